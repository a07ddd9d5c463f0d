//! Futures delivered in completion order

use std::sync::Arc;
use std::time::Duration;

use efc_core::Result;

use super::{Executor, FutureTask, LinkedBlockingQueue};

/// Submits work to an executor and queues each future as it finishes.
pub struct ExecutorCompletionService<T> {
    executor: Arc<dyn Executor>,
    completed: Arc<LinkedBlockingQueue<Arc<FutureTask<T>>>>,
}

impl<T: Send + 'static> ExecutorCompletionService<T> {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self::with_queue(executor, LinkedBlockingQueue::unbounded())
    }

    /// Deliver finished futures into `queue`. A bounded queue drops
    /// completions that do not fit.
    pub fn with_queue(
        executor: Arc<dyn Executor>,
        queue: LinkedBlockingQueue<Arc<FutureTask<T>>>,
    ) -> Self {
        ExecutorCompletionService {
            executor,
            completed: Arc::new(queue),
        }
    }

    pub fn submit<F>(&self, f: F) -> Result<Arc<FutureTask<T>>>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let task = Arc::new(FutureTask::new(f));
        let queue = Arc::downgrade(&self.completed);
        let me = Arc::downgrade(&task);
        task.on_done(move || {
            if let (Some(queue), Some(task)) = (queue.upgrade(), me.upgrade()) {
                if queue.offer(task).is_err() {
                    log::warn!("completion queue full, dropping finished task");
                }
            }
        });
        self.executor.execute(task.clone())?;
        Ok(task)
    }

    /// Wait for the next finished future.
    pub fn take(&self) -> Result<Arc<FutureTask<T>>> {
        self.completed.take()
    }

    pub fn poll(&self) -> Option<Arc<FutureTask<T>>> {
        self.completed.poll()
    }

    pub fn poll_timeout(&self, timeout: Duration) -> Result<Option<Arc<FutureTask<T>>>> {
        self.completed.poll_timeout(timeout)
    }
}
