//! Task execution
//!
//! - [`Executor`] runs a [`Runnable`] somewhere
//! - [`ExecutorService`] adds lifecycle (shutdown, termination) and the
//!   submit/invoke family built on [`FutureTask`]
//! - [`ThreadPoolExecutor`] is the worker-pool implementation
//! - [`ExecutorCompletionService`] hands back futures in completion order

mod blocking_queue;
mod completion;
mod future_task;
mod thread_pool;

pub use blocking_queue::LinkedBlockingQueue;
pub use completion::ExecutorCompletionService;
pub use future_task::{FutureState, FutureTask};
pub use thread_pool::{
    AbortPolicy, CallerRunsPolicy, DefaultThreadFactory, DiscardOldestPolicy, DiscardPolicy,
    Executors, RejectedExecutionHandler, RejectionContext, ThreadFactory, ThreadPoolExecutor,
};

use std::sync::Arc;
use std::time::{Duration, Instant};

use efc_core::{Error, Result, SpinLock};

/// A unit of work.
pub trait Runnable: Send + Sync {
    fn run(&self);

    /// Lets a pool purge work that no longer needs running.
    fn is_cancelled(&self) -> bool {
        false
    }

    /// Run `hook` once the work is done or cancelled. Returns false if
    /// the work has no completion to observe.
    fn when_done(&self, _hook: Box<dyn FnOnce() + Send + 'static>) -> bool {
        false
    }
}

/// Shared handle to queued work.
pub type Task = Arc<dyn Runnable>;

/// A boxed computation producing a `T`.
pub type Callable<T> = Box<dyn FnOnce() -> Result<T> + Send + 'static>;

struct FnRunnable<F> {
    body: SpinLock<Option<F>>,
}

impl<F: FnOnce() + Send> Runnable for FnRunnable<F> {
    fn run(&self) {
        let body = self.body.lock().take();
        if let Some(body) = body {
            body();
        }
    }
}

/// Wrap a closure as a task. The closure runs at most once.
pub fn runnable<F>(f: F) -> Task
where
    F: FnOnce() + Send + 'static,
{
    Arc::new(FnRunnable {
        body: SpinLock::new(Some(f)),
    })
}

pub trait Executor: Send + Sync {
    /// Run `task` at some point, or fail with `RejectedExecution`.
    fn execute(&self, task: Task) -> Result<()>;
}

/// Result handle of an asynchronous computation.
pub trait Future<T>: Send + Sync {
    fn cancel(&self, may_interrupt: bool) -> bool;
    fn is_cancelled(&self) -> bool;
    fn is_done(&self) -> bool;
    fn get(&self) -> Result<T>;
    fn get_timeout(&self, timeout: Duration) -> Result<T>;
}

/// An executor with a lifecycle.
pub trait ExecutorService: Executor {
    /// Stop accepting tasks; queued and running ones still complete.
    fn shutdown(&self);

    /// Stop accepting tasks, interrupt running ones and return the tasks
    /// that never started.
    fn shutdown_now(&self) -> Vec<Task>;

    fn is_shutdown(&self) -> bool;

    fn is_terminated(&self) -> bool;

    /// Wait for termination after a shutdown. `Ok(false)` on timeout.
    fn await_termination(&self, timeout: Duration) -> Result<bool>;

    fn submit<T, F>(&self, f: F) -> Result<Arc<FutureTask<T>>>
    where
        Self: Sized,
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let task = Arc::new(FutureTask::new(f));
        self.execute(task.clone())?;
        Ok(task)
    }

    fn submit_runnable<F>(&self, f: F) -> Result<Arc<FutureTask<()>>>
    where
        Self: Sized,
        F: FnOnce() + Send + 'static,
    {
        let task = Arc::new(FutureTask::from_runnable(f, ()));
        self.execute(task.clone())?;
        Ok(task)
    }

    /// Run every task and wait until all are done.
    ///
    /// Task failures are left in the returned futures. On interrupt or
    /// rejection every task not yet done is cancelled.
    fn invoke_all<T>(&self, tasks: Vec<Callable<T>>) -> Result<Vec<Arc<FutureTask<T>>>>
    where
        Self: Sized,
        T: Send + 'static,
    {
        let futures: Vec<_> = tasks
            .into_iter()
            .map(|c| Arc::new(FutureTask::new(c)))
            .collect();
        let outcome = futures.iter().try_for_each(|f| self.execute(f.clone()));
        let outcome = outcome.and_then(|()| futures.iter().try_for_each(|f| f.wait_done()));
        if let Err(e) = outcome {
            cancel_all(&futures);
            return Err(e);
        }
        Ok(futures)
    }

    /// Like [`invoke_all`](Self::invoke_all), bounded by `timeout` overall.
    /// Tasks not done in time are cancelled.
    fn invoke_all_timeout<T>(
        &self,
        tasks: Vec<Callable<T>>,
        timeout: Duration,
    ) -> Result<Vec<Arc<FutureTask<T>>>>
    where
        Self: Sized,
        T: Send + 'static,
    {
        let deadline = Instant::now() + timeout;
        let futures: Vec<_> = tasks
            .into_iter()
            .map(|c| Arc::new(FutureTask::new(c)))
            .collect();

        for f in &futures {
            if Instant::now() >= deadline {
                cancel_all(&futures);
                return Ok(futures);
            }
            if let Err(e) = self.execute(f.clone()) {
                cancel_all(&futures);
                return Err(e);
            }
        }
        for f in &futures {
            let left = deadline.saturating_duration_since(Instant::now());
            match f.wait_done_timeout(left) {
                Ok(true) => {}
                Ok(false) => {
                    cancel_all(&futures);
                    return Ok(futures);
                }
                Err(e) => {
                    cancel_all(&futures);
                    return Err(e);
                }
            }
        }
        Ok(futures)
    }

    /// Return the result of the first task to succeed and cancel the rest.
    ///
    /// If every task fails, the last failure is returned.
    fn invoke_any<T>(&self, tasks: Vec<Callable<T>>) -> Result<T>
    where
        Self: Sized,
        T: Clone + Send + 'static,
    {
        do_invoke_any(self, tasks, None)
    }

    fn invoke_any_timeout<T>(&self, tasks: Vec<Callable<T>>, timeout: Duration) -> Result<T>
    where
        Self: Sized,
        T: Clone + Send + 'static,
    {
        do_invoke_any(self, tasks, Some(Instant::now() + timeout))
    }
}

fn cancel_all<T: Send + 'static>(futures: &[Arc<FutureTask<T>>]) {
    for f in futures {
        f.cancel(true);
    }
}

fn do_invoke_any<E, T>(executor: &E, tasks: Vec<Callable<T>>, deadline: Option<Instant>) -> Result<T>
where
    E: Executor + ?Sized,
    T: Clone + Send + 'static,
{
    if tasks.is_empty() {
        return Err(Error::illegal_argument("invoke_any needs at least one task"));
    }
    let finished = Arc::new(LinkedBlockingQueue::unbounded());
    let mut futures = Vec::with_capacity(tasks.len());
    for (index, c) in tasks.into_iter().enumerate() {
        let f = Arc::new(FutureTask::new(c));
        let q = Arc::clone(&finished);
        f.on_done(move || {
            let _ = q.offer(index);
        });
        futures.push(f);
    }

    let outcome = (|| -> Result<T> {
        for f in &futures {
            executor.execute(f.clone())?;
        }
        let mut pending = futures.len();
        let mut last = Error::execution(Error::illegal_state("no task completed"));
        while pending > 0 {
            let index = match deadline {
                None => finished.take()?,
                Some(d) => {
                    let left = d.saturating_duration_since(Instant::now());
                    finished.poll_timeout(left)?.ok_or(Error::Timeout)?
                }
            };
            pending -= 1;
            match futures[index].get() {
                Ok(v) => return Ok(v),
                Err(e) => last = e,
            }
        }
        Err(last)
    })();

    cancel_all(&futures);
    outcome
}
