//! Worker-pool executor
//!
//! Control word: run state in the high 32 bits, worker count in the low
//! 32. Run states only increase:
//!
//! - RUNNING: accept new tasks and process queued ones
//! - SHUTDOWN: no new tasks, queued ones still run
//! - STOP: no new tasks, queue discarded, running tasks interrupted
//! - TIDYING: all workers gone, terminated hook running
//! - TERMINATED: done
//!
//! `execute` first grows the pool to the core size, then queues, then
//! grows up to the maximum, and finally hands the task to the rejection
//! policy.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use efc_core::{config, Error, Result, SpinLock};

use super::{Executor, ExecutorService, LinkedBlockingQueue, Task};
use crate::lock::{Condition, ReentrantLock};
use crate::thread::{panic_message, Builder, Thread, ThreadGroup, NORM_PRIORITY};

// ── Control word ──

const COUNT_BITS: u32 = 32;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;

const RUNNING: u64 = 0;
const SHUTDOWN: u64 = 1;
const STOP: u64 = 2;
const TIDYING: u64 = 3;
const TERMINATED: u64 = 4;

#[inline]
fn run_state_of(c: u64) -> u64 {
    c >> COUNT_BITS
}

#[inline]
fn worker_count_of(c: u64) -> usize {
    (c & COUNT_MASK) as usize
}

#[inline]
fn ctl_of(rs: u64, wc: usize) -> u64 {
    (rs << COUNT_BITS) | wc as u64
}

// ── Thread factory ──

/// Creates the threads a pool runs its workers on.
pub trait ThreadFactory: Send + Sync {
    /// Build (but do not start) a thread running `body`.
    fn new_thread(&self, body: Box<dyn FnOnce() + Send + 'static>) -> Result<Thread>;
}

static POOL_NUMBER: AtomicUsize = AtomicUsize::new(1);

/// Names threads `pool-N-thread-M`, non-daemon, normal priority.
pub struct DefaultThreadFactory {
    group: Option<ThreadGroup>,
    prefix: String,
    next_thread: AtomicUsize,
}

impl DefaultThreadFactory {
    pub fn new() -> Self {
        let n = POOL_NUMBER.fetch_add(1, Ordering::Relaxed);
        DefaultThreadFactory {
            group: None,
            prefix: format!("pool-{}-thread-", n),
            next_thread: AtomicUsize::new(1),
        }
    }

    /// Place worker threads in `group` instead of the creator's group.
    pub fn with_group(group: ThreadGroup) -> Self {
        DefaultThreadFactory {
            group: Some(group),
            ..Self::new()
        }
    }
}

impl Default for DefaultThreadFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadFactory for DefaultThreadFactory {
    fn new_thread(&self, body: Box<dyn FnOnce() + Send + 'static>) -> Result<Thread> {
        let m = self.next_thread.fetch_add(1, Ordering::Relaxed);
        let mut builder = Builder::new()
            .name(format!("{}{}", self.prefix, m))
            .daemon(false)
            .priority(NORM_PRIORITY);
        if let Some(group) = &self.group {
            builder = builder.group(group.clone());
        }
        builder.build(body)
    }
}

// ── Rejection ──

/// What a rejection policy may do to the pool that rejected a task.
pub trait RejectionContext {
    fn is_shutdown(&self) -> bool;

    /// Remove and return the oldest queued task.
    fn discard_oldest(&self) -> Option<Task>;

    /// Retry the normal execute path.
    fn execute(&self, task: Task) -> Result<()>;
}

/// Decides the fate of a task the pool cannot accept.
pub trait RejectedExecutionHandler: Send + Sync {
    fn rejected(&self, task: Task, pool: &dyn RejectionContext) -> Result<()>;
}

/// Fails with `RejectedExecution`.
pub struct AbortPolicy;

impl RejectedExecutionHandler for AbortPolicy {
    fn rejected(&self, _task: Task, pool: &dyn RejectionContext) -> Result<()> {
        let why = if pool.is_shutdown() {
            "executor is shut down"
        } else {
            "pool and queue are full"
        };
        Err(Error::RejectedExecution(why.into()))
    }
}

/// Runs the task on the submitting thread unless the pool is shut down.
pub struct CallerRunsPolicy;

impl RejectedExecutionHandler for CallerRunsPolicy {
    fn rejected(&self, task: Task, pool: &dyn RejectionContext) -> Result<()> {
        if !pool.is_shutdown() {
            task.run();
        }
        Ok(())
    }
}

/// Drops the task.
pub struct DiscardPolicy;

impl RejectedExecutionHandler for DiscardPolicy {
    fn rejected(&self, _task: Task, _pool: &dyn RejectionContext) -> Result<()> {
        Ok(())
    }
}

/// Drops the oldest queued task and retries, unless shut down.
pub struct DiscardOldestPolicy;

impl RejectedExecutionHandler for DiscardOldestPolicy {
    fn rejected(&self, task: Task, pool: &dyn RejectionContext) -> Result<()> {
        if pool.is_shutdown() {
            return Ok(());
        }
        pool.discard_oldest();
        pool.execute(task)
    }
}

// ── Workers ──

struct Worker {
    thread: SpinLock<Option<Thread>>,
    first_task: SpinLock<Option<Task>>,
    completed: AtomicU64,
    // Held while running a task; starts held so the worker cannot be
    // interrupted before it runs
    busy: AtomicBool,
}

impl Worker {
    fn new(first_task: Option<Task>) -> Self {
        Worker {
            thread: SpinLock::new(None),
            first_task: SpinLock::new(first_task),
            completed: AtomicU64::new(0),
            busy: AtomicBool::new(true),
        }
    }

    fn try_lock(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn lock(&self) {
        while !self.try_lock() {
            Thread::yield_now();
        }
    }

    fn unlock(&self) {
        self.busy.store(false, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn thread(&self) -> Option<Thread> {
        self.thread.lock().clone()
    }

    /// Interrupt even if busy; used by `shutdown_now`.
    fn interrupt_if_started(&self) {
        if let Some(t) = self.thread() {
            if t.is_alive() && !t.is_interrupted() {
                t.interrupt();
            }
        }
    }
}

fn same_task(a: &Task, b: &Task) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

// ── Pool state ──

struct PoolInner {
    ctl: AtomicU64,
    queue: LinkedBlockingQueue<Task>,
    main_lock: ReentrantLock,
    termination: Condition,
    // Mutated only with main_lock held
    workers: SpinLock<Vec<Arc<Worker>>>,
    largest_pool_size: AtomicUsize,
    completed_tasks: AtomicU64,
    core_pool_size: AtomicUsize,
    maximum_pool_size: AtomicUsize,
    keep_alive_nanos: AtomicU64,
    allow_core_timeout: AtomicBool,
    factory: SpinLock<Arc<dyn ThreadFactory>>,
    handler: SpinLock<Arc<dyn RejectedExecutionHandler>>,
}

impl PoolInner {
    #[inline]
    fn ctl(&self) -> u64 {
        self.ctl.load(Ordering::SeqCst)
    }

    fn cas_ctl(&self, expect: u64, new: u64) -> bool {
        self.ctl
            .compare_exchange(expect, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn decrement_worker_count(&self) {
        self.ctl.fetch_sub(1, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        run_state_of(self.ctl()) == RUNNING
    }

    fn advance_run_state(&self, target: u64) {
        loop {
            let c = self.ctl();
            if run_state_of(c) >= target || self.cas_ctl(c, ctl_of(target, worker_count_of(c))) {
                return;
            }
        }
    }

    fn keep_alive(&self) -> Duration {
        Duration::from_nanos(self.keep_alive_nanos.load(Ordering::Relaxed))
    }

    fn reject(self: &Arc<Self>, task: Task) -> Result<()> {
        let handler = self.handler.lock().clone();
        handler.rejected(task, self)
    }

    fn execute(self: &Arc<Self>, task: Task) -> Result<()> {
        let c = self.ctl();
        if worker_count_of(c) < self.core_pool_size.load(Ordering::SeqCst)
            && self.add_worker(Some(task.clone()), true)
        {
            return Ok(());
        }
        if self.is_running() && self.queue.offer(task.clone()).is_ok() {
            self.dequeue_on_cancel(&task);
            let recheck = self.ctl();
            if run_state_of(recheck) != RUNNING && self.remove(&task) {
                return self.reject(task);
            }
            if worker_count_of(recheck) == 0 {
                self.add_worker(None, false);
            }
            return Ok(());
        }
        if !self.add_worker(Some(task.clone()), false) {
            return self.reject(task);
        }
        Ok(())
    }

    /// Take `task` off the queue as soon as it is cancelled. Registered
    /// after the offer so a cancel that already happened fires at once.
    fn dequeue_on_cancel(self: &Arc<Self>, task: &Task) {
        let pool: Weak<PoolInner> = Arc::downgrade(self);
        let queued = Arc::downgrade(task);
        task.when_done(Box::new(move || {
            if let (Some(pool), Some(task)) = (pool.upgrade(), queued.upgrade()) {
                if task.is_cancelled() && pool.remove(&task) {
                    log::trace!("cancelled task dropped from pool queue");
                }
            }
        }));
    }

    /// Reserve a worker slot, create and start its thread. Returns false
    /// if the pool state or bounds forbid it, or the factory failed.
    fn add_worker(self: &Arc<Self>, first_task: Option<Task>, core: bool) -> bool {
        'retry: loop {
            let mut c = self.ctl();
            let rs = run_state_of(c);
            if rs >= SHUTDOWN && !(rs == SHUTDOWN && first_task.is_none() && !self.queue.is_empty())
            {
                return false;
            }
            loop {
                let bound = if core {
                    self.core_pool_size.load(Ordering::SeqCst)
                } else {
                    self.maximum_pool_size.load(Ordering::SeqCst)
                };
                let wc = worker_count_of(c);
                if wc as u64 >= COUNT_MASK || wc >= bound {
                    return false;
                }
                if self.cas_ctl(c, c + 1) {
                    break 'retry;
                }
                c = self.ctl();
                if run_state_of(c) != rs {
                    continue 'retry;
                }
            }
        }

        let had_first = first_task.is_some();
        let worker = Arc::new(Worker::new(first_task));
        let pool = Arc::clone(self);
        let w = Arc::clone(&worker);
        let factory = self.factory.lock().clone();
        let thread = match factory.new_thread(Box::new(move || pool.run_worker(w))) {
            Ok(t) => t,
            Err(e) => {
                log::warn!("thread factory failed: {}", e);
                self.add_worker_failed(&worker);
                return false;
            }
        };
        *worker.thread.lock() = Some(thread.clone());

        let added = {
            let _guard = self.main_lock.guard();
            let rs = run_state_of(self.ctl());
            if rs < SHUTDOWN || (rs == SHUTDOWN && !had_first) {
                let mut workers = self.workers.lock();
                workers.push(Arc::clone(&worker));
                self.largest_pool_size.fetch_max(workers.len(), Ordering::Relaxed);
                true
            } else {
                false
            }
        };

        let started = added
            && match thread.start() {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("worker thread failed to start: {}", e);
                    false
                }
            };
        if !started {
            self.add_worker_failed(&worker);
        } else {
            log::debug!("pool worker {} started", thread.name());
        }
        started
    }

    fn add_worker_failed(self: &Arc<Self>, worker: &Arc<Worker>) {
        {
            let _guard = self.main_lock.guard();
            self.workers.lock().retain(|w| !Arc::ptr_eq(w, worker));
            self.decrement_worker_count();
        }
        self.try_terminate();
    }

    fn run_worker(self: &Arc<Self>, w: Arc<Worker>) {
        let me = Thread::current();
        let mut task = w.first_task.lock().take();
        w.unlock();
        loop {
            let t = match task.take() {
                Some(t) => t,
                None => match self.get_task() {
                    Some(t) => t,
                    None => break,
                },
            };
            w.lock();
            // Stopping: make sure we are interrupted. Otherwise clear any
            // interrupt left over from the previous task.
            if (run_state_of(self.ctl()) >= STOP
                || (Thread::interrupted() && run_state_of(self.ctl()) >= STOP))
                && !me.is_interrupted()
            {
                me.interrupt();
            }
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| t.run())) {
                log::error!(
                    "task panicked on {}: {}",
                    me.name(),
                    panic_message(payload.as_ref())
                );
            }
            w.completed.fetch_add(1, Ordering::Relaxed);
            w.unlock();
        }
        self.process_worker_exit(&w);
    }

    /// Block for the next task. `None` tells the worker to exit; the
    /// worker count has already been decremented.
    fn get_task(&self) -> Option<Task> {
        let mut timed_out = false;
        loop {
            let c = self.ctl();
            let rs = run_state_of(c);
            if rs >= SHUTDOWN && (rs >= STOP || self.queue.is_empty()) {
                self.decrement_worker_count();
                return None;
            }

            let wc = worker_count_of(c);
            let timed = self.allow_core_timeout.load(Ordering::SeqCst)
                || wc > self.core_pool_size.load(Ordering::SeqCst);
            if (wc > self.maximum_pool_size.load(Ordering::SeqCst) || (timed && timed_out))
                && (wc > 1 || self.queue.is_empty())
            {
                if self.cas_ctl(c, c - 1) {
                    return None;
                }
                continue;
            }

            let polled = if timed {
                self.queue.poll_timeout(self.keep_alive())
            } else {
                self.queue.take().map(Some)
            };
            match polled {
                Ok(Some(t)) => return Some(t),
                Ok(None) => timed_out = true,
                // Interrupted: recheck state
                Err(_) => timed_out = false,
            }
        }
    }

    fn process_worker_exit(self: &Arc<Self>, w: &Arc<Worker>) {
        {
            let _guard = self.main_lock.guard();
            self.completed_tasks
                .fetch_add(w.completed.load(Ordering::Relaxed), Ordering::Relaxed);
            self.workers.lock().retain(|x| !Arc::ptr_eq(x, w));
        }
        if let Some(t) = w.thread() {
            log::debug!("pool worker {} exiting", t.name());
        }
        self.try_terminate();

        let c = self.ctl();
        if run_state_of(c) < STOP {
            let mut min = if self.allow_core_timeout.load(Ordering::SeqCst) {
                0
            } else {
                self.core_pool_size.load(Ordering::SeqCst)
            };
            if min == 0 && !self.queue.is_empty() {
                min = 1;
            }
            if worker_count_of(c) >= min {
                return;
            }
            self.add_worker(None, false);
        }
    }

    /// Move to TERMINATED if shut down with no workers and (for SHUTDOWN)
    /// an empty queue. Otherwise propagate the shutdown signal to one
    /// idle worker.
    fn try_terminate(&self) {
        loop {
            let c = self.ctl();
            let rs = run_state_of(c);
            if rs == RUNNING || rs >= TIDYING || (rs == SHUTDOWN && !self.queue.is_empty()) {
                return;
            }
            if worker_count_of(c) != 0 {
                self.interrupt_idle_workers(true);
                return;
            }

            let _guard = self.main_lock.guard();
            if self.cas_ctl(c, ctl_of(TIDYING, 0)) {
                log::debug!("thread pool terminated");
                self.ctl.store(ctl_of(TERMINATED, 0), Ordering::SeqCst);
                // Caller holds main_lock
                let _ = self.termination.signal_all();
                return;
            }
        }
    }

    fn interrupt_idle_workers(&self, only_one: bool) {
        let _guard = self.main_lock.guard();
        let workers = self.workers.lock().clone();
        for w in workers {
            if let Some(t) = w.thread() {
                if !t.is_interrupted() && w.try_lock() {
                    t.interrupt();
                    w.unlock();
                }
            }
            if only_one {
                break;
            }
        }
    }

    fn interrupt_workers(&self) {
        let _guard = self.main_lock.guard();
        let workers = self.workers.lock().clone();
        for w in workers {
            w.interrupt_if_started();
        }
    }

    fn shutdown(&self) {
        {
            let _guard = self.main_lock.guard();
            self.advance_run_state(SHUTDOWN);
            self.interrupt_idle_workers(false);
        }
        self.try_terminate();
    }

    fn shutdown_now(&self) -> Vec<Task> {
        let mut tasks = Vec::new();
        {
            let _guard = self.main_lock.guard();
            self.advance_run_state(STOP);
            self.interrupt_workers();
            self.queue.drain_to(&mut tasks);
        }
        self.try_terminate();
        tasks
    }

    fn await_termination(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let _guard = self.main_lock.guard();
        loop {
            if run_state_of(self.ctl()) >= TERMINATED {
                return Ok(true);
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(false);
            }
            self.termination.wait_timeout(left)?;
        }
    }

    fn remove(&self, task: &Task) -> bool {
        let removed = self.queue.remove_if(|t| same_task(t, task)) > 0;
        self.try_terminate();
        removed
    }
}

impl RejectionContext for Arc<PoolInner> {
    fn is_shutdown(&self) -> bool {
        !self.is_running()
    }

    fn discard_oldest(&self) -> Option<Task> {
        self.queue.poll()
    }

    fn execute(&self, task: Task) -> Result<()> {
        PoolInner::execute(self, task)
    }
}

// ── Public surface ──

/// Executor running tasks on a pool of reusable worker threads.
///
/// Dropping the executor shuts it down; queued tasks still run.
pub struct ThreadPoolExecutor {
    inner: Arc<PoolInner>,
}

impl ThreadPoolExecutor {
    /// Pool with the default thread factory and [`AbortPolicy`].
    pub fn new(
        core_pool_size: usize,
        maximum_pool_size: usize,
        keep_alive: Duration,
        queue: LinkedBlockingQueue<Task>,
    ) -> Result<Self> {
        Self::with_parts(
            core_pool_size,
            maximum_pool_size,
            keep_alive,
            queue,
            Arc::new(DefaultThreadFactory::new()),
            Arc::new(AbortPolicy),
        )
    }

    pub fn with_parts(
        core_pool_size: usize,
        maximum_pool_size: usize,
        keep_alive: Duration,
        queue: LinkedBlockingQueue<Task>,
        factory: Arc<dyn ThreadFactory>,
        handler: Arc<dyn RejectedExecutionHandler>,
    ) -> Result<Self> {
        if maximum_pool_size == 0 || maximum_pool_size < core_pool_size {
            return Err(Error::illegal_argument(format!(
                "pool sizes core={} max={}",
                core_pool_size, maximum_pool_size
            )));
        }
        let main_lock = ReentrantLock::new();
        let termination = main_lock.new_condition();
        Ok(ThreadPoolExecutor {
            inner: Arc::new(PoolInner {
                ctl: AtomicU64::new(ctl_of(RUNNING, 0)),
                queue,
                main_lock,
                termination,
                workers: SpinLock::new(Vec::new()),
                largest_pool_size: AtomicUsize::new(0),
                completed_tasks: AtomicU64::new(0),
                core_pool_size: AtomicUsize::new(core_pool_size),
                maximum_pool_size: AtomicUsize::new(maximum_pool_size),
                keep_alive_nanos: AtomicU64::new(keep_alive.as_nanos() as u64),
                allow_core_timeout: AtomicBool::new(false),
                factory: SpinLock::new(factory),
                handler: SpinLock::new(handler),
            }),
        })
    }

    /// Tasks queued and not yet taken by a worker.
    pub fn queue(&self) -> &LinkedBlockingQueue<Task> {
        &self.inner.queue
    }

    pub fn set_thread_factory(&self, factory: Arc<dyn ThreadFactory>) {
        *self.inner.factory.lock() = factory;
    }

    pub fn set_rejected_execution_handler(&self, handler: Arc<dyn RejectedExecutionHandler>) {
        *self.inner.handler.lock() = handler;
    }

    pub fn is_terminating(&self) -> bool {
        let rs = run_state_of(self.inner.ctl());
        rs >= SHUTDOWN && rs < TERMINATED
    }

    // ── Sizing ──

    pub fn core_pool_size(&self) -> usize {
        self.inner.core_pool_size.load(Ordering::SeqCst)
    }

    /// Excess workers exit when next idle; a larger core size starts
    /// workers for already queued tasks.
    pub fn set_core_pool_size(&self, size: usize) -> Result<()> {
        if size > self.maximum_pool_size() {
            return Err(Error::illegal_argument(format!(
                "core size {} exceeds maximum",
                size
            )));
        }
        let old = self.inner.core_pool_size.swap(size, Ordering::SeqCst);
        if worker_count_of(self.inner.ctl()) > size {
            self.inner.interrupt_idle_workers(false);
        } else if size > old {
            let mut k = (size - old).min(self.inner.queue.len());
            while k > 0 && self.inner.add_worker(None, true) {
                k -= 1;
                if self.inner.queue.is_empty() {
                    break;
                }
            }
        }
        Ok(())
    }

    pub fn maximum_pool_size(&self) -> usize {
        self.inner.maximum_pool_size.load(Ordering::SeqCst)
    }

    pub fn set_maximum_pool_size(&self, size: usize) -> Result<()> {
        if size == 0 || size < self.core_pool_size() {
            return Err(Error::illegal_argument(format!("maximum size {}", size)));
        }
        self.inner.maximum_pool_size.store(size, Ordering::SeqCst);
        if worker_count_of(self.inner.ctl()) > size {
            self.inner.interrupt_idle_workers(false);
        }
        Ok(())
    }

    pub fn keep_alive_time(&self) -> Duration {
        self.inner.keep_alive()
    }

    pub fn set_keep_alive_time(&self, keep_alive: Duration) -> Result<()> {
        if keep_alive.is_zero() && self.allows_core_thread_timeout() {
            return Err(Error::illegal_argument(
                "core threads must have a non-zero keep-alive",
            ));
        }
        let old = self
            .inner
            .keep_alive_nanos
            .swap(keep_alive.as_nanos() as u64, Ordering::SeqCst);
        if (keep_alive.as_nanos() as u64) < old {
            self.inner.interrupt_idle_workers(false);
        }
        Ok(())
    }

    pub fn allows_core_thread_timeout(&self) -> bool {
        self.inner.allow_core_timeout.load(Ordering::SeqCst)
    }

    /// Let core workers time out like surplus ones.
    pub fn allow_core_thread_timeout(&self, on: bool) -> Result<()> {
        if on && self.inner.keep_alive().is_zero() {
            return Err(Error::illegal_argument(
                "core threads must have a non-zero keep-alive",
            ));
        }
        let was = self.inner.allow_core_timeout.swap(on, Ordering::SeqCst);
        if on && !was {
            self.inner.interrupt_idle_workers(false);
        }
        Ok(())
    }

    /// Start one idle core worker if below the core size.
    pub fn prestart_core_thread(&self) -> bool {
        worker_count_of(self.inner.ctl()) < self.core_pool_size()
            && self.inner.add_worker(None, true)
    }

    /// Start all core workers; returns how many were started.
    pub fn prestart_all_core_threads(&self) -> usize {
        let mut n = 0;
        while self.inner.add_worker(None, true) {
            n += 1;
        }
        n
    }

    // ── Queue maintenance ──

    /// Remove queued tasks that report themselves cancelled.
    pub fn purge(&self) -> usize {
        let n = self.inner.queue.remove_if(|t| t.is_cancelled());
        self.inner.try_terminate();
        n
    }

    /// Remove `task` from the queue if it has not started.
    pub fn remove(&self, task: &Task) -> bool {
        self.inner.remove(task)
    }

    // ── Statistics ──

    pub fn pool_size(&self) -> usize {
        let _guard = self.inner.main_lock.guard();
        if run_state_of(self.inner.ctl()) >= TIDYING {
            0
        } else {
            self.inner.workers.lock().len()
        }
    }

    /// Workers currently running a task.
    pub fn active_count(&self) -> usize {
        let _guard = self.inner.main_lock.guard();
        let n = self
            .inner
            .workers
            .lock()
            .iter()
            .filter(|w| w.is_locked())
            .count();
        n
    }

    pub fn largest_pool_size(&self) -> usize {
        self.inner.largest_pool_size.load(Ordering::Relaxed)
    }

    /// Tasks ever scheduled: completed, running and queued.
    pub fn task_count(&self) -> u64 {
        let _guard = self.inner.main_lock.guard();
        let mut n = self.inner.completed_tasks.load(Ordering::Relaxed);
        for w in self.inner.workers.lock().iter() {
            n += w.completed.load(Ordering::Relaxed);
            if w.is_locked() {
                n += 1;
            }
        }
        n + self.inner.queue.len() as u64
    }

    pub fn completed_task_count(&self) -> u64 {
        let _guard = self.inner.main_lock.guard();
        let mut n = self.inner.completed_tasks.load(Ordering::Relaxed);
        for w in self.inner.workers.lock().iter() {
            n += w.completed.load(Ordering::Relaxed);
        }
        n
    }
}

impl Executor for ThreadPoolExecutor {
    fn execute(&self, task: Task) -> Result<()> {
        PoolInner::execute(&self.inner, task)
    }
}

impl ExecutorService for ThreadPoolExecutor {
    fn shutdown(&self) {
        self.inner.shutdown();
    }

    fn shutdown_now(&self) -> Vec<Task> {
        self.inner.shutdown_now()
    }

    fn is_shutdown(&self) -> bool {
        !self.inner.is_running()
    }

    fn is_terminated(&self) -> bool {
        run_state_of(self.inner.ctl()) == TERMINATED
    }

    fn await_termination(&self, timeout: Duration) -> Result<bool> {
        self.inner.await_termination(timeout)
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl std::fmt::Debug for ThreadPoolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let c = self.inner.ctl();
        let state = match run_state_of(c) {
            RUNNING => "Running",
            SHUTDOWN => "Shutting down",
            STOP => "Stopping",
            TIDYING => "Tidying",
            _ => "Terminated",
        };
        f.debug_struct("ThreadPoolExecutor")
            .field("state", &state)
            .field("workers", &worker_count_of(c))
            .field("queued", &self.inner.queue.len())
            .finish()
    }
}

/// Factory methods for common pool shapes.
pub struct Executors;

impl Executors {
    /// `n` workers sharing an unbounded queue.
    pub fn new_fixed_thread_pool(n: usize) -> Result<ThreadPoolExecutor> {
        ThreadPoolExecutor::new(n, n, Duration::ZERO, LinkedBlockingQueue::unbounded())
    }

    pub fn new_single_thread_executor() -> Result<ThreadPoolExecutor> {
        Self::new_fixed_thread_pool(1)
    }

    /// Unbounded pool that reuses idle workers and retires them after
    /// the configured keep-alive.
    pub fn new_cached_thread_pool() -> Result<ThreadPoolExecutor> {
        ThreadPoolExecutor::new(
            0,
            usize::MAX,
            config::global().pool_keep_alive,
            LinkedBlockingQueue::hand_off(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{runnable, Callable};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_ctl_packing() {
        let c = ctl_of(SHUTDOWN, 7);
        assert_eq!(run_state_of(c), SHUTDOWN);
        assert_eq!(worker_count_of(c), 7);
        assert_eq!(worker_count_of(c - 1), 6);
    }

    #[test]
    fn test_bad_sizes_rejected() {
        assert!(ThreadPoolExecutor::new(2, 1, Duration::ZERO, LinkedBlockingQueue::unbounded()).is_err());
        assert!(ThreadPoolExecutor::new(0, 0, Duration::ZERO, LinkedBlockingQueue::unbounded()).is_err());
    }

    #[test]
    fn test_fixed_pool_runs_all() {
        let pool = Executors::new_fixed_thread_pool(3).unwrap();
        let futures: Vec<_> = (0..20u64).map(|i| pool.submit(move || Ok(i * i)).unwrap()).collect();
        let total: u64 = futures.iter().map(|f| f.get().unwrap()).sum();
        assert_eq!(total, (0..20u64).map(|i| i * i).sum());
        assert!(pool.largest_pool_size() <= 3);
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)).unwrap());
        assert!(pool.is_terminated());
        assert_eq!(pool.completed_task_count(), 20);
        assert_eq!(pool.pool_size(), 0);
    }

    #[test]
    fn test_submit_after_shutdown_rejected() {
        let pool = Executors::new_single_thread_executor().unwrap();
        pool.shutdown();
        let err = pool.submit(|| Ok(1)).unwrap_err();
        assert!(matches!(err, Error::RejectedExecution(_)));
    }

    #[test]
    fn test_shutdown_now_returns_queued() {
        let pool = Executors::new_single_thread_executor().unwrap();
        let gate = Arc::new(AtomicBool::new(false));
        let g = Arc::clone(&gate);
        pool.execute(runnable(move || {
            while !g.load(Ordering::SeqCst) && !Thread::current().is_interrupted() {
                Thread::yield_now();
            }
        }))
        .unwrap();
        for _ in 0..4 {
            pool.execute(runnable(|| {})).unwrap();
        }
        let pending = pool.shutdown_now();
        assert!(pending.len() >= 3);
        assert!(pool.await_termination(Duration::from_secs(5)).unwrap());
        gate.store(true, Ordering::SeqCst);
    }

    #[test]
    fn test_panicking_task_keeps_worker() {
        let pool = Executors::new_single_thread_executor().unwrap();
        pool.execute(runnable(|| panic!("task blew up"))).unwrap();
        let f = pool.submit(|| Ok("still alive")).unwrap();
        assert_eq!(f.get().unwrap(), "still alive");
        assert_eq!(pool.largest_pool_size(), 1);
    }

    #[test]
    fn test_caller_runs_when_saturated() {
        let pool = ThreadPoolExecutor::with_parts(
            1,
            1,
            Duration::ZERO,
            LinkedBlockingQueue::new(1),
            Arc::new(DefaultThreadFactory::new()),
            Arc::new(CallerRunsPolicy),
        )
        .unwrap();
        let release = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&release);
        pool.execute(runnable(move || {
            while !r.load(Ordering::SeqCst) {
                Thread::yield_now();
            }
        }))
        .unwrap();
        pool.execute(runnable(|| {})).unwrap();

        let ran_on = Arc::new(AtomicU64::new(0));
        let ro = Arc::clone(&ran_on);
        pool.execute(runnable(move || {
            ro.store(Thread::current().id(), Ordering::SeqCst);
        }))
        .unwrap();
        assert_eq!(ran_on.load(Ordering::SeqCst), Thread::current().id());
        release.store(true, Ordering::SeqCst);
    }

    #[test]
    fn test_discard_oldest() {
        let pool = ThreadPoolExecutor::with_parts(
            1,
            1,
            Duration::ZERO,
            LinkedBlockingQueue::new(1),
            Arc::new(DefaultThreadFactory::new()),
            Arc::new(DiscardOldestPolicy),
        )
        .unwrap();
        let release = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&release);
        pool.execute(runnable(move || {
            while !r.load(Ordering::SeqCst) {
                Thread::yield_now();
            }
        }))
        .unwrap();
        let first = pool.submit(|| Ok(1)).unwrap();
        let second = pool.submit(|| Ok(2)).unwrap();
        assert_eq!(pool.queue().len(), 1);
        release.store(true, Ordering::SeqCst);
        assert_eq!(second.get().unwrap(), 2);
        assert!(!first.is_done());
    }

    #[test]
    fn test_cancel_dequeues_pending_task() {
        let pool = Executors::new_single_thread_executor().unwrap();
        let release = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&release);
        let blocker = pool
            .submit_runnable(move || {
                while !r.load(Ordering::SeqCst) {
                    Thread::yield_now();
                }
            })
            .unwrap();

        let queued = pool.submit(|| Ok(1)).unwrap();
        assert_eq!(pool.queue().len(), 1);
        assert!(queued.cancel(true));
        assert_eq!(pool.queue().len(), 0);
        assert!(matches!(queued.get(), Err(Error::Cancellation)));

        let other = pool.submit(|| Ok(2)).unwrap();
        assert!(other.cancel(false));
        assert!(pool.queue().is_empty());

        release.store(true, Ordering::SeqCst);
        blocker.get().unwrap();
        assert_eq!(pool.submit(|| Ok(3)).unwrap().get().unwrap(), 3);
    }

    #[test]
    fn test_cached_pool_reuses_idle_worker() {
        let pool = Executors::new_cached_thread_pool().unwrap();
        let a = pool.submit(|| Ok(Thread::current().id())).unwrap().get().unwrap();
        // Give the worker time to park in the hand-off poll
        std::thread::sleep(Duration::from_millis(50));
        let b = pool.submit(|| Ok(Thread::current().id())).unwrap().get().unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.largest_pool_size(), 1);
    }

    #[test]
    fn test_surplus_workers_time_out() {
        let pool = ThreadPoolExecutor::new(
            1,
            4,
            Duration::from_millis(20),
            LinkedBlockingQueue::hand_off(),
        )
        .unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let futures: Vec<_> = (0..4)
            .map(|_| {
                let c = Arc::clone(&count);
                pool.submit(move || {
                    std::thread::sleep(Duration::from_millis(30));
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap()
            })
            .collect();
        for f in &futures {
            f.get().unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 4);
        assert_eq!(pool.largest_pool_size(), 4);
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(pool.pool_size(), 1);
    }

    #[test]
    fn test_purge_and_remove() {
        let pool = Executors::new_single_thread_executor().unwrap();
        let release = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&release);
        pool.execute(runnable(move || {
            while !r.load(Ordering::SeqCst) {
                Thread::yield_now();
            }
        }))
        .unwrap();
        let doomed = pool.submit(|| Ok(())).unwrap();
        doomed.cancel(false);
        let plain = runnable(|| {});
        pool.execute(plain.clone()).unwrap();
        assert_eq!(pool.purge(), 1);
        assert!(pool.remove(&plain));
        assert!(pool.queue().is_empty());
        release.store(true, Ordering::SeqCst);
    }

    #[test]
    fn test_invoke_all_and_any() {
        let pool = Executors::new_fixed_thread_pool(2).unwrap();
        let tasks: Vec<Callable<u32>> =
            (1..=4u32).map(|i| -> Callable<u32> { Box::new(move || Ok(i)) }).collect();
        let futures = pool.invoke_all(tasks).unwrap();
        assert!(futures.iter().all(|f| f.is_done()));
        assert_eq!(futures.iter().map(|f| f.get().unwrap()).sum::<u32>(), 10);

        let tasks: Vec<Callable<u32>> = vec![
            Box::new(|| {
                Thread::sleep(Duration::from_secs(5))?;
                Ok(1)
            }),
            Box::new(|| Ok(2)),
        ];
        assert_eq!(pool.invoke_any(tasks).unwrap(), 2);
    }

    #[test]
    fn test_invoke_all_timeout_cancels_slow() {
        let pool = Executors::new_fixed_thread_pool(2).unwrap();
        let tasks: Vec<Callable<u32>> = vec![
            Box::new(|| Ok(1)),
            Box::new(|| {
                while !Thread::interrupted() {
                    Thread::yield_now();
                }
                Ok(2)
            }),
        ];
        let futures = pool
            .invoke_all_timeout(tasks, Duration::from_millis(50))
            .unwrap();
        assert_eq!(futures[0].get().unwrap(), 1);
        assert!(futures[1].is_cancelled());
    }

    #[test]
    fn test_invoke_any_timeout() {
        let pool = Executors::new_fixed_thread_pool(1).unwrap();
        let tasks: Vec<Callable<u32>> = vec![Box::new(|| {
            while !Thread::interrupted() {
                Thread::yield_now();
            }
            Ok(1)
        })];
        let err = pool
            .invoke_any_timeout(tasks, Duration::from_millis(30))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }
}
