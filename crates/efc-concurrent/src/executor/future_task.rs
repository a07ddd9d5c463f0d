//! Cancellable computation with a one-shot outcome
//!
//! State machine:
//!
//! ```text
//! NEW -> COMPLETING -> NORMAL
//! NEW -> COMPLETING -> EXCEPTIONAL
//! NEW -> CANCELLED
//! NEW -> INTERRUPTING -> INTERRUPTED
//! ```
//!
//! Every move out of NEW is a CAS, so exactly one of `run` and `cancel`
//! decides the outcome. Threads blocked in `get` push a node onto a
//! Treiber stack and park; completion swaps the whole stack out and
//! unparks every node still carrying a thread.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use efc_core::constants::NO_THREAD;
use efc_core::{Error, Result, SpinLock};

use super::{Future, Runnable};
use crate::park::{self, ParkTimeout};
use crate::thread::{current_id, panic_message, Thread};

const NEW: u8 = 0;
const COMPLETING: u8 = 1;
const NORMAL: u8 = 2;
const EXCEPTIONAL: u8 = 3;
const CANCELLED: u8 = 4;
const INTERRUPTING: u8 = 5;
const INTERRUPTED: u8 = 6;

/// Observable state of a [`FutureTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FutureState {
    New = NEW,
    Completing = COMPLETING,
    Normal = NORMAL,
    Exceptional = EXCEPTIONAL,
    Cancelled = CANCELLED,
    Interrupting = INTERRUPTING,
    Interrupted = INTERRUPTED,
}

impl FutureState {
    fn from_u8(v: u8) -> Self {
        match v {
            NEW => FutureState::New,
            COMPLETING => FutureState::Completing,
            NORMAL => FutureState::Normal,
            EXCEPTIONAL => FutureState::Exceptional,
            CANCELLED => FutureState::Cancelled,
            INTERRUPTING => FutureState::Interrupting,
            _ => FutureState::Interrupted,
        }
    }
}

type Callable<T> = Box<dyn FnOnce() -> Result<T> + Send + 'static>;
type DoneHook = Box<dyn FnOnce() + Send + 'static>;

/// Treiber stack node. The stack owns one strong count per pushed node.
struct WaitNode {
    thread: SpinLock<Option<Thread>>,
    next: AtomicPtr<WaitNode>,
}

pub struct FutureTask<T> {
    state: AtomicU8,
    callable: SpinLock<Option<Callable<T>>>,
    outcome: SpinLock<Option<Result<T>>>,
    runner: AtomicU64,
    runner_thread: SpinLock<Option<Thread>>,
    waiters: AtomicPtr<WaitNode>,
    // None once the hooks have fired
    done: SpinLock<Option<Vec<DoneHook>>>,
}

impl<T: Send + 'static> FutureTask<T> {
    pub fn new<F>(callable: F) -> Self
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        FutureTask {
            state: AtomicU8::new(NEW),
            callable: SpinLock::new(Some(Box::new(callable))),
            outcome: SpinLock::new(None),
            runner: AtomicU64::new(NO_THREAD),
            runner_thread: SpinLock::new(None),
            waiters: AtomicPtr::new(ptr::null_mut()),
            done: SpinLock::new(Some(Vec::new())),
        }
    }

    /// Wrap a closure with no result; `get` yields `value` on success.
    pub fn from_runnable<F>(f: F, value: T) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new(move || {
            f();
            Ok(value)
        })
    }

    /// Run the computation unless it already ran, is running, or was
    /// cancelled.
    pub fn run(&self) {
        let me = current_id();
        if self.state.load(Ordering::SeqCst) != NEW
            || self
                .runner
                .compare_exchange(NO_THREAD, me, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            return;
        }
        *self.runner_thread.lock() = Some(Thread::current());

        let callable = if self.state.load(Ordering::SeqCst) == NEW {
            self.callable.lock().take()
        } else {
            None
        };
        if let Some(callable) = callable {
            match panic::catch_unwind(AssertUnwindSafe(callable)) {
                Ok(Ok(value)) => self.set(Ok(value)),
                Ok(Err(e)) => self.set(Err(e)),
                Err(payload) => self.set(Err(Error::Panicked(panic_message(payload.as_ref())))),
            }
        }

        self.runner_thread.lock().take();
        self.runner.store(NO_THREAD, Ordering::SeqCst);
        if self.state.load(Ordering::SeqCst) >= INTERRUPTING {
            self.absorb_cancel_interrupt();
        }
    }

    fn set(&self, outcome: Result<T>) {
        if self
            .state
            .compare_exchange(NEW, COMPLETING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let terminal = if outcome.is_ok() { NORMAL } else { EXCEPTIONAL };
        *self.outcome.lock() = Some(outcome);
        self.state.store(terminal, Ordering::Release);
        self.finish_completion();
    }

    /// Wait out a concurrent `cancel(true)` so its interrupt lands here,
    /// then clear it.
    fn absorb_cancel_interrupt(&self) {
        while self.state.load(Ordering::SeqCst) == INTERRUPTING {
            Thread::yield_now();
        }
        Thread::interrupted();
    }

    /// Attempt to cancel. Fails if the task already completed or was
    /// cancelled. With `may_interrupt`, the running thread is interrupted.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        let target = if may_interrupt { INTERRUPTING } else { CANCELLED };
        if self
            .state
            .compare_exchange(NEW, target, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        if may_interrupt {
            // The runner id is claimed just before its handle is published
            loop {
                let runner = self.runner_thread.lock().clone();
                if let Some(t) = runner {
                    t.interrupt();
                    break;
                }
                if self.runner.load(Ordering::SeqCst) == NO_THREAD {
                    break;
                }
                Thread::yield_now();
            }
            self.state.store(INTERRUPTED, Ordering::Release);
        }
        self.finish_completion();
        true
    }

    fn finish_completion(&self) {
        let mut node = self.waiters.swap(ptr::null_mut(), Ordering::SeqCst);
        while !node.is_null() {
            // Safety: every pointer on the stack came from Arc::into_raw
            // and is consumed exactly once, here or in Drop
            let owned = unsafe { Arc::from_raw(node as *const WaitNode) };
            if let Some(t) = owned.thread.lock().take() {
                t.unpark();
            }
            node = owned.next.load(Ordering::Acquire);
        }

        let hooks = self.done.lock().take();
        for hook in hooks.into_iter().flatten() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(hook)) {
                log::warn!("future done hook panicked: {}", panic_message(payload.as_ref()));
            }
        }
        self.callable.lock().take();
    }

    /// Register `hook` to run once the task is done, after waiters are
    /// released. Runs immediately if the task is already done.
    pub fn on_done<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut done = self.done.lock();
        match done.as_mut() {
            Some(hooks) => hooks.push(Box::new(hook)),
            None => {
                drop(done);
                hook();
            }
        }
    }

    pub fn state(&self) -> FutureState {
        FutureState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) >= CANCELLED
    }

    pub fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) != NEW
    }

    /// Block until done. Fails only with `Interrupted`.
    pub fn wait_done(&self) -> Result<()> {
        self.await_done(None).map(|_| ())
    }

    /// Block until done or `timeout` passes; `Ok(false)` on timeout.
    pub fn wait_done_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now().checked_add(timeout);
        let s = self.await_done(Some(deadline.unwrap_or_else(far_future)))?;
        Ok(s > COMPLETING)
    }

    fn push_waiter(&self, node: &Arc<WaitNode>) {
        let raw = Arc::into_raw(Arc::clone(node)) as *mut WaitNode;
        let mut head = self.waiters.load(Ordering::Acquire);
        loop {
            node.next.store(head, Ordering::Relaxed);
            match self
                .waiters
                .compare_exchange_weak(head, raw, Ordering::SeqCst, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }

    /// Returns the state once terminal, or the non-terminal state seen
    /// when `deadline` passed.
    fn await_done(&self, deadline: Option<Instant>) -> Result<u8> {
        let mut node: Option<Arc<WaitNode>> = None;
        let leave = |node: &Option<Arc<WaitNode>>| {
            if let Some(n) = node {
                n.thread.lock().take();
            }
        };
        loop {
            if Thread::interrupted() {
                leave(&node);
                return Err(Error::Interrupted);
            }
            let s = self.state.load(Ordering::Acquire);
            if s > COMPLETING {
                leave(&node);
                return Ok(s);
            }
            if s == COMPLETING {
                Thread::yield_now();
                continue;
            }
            if node.is_none() {
                let n = Arc::new(WaitNode {
                    thread: SpinLock::new(Some(Thread::current())),
                    next: AtomicPtr::new(ptr::null_mut()),
                });
                self.push_waiter(&n);
                node = Some(n);
                // Recheck the state before parking
                continue;
            }
            let timeout = match deadline {
                None => ParkTimeout::Forever,
                Some(d) => match ParkTimeout::until_instant(d) {
                    Some(t) => t,
                    None => {
                        leave(&node);
                        return Ok(self.state.load(Ordering::Acquire));
                    }
                },
            };
            park::park_timeout(timeout);
        }
    }
}

impl<T: Clone + Send + 'static> FutureTask<T> {
    fn report(&self, s: u8) -> Result<T> {
        match s {
            NORMAL | EXCEPTIONAL => match self.outcome.lock().as_ref() {
                Some(Ok(v)) => Ok(v.clone()),
                Some(Err(e)) => Err(Error::execution(e.clone())),
                None => Err(Error::illegal_state("completed future has no outcome")),
            },
            _ => Err(Error::Cancellation),
        }
    }

    /// Wait for completion and return the value.
    ///
    /// A failed computation reports `Execution` wrapping its error; a
    /// cancelled one reports `Cancellation`.
    pub fn get(&self) -> Result<T> {
        let mut s = self.state.load(Ordering::Acquire);
        if s <= COMPLETING {
            s = self.await_done(None)?;
        }
        self.report(s)
    }

    pub fn get_timeout(&self, timeout: Duration) -> Result<T> {
        let mut s = self.state.load(Ordering::Acquire);
        if s <= COMPLETING {
            let deadline = Instant::now().checked_add(timeout).unwrap_or_else(far_future);
            s = self.await_done(Some(deadline))?;
            if s <= COMPLETING {
                return Err(Error::Timeout);
            }
        }
        self.report(s)
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(60 * 60 * 24 * 365)
}

impl<T> Drop for FutureTask<T> {
    fn drop(&mut self) {
        let mut node = *self.waiters.get_mut();
        while !node.is_null() {
            // Safety: see finish_completion
            let owned = unsafe { Arc::from_raw(node as *const WaitNode) };
            node = owned.next.load(Ordering::Acquire);
        }
    }
}

impl<T: Send + 'static> Runnable for FutureTask<T> {
    fn run(&self) {
        FutureTask::run(self);
    }

    fn is_cancelled(&self) -> bool {
        FutureTask::is_cancelled(self)
    }

    fn when_done(&self, hook: Box<dyn FnOnce() + Send + 'static>) -> bool {
        self.on_done(hook);
        true
    }
}

impl<T: Clone + Send + 'static> Future<T> for FutureTask<T> {
    fn cancel(&self, may_interrupt: bool) -> bool {
        FutureTask::cancel(self, may_interrupt)
    }

    fn is_cancelled(&self) -> bool {
        FutureTask::is_cancelled(self)
    }

    fn is_done(&self) -> bool {
        FutureTask::is_done(self)
    }

    fn get(&self) -> Result<T> {
        FutureTask::get(self)
    }

    fn get_timeout(&self, timeout: Duration) -> Result<T> {
        FutureTask::get_timeout(self, timeout)
    }
}

impl<T> fmt::Debug for FutureTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureTask")
            .field("state", &FutureState::from_u8(self.state.load(Ordering::Acquire)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[test]
    fn test_run_then_get() {
        let task = FutureTask::new(|| Ok(21 * 2));
        assert!(!task.is_done());
        task.run();
        assert_eq!(task.state(), FutureState::Normal);
        assert_eq!(task.get().unwrap(), 42);
        // Same outcome every time
        assert_eq!(task.get().unwrap(), 42);
    }

    #[test]
    fn test_error_wrapped_in_execution() {
        let task: FutureTask<u8> = FutureTask::new(|| Err(Error::illegal_argument("bad")));
        task.run();
        match task.get() {
            Err(Error::Execution(cause)) => assert!(matches!(*cause, Error::IllegalArgument(_))),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_panic_captured() {
        let task: FutureTask<u8> = FutureTask::new(|| panic!("kaboom"));
        task.run();
        assert_eq!(task.state(), FutureState::Exceptional);
        let err = task.get().unwrap_err();
        assert!(matches!(err.root_cause(), Error::Panicked(m) if m == "kaboom"));
    }

    #[test]
    fn test_run_only_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let task = FutureTask::new(move || Ok(c.fetch_add(1, Ordering::SeqCst)));
        task.run();
        task.run();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_before_run() {
        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);
        let task = FutureTask::new(move || {
            r.store(true, Ordering::SeqCst);
            Ok(())
        });
        assert!(task.cancel(false));
        assert!(!task.cancel(false));
        task.run();
        assert!(!ran.load(Ordering::SeqCst));
        assert!(task.is_cancelled());
        assert!(matches!(task.get(), Err(Error::Cancellation)));
    }

    #[test]
    fn test_cancel_interrupts_runner() {
        let task = Arc::new(FutureTask::new(|| {
            while !Thread::interrupted() {
                std::hint::spin_loop();
            }
            Ok(())
        }));
        let t2 = Arc::clone(&task);
        let worker = Thread::spawn(move || {
            t2.run();
            // Cancellation interrupt does not leak past run
            assert!(!Thread::current().is_interrupted());
        })
        .unwrap();
        while task.runner.load(Ordering::SeqCst) == NO_THREAD {
            Thread::yield_now();
        }
        assert!(task.cancel(true));
        assert_eq!(task.state(), FutureState::Interrupted);
        worker.join().unwrap();
        assert!(matches!(task.get(), Err(Error::Cancellation)));
    }

    #[test]
    fn test_get_blocks_until_done() {
        let task = Arc::new(FutureTask::new(|| {
            std::thread::sleep(Duration::from_millis(30));
            Ok("done")
        }));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let t = Arc::clone(&task);
                Thread::spawn(move || assert_eq!(t.get().unwrap(), "done")).unwrap()
            })
            .collect();
        task.run();
        for w in waiters {
            w.join().unwrap();
        }
    }

    #[test]
    fn test_get_timeout() {
        let task: FutureTask<u8> = FutureTask::new(|| Ok(1));
        assert!(matches!(task.get_timeout(Duration::from_millis(10)), Err(Error::Timeout)));
        assert!(!task.wait_done_timeout(Duration::from_millis(5)).unwrap());
        task.run();
        assert_eq!(task.get_timeout(Duration::from_millis(10)).unwrap(), 1);
    }

    #[test]
    fn test_get_interrupted() {
        let task: Arc<FutureTask<u8>> = Arc::new(FutureTask::new(|| Ok(1)));
        let t2 = Arc::clone(&task);
        let waiter = Thread::spawn(move || {
            assert!(matches!(t2.get(), Err(Error::Interrupted)));
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        waiter.interrupt();
        waiter.join().unwrap();
        assert!(!task.is_done());
    }

    #[test]
    fn test_done_hooks_fire_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let task = FutureTask::from_runnable(|| {}, 7u8);
        let f = Arc::clone(&fired);
        task.on_done(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        task.run();
        task.cancel(true);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // Late registration runs immediately
        let f = Arc::clone(&fired);
        task.on_done(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(task.get().unwrap(), 7);
    }
}
