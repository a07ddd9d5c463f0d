//! Condition variables bound to a [`ReentrantLock`](super::ReentrantLock)
//!
//! A wait queues a node on the condition, fully releases the lock and
//! parks until the node has been transferred to the lock's acquire queue.
//! Transfer happens either by `signal` (status WAITING -> TRANSFERRED under
//! the condition's queue lock) or by the waiter itself on timeout or
//! interrupt. A transferred node then reacquires the lock through the
//! normal queue with its saved hold count, so a signalled thread never
//! races unqueued for the lock.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use efc_core::{Error, Result, SpinLock};

use super::{Interrupts, LockInner, WaitNode, NODE_TRANSFERRED, NODE_WAITING};
use crate::park::ParkTimeout;
use crate::thread::{Thread, ThreadState};

/// How an interrupt during a wait is reported.
#[derive(Clone, Copy, PartialEq, Eq)]
enum InterruptMode {
    None,
    /// Interrupted before being signalled: fail with `Interrupted`
    Throw,
    /// Interrupted after being signalled: re-assert the flag
    Reinterrupt,
}

struct CondInner {
    lock: Arc<LockInner>,
    waiters: SpinLock<VecDeque<Arc<WaitNode>>>,
}

#[derive(Clone)]
pub struct Condition {
    inner: Arc<CondInner>,
}

impl Condition {
    pub(crate) fn new(lock: Arc<LockInner>) -> Self {
        Condition {
            inner: Arc::new(CondInner {
                lock,
                waiters: SpinLock::new(VecDeque::new()),
            }),
        }
    }

    pub(crate) fn belongs_to(&self, lock: &Arc<LockInner>) -> bool {
        Arc::ptr_eq(&self.inner.lock, lock)
    }

    pub(crate) fn waiter_count(&self) -> usize {
        self.inner.waiters.lock().len()
    }

    fn check_owner(&self) -> Result<()> {
        if self.inner.lock.is_held_by_current() {
            Ok(())
        } else {
            Err(Error::IllegalMonitorState(
                "current thread does not hold the lock".into(),
            ))
        }
    }

    /// Move `node` to the lock queue if no signal got there first.
    fn transfer_self(&self, node: &Arc<WaitNode>) -> bool {
        let mut waiters = self.inner.waiters.lock();
        if node.status.load(Ordering::SeqCst) != NODE_WAITING {
            return false;
        }
        node.status.store(NODE_TRANSFERRED, Ordering::SeqCst);
        waiters.retain(|n| !Arc::ptr_eq(n, node));
        self.inner.lock.enqueue(node);
        true
    }

    /// Returns `Ok(false)` when the deadline passed before a signal.
    fn wait_inner(&self, deadline: Option<Instant>, interruptible: bool) -> Result<bool> {
        self.check_owner()?;
        if interruptible && Thread::interrupted() {
            return Err(Error::Interrupted);
        }

        let node = WaitNode::for_current();
        self.inner.waiters.lock().push_back(Arc::clone(&node));
        let holds = self.inner.lock.release_all()?;

        let me = &node.thread;
        me.set_state(if deadline.is_some() {
            ThreadState::TimedWaiting
        } else {
            ThreadState::Waiting
        });

        let mut mode = InterruptMode::None;
        let mut deferred = false;
        let mut timed_out = false;
        while node.status.load(Ordering::SeqCst) == NODE_WAITING {
            let timeout = match deadline {
                None => ParkTimeout::Forever,
                Some(d) => match ParkTimeout::until_instant(d) {
                    Some(t) => t,
                    None => {
                        timed_out = self.transfer_self(&node);
                        break;
                    }
                },
            };
            me.park_raw(timeout);
            if Thread::interrupted() {
                if interruptible {
                    mode = if self.transfer_self(&node) {
                        InterruptMode::Throw
                    } else {
                        InterruptMode::Reinterrupt
                    };
                    break;
                }
                deferred = true;
            }
        }
        me.set_state(ThreadState::Runnable);

        // Node is in the lock queue now, by signal or by self-transfer
        self.inner
            .lock
            .acquire_queued(&node, holds, Interrupts::Defer, None)?;

        match mode {
            InterruptMode::Throw => {
                // Drop any flag re-asserted while reacquiring
                Thread::interrupted();
                Err(Error::Interrupted)
            }
            InterruptMode::Reinterrupt => {
                me.interrupt();
                Ok(!timed_out)
            }
            InterruptMode::None => {
                if deferred {
                    me.interrupt();
                }
                Ok(!timed_out)
            }
        }
    }

    /// Release the lock and wait for a signal or interrupt.
    pub fn wait(&self) -> Result<()> {
        self.wait_inner(None, true).map(|_| ())
    }

    /// Wait for a signal only; an interrupt is re-asserted on return.
    pub fn wait_uninterruptibly(&self) -> Result<()> {
        self.wait_inner(None, false).map(|_| ())
    }

    /// Wait at most `nanos`; returns an estimate of the time left, which
    /// is `<= 0` when the wait timed out.
    pub fn wait_nanos(&self, nanos: i64) -> Result<i64> {
        let start = Instant::now();
        let budget = Duration::from_nanos(nanos.max(0) as u64);
        let deadline = start.checked_add(budget);
        if nanos <= 0 {
            self.wait_inner(Some(start), true)?;
            return Ok(0);
        }
        self.wait_inner(deadline, true)?;
        let elapsed = start.elapsed();
        Ok(nanos.saturating_sub(elapsed.as_nanos().min(i64::MAX as u128) as i64))
    }

    /// Wait at most `timeout`; `Ok(false)` if it elapsed first.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        self.wait_inner(Instant::now().checked_add(timeout), true)
    }

    /// Wait until the wall clock reaches `deadline`.
    pub fn wait_until(&self, deadline: SystemTime) -> Result<bool> {
        let remaining = deadline
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
        self.wait_timeout(remaining)
    }

    /// Move the longest waiter to the lock queue.
    pub fn signal(&self) -> Result<()> {
        self.check_owner()?;
        let mut waiters = self.inner.waiters.lock();
        if let Some(node) = waiters.pop_front() {
            node.status.store(NODE_TRANSFERRED, Ordering::SeqCst);
            self.inner.lock.enqueue(&node);
        }
        Ok(())
    }

    /// Move every waiter to the lock queue.
    pub fn signal_all(&self) -> Result<()> {
        self.check_owner()?;
        let mut waiters = self.inner.waiters.lock();
        while let Some(node) = waiters.pop_front() {
            node.status.store(NODE_TRANSFERRED, Ordering::SeqCst);
            self.inner.lock.enqueue(&node);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condition")
            .field("waiters", &self.waiter_count())
            .finish()
    }
}
