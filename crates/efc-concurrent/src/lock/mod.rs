//! Reentrant mutual exclusion
//!
//! State: owning thread id (0 = free), hold count, and a FIFO queue of
//! waiting threads. Only the queue head attempts the owner CAS; in
//! non-fair mode a newly arriving thread may barge ahead of the queue.
//!
//! Release stores owner = 0 and then unparks the current head. A waiter
//! enqueues itself before its CAS attempt, so a release either sees the
//! waiter in the queue or the waiter sees the free owner word.

mod condition;

pub use condition::Condition;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use efc_core::constants::NO_THREAD;
use efc_core::{Error, Result, SpinLock};

use crate::park::ParkTimeout;
use crate::thread::{current_id, Thread, ThreadState};

/// Node waiting for the lock or for a condition.
pub(crate) struct WaitNode {
    thread: Thread,
    status: AtomicU8,
}

const NODE_WAITING: u8 = 0;
/// Moved from a condition queue to the lock queue
const NODE_TRANSFERRED: u8 = 1;

impl WaitNode {
    fn for_current() -> Arc<WaitNode> {
        Arc::new(WaitNode {
            thread: Thread::current(),
            status: AtomicU8::new(NODE_WAITING),
        })
    }
}

pub(crate) struct LockInner {
    owner: AtomicU64,
    holds: AtomicU32,
    fair: bool,
    queue: SpinLock<VecDeque<Arc<WaitNode>>>,
}

/// Whether an acquire may be abandoned.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Interrupts {
    /// Remember interrupts and re-assert the flag once acquired
    Defer,
    /// Abandon the acquire with `Interrupted`
    Abort,
}

impl LockInner {
    #[inline]
    fn try_cas(&self, me: u64) -> bool {
        self.owner
            .compare_exchange(NO_THREAD, me, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    /// Reentrant fast path plus a CAS attempt. `barge` ignores queued
    /// waiters.
    fn try_acquire(&self, me: u64, barge: bool) -> bool {
        let owner = self.owner.load(Ordering::SeqCst);
        if owner == me {
            let holds = self.holds.load(Ordering::Relaxed);
            self.holds.store(holds + 1, Ordering::Relaxed);
            return true;
        }
        if owner != NO_THREAD {
            return false;
        }
        if !barge && !self.queue.lock().is_empty() {
            return false;
        }
        if self.try_cas(me) {
            self.holds.store(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    fn is_head(&self, node: &Arc<WaitNode>) -> bool {
        self.queue
            .lock()
            .front()
            .map_or(false, |h| Arc::ptr_eq(h, node))
    }

    pub(crate) fn enqueue(&self, node: &Arc<WaitNode>) {
        self.queue.lock().push_back(Arc::clone(node));
    }

    /// Remove `node` from the queue; if that exposes a new head while the
    /// lock is free, wake it.
    fn dequeue(&self, node: &Arc<WaitNode>) {
        let next = {
            let mut q = self.queue.lock();
            let was_head = q.front().map_or(false, |h| Arc::ptr_eq(h, node));
            q.retain(|n| !Arc::ptr_eq(n, node));
            if was_head {
                q.front().cloned()
            } else {
                None
            }
        };
        if let Some(next) = next {
            if self.owner.load(Ordering::SeqCst) == NO_THREAD {
                next.thread.unpark();
            }
        }
    }

    fn wake_head(&self) {
        let head = self.queue.lock().front().cloned();
        if let Some(head) = head {
            head.thread.unpark();
        }
    }

    /// Acquire with `node` already queued; on success the hold count is
    /// set to `holds`. `Ok(false)` means the deadline passed.
    fn acquire_queued(
        &self,
        node: &Arc<WaitNode>,
        holds: u32,
        interrupts: Interrupts,
        deadline: Option<Instant>,
    ) -> Result<bool> {
        let me = node.thread.id();
        let mut deferred_interrupt = false;
        let prior_state = node.thread.state();
        node.thread.set_state(if deadline.is_some() {
            ThreadState::TimedWaiting
        } else {
            ThreadState::Blocked
        });

        let result = loop {
            if self.is_head(node) && self.try_cas(me) {
                self.holds.store(holds, Ordering::Relaxed);
                self.dequeue(node);
                break Ok(true);
            }
            let timeout = match deadline {
                None => ParkTimeout::Forever,
                Some(d) => match ParkTimeout::until_instant(d) {
                    Some(t) => t,
                    None => {
                        self.dequeue(node);
                        break Ok(false);
                    }
                },
            };
            node.thread.park_raw(timeout);
            if Thread::interrupted() {
                match interrupts {
                    Interrupts::Abort => {
                        self.dequeue(node);
                        break Err(Error::Interrupted);
                    }
                    Interrupts::Defer => deferred_interrupt = true,
                }
            }
        };

        node.thread.set_state(prior_state);
        if deferred_interrupt {
            node.thread.interrupt();
        }
        result
    }

    fn acquire(&self, interrupts: Interrupts, deadline: Option<Instant>) -> Result<bool> {
        let me = current_id();
        if interrupts == Interrupts::Abort && Thread::interrupted() {
            return Err(Error::Interrupted);
        }
        if self.try_acquire(me, !self.fair) {
            return Ok(true);
        }
        let node = WaitNode::for_current();
        self.enqueue(&node);
        self.acquire_queued(&node, 1, interrupts, deadline)
    }

    /// Drop every hold of the current owner; returns the count released.
    pub(crate) fn release_all(&self) -> Result<u32> {
        let me = current_id();
        if self.owner.load(Ordering::SeqCst) != me {
            return Err(Error::IllegalMonitorState(
                "current thread does not hold the lock".into(),
            ));
        }
        let holds = self.holds.swap(0, Ordering::Relaxed);
        self.owner.store(NO_THREAD, Ordering::SeqCst);
        self.wake_head();
        Ok(holds)
    }

    fn release(&self) -> Result<()> {
        let me = current_id();
        if self.owner.load(Ordering::SeqCst) != me {
            return Err(Error::IllegalMonitorState(
                "current thread does not hold the lock".into(),
            ));
        }
        let holds = self.holds.load(Ordering::Relaxed) - 1;
        self.holds.store(holds, Ordering::Relaxed);
        if holds == 0 {
            self.owner.store(NO_THREAD, Ordering::SeqCst);
            self.wake_head();
        }
        Ok(())
    }

    pub(crate) fn is_held_by_current(&self) -> bool {
        self.owner.load(Ordering::SeqCst) == current_id()
    }
}

/// A reentrant mutual-exclusion lock with optional FIFO fairness.
///
/// `lock` and `unlock` pair explicitly; [`ReentrantLock::guard`] gives a
/// scoped hold instead.
#[derive(Clone)]
pub struct ReentrantLock {
    inner: Arc<LockInner>,
}

impl ReentrantLock {
    /// A non-fair lock.
    pub fn new() -> Self {
        Self::with_fairness(false)
    }

    pub fn with_fairness(fair: bool) -> Self {
        ReentrantLock {
            inner: Arc::new(LockInner {
                owner: AtomicU64::new(NO_THREAD),
                holds: AtomicU32::new(0),
                fair,
                queue: SpinLock::new(VecDeque::new()),
            }),
        }
    }

    /// Acquire, waiting as long as needed. Interrupts received while
    /// waiting are re-asserted once the lock is held.
    pub fn lock(&self) {
        // Cannot fail: interrupts are deferred and there is no deadline
        let _ = self.inner.acquire(Interrupts::Defer, None);
    }

    /// Acquire unless interrupted before or while waiting.
    pub fn lock_interruptibly(&self) -> Result<()> {
        self.inner.acquire(Interrupts::Abort, None).map(|_| ())
    }

    /// Acquire only if free now (or already held). Barges even on a fair
    /// lock.
    pub fn try_lock(&self) -> bool {
        self.inner.try_acquire(current_id(), true)
    }

    /// Acquire within `timeout`, honouring fairness.
    pub fn try_lock_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now().checked_add(timeout);
        self.inner.acquire(Interrupts::Abort, deadline)
    }

    /// Release one hold. Fails with `IllegalMonitorState` for non-owners.
    pub fn unlock(&self) -> Result<()> {
        self.inner.release()
    }

    /// Acquire and return a guard that releases on drop.
    pub fn guard(&self) -> ReentrantLockGuard<'_> {
        self.lock();
        ReentrantLockGuard { lock: self }
    }

    pub fn new_condition(&self) -> Condition {
        Condition::new(Arc::clone(&self.inner))
    }

    // ── Observers ──

    pub fn is_fair(&self) -> bool {
        self.inner.fair
    }

    pub fn is_locked(&self) -> bool {
        self.inner.owner.load(Ordering::SeqCst) != NO_THREAD
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.inner.is_held_by_current()
    }

    /// Holds of the current thread; 0 when it is not the owner.
    pub fn hold_count(&self) -> u32 {
        if self.inner.is_held_by_current() {
            self.inner.holds.load(Ordering::Relaxed)
        } else {
            0
        }
    }

    /// Id of the owning thread, if any.
    pub fn owner_id(&self) -> Option<u64> {
        match self.inner.owner.load(Ordering::SeqCst) {
            NO_THREAD => None,
            id => Some(id),
        }
    }

    pub fn has_queued_threads(&self) -> bool {
        !self.inner.queue.lock().is_empty()
    }

    pub fn has_queued_thread(&self, thread: &Thread) -> bool {
        self.inner.queue.lock().iter().any(|n| n.thread == *thread)
    }

    pub fn queue_length(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Whether any thread waits on `condition`, which must belong to this
    /// lock and be called by the owner.
    pub fn has_waiters(&self, condition: &Condition) -> Result<bool> {
        self.check_condition(condition)?;
        Ok(condition.waiter_count() > 0)
    }

    pub fn wait_queue_length(&self, condition: &Condition) -> Result<usize> {
        self.check_condition(condition)?;
        Ok(condition.waiter_count())
    }

    fn check_condition(&self, condition: &Condition) -> Result<()> {
        if !condition.belongs_to(&self.inner) {
            return Err(Error::illegal_argument("condition belongs to another lock"));
        }
        if !self.inner.is_held_by_current() {
            return Err(Error::IllegalMonitorState(
                "current thread does not hold the lock".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ReentrantLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReentrantLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReentrantLock")
            .field("owner", &self.owner_id())
            .field("fair", &self.is_fair())
            .field("queued", &self.queue_length())
            .finish()
    }
}

/// Releases one hold when dropped.
pub struct ReentrantLockGuard<'a> {
    lock: &'a ReentrantLock,
}

impl Drop for ReentrantLockGuard<'_> {
    fn drop(&mut self) {
        // The guard's own hold is always present
        let _ = self.lock.unlock();
    }
}
