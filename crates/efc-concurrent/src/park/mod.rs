//! Park / unpark
//!
//! A per-thread permit bounded to {-1: blocked, 0: neutral, 1: signalled}.
//! Permits never accumulate: any number of unparks before a park leave a
//! single permit, which the next park consumes.
//!
//! Two users sit on top of the same platform event:
//! - [`Parker`], the user-visible park/unpark target of a thread. Pooled on
//!   a process-wide free list and handed to the next thread that starts.
//! - [`ParkEvent`], the event a thread blocks on inside `sleep` and `join`.
//!
//! Every park may return spuriously; callers re-check their predicate.

mod support;

pub use support::{park, park_nanos, park_timeout, park_until, unpark};

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use efc_core::config;
use efc_core::SpinLock;

/// How long a park may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkTimeout {
    /// Until unparked
    Forever,
    /// Relative to now, measured on the monotonic clock
    Relative(Duration),
    /// Absolute wall-clock deadline
    Absolute(SystemTime),
}

impl ParkTimeout {
    /// Relative timeout from a signed nanosecond count. `None` when the
    /// count is not positive.
    pub fn from_nanos(nanos: i64) -> Option<Self> {
        (nanos > 0).then(|| ParkTimeout::Relative(Duration::from_nanos(nanos as u64)))
    }

    /// Absolute timeout from epoch milliseconds. `None` when the deadline
    /// has already passed.
    pub fn from_epoch_millis(millis: i64) -> Option<Self> {
        if millis <= 0 {
            return None;
        }
        let deadline = UNIX_EPOCH + Duration::from_millis(millis as u64);
        (deadline > SystemTime::now()).then_some(ParkTimeout::Absolute(deadline))
    }

    /// Relative timeout ending at a monotonic instant. `None` once passed.
    pub fn until_instant(deadline: Instant) -> Option<Self> {
        let now = Instant::now();
        (deadline > now).then(|| ParkTimeout::Relative(deadline - now))
    }
}

/// A platform wait primitive implementing the three-state permit.
pub trait ParkPrimitive: Send + Sync {
    /// Block until a permit is available or the timeout elapses; consume
    /// the permit. Returns `true` when a permit was consumed.
    ///
    /// Only the owning thread may call this.
    fn park(&self, timeout: ParkTimeout) -> bool;

    /// Make a permit available, releasing the parked owner if any.
    fn unpark(&self);

    /// Drop any pending permit.
    fn reset(&self);

    /// Current permit state, -1, 0 or 1. Hint only.
    fn state(&self) -> i32;
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        pub use futex_linux::FutexEvent as PlatformEvent;
    } else {
        mod fallback;
        pub use fallback::CondvarEvent as PlatformEvent;
    }
}

/// Park target of one live thread.
pub struct Parker {
    event: PlatformEvent,
}

impl Parker {
    fn new() -> Self {
        Parker {
            event: PlatformEvent::new(),
        }
    }

    /// Take a parker from the free list, or allocate one.
    pub fn allocate() -> Arc<Parker> {
        if let Some(parker) = FREE_LIST.lock().pop() {
            return parker;
        }
        Arc::new(Parker::new())
    }

    /// Return a parker whose thread has exited.
    ///
    /// Any pending permit is dropped. The list is capped by
    /// `parker_free_list_max`; surplus parkers are freed.
    pub fn release(parker: Arc<Parker>) {
        parker.event.reset();
        let max = config::global().parker_free_list_max;
        let mut list = FREE_LIST.lock();
        if list.len() < max {
            list.push(parker);
        }
    }

    /// Park indefinitely.
    #[inline]
    pub fn park(&self) -> bool {
        self.event.park(ParkTimeout::Forever)
    }

    /// Park for at most `nanos`; returns at once when `nanos <= 0`.
    pub fn park_nanos(&self, nanos: i64) -> bool {
        match ParkTimeout::from_nanos(nanos) {
            Some(t) => self.event.park(t),
            None => false,
        }
    }

    /// Park until the wall clock reaches `epoch_millis`.
    pub fn park_until(&self, epoch_millis: i64) -> bool {
        match ParkTimeout::from_epoch_millis(epoch_millis) {
            Some(t) => self.event.park(t),
            None => false,
        }
    }

    #[inline]
    pub fn park_timeout(&self, timeout: ParkTimeout) -> bool {
        self.event.park(timeout)
    }

    #[inline]
    pub fn unpark(&self) {
        self.event.unpark();
    }

    pub fn state(&self) -> i32 {
        self.event.state()
    }
}

impl std::fmt::Debug for Parker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parker").field("state", &self.state()).finish()
    }
}

static FREE_LIST: SpinLock<Vec<Arc<Parker>>> = SpinLock::new(Vec::new());

/// Parkers currently waiting for reuse.
pub fn free_list_len() -> usize {
    FREE_LIST.lock().len()
}

/// Pre-size the free list.
pub fn init() {
    let max = config::global().parker_free_list_max;
    let mut list = FREE_LIST.lock();
    let want = max.min(64);
    if list.capacity() < want {
        let len = list.len();
        list.reserve(want - len);
    }
}

/// Drop every pooled parker.
pub fn teardown() {
    let drained: Vec<_> = std::mem::take(&mut *FREE_LIST.lock());
    log::trace!("parker free list released {} entries", drained.len());
}

/// Event a thread blocks on while sleeping or joining.
///
/// Wait lists hold events by `Arc`; firing a list unparks every member.
pub struct ParkEvent {
    event: PlatformEvent,
}

impl ParkEvent {
    pub fn new() -> Arc<ParkEvent> {
        Arc::new(ParkEvent {
            event: PlatformEvent::new(),
        })
    }

    #[inline]
    pub fn park(&self, timeout: ParkTimeout) -> bool {
        self.event.park(timeout)
    }

    #[inline]
    pub fn unpark(&self) {
        self.event.unpark();
    }

    pub fn reset(&self) {
        self.event.reset();
    }
}

/// Events waiting for a one-shot occurrence (thread exit).
#[derive(Default)]
pub struct WaitList {
    waiters: SpinLock<Vec<Arc<ParkEvent>>>,
}

impl WaitList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: &Arc<ParkEvent>) {
        self.waiters.lock().push(Arc::clone(event));
    }

    /// Unlink `event` if still present.
    pub fn remove(&self, event: &Arc<ParkEvent>) {
        self.waiters.lock().retain(|e| !Arc::ptr_eq(e, event));
    }

    /// Unlink every waiter and unpark it.
    pub fn fire_all(&self) {
        let waiters = std::mem::take(&mut *self.waiters.lock());
        for w in waiters {
            w.unpark();
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
