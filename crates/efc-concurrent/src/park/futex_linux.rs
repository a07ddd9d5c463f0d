//! Linux futex-backed park event
//!
//! Futex word semantics:
//! - -1 = owner is (about to be) blocked in FUTEX_WAIT
//! -  0 = neutral
//! -  1 = permit available
//!
//! Park: consume a permit with a swap; otherwise CAS 0 -> -1 and wait on
//! the word while it stays -1. Unpark: swap in 1 and issue FUTEX_WAKE only
//! if the prior value was -1.
//!
//! Relative timeouts use plain FUTEX_WAIT (CLOCK_MONOTONIC). Absolute
//! deadlines use FUTEX_WAIT_BITSET with FUTEX_CLOCK_REALTIME so a wall
//! clock adjustment moves the wake time with it.

use super::{ParkPrimitive, ParkTimeout};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, UNIX_EPOCH};

const FUTEX_BITSET_MATCH_ANY: u32 = 0xffff_ffff;

pub struct FutexEvent {
    state: AtomicI32,
}

impl FutexEvent {
    pub fn new() -> Self {
        Self {
            state: AtomicI32::new(0),
        }
    }

    fn futex_wait(&self, timeout: ParkTimeout) {
        let (op, ts, val3) = match timeout {
            ParkTimeout::Forever => (libc::FUTEX_WAIT, None, 0u32),
            ParkTimeout::Relative(d) => (libc::FUTEX_WAIT, Some(to_timespec(d)), 0u32),
            ParkTimeout::Absolute(at) => {
                // Pre-epoch deadlines have passed already
                let since_epoch = at.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
                (
                    libc::FUTEX_WAIT_BITSET | libc::FUTEX_CLOCK_REALTIME,
                    Some(to_timespec(since_epoch)),
                    FUTEX_BITSET_MATCH_ANY,
                )
            }
        };
        let ts_ptr = match &ts {
            Some(ts) => ts as *const libc::timespec,
            None => std::ptr::null(),
        };

        // Safety: the futex word outlives the call; the kernel only reads it.
        // ETIMEDOUT, EAGAIN (word changed) and EINTR all mean "re-check".
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.state.as_ptr(),
                op | libc::FUTEX_PRIVATE_FLAG,
                -1i32,
                ts_ptr,
                std::ptr::null::<u32>(),
                val3,
            );
        }
    }

    fn futex_wake(&self) {
        // Safety: as above
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.state.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1i32,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }
}

impl Default for FutexEvent {
    fn default() -> Self {
        Self::new()
    }
}

fn to_timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    }
}

impl ParkPrimitive for FutexEvent {
    fn park(&self, timeout: ParkTimeout) -> bool {
        // Fast path: permit already there
        if self.state.swap(0, Ordering::AcqRel) == 1 {
            return true;
        }
        if self
            .state
            .compare_exchange(0, -1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // An unpark slipped in between the swap and the CAS
            self.state.store(0, Ordering::Release);
            return true;
        }

        self.futex_wait(timeout);

        // 1 = woken by unpark, -1 = timeout or spurious
        self.state.swap(0, Ordering::AcqRel) == 1
    }

    fn unpark(&self) {
        if self.state.swap(1, Ordering::AcqRel) == -1 {
            self.futex_wake();
        }
    }

    fn reset(&self) {
        self.state.store(0, Ordering::Release);
    }

    fn state(&self) -> i32 {
        self.state.load(Ordering::Relaxed)
    }
}

// Safety: FutexEvent only contains an atomic
unsafe impl Send for FutexEvent {}
unsafe impl Sync for FutexEvent {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Instant, SystemTime};

    #[test]
    fn test_relative_timeout() {
        let ev = FutexEvent::new();
        let start = Instant::now();
        assert!(!ev.park(ParkTimeout::Relative(Duration::from_millis(40))));
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(ev.state(), 0);
    }

    #[test]
    fn test_absolute_timeout() {
        let ev = FutexEvent::new();
        let start = Instant::now();
        ev.park(ParkTimeout::Absolute(
            SystemTime::now() + Duration::from_millis(40),
        ));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_wake_blocked() {
        let ev = Arc::new(FutexEvent::new());
        let ev2 = Arc::clone(&ev);
        let handle = thread::spawn(move || {
            while !ev2.park(ParkTimeout::Forever) {}
        });
        // Wait until the owner is actually blocked
        while ev.state() != -1 {
            thread::yield_now();
        }
        ev.unpark();
        handle.join().unwrap();
        assert_eq!(ev.state(), 0);
    }
}
