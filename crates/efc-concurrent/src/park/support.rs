//! Park/unpark addressed by thread
//!
//! These entry points add the interrupt rule on top of the raw
//! [`Parker`](super::Parker): a park by a thread whose interrupt flag is
//! set returns at once and leaves the flag set. `Thread::interrupt`
//! unparks the target, so a flag raised during the park also ends it.

use super::ParkTimeout;
use crate::thread::Thread;

/// Park the current thread until unparked, interrupted, or spuriously woken.
pub fn park() {
    park_timeout(ParkTimeout::Forever);
}

/// Park for at most `nanos`; non-positive values return at once.
pub fn park_nanos(nanos: i64) {
    if let Some(t) = ParkTimeout::from_nanos(nanos) {
        park_timeout(t);
    }
}

/// Park until the wall clock reaches `epoch_millis`.
pub fn park_until(epoch_millis: i64) {
    if let Some(t) = ParkTimeout::from_epoch_millis(epoch_millis) {
        park_timeout(t);
    }
}

pub fn park_timeout(timeout: ParkTimeout) {
    let me = Thread::current();
    if me.is_interrupted() {
        return;
    }
    me.park_raw(timeout);
}

/// Give `thread` a permit. Safe in any thread state; a no-op on threads
/// that have not started or have exited.
pub fn unpark(thread: &Thread) {
    thread.unpark();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn test_interrupted_thread_does_not_park() {
        let me = Thread::current();
        me.interrupt();
        let start = Instant::now();
        park();
        park_nanos(5_000_000_000);
        assert!(start.elapsed() < Duration::from_secs(1));
        // Flag survives the park
        assert!(Thread::interrupted());
        assert!(!me.is_interrupted());
    }

    #[test]
    fn test_unpark_by_thread() {
        let flag = Arc::new(AtomicBool::new(false));
        let f2 = Arc::clone(&flag);
        let t = Thread::spawn(move || {
            while !f2.load(Ordering::Acquire) {
                park();
            }
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        flag.store(true, Ordering::Release);
        unpark(&t);
        assert!(t.join_timeout(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn test_interrupt_ends_park() {
        let t = Thread::spawn(|| {
            while !Thread::current().is_interrupted() {
                park();
            }
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        t.interrupt();
        assert!(t.join_timeout(Duration::from_secs(5)).unwrap());
    }
}
