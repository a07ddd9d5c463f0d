//! Park event on `std::sync::Condvar`
//!
//! Used on platforms without futex. The permit lives inside the mutex,
//! with the same -1/0/1 meaning as the futex word.

use super::{ParkPrimitive, ParkTimeout};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

pub struct CondvarEvent {
    permit: Mutex<i32>,
    condvar: Condvar,
}

impl CondvarEvent {
    pub fn new() -> Self {
        Self {
            permit: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    // A panic while holding the mutex cannot leave the permit inconsistent
    fn lock(&self) -> MutexGuard<'_, i32> {
        self.permit.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CondvarEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl ParkPrimitive for CondvarEvent {
    fn park(&self, timeout: ParkTimeout) -> bool {
        let mut guard = self.lock();
        if *guard == 1 {
            *guard = 0;
            return true;
        }
        *guard = -1;

        guard = match timeout {
            ParkTimeout::Forever => self
                .condvar
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner),
            ParkTimeout::Relative(d) => {
                self.condvar
                    .wait_timeout(guard, d)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            ParkTimeout::Absolute(at) => {
                match at.duration_since(SystemTime::now()) {
                    Ok(d) => {
                        self.condvar
                            .wait_timeout(guard, d)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0
                    }
                    Err(_) => guard,
                }
            }
        };

        let consumed = *guard == 1;
        *guard = 0;
        consumed
    }

    fn unpark(&self) {
        let prior = {
            let mut guard = self.lock();
            std::mem::replace(&mut *guard, 1)
        };
        if prior == -1 {
            self.condvar.notify_one();
        }
    }

    fn reset(&self) {
        *self.lock() = 0;
    }

    fn state(&self) -> i32 {
        *self.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_timeout_and_wake() {
        let ev = Arc::new(CondvarEvent::new());
        let start = Instant::now();
        assert!(!ev.park(ParkTimeout::Relative(Duration::from_millis(30))));
        assert!(start.elapsed() >= Duration::from_millis(20));

        let ev2 = Arc::clone(&ev);
        let h = thread::spawn(move || while !ev2.park(ParkTimeout::Forever) {});
        thread::sleep(Duration::from_millis(20));
        ev.unpark();
        h.join().unwrap();
    }
}
