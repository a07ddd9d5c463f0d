//! OS threads blocked inside a channel syscall
//!
//! A blocking `read` or `accept` does not return because another thread
//! closed the descriptor. Each operation records its `pthread_t` here;
//! close then sends every recorded thread [`INTERRUPT_SIGNAL`], whose
//! handler does nothing and is installed without `SA_RESTART`, so the
//! syscall fails with `EINTR` and the operation notices the close.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::sys::pthread::{pthread_kill, pthread_self, Pthread};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use efc_concurrent::park::{self, ParkTimeout};
use efc_concurrent::Thread;
use efc_core::{Error, Result, SpinLock};

/// Signal used to knock a thread out of a blocking syscall.
pub const INTERRUPT_SIGNAL: Signal = Signal::SIGUSR2;

static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt_signal(_: libc::c_int) {}

/// Install the no-op handler. Idempotent.
pub fn init() -> Result<()> {
    if HANDLER_INSTALLED.load(Ordering::Acquire) {
        return Ok(());
    }
    let action = SigAction::new(
        SigHandler::Handler(on_interrupt_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // Safety: the handler is async-signal-safe (it does nothing)
    unsafe { sigaction(INTERRUPT_SIGNAL, &action) }.map_err(|e| Error::from_errno(e as i32))?;
    HANDLER_INSTALLED.store(true, Ordering::Release);
    log::debug!("native thread signal {:?} installed", INTERRUPT_SIGNAL);
    Ok(())
}

struct Slots {
    threads: Vec<Option<Pthread>>,
    used: usize,
    /// Thread waiting in signal_and_wait for the set to drain
    waiter: Option<Thread>,
}

/// Set of OS threads currently inside an operation on one channel.
pub struct NativeThreadSet {
    slots: SpinLock<Slots>,
}

impl NativeThreadSet {
    pub fn new() -> Self {
        NativeThreadSet {
            slots: SpinLock::new(Slots {
                threads: Vec::new(),
                used: 0,
                waiter: None,
            }),
        }
    }

    /// Record the calling thread; returns the slot to pass to
    /// [`remove`](Self::remove).
    pub fn add(&self) -> usize {
        let me = pthread_self();
        let mut s = self.slots.lock();
        s.used += 1;
        if let Some(i) = s.threads.iter().position(Option::is_none) {
            s.threads[i] = Some(me);
            return i;
        }
        s.threads.push(Some(me));
        s.threads.len() - 1
    }

    pub fn remove(&self, slot: usize) {
        let waiter = {
            let mut s = self.slots.lock();
            match s.threads.get_mut(slot) {
                Some(entry @ Some(_)) => {
                    *entry = None;
                    s.used -= 1;
                }
                _ => return,
            }
            if s.used == 0 {
                s.waiter.take()
            } else {
                None
            }
        };
        if let Some(w) = waiter {
            w.unpark();
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().used
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal every recorded thread and wait until all have left.
    ///
    /// The caller's own entry, if any, is neither signalled nor awaited.
    /// Threads are re-signalled while the set stays non-empty since a
    /// signal delivered just before a thread enters its syscall is lost.
    pub fn signal_and_wait(&self) {
        let me = pthread_self();
        let current = Thread::current();
        loop {
            {
                let mut s = self.slots.lock();
                let mut others = 0;
                for th in s.threads.iter().flatten() {
                    // Safety: pthread_equal only compares handles
                    if unsafe { libc::pthread_equal(*th, me) } != 0 {
                        continue;
                    }
                    others += 1;
                    if let Err(e) = pthread_kill(*th, INTERRUPT_SIGNAL) {
                        log::debug!("pthread_kill failed: {}", e);
                    }
                }
                if others == 0 {
                    s.waiter = None;
                    return;
                }
                s.waiter = Some(current.clone());
            }
            park::park_timeout(ParkTimeout::Relative(Duration::from_millis(50)));
        }
    }
}

impl Default for NativeThreadSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::RawFd;
    use std::sync::atomic::AtomicI64;
    use std::sync::Arc;

    #[test]
    fn test_slots_reused() {
        let set = NativeThreadSet::new();
        let a = set.add();
        let b = set.add();
        assert_ne!(a, b);
        assert_eq!(set.len(), 2);
        set.remove(a);
        assert_eq!(set.add(), a);
        set.remove(a);
        set.remove(b);
        set.remove(b);
        assert!(set.is_empty());
    }

    #[test]
    fn test_own_entry_not_awaited() {
        let set = NativeThreadSet::new();
        let slot = set.add();
        set.signal_and_wait();
        set.remove(slot);
    }

    #[test]
    fn test_signal_breaks_blocking_read() {
        init().unwrap();
        let mut pair = [0 as libc::c_int; 2];
        assert_eq!(
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, pair.as_mut_ptr()) },
            0
        );
        let reader: RawFd = pair[0];
        let set = Arc::new(NativeThreadSet::new());
        let result = Arc::new(AtomicI64::new(0));

        let (s, r) = (Arc::clone(&set), Arc::clone(&result));
        let t = Thread::spawn(move || {
            let slot = s.add();
            let mut byte = [0u8; 1];
            let n = unsafe { libc::read(reader, byte.as_mut_ptr() as *mut libc::c_void, 1) };
            let errno = nix::errno::Errno::last_raw();
            r.store(if n < 0 { -(errno as i64) } else { n as i64 }, Ordering::SeqCst);
            s.remove(slot);
        })
        .unwrap();

        while set.is_empty() {
            std::thread::yield_now();
        }
        std::thread::sleep(Duration::from_millis(20));
        set.signal_and_wait();
        t.join().unwrap();
        assert_eq!(result.load(Ordering::SeqCst), -(libc::EINTR as i64));
        unsafe {
            libc::close(pair[0]);
            libc::close(pair[1]);
        }
    }
}
