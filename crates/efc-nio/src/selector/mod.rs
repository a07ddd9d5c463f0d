//! Readiness multiplexing
//!
//! A [`Selector`] holds three sets:
//! - registered keys, one per (channel, selector) pair
//! - selected keys, those found ready by a select and not yet removed
//! - cancelled keys, awaiting deregistration at the next select
//!
//! Interest changes are queued and applied to the kernel at the start of
//! the next select, so registering or changing interest never blocks on a
//! select in progress. A self-pipe carries [`Selector::wakeup`].
//!
//! ```rust,ignore
//! let selector = Selector::open()?;
//! let server = Arc::new(ServerSocketChannel::open()?);
//! server.bind("127.0.0.1:8899".parse()?, 128)?;
//! server.configure_blocking(false)?;
//! server.register(&selector, OP_ACCEPT, None)?;
//! while selector.select()? > 0 {
//!     for key in selector.take_selected() { /* ... */ }
//! }
//! ```

mod key;
#[cfg_attr(any(target_os = "linux", target_os = "android"), allow(dead_code))]
mod poll;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod epoll_linux;
        use epoll_linux::EpollPoller as PlatformPoller;
    } else {
        use poll::PollPoller as PlatformPoller;
    }
}

pub use key::SelectionKey;
pub(crate) use key::KeyInner;

use std::any::Any;
use std::collections::BTreeMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam_queue::SegQueue;

use efc_concurrent::thread::Interruptible;
use efc_concurrent::Thread;
use efc_core::{config, Error, Result};

use crate::channel::SelectableChannel;
use crate::dispatch;

pub const OP_READ: u32 = 1 << 0;
pub const OP_WRITE: u32 = 1 << 2;
pub const OP_CONNECT: u32 = 1 << 3;
pub const OP_ACCEPT: u32 = 1 << 4;

/// Opaque value carried by a key.
pub type Attachment = Arc<dyn Any + Send + Sync>;

const WAKEUP_TOKEN: u64 = u64::MAX;

static NEXT_SELECTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Kernel readiness of one descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PollReady {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hup: bool,
}

/// Kernel readiness backend.
pub(crate) trait Poller: Send {
    /// Add or modify `fd` under `token`; no interest removes it.
    fn update(&mut self, token: u64, fd: RawFd, readable: bool, writable: bool) -> io::Result<()>;

    fn remove(&mut self, token: u64) -> io::Result<()>;

    /// Wait for readiness; `None` waits indefinitely. An interrupted wait
    /// returns no events.
    fn poll(&mut self, timeout: Option<Duration>, out: &mut Vec<(u64, PollReady)>) -> io::Result<()>;
}

/// Milliseconds for a poll call, rounding up so short waits still wait.
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) if d.is_zero() => 0,
        Some(d) => {
            let ms = d.as_nanos().div_ceil(1_000_000);
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct SelectorInner {
    id: u64,
    open: AtomicBool,
    poller: Mutex<Box<dyn Poller>>,
    select_lock: Mutex<()>,
    keys: Mutex<BTreeMap<u64, SelectionKey>>,
    selected: Mutex<BTreeMap<u64, SelectionKey>>,
    cancelled: SegQueue<SelectionKey>,
    updates: SegQueue<u64>,
    wakeup_read: RawFd,
    wakeup_write: RawFd,
    wakeup_pending: AtomicBool,
    next_key: AtomicU64,
}

impl SelectorInner {
    fn wakeup(&self) {
        if self.wakeup_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let byte = 1u8;
        // Safety: writes one byte from a live local
        let r = unsafe { libc::write(self.wakeup_write, &byte as *const u8 as *const libc::c_void, 1) };
        if r < 0 {
            // A full pipe already guarantees a wakeup
            log::trace!("selector {} wakeup write: {}", self.id, io::Error::last_os_error());
        }
    }

    fn drain_wakeup(&self) {
        let mut buf = [0u8; 64];
        loop {
            // Safety: reads into a live local buffer
            let r = unsafe { libc::read(self.wakeup_read, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if r <= 0 {
                break;
            }
        }
        self.wakeup_pending.store(false, Ordering::SeqCst);
    }

    /// Remove `key` everywhere and let its channel release the fd.
    fn deregister(&self, poller: &mut dyn Poller, key: &SelectionKey) {
        if let Err(e) = poller.remove(key.id()) {
            log::debug!("selector {} remove key {}: {}", self.id, key.id(), e);
        }
        lock(&self.keys).remove(&key.id());
        lock(&self.selected).remove(&key.id());
        let core = key.channel().core();
        core.remove_key(key);
        if let Err(e) = core.kill() {
            log::debug!("selector {} kill fd {}: {}", self.id, core.fd(), e);
        }
    }

    fn process_cancelled(&self, poller: &mut dyn Poller) {
        while let Some(key) = self.cancelled.pop() {
            self.deregister(poller, &key);
        }
    }

    fn process_updates(&self, poller: &mut dyn Poller) {
        while let Some(id) = self.updates.pop() {
            let key = lock(&self.keys).get(&id).cloned();
            let Some(key) = key else { continue };
            if !key.is_valid() {
                continue;
            }
            let core = key.channel().core();
            let (r, w) = core.poll_interest(key.raw_interest());
            if let Err(e) = poller.update(id, core.fd(), r, w) {
                log::debug!("selector {} update fd {}: {}", self.id, core.fd(), e);
            }
        }
    }
}

impl Interruptible for SelectorInner {
    fn interrupt(&self, _target: &Thread) {
        self.wakeup();
    }
}

impl Drop for SelectorInner {
    fn drop(&mut self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let poller = self.poller.get_mut().unwrap_or_else(PoisonError::into_inner);
            let keys: Vec<SelectionKey> = self
                .keys
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .cloned()
                .collect();
            for key in keys {
                key.invalidate();
                let _ = poller.remove(key.id());
                let core = key.channel().core();
                core.remove_key(&key);
                let _ = core.kill();
            }
        }
        // Safety: both pipe ends are owned here
        unsafe {
            libc::close(self.wakeup_read);
            libc::close(self.wakeup_write);
        }
    }
}

/// Multiplexes readiness of registered non-blocking channels.
///
/// Cloning yields another handle to the same selector.
#[derive(Clone)]
pub struct Selector {
    inner: Arc<SelectorInner>,
}

impl Selector {
    pub fn open() -> Result<Selector> {
        let max_events = config::global().selector_max_events;
        let mut poller: Box<dyn Poller> = Box::new(PlatformPoller::new(max_events)?);

        let mut fds = [0 as libc::c_int; 2];
        // Safety: fds has room for two descriptors
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(Error::last_os_error());
        }
        for &fd in &fds {
            dispatch::set_cloexec(fd)?;
            dispatch::set_blocking(fd, false)?;
        }
        poller.update(WAKEUP_TOKEN, fds[0], true, false)?;

        let id = NEXT_SELECTOR_ID.fetch_add(1, Ordering::Relaxed);
        log::trace!("selector {} open", id);
        Ok(Selector {
            inner: Arc::new(SelectorInner {
                id,
                open: AtomicBool::new(true),
                poller: Mutex::new(poller),
                select_lock: Mutex::new(()),
                keys: Mutex::new(BTreeMap::new()),
                selected: Mutex::new(BTreeMap::new()),
                cancelled: SegQueue::new(),
                updates: SegQueue::new(),
                wakeup_read: fds[0],
                wakeup_write: fds[1],
                wakeup_pending: AtomicBool::new(false),
                next_key: AtomicU64::new(1),
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<SelectorInner>) -> Selector {
        Selector { inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::ClosedSelector)
        }
    }

    /// Register `channel`, or update its existing registration here.
    ///
    /// The channel must be open and non-blocking, `ops` must be a subset
    /// of its valid ops, and it must not hold a valid key on another
    /// selector.
    pub fn register(
        &self,
        channel: Arc<dyn SelectableChannel>,
        ops: u32,
        attachment: Option<Attachment>,
    ) -> Result<SelectionKey> {
        self.ensure_open()?;
        let core = Arc::clone(channel.core());
        core.ensure_open()?;
        if ops & !channel.valid_ops() != 0 {
            return Err(Error::illegal_argument(format!("ops {:#x} not supported", ops)));
        }
        let _reg = core.reg_guard();
        if core.is_blocking() {
            return Err(Error::IllegalBlockingMode);
        }
        if let Some(existing) = core.find_key(self) {
            existing.set_interest_ops(ops)?;
            existing.attach(attachment);
            return Ok(existing);
        }
        if core.has_valid_key() {
            return Err(Error::IllegalSelector);
        }
        let id = self.inner.next_key.fetch_add(1, Ordering::Relaxed);
        let key = SelectionKey::new(id, channel, &self.inner, ops, attachment);
        lock(&self.inner.keys).insert(id, key.clone());
        core.add_key(&key);
        self.inner.updates.push(id);
        Ok(key)
    }

    // ── Selection ──

    /// Block until a key is ready, [`wakeup`](Self::wakeup) is called or
    /// the thread is interrupted. Returns the number of keys whose ready
    /// set was updated.
    pub fn select(&self) -> Result<usize> {
        self.do_select(None)
    }

    /// Like [`select`](Self::select), waiting at most `timeout`.
    /// A zero timeout polls.
    pub fn select_timeout(&self, timeout: Duration) -> Result<usize> {
        self.do_select(Some(timeout))
    }

    /// Poll without blocking. Clears a pending wakeup.
    pub fn select_now(&self) -> Result<usize> {
        self.do_select(Some(Duration::ZERO))
    }

    fn do_select(&self, mut timeout: Option<Duration>) -> Result<usize> {
        self.ensure_open()?;
        let inner = &self.inner;
        let _select = lock(&inner.select_lock);
        self.ensure_open()?;

        let mut events = Vec::new();
        let polled = {
            let mut poller = lock(&inner.poller);
            inner.process_cancelled(&mut **poller);
            inner.process_updates(&mut **poller);

            let blocking = timeout != Some(Duration::ZERO);
            if blocking {
                Thread::set_blocker(Some(Arc::clone(inner) as Arc<dyn Interruptible>));
                if Thread::current().is_interrupted() {
                    timeout = Some(Duration::ZERO);
                }
            }
            let polled = poller.poll(timeout, &mut events);
            if blocking {
                Thread::set_blocker(None);
            }
            inner.process_cancelled(&mut **poller);
            polled
        };
        polled?;

        let mut count = 0;
        for (token, ready) in events {
            if token == WAKEUP_TOKEN {
                inner.drain_wakeup();
                continue;
            }
            let key = lock(&inner.keys).get(&token).cloned();
            let Some(key) = key else { continue };
            if !key.is_valid() {
                continue;
            }
            let ops = key.channel().core().translate_ready(ready, key.raw_interest());
            if ops == 0 {
                continue;
            }
            let mut selected = lock(&inner.selected);
            if selected.contains_key(&token) {
                let prev = key.ready_cell().fetch_or(ops, Ordering::SeqCst);
                if prev | ops != prev {
                    count += 1;
                }
            } else {
                key.ready_cell().store(ops, Ordering::SeqCst);
                selected.insert(token, key);
                count += 1;
            }
        }
        Ok(count)
    }

    /// Make the current or next select return at once.
    pub fn wakeup(&self) {
        self.inner.wakeup();
    }

    // ── Key sets ──

    /// Snapshot of registered keys, cancelled ones included until the
    /// next select removes them.
    pub fn keys(&self) -> Vec<SelectionKey> {
        lock(&self.inner.keys).values().cloned().collect()
    }

    /// Snapshot of the selected set.
    pub fn selected_keys(&self) -> Vec<SelectionKey> {
        lock(&self.inner.selected).values().cloned().collect()
    }

    /// Drain the selected set.
    pub fn take_selected(&self) -> Vec<SelectionKey> {
        std::mem::take(&mut *lock(&self.inner.selected))
            .into_values()
            .collect()
    }

    /// Remove one key from the selected set.
    pub fn remove_selected(&self, key: &SelectionKey) -> bool {
        lock(&self.inner.selected).remove(&key.id()).is_some()
    }

    // ── Close ──

    /// Close the selector and deregister every key. Later calls do
    /// nothing.
    pub fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        inner.wakeup();
        let _select = lock(&inner.select_lock);
        let mut poller = lock(&inner.poller);
        let keys: Vec<SelectionKey> = lock(&inner.keys).values().cloned().collect();
        for key in keys {
            key.invalidate();
            inner.deregister(&mut **poller, &key);
        }
        inner.process_cancelled(&mut **poller);
        log::trace!("selector {} closed", inner.id);
        Ok(())
    }
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selector")
            .field("id", &self.inner.id)
            .field("open", &self.is_open())
            .field("keys", &lock(&self.inner.keys).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::IoByteBuffer;
    use crate::channel::{Channel, ReadableByteChannel, SelectableChannel, WritableByteChannel};
    use crate::net::Pipe;
    use std::time::Instant;

    #[test]
    fn test_timeout_millis() {
        assert_eq!(timeout_millis(None), -1);
        assert_eq!(timeout_millis(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_millis(Some(Duration::from_micros(10))), 1);
        assert_eq!(timeout_millis(Some(Duration::from_secs(u64::MAX))), libc::c_int::MAX);
    }

    #[test]
    fn test_pending_wakeup_returns_immediately() {
        let sel = Selector::open().unwrap();
        sel.wakeup();
        sel.wakeup();
        let start = Instant::now();
        assert_eq!(sel.select_timeout(Duration::from_secs(5)).unwrap(), 0);
        assert!(start.elapsed() < Duration::from_secs(2));
        // Consumed: the next short select times out
        assert_eq!(sel.select_timeout(Duration::from_millis(10)).unwrap(), 0);
    }

    #[test]
    fn test_wakeup_from_other_thread() {
        let sel = Selector::open().unwrap();
        let other = sel.clone();
        let t = Thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            other.wakeup();
        })
        .unwrap();
        assert_eq!(sel.select().unwrap(), 0);
        t.join().unwrap();
    }

    #[test]
    fn test_interrupt_ends_select() {
        let sel = Selector::open().unwrap();
        let me = Thread::current();
        let t = Thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            me.interrupt();
        })
        .unwrap();
        assert_eq!(sel.select().unwrap(), 0);
        assert!(Thread::interrupted());
        t.join().unwrap();
    }

    #[test]
    fn test_pipe_selection_lifecycle() {
        crate::init().unwrap();
        let sel = Selector::open().unwrap();
        let pipe = Pipe::open().unwrap();
        let source = pipe.source();
        let sink = pipe.sink();

        // Blocking channels cannot register
        assert!(matches!(
            source.register(&sel, OP_READ, None),
            Err(Error::IllegalBlockingMode)
        ));
        source.configure_blocking(false).unwrap();
        assert!(matches!(
            source.register(&sel, OP_WRITE, None),
            Err(Error::IllegalArgument(_))
        ));
        let tag: Attachment = Arc::new(42u32);
        let key = source.register(&sel, OP_READ, Some(tag)).unwrap();
        assert!(source.is_registered());
        assert!(matches!(source.configure_blocking(true), Err(Error::IllegalBlockingMode)));
        assert_eq!(sel.select_now().unwrap(), 0);

        sink.write(&mut IoByteBuffer::wrap(b"hi".to_vec())).unwrap();
        assert_eq!(sel.select_timeout(Duration::from_secs(1)).unwrap(), 1);
        assert!(key.is_readable());
        assert_eq!(key.ready_ops().unwrap() & !key.interest_ops().unwrap(), 0);
        let att = key.attachment().unwrap();
        assert_eq!(att.downcast_ref::<u32>(), Some(&42));

        // Not removed: stays selected and is not recounted
        assert_eq!(sel.select_now().unwrap(), 0);
        assert_eq!(sel.selected_keys().len(), 1);
        assert_eq!(sel.take_selected(), vec![key.clone()]);

        let mut buf = IoByteBuffer::allocate(8).unwrap();
        assert_eq!(source.read(&mut buf).unwrap(), 2);

        key.cancel();
        assert!(!key.is_valid());
        assert!(matches!(key.interest_ops(), Err(Error::CancelledKey)));
        assert_eq!(sel.keys().len(), 1);
        sel.select_now().unwrap();
        assert!(sel.keys().is_empty());
        assert!(!source.is_registered());
        source.configure_blocking(true).unwrap();

        source.close().unwrap();
        sink.close().unwrap();
        sel.close().unwrap();
    }

    #[test]
    fn test_second_selector_rejected() {
        crate::init().unwrap();
        let a = Selector::open().unwrap();
        let b = Selector::open().unwrap();
        let pipe = Pipe::open().unwrap();
        let source = pipe.source();
        source.configure_blocking(false).unwrap();
        let key = source.register(&a, OP_READ, None).unwrap();
        assert!(matches!(source.register(&b, OP_READ, None), Err(Error::IllegalSelector)));
        // Re-registering with the same selector updates the key
        let again = source.register(&a, 0, None).unwrap();
        assert_eq!(key, again);
        assert_eq!(key.interest_ops().unwrap(), 0);
        assert!(source.key_for(&a).is_some());
        assert!(source.key_for(&b).is_none());
        a.close().unwrap();
        assert!(!key.is_valid());
        assert!(matches!(b.select_now(), Ok(0)));
        assert!(matches!(a.select_now(), Err(Error::ClosedSelector)));
    }

    #[test]
    fn test_close_channel_cancels_key_and_defers_fd_close() {
        crate::init().unwrap();
        let sel = Selector::open().unwrap();
        let pipe = Pipe::open().unwrap();
        let source = pipe.source();
        source.configure_blocking(false).unwrap();
        let key = source.register(&sel, OP_READ, None).unwrap();
        source.close().unwrap();
        assert!(!key.is_valid());
        assert!(!source.is_open());
        sel.select_now().unwrap();
        assert!(sel.keys().is_empty());
        pipe.sink().close().unwrap();
    }
}
