//! Channel traits and the shared channel core
//!
//! Every concrete channel owns an [`ChannelCore`]: the descriptor, the
//! open flag, the blocking mode, the set of threads inside a syscall and
//! the selection keys the channel is registered under. The core
//! implements the close protocol:
//!
//! 1. clear the open flag (only the first close proceeds)
//! 2. dup the preclose sentinel over a socket descriptor
//! 3. signal threads blocked on the descriptor and wait for them to leave
//! 4. cancel every selection key
//! 5. close the descriptor once no selector still references it
//!
//! A blocking operation registers the core as the calling thread's
//! interrupt blocker, so `Thread::interrupt` closes the channel and the
//! interrupted operation fails with `ClosedByInterrupt`.

use std::any::Any;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use efc_concurrent::thread::{current_id, Interruptible};
use efc_concurrent::Thread;
use efc_core::{Error, Result, SpinLock};

use crate::buffer::IoByteBuffer;
use crate::dispatch::{self, FdKind, INTERRUPTED};
use crate::native_thread::NativeThreadSet;
use crate::selector::{
    Attachment, KeyInner, PollReady, SelectionKey, Selector, OP_ACCEPT, OP_CONNECT, OP_READ,
    OP_WRITE,
};

// ── Traits ──

pub trait Channel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Close the channel. Later calls do nothing.
    fn close(&self) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}

pub trait ReadableByteChannel: Channel {
    /// Read into `dst`. Returns the byte count, 0 when a non-blocking
    /// channel has nothing, or -1 at end of stream.
    fn read(&self, dst: &mut IoByteBuffer) -> Result<isize>;
}

pub trait WritableByteChannel: Channel {
    /// Write from `src`. A non-blocking channel may write nothing.
    fn write(&self, src: &mut IoByteBuffer) -> Result<usize>;
}

pub trait ScatteringByteChannel: ReadableByteChannel {
    fn read_vectored(&self, dsts: &mut [IoByteBuffer]) -> Result<isize>;
}

pub trait GatheringByteChannel: WritableByteChannel {
    fn write_vectored(&self, srcs: &mut [IoByteBuffer]) -> Result<usize>;
}

/// A channel that can be multiplexed by a [`Selector`].
pub trait SelectableChannel: Channel {
    fn core(&self) -> &Arc<ChannelCore>;

    /// Operations this channel supports (`OP_*` bits).
    fn valid_ops(&self) -> u32;

    /// Switch blocking mode. A registered channel must stay non-blocking.
    fn configure_blocking(&self, block: bool) -> Result<()> {
        self.core().configure_blocking(block)
    }

    fn is_blocking(&self) -> bool {
        self.core().is_blocking()
    }

    fn is_registered(&self) -> bool {
        self.core().has_valid_key()
    }

    fn key_for(&self, selector: &Selector) -> Option<SelectionKey> {
        self.core().find_key(selector)
    }

    /// Register with `selector`, or update the interest set and
    /// attachment of an existing registration.
    fn register(
        self: &Arc<Self>,
        selector: &Selector,
        ops: u32,
        attachment: Option<Attachment>,
    ) -> Result<SelectionKey>
    where
        Self: Sized + 'static,
    {
        let channel: Arc<dyn SelectableChannel> = self.clone();
        selector.register(channel, ops, attachment)
    }
}

// ── Core ──

/// What a descriptor is used for; decides how readiness maps to ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    File,
    ServerSocket,
    Socket,
    Datagram,
    PipeSource,
    PipeSink,
}

pub(crate) const UNCONNECTED: u8 = 0;
pub(crate) const PENDING: u8 = 1;
pub(crate) const CONNECTED: u8 = 2;

/// Descriptor ownership and the close/interrupt protocol shared by all
/// channels.
pub struct ChannelCore {
    fd: RawFd,
    kind: FdKind,
    role: Role,
    open: AtomicBool,
    killed: AtomicBool,
    blocking: AtomicBool,
    conn: AtomicU8,
    threads: NativeThreadSet,
    /// Thread whose interrupt closed the channel
    interrupted_by: SpinLock<Option<u64>>,
    keys: SpinLock<Vec<Weak<KeyInner>>>,
    reg_lock: Mutex<()>,
    read_lock: Mutex<()>,
    write_lock: Mutex<()>,
}

impl ChannelCore {
    pub(crate) fn new(fd: RawFd, kind: FdKind, role: Role) -> Arc<ChannelCore> {
        Arc::new(ChannelCore {
            fd,
            kind,
            role,
            open: AtomicBool::new(true),
            killed: AtomicBool::new(false),
            blocking: AtomicBool::new(true),
            conn: AtomicU8::new(UNCONNECTED),
            threads: NativeThreadSet::new(),
            interrupted_by: SpinLock::new(None),
            keys: SpinLock::new(Vec::new()),
            reg_lock: Mutex::new(()),
            read_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn kind(&self) -> FdKind {
        self.kind
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking.load(Ordering::SeqCst)
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::ClosedChannel)
        }
    }

    pub(crate) fn conn_state(&self) -> u8 {
        self.conn.load(Ordering::SeqCst)
    }

    pub(crate) fn set_conn_state(&self, state: u8) {
        self.conn.store(state, Ordering::SeqCst);
    }

    pub(crate) fn read_guard(&self) -> MutexGuard<'_, ()> {
        self.read_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn reg_guard(&self) -> MutexGuard<'_, ()> {
        self.reg_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn configure_blocking(&self, block: bool) -> Result<()> {
        self.ensure_open()?;
        let _reg = self.reg_guard();
        if block && self.has_valid_key() {
            return Err(Error::IllegalBlockingMode);
        }
        if self.is_blocking() != block {
            dispatch::set_blocking(self.fd, block)?;
            self.blocking.store(block, Ordering::SeqCst);
        }
        Ok(())
    }

    // ── Operation bracketing ──

    /// Enter an I/O operation.
    ///
    /// A blocking operation installs this core as the thread's interrupt
    /// blocker; an interrupt already pending closes the channel at once.
    pub(crate) fn begin(self: &Arc<Self>, blocking: bool) -> Result<IoOp> {
        self.ensure_open()?;
        let mut op = IoOp {
            core: Arc::clone(self),
            slot: None,
            blocker: false,
            finished: false,
        };
        if blocking {
            Thread::set_blocker(Some(Arc::clone(self) as Arc<dyn Interruptible>));
            op.blocker = true;
            let me = Thread::current();
            if me.is_interrupted() {
                self.interrupt(&me);
            }
        }
        op.slot = Some(self.threads.add());
        // Closers clear `open` before draining the thread set
        if !self.is_open() {
            return match op.end(false) {
                Err(e) => Err(e),
                Ok(()) => Err(Error::AsynchronousClose),
            };
        }
        Ok(op)
    }

    /// Repeat `f` while it reports `INTERRUPTED` on an open channel.
    pub(crate) fn retry<F>(&self, mut f: F) -> Result<isize>
    where
        F: FnMut(RawFd) -> Result<isize>,
    {
        loop {
            let n = f(self.fd)?;
            if n == INTERRUPTED && self.is_open() {
                continue;
            }
            return Ok(n);
        }
    }

    // ── Close ──

    pub(crate) fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut first_err = None;
        if self.role != Role::File {
            if let Err(e) = dispatch::preclose(self.fd) {
                first_err = Some(e);
            }
        }
        self.threads.signal_and_wait();
        for key in self.live_keys() {
            key.cancel();
        }
        if self.keys.lock().is_empty() {
            if let Err(e) = self.kill() {
                first_err.get_or_insert(e);
            }
        }
        log::trace!("channel fd {} closed", self.fd);
        first_err.map_or(Ok(()), Err)
    }

    /// Release the descriptor once closed and deregistered everywhere.
    pub(crate) fn kill(&self) -> Result<()> {
        if self.is_open() || !self.keys.lock().is_empty() {
            return Ok(());
        }
        if self.killed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        dispatch::close(self.fd)
    }

    // ── Registration bookkeeping ──

    fn live_keys(&self) -> Vec<SelectionKey> {
        self.keys
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .map(SelectionKey::from_inner)
            .collect()
    }

    /// Recompute kernel interest for every key, after a state change
    /// such as a completed connect.
    pub(crate) fn refresh_keys(&self) {
        for key in self.live_keys() {
            key.request_update();
        }
    }

    pub(crate) fn has_valid_key(&self) -> bool {
        self.live_keys().iter().any(SelectionKey::is_valid)
    }

    pub(crate) fn find_key(&self, selector: &Selector) -> Option<SelectionKey> {
        self.live_keys()
            .into_iter()
            .find(|k| k.selector_id() == selector.id())
    }

    pub(crate) fn add_key(&self, key: &SelectionKey) {
        self.keys.lock().push(key.downgrade());
    }

    pub(crate) fn remove_key(&self, key: &SelectionKey) {
        self.keys
            .lock()
            .retain(|w| w.strong_count() > 0 && !key.is_inner(w));
    }

    // ── Readiness ──

    /// Map kernel readiness to the `OP_*` bits this channel's role
    /// supports, restricted to `interest`.
    pub(crate) fn translate_ready(&self, ev: PollReady, interest: u32) -> u32 {
        if ev.error || ev.hup {
            return interest;
        }
        let mut ops = 0;
        match self.role {
            Role::ServerSocket => {
                if ev.readable {
                    ops |= OP_ACCEPT;
                }
            }
            Role::Socket => {
                if ev.readable {
                    ops |= OP_READ;
                }
                if ev.writable {
                    ops |= if self.conn_state() == PENDING {
                        OP_CONNECT
                    } else {
                        OP_WRITE
                    };
                }
            }
            Role::Datagram | Role::File => {
                if ev.readable {
                    ops |= OP_READ;
                }
                if ev.writable {
                    ops |= OP_WRITE;
                }
            }
            Role::PipeSource => {
                if ev.readable {
                    ops |= OP_READ;
                }
            }
            Role::PipeSink => {
                if ev.writable {
                    ops |= OP_WRITE;
                }
            }
        }
        ops & interest
    }

    /// Kernel interest for a set of `OP_*` bits: (readable, writable).
    pub(crate) fn poll_interest(&self, ops: u32) -> (bool, bool) {
        let readable = ops & (OP_READ | OP_ACCEPT) != 0;
        let writable = ops & OP_WRITE != 0
            || (ops & OP_CONNECT != 0 && self.conn_state() == PENDING);
        (readable, writable)
    }
}

impl Interruptible for ChannelCore {
    fn interrupt(&self, target: &Thread) {
        *self.interrupted_by.lock() = Some(target.id());
        if let Err(e) = self.close() {
            log::debug!("close on interrupt of fd {}: {}", self.fd, e);
        }
    }
}

impl AsRawFd for ChannelCore {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl AsFd for ChannelCore {
    fn as_fd(&self) -> BorrowedFd<'_> {
        // Safety: the descriptor stays open until this core is killed,
        // which cannot happen while it is borrowed
        unsafe { BorrowedFd::borrow_raw(self.fd) }
    }
}

impl Drop for ChannelCore {
    fn drop(&mut self) {
        if !self.killed.swap(true, Ordering::SeqCst) {
            let _ = dispatch::close(self.fd);
        }
    }
}

impl std::fmt::Debug for ChannelCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelCore")
            .field("fd", &self.fd)
            .field("role", &self.role)
            .field("open", &self.is_open())
            .field("blocking", &self.is_blocking())
            .finish()
    }
}

/// An operation in progress on a channel; see [`ChannelCore::begin`].
pub(crate) struct IoOp {
    core: Arc<ChannelCore>,
    slot: Option<usize>,
    blocker: bool,
    finished: bool,
}

impl IoOp {
    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        // Leave the thread set before clearing the blocker: an
        // interrupter holds the blocker while close waits on the set.
        if let Some(slot) = self.slot.take() {
            self.core.threads.remove(slot);
        }
        if self.blocker {
            Thread::set_blocker(None);
        }
    }

    /// Leave the operation. `completed` says whether it made progress;
    /// an incomplete operation on a channel closed meanwhile fails.
    pub(crate) fn end(mut self, completed: bool) -> Result<()> {
        self.finish();
        if self.blocker && *self.core.interrupted_by.lock() == Some(current_id()) {
            return Err(Error::ClosedByInterrupt);
        }
        if !completed && !self.core.is_open() {
            return Err(Error::AsynchronousClose);
        }
        Ok(())
    }
}

impl Drop for IoOp {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Run a byte-count operation between `begin` and `end`.
pub(crate) fn bracket<F>(core: &Arc<ChannelCore>, f: F) -> Result<isize>
where
    F: FnMut(RawFd) -> Result<isize>,
{
    let op = core.begin(core.is_blocking())?;
    let r = core.retry(f);
    op.end(matches!(r, Ok(n) if n > 0))?;
    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn pipe_core() -> (Arc<ChannelCore>, Arc<ChannelCore>) {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (
            ChannelCore::new(fds[0], FdKind::File, Role::PipeSource),
            ChannelCore::new(fds[1], FdKind::File, Role::PipeSink),
        )
    }

    #[test]
    fn test_close_is_idempotent() {
        crate::init().unwrap();
        let (r, w) = pipe_core();
        r.close().unwrap();
        r.close().unwrap();
        assert!(!r.is_open());
        assert!(matches!(r.ensure_open(), Err(Error::ClosedChannel)));
        w.close().unwrap();
    }

    #[test]
    fn test_begin_on_closed_channel() {
        crate::init().unwrap();
        let (r, w) = pipe_core();
        r.close().unwrap();
        assert!(matches!(r.begin(true), Err(Error::ClosedChannel)));
        w.close().unwrap();
    }

    #[test]
    fn test_pending_interrupt_closes_channel() {
        crate::init().unwrap();
        let (r, w) = pipe_core();
        let (tx, rx) = mpsc::channel();
        let t = Thread::spawn(move || {
            Thread::current().interrupt();
            let err = r.begin(true).err();
            // Flag stays set after the channel closes
            let flag = Thread::interrupted();
            let _ = tx.send((matches!(err, Some(Error::ClosedByInterrupt)), r.is_open(), flag));
        })
        .unwrap();
        t.join().unwrap();
        assert_eq!(rx.recv().unwrap(), (true, false, true));
        w.close().unwrap();
    }

    fn blocked_reader(core: &Arc<ChannelCore>) -> (Thread, mpsc::Receiver<Result<isize>>) {
        let reader = Arc::clone(core);
        let (tx, rx) = mpsc::channel();
        let t = Thread::spawn(move || {
            let mut buf = IoByteBuffer::allocate(8).unwrap();
            let res = bracket(&reader, |fd| dispatch::read(fd, FdKind::File, &mut buf));
            let _ = tx.send(res);
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        (t, rx)
    }

    #[test]
    fn test_async_close_unblocks_reader() {
        crate::init().unwrap();
        let (r, w) = pipe_core();
        let (t, rx) = blocked_reader(&r);
        r.close().unwrap();
        t.join().unwrap();
        assert!(matches!(rx.recv().unwrap(), Err(Error::AsynchronousClose)));
        w.close().unwrap();
    }

    #[test]
    fn test_interrupt_unblocks_reader() {
        crate::init().unwrap();
        let (r, w) = pipe_core();
        let (t, rx) = blocked_reader(&r);
        t.interrupt();
        t.join().unwrap();
        assert!(matches!(rx.recv().unwrap(), Err(Error::ClosedByInterrupt)));
        assert!(!r.is_open());
        w.close().unwrap();
    }

    #[test]
    fn test_readiness_by_role() {
        let (r, w) = pipe_core();
        let readable = PollReady { readable: true, ..PollReady::default() };
        let writable = PollReady { writable: true, ..PollReady::default() };
        assert_eq!(r.translate_ready(readable, OP_READ), OP_READ);
        assert_eq!(r.translate_ready(writable, OP_READ), 0);
        assert_eq!(w.translate_ready(writable, OP_WRITE), OP_WRITE);

        let sock = ChannelCore::new(-1, FdKind::Stream, Role::Socket);
        sock.set_conn_state(PENDING);
        assert_eq!(sock.translate_ready(writable, OP_CONNECT | OP_READ), OP_CONNECT);
        assert_eq!(sock.poll_interest(OP_CONNECT), (false, true));
        sock.set_conn_state(CONNECTED);
        assert_eq!(sock.translate_ready(writable, OP_WRITE), OP_WRITE);
        assert_eq!(sock.poll_interest(OP_CONNECT), (false, false));
        // Hang-up reports everything asked for
        let hup = PollReady { hup: true, ..PollReady::default() };
        assert_eq!(sock.translate_ready(hup, OP_READ | OP_WRITE), OP_READ | OP_WRITE);
        sock.killed.store(true, Ordering::SeqCst);
        r.close().unwrap();
        w.close().unwrap();
    }
}
