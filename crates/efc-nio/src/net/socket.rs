use std::any::Any;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Protocol, SockAddr, SockRef, Type};

use efc_core::{Error, Result, SpinLock};

use super::{any_v4, local_addr_of, new_socket, poll_fd};
use crate::buffer::IoByteBuffer;
use crate::channel::{
    bracket, Channel, ChannelCore, GatheringByteChannel, ReadableByteChannel, Role,
    ScatteringByteChannel, SelectableChannel, WritableByteChannel, CONNECTED, PENDING, UNCONNECTED,
};
use crate::dispatch::{self, normalize, FdKind, EOF};
use crate::selector::{OP_CONNECT, OP_READ, OP_WRITE};

/// A stream connection.
///
/// `connect` on a non-blocking channel starts the handshake and returns
/// `false`; `finish_connect` completes it once the selector reports
/// `OP_CONNECT`.
pub struct SocketChannel {
    core: Arc<ChannelCore>,
    remote: SpinLock<Option<SocketAddr>>,
    input_shut: AtomicBool,
    output_shut: AtomicBool,
}

fn in_progress(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EINPROGRESS) | Some(libc::EINTR))
}

impl SocketChannel {
    /// An unconnected IPv4 stream socket.
    pub fn open() -> Result<Self> {
        Self::open_for(&any_v4())
    }

    /// An unconnected stream socket for the family of `addr`.
    pub fn open_for(addr: &SocketAddr) -> Result<Self> {
        let fd = new_socket(addr, Type::STREAM, Protocol::TCP)?;
        Ok(Self::with_core(ChannelCore::new(fd, FdKind::Stream, Role::Socket), None))
    }

    /// Open and connect in blocking mode.
    pub fn connect_to(addr: SocketAddr) -> Result<Self> {
        let ch = Self::open_for(&addr)?;
        ch.connect(addr)?;
        Ok(ch)
    }

    pub(crate) fn from_accepted(fd: RawFd, peer: Option<SocketAddr>) -> Self {
        let core = ChannelCore::new(fd, FdKind::Stream, Role::Socket);
        core.set_conn_state(CONNECTED);
        Self::with_core(core, peer)
    }

    fn with_core(core: Arc<ChannelCore>, remote: Option<SocketAddr>) -> Self {
        SocketChannel {
            core,
            remote: SpinLock::new(remote),
            input_shut: AtomicBool::new(false),
            output_shut: AtomicBool::new(false),
        }
    }

    fn sock(&self) -> SockRef<'_> {
        SockRef::from(&*self.core)
    }

    pub fn is_connected(&self) -> bool {
        self.core.conn_state() == CONNECTED
    }

    pub fn is_connection_pending(&self) -> bool {
        self.core.conn_state() == PENDING
    }

    fn ensure_connected(&self) -> Result<()> {
        self.core.ensure_open()?;
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::NotYetConnected)
        }
    }

    /// Connect to `addr`. Returns `true` once connected; a non-blocking
    /// channel returns `false` with the connection pending.
    ///
    /// A failed connect closes the channel.
    pub fn connect(&self, addr: SocketAddr) -> Result<bool> {
        {
            let _r = self.core.read_guard();
            let _w = self.core.write_guard();
            self.core.ensure_open()?;
            match self.core.conn_state() {
                CONNECTED => return Err(Error::AlreadyConnected),
                PENDING => return Err(Error::ConnectionPending),
                _ => {}
            }
            let target = SockAddr::from(addr);
            let op = self.core.begin(self.core.is_blocking())?;
            let r = match self.sock().connect(&target) {
                Ok(()) => Ok(true),
                Err(e) if in_progress(&e) => Ok(false),
                Err(e) => Err(Error::from(e)),
            };
            op.end(matches!(r, Ok(true)))?;
            let done = match r {
                Ok(done) => done,
                Err(e) => {
                    log::debug!("connect to {} failed: {}", addr, e);
                    let _ = self.core.close();
                    return Err(e);
                }
            };
            *self.remote.lock() = Some(addr);
            if done {
                self.core.set_conn_state(CONNECTED);
                self.core.refresh_keys();
                return Ok(true);
            }
            self.core.set_conn_state(PENDING);
            self.core.refresh_keys();
            if !self.core.is_blocking() {
                return Ok(false);
            }
        }
        // Blocking connect interrupted by a signal: wait it out
        while !self.finish_connect()? {}
        Ok(true)
    }

    /// Complete a pending connect. Returns `false` if a non-blocking
    /// channel is still connecting.
    pub fn finish_connect(&self) -> Result<bool> {
        let _r = self.core.read_guard();
        let _w = self.core.write_guard();
        self.core.ensure_open()?;
        match self.core.conn_state() {
            CONNECTED => return Ok(true),
            UNCONNECTED => return Err(Error::NoConnectionPending),
            _ => {}
        }
        let blocking = self.core.is_blocking();
        let timeout = if blocking { -1 } else { 0 };
        let n = bracket(&self.core, |fd| poll_fd(fd, libc::POLLOUT, timeout))?;
        if n <= 0 {
            return Ok(false);
        }
        let pending = match self.sock().take_error() {
            Ok(None) => None,
            Ok(Some(e)) | Err(e) => Some(e),
        };
        if let Some(e) = pending {
            log::debug!("connect on fd {} failed: {}", self.core.fd(), e);
            let _ = self.core.close();
            return Err(e.into());
        }
        self.core.set_conn_state(CONNECTED);
        self.core.refresh_keys();
        log::trace!("fd {} connected", self.core.fd());
        Ok(true)
    }

    /// Stop reading; later reads report end of stream.
    pub fn shutdown_input(&self) -> Result<()> {
        self.ensure_connected()?;
        if !self.input_shut.swap(true, Ordering::SeqCst) {
            self.sock().shutdown(Shutdown::Read)?;
        }
        Ok(())
    }

    /// Stop writing; the peer sees end of stream.
    pub fn shutdown_output(&self) -> Result<()> {
        self.ensure_connected()?;
        if !self.output_shut.swap(true, Ordering::SeqCst) {
            self.sock().shutdown(Shutdown::Write)?;
        }
        Ok(())
    }

    pub fn local_addr(&self) -> Result<Option<SocketAddr>> {
        let addr = local_addr_of(&self.core)?;
        Ok(addr.filter(|a| a.port() != 0))
    }

    /// The address passed to `connect`, or the peer of an accepted socket.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote.lock()
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.ensure_connected()?;
        self.sock()
            .peer_addr()?
            .as_socket()
            .ok_or_else(|| Error::illegal_state("peer is not an IP socket"))
    }

    pub fn bind(&self, addr: SocketAddr) -> Result<()> {
        self.core.ensure_open()?;
        self.sock().bind(&addr.into())?;
        Ok(())
    }

    pub fn set_nodelay(&self, on: bool) -> Result<()> {
        self.core.ensure_open()?;
        Ok(self.sock().set_nodelay(on)?)
    }

    pub fn nodelay(&self) -> Result<bool> {
        self.core.ensure_open()?;
        Ok(self.sock().nodelay()?)
    }

    pub fn set_keepalive(&self, on: bool) -> Result<()> {
        self.core.ensure_open()?;
        Ok(self.sock().set_keepalive(on)?)
    }

    pub fn set_linger(&self, linger: Option<Duration>) -> Result<()> {
        self.core.ensure_open()?;
        Ok(self.sock().set_linger(linger)?)
    }

    pub fn set_send_buffer_size(&self, size: usize) -> Result<()> {
        self.core.ensure_open()?;
        Ok(self.sock().set_send_buffer_size(size)?)
    }

    pub fn set_recv_buffer_size(&self, size: usize) -> Result<()> {
        self.core.ensure_open()?;
        Ok(self.sock().set_recv_buffer_size(size)?)
    }
}

impl Channel for SocketChannel {
    fn is_open(&self) -> bool {
        self.core.is_open()
    }

    fn close(&self) -> Result<()> {
        self.core.close()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ReadableByteChannel for SocketChannel {
    fn read(&self, dst: &mut IoByteBuffer) -> Result<isize> {
        let _g = self.core.read_guard();
        self.ensure_connected()?;
        if self.input_shut.load(Ordering::SeqCst) {
            return Ok(EOF);
        }
        let kind = self.core.kind();
        let n = bracket(&self.core, |fd| dispatch::read(fd, kind, dst))?;
        Ok(normalize(n))
    }
}

impl ScatteringByteChannel for SocketChannel {
    fn read_vectored(&self, dsts: &mut [IoByteBuffer]) -> Result<isize> {
        let _g = self.core.read_guard();
        self.ensure_connected()?;
        if self.input_shut.load(Ordering::SeqCst) {
            return Ok(EOF);
        }
        let kind = self.core.kind();
        let n = bracket(&self.core, |fd| dispatch::read_vectored(fd, kind, dsts))?;
        Ok(normalize(n))
    }
}

impl WritableByteChannel for SocketChannel {
    fn write(&self, src: &mut IoByteBuffer) -> Result<usize> {
        let _g = self.core.write_guard();
        self.ensure_connected()?;
        if self.output_shut.load(Ordering::SeqCst) {
            return Err(Error::ClosedChannel);
        }
        let kind = self.core.kind();
        let n = bracket(&self.core, |fd| dispatch::write(fd, kind, src))?;
        Ok(normalize(n).max(0) as usize)
    }
}

impl GatheringByteChannel for SocketChannel {
    fn write_vectored(&self, srcs: &mut [IoByteBuffer]) -> Result<usize> {
        let _g = self.core.write_guard();
        self.ensure_connected()?;
        if self.output_shut.load(Ordering::SeqCst) {
            return Err(Error::ClosedChannel);
        }
        let kind = self.core.kind();
        let n = bracket(&self.core, |fd| dispatch::write_vectored(fd, kind, srcs))?;
        Ok(normalize(n).max(0) as usize)
    }
}

impl SelectableChannel for SocketChannel {
    fn core(&self) -> &Arc<ChannelCore> {
        &self.core
    }

    fn valid_ops(&self) -> u32 {
        OP_READ | OP_WRITE | OP_CONNECT
    }
}

impl AsRawFd for SocketChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.core.fd()
    }
}

impl std::fmt::Debug for SocketChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketChannel")
            .field("core", &self.core)
            .field("remote", &self.remote_addr())
            .field("connected", &self.is_connected())
            .finish()
    }
}
