use std::any::Any;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use nix::errno::Errno;
use socket2::{Protocol, SockRef, Type};

use efc_core::{Error, Result, SpinLock};

use super::{any_v4, local_addr_of, new_socket};
use crate::buffer::IoByteBuffer;
use crate::channel::{
    bracket, Channel, ChannelCore, GatheringByteChannel, ReadableByteChannel, Role,
    ScatteringByteChannel, SelectableChannel, WritableByteChannel, CONNECTED, UNCONNECTED,
};
use crate::dispatch::{self, normalize, FdKind};
use crate::selector::{OP_READ, OP_WRITE};

/// A UDP socket. Unconnected it sends and receives with explicit
/// addresses; connected it also supports plain `read` and `write`, and
/// an ICMP port-unreachable surfaces as [`Error::PortUnreachable`].
pub struct DatagramChannel {
    core: Arc<ChannelCore>,
    remote: SpinLock<Option<SocketAddr>>,
}

impl DatagramChannel {
    pub fn open() -> Result<Self> {
        Self::open_for(&any_v4())
    }

    pub fn open_for(addr: &SocketAddr) -> Result<Self> {
        let fd = new_socket(addr, Type::DGRAM, Protocol::UDP)?;
        Ok(DatagramChannel {
            core: ChannelCore::new(fd, FdKind::Datagram, Role::Datagram),
            remote: SpinLock::new(None),
        })
    }

    fn sock(&self) -> SockRef<'_> {
        SockRef::from(&*self.core)
    }

    pub fn bind(&self, addr: SocketAddr) -> Result<()> {
        self.core.ensure_open()?;
        self.sock().bind(&addr.into())?;
        Ok(())
    }

    pub fn local_addr(&self) -> Result<Option<SocketAddr>> {
        Ok(local_addr_of(&self.core)?.filter(|a| a.port() != 0))
    }

    pub fn set_broadcast(&self, on: bool) -> Result<()> {
        self.core.ensure_open()?;
        Ok(self.sock().set_broadcast(on)?)
    }

    pub fn is_connected(&self) -> bool {
        self.core.conn_state() == CONNECTED
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote.lock()
    }

    /// Fix the peer; only its datagrams are received afterwards.
    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        let _r = self.core.read_guard();
        let _w = self.core.write_guard();
        self.core.ensure_open()?;
        if self.is_connected() {
            return Err(Error::AlreadyConnected);
        }
        self.sock().connect(&addr.into())?;
        *self.remote.lock() = Some(addr);
        self.core.set_conn_state(CONNECTED);
        Ok(())
    }

    /// Drop the peer association. Does nothing when unconnected.
    pub fn disconnect(&self) -> Result<()> {
        let _r = self.core.read_guard();
        let _w = self.core.write_guard();
        if !self.core.is_open() || !self.is_connected() {
            return Ok(());
        }
        // Safety: zeroed sockaddr is a valid AF_UNSPEC address
        let r = unsafe {
            let mut sa: libc::sockaddr = std::mem::zeroed();
            sa.sa_family = libc::AF_UNSPEC as libc::sa_family_t;
            libc::connect(
                self.core.fd(),
                &sa,
                std::mem::size_of::<libc::sockaddr>() as libc::socklen_t,
            )
        };
        // BSD stacks report EAFNOSUPPORT after dissolving the association
        if r == -1 && Errno::last() != Errno::EAFNOSUPPORT {
            return Err(Error::last_os_error());
        }
        *self.remote.lock() = None;
        self.core.set_conn_state(UNCONNECTED);
        Ok(())
    }

    /// Receive one datagram into `dst`, returning its sender. `None`
    /// when non-blocking and nothing is queued. Excess bytes of a
    /// datagram larger than `dst` are discarded.
    pub fn receive(&self, dst: &mut IoByteBuffer) -> Result<Option<SocketAddr>> {
        let _g = self.core.read_guard();
        self.core.ensure_open()?;
        let mut sender = None;
        bracket(&self.core, |fd| {
            let (n, from) = dispatch::recv_from(fd, dst)?;
            sender = from;
            Ok(n)
        })?;
        Ok(sender)
    }

    /// Send all of `src` as one datagram to `target`. Returns the bytes
    /// sent, or 0 when a non-blocking channel has no buffer space.
    pub fn send(&self, src: &mut IoByteBuffer, target: SocketAddr) -> Result<usize> {
        let _g = self.core.write_guard();
        self.core.ensure_open()?;
        if let Some(remote) = self.remote_addr() {
            if remote != target {
                return Err(Error::illegal_argument(format!(
                    "connected to {}, not {}",
                    remote, target
                )));
            }
        }
        let n = bracket(&self.core, |fd| dispatch::send_to(fd, src, &target))?;
        Ok(normalize(n).max(0) as usize)
    }

    fn ensure_connected(&self) -> Result<()> {
        self.core.ensure_open()?;
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::NotYetConnected)
        }
    }
}

impl Channel for DatagramChannel {
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

impl ReadableByteChannel for DatagramChannel {
    fn read(&self, dst: &mut IoByteBuffer) -> Result<isize> {
        let _g = self.core.read_guard();
        self.ensure_connected()?;
        let n = bracket(&self.core, |fd| dispatch::read(fd, FdKind::Datagram, dst))?;
        Ok(normalize(n))
    }
}

impl ScatteringByteChannel for DatagramChannel {
    fn read_vectored(&self, dsts: &mut [IoByteBuffer]) -> Result<isize> {
        let _g = self.core.read_guard();
        self.ensure_connected()?;
        let n = bracket(&self.core, |fd| dispatch::read_vectored(fd, FdKind::Datagram, dsts))?;
        Ok(normalize(n))
    }
}

impl WritableByteChannel for DatagramChannel {
    fn write(&self, src: &mut IoByteBuffer) -> Result<usize> {
        let _g = self.core.write_guard();
        self.ensure_connected()?;
        let n = bracket(&self.core, |fd| dispatch::write(fd, FdKind::Datagram, src))?;
        Ok(normalize(n).max(0) as usize)
    }
}

impl GatheringByteChannel for DatagramChannel {
    fn write_vectored(&self, srcs: &mut [IoByteBuffer]) -> Result<usize> {
        let _g = self.core.write_guard();
        self.ensure_connected()?;
        let n = bracket(&self.core, |fd| dispatch::write_vectored(fd, FdKind::Datagram, srcs))?;
        Ok(normalize(n).max(0) as usize)
    }
}

impl SelectableChannel for DatagramChannel {
    fn core(&self) -> &Arc<ChannelCore> {
        &self.core
    }

    fn valid_ops(&self) -> u32 {
        OP_READ | OP_WRITE
    }
}

impl AsRawFd for DatagramChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.core.fd()
    }
}

impl std::fmt::Debug for DatagramChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramChannel")
            .field("core", &self.core)
            .field("remote", &self.remote_addr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound() -> (DatagramChannel, SocketAddr) {
        let ch = DatagramChannel::open().unwrap();
        ch.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = ch.local_addr().unwrap().unwrap();
        (ch, addr)
    }

    #[test]
    fn test_send_and_receive() {
        crate::init().unwrap();
        let (a, a_addr) = bound();
        let (b, b_addr) = bound();
        let mut src = IoByteBuffer::wrap(b"ping".to_vec());
        assert_eq!(a.send(&mut src, b_addr).unwrap(), 4);
        let mut dst = IoByteBuffer::allocate(16).unwrap();
        assert_eq!(b.receive(&mut dst).unwrap(), Some(a_addr));
        dst.flip();
        assert_eq!(dst.as_slice(), b"ping");
    }

    #[test]
    fn test_non_blocking_receive_empty() {
        crate::init().unwrap();
        let (a, _) = bound();
        a.configure_blocking(false).unwrap();
        let mut dst = IoByteBuffer::allocate(16).unwrap();
        assert_eq!(a.receive(&mut dst).unwrap(), None);
        assert_eq!(dst.position(), 0);
    }

    #[test]
    fn test_connected_read_write() {
        crate::init().unwrap();
        let (a, a_addr) = bound();
        let (b, b_addr) = bound();
        let mut dst = IoByteBuffer::allocate(4).unwrap();
        assert!(matches!(a.read(&mut dst), Err(Error::NotYetConnected)));

        a.connect(b_addr).unwrap();
        b.connect(a_addr).unwrap();
        assert!(matches!(a.connect(b_addr), Err(Error::AlreadyConnected)));
        let mut other = IoByteBuffer::wrap(vec![0]);
        assert!(a.send(&mut other, "127.0.0.1:9".parse().unwrap()).is_err());

        let mut src = IoByteBuffer::wrap(b"abc".to_vec());
        assert_eq!(a.write(&mut src).unwrap(), 3);
        assert_eq!(b.read(&mut dst).unwrap(), 3);

        a.disconnect().unwrap();
        assert!(!a.is_connected());
        assert_eq!(a.remote_addr(), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_port_unreachable_on_connected_read() {
        crate::init().unwrap();
        let (gone, gone_addr) = bound();
        gone.close().unwrap();
        let (a, _) = bound();
        a.connect(gone_addr).unwrap();
        let mut src = IoByteBuffer::wrap(b"x".to_vec());
        a.write(&mut src).unwrap();
        let mut dst = IoByteBuffer::allocate(4).unwrap();
        assert!(matches!(a.read(&mut dst), Err(Error::PortUnreachable)));
    }
}
