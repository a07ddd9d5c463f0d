use std::any::Any;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use socket2::{Protocol, SockRef, Type};

use efc_core::Result;

use super::{any_v4, io_sentinel, local_addr_of, new_socket, not_bound, SocketChannel};
use crate::channel::{bracket, Channel, ChannelCore, Role, SelectableChannel};
use crate::dispatch::FdKind;
use crate::selector::OP_ACCEPT;

/// A listening stream socket.
pub struct ServerSocketChannel {
    core: Arc<ChannelCore>,
    bound: AtomicBool,
}

impl ServerSocketChannel {
    /// An unbound IPv4 listener.
    pub fn open() -> Result<Self> {
        Self::open_for(&any_v4())
    }

    /// An unbound listener for the address family of `addr`.
    pub fn open_for(addr: &SocketAddr) -> Result<Self> {
        let fd = new_socket(addr, Type::STREAM, Protocol::TCP)?;
        Ok(ServerSocketChannel {
            core: ChannelCore::new(fd, FdKind::Stream, Role::ServerSocket),
            bound: AtomicBool::new(false),
        })
    }

    /// Bind with address reuse and start listening.
    pub fn bind(&self, addr: SocketAddr, backlog: i32) -> Result<()> {
        self.core.ensure_open()?;
        let sock = SockRef::from(&*self.core);
        sock.set_reuse_address(true)?;
        sock.bind(&addr.into())?;
        sock.listen(if backlog < 1 { 50 } else { backlog })?;
        self.bound.store(true, Ordering::SeqCst);
        log::debug!("listening on {}", addr);
        Ok(())
    }

    pub fn local_addr(&self) -> Result<Option<SocketAddr>> {
        if !self.bound.load(Ordering::SeqCst) {
            return Ok(None);
        }
        local_addr_of(&self.core)
    }

    /// Accept one connection. `None` when non-blocking and nothing is
    /// pending. The accepted channel starts in blocking mode.
    pub fn accept(&self) -> Result<Option<SocketChannel>> {
        let _g = self.core.read_guard();
        self.core.ensure_open()?;
        if !self.bound.load(Ordering::SeqCst) {
            return Err(not_bound());
        }
        let mut accepted = None;
        let core = &self.core;
        bracket(core, |_| match SockRef::from(&**core).accept() {
            Ok(pair) => {
                accepted = Some(pair);
                Ok(1)
            }
            Err(e) => io_sentinel(e),
        })?;
        let Some((socket, peer)) = accepted else {
            return Ok(None);
        };
        socket.set_nonblocking(false)?;
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        socket.set_nosigpipe(true)?;
        Ok(Some(SocketChannel::from_accepted(
            socket.into_raw_fd(),
            peer.as_socket(),
        )))
    }
}

impl Channel for ServerSocketChannel {
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

impl SelectableChannel for ServerSocketChannel {
    fn core(&self) -> &Arc<ChannelCore> {
        &self.core
    }

    fn valid_ops(&self) -> u32 {
        OP_ACCEPT
    }
}

impl AsRawFd for ServerSocketChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.core.fd()
    }
}

impl std::fmt::Debug for ServerSocketChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSocketChannel")
            .field("core", &self.core)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::Selector;
    use std::net::TcpStream;
    use std::time::Duration;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_accept_blocking() {
        crate::init().unwrap();
        let server = ServerSocketChannel::open().unwrap();
        assert!(server.local_addr().unwrap().is_none());
        server.bind(loopback(), 16).unwrap();
        let addr = server.local_addr().unwrap().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let accepted = server.accept().unwrap().unwrap();
        assert!(accepted.is_connected());
        assert_eq!(accepted.remote_addr(), Some(client.local_addr().unwrap()));
        assert!(accepted.is_blocking());
    }

    #[test]
    fn test_accept_non_blocking_empty() {
        crate::init().unwrap();
        let server = ServerSocketChannel::open().unwrap();
        server.bind(loopback(), 16).unwrap();
        server.configure_blocking(false).unwrap();
        assert!(server.accept().unwrap().is_none());
    }

    #[test]
    fn test_unbound_accept_fails() {
        let server = ServerSocketChannel::open().unwrap();
        assert!(server.accept().is_err());
    }

    #[test]
    fn test_selector_reports_acceptable() {
        crate::init().unwrap();
        let sel = Selector::open().unwrap();
        let server = Arc::new(ServerSocketChannel::open().unwrap());
        server.bind(loopback(), 16).unwrap();
        server.configure_blocking(false).unwrap();
        let key = server.register(&sel, OP_ACCEPT, None).unwrap();
        let addr = server.local_addr().unwrap().unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        assert_eq!(sel.select_timeout(Duration::from_secs(1)).unwrap(), 1);
        assert!(key.is_acceptable());
        assert!(server.accept().unwrap().is_some());
    }

    #[test]
    fn test_close_unblocks_accept() {
        crate::init().unwrap();
        let server = Arc::new(ServerSocketChannel::open().unwrap());
        server.bind(loopback(), 16).unwrap();
        let s = Arc::clone(&server);
        let (tx, rx) = std::sync::mpsc::channel();
        let t = efc_concurrent::Thread::spawn(move || {
            let _ = tx.send(s.accept().map(|c| c.is_some()));
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        server.close().unwrap();
        t.join().unwrap();
        assert!(matches!(
            rx.recv().unwrap(),
            Err(efc_core::Error::AsynchronousClose)
        ));
    }
}
