//! Selectable network and pipe channels
//!
//! - [`ServerSocketChannel`] accepts stream connections
//! - [`SocketChannel`] is a stream connection with non-blocking connect
//! - [`DatagramChannel`] sends and receives datagrams, connected or not
//! - [`Pipe`] is a one-way pair of channels within the process

mod datagram;
mod pipe;
mod server;
mod socket;

pub use datagram::DatagramChannel;
pub use pipe::{Pipe, SinkChannel, SourceChannel};
pub use server::ServerSocketChannel;
pub use socket::SocketChannel;

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{IntoRawFd, RawFd};

use socket2::{Domain, Protocol, SockRef, Socket, Type};

use efc_core::{Error, Result};

use crate::channel::ChannelCore;
use crate::dispatch::{INTERRUPTED, UNAVAILABLE};

/// Create a socket for the address family of `addr`.
pub(crate) fn new_socket(addr: &SocketAddr, ty: Type, protocol: Protocol) -> Result<RawFd> {
    let socket = Socket::new(Domain::for_address(*addr), ty, Some(protocol))?;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    socket.set_nosigpipe(true)?;
    Ok(socket.into_raw_fd())
}

/// Placeholder address selecting IPv4 for channels opened unbound.
pub(crate) fn any_v4() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

/// Map a transient socket error to its sentinel.
pub(crate) fn io_sentinel(err: io::Error) -> Result<isize> {
    match err.kind() {
        io::ErrorKind::WouldBlock => Ok(UNAVAILABLE),
        io::ErrorKind::Interrupted => Ok(INTERRUPTED),
        _ => Err(err.into()),
    }
}

/// Wait for `events` on `fd`: 1 when ready, 0 on timeout, or
/// `INTERRUPTED`.
pub(crate) fn poll_fd(fd: RawFd, events: libc::c_short, timeout_ms: libc::c_int) -> Result<isize> {
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    // Safety: one live pollfd
    let r = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if r < 0 {
        let err = io::Error::last_os_error();
        return io_sentinel(err);
    }
    Ok(r as isize)
}

/// Bound address of a channel, if it has one of the IP families.
pub(crate) fn local_addr_of(core: &ChannelCore) -> Result<Option<SocketAddr>> {
    core.ensure_open()?;
    Ok(SockRef::from(core).local_addr()?.as_socket())
}

pub(crate) fn not_bound() -> Error {
    Error::illegal_state("socket is not bound")
}
