//! Addressed datagram I/O

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use socket2::SockAddr;

use efc_core::{Error, Result};

use super::{FdKind, INTERRUPTED, UNAVAILABLE};
use crate::buffer::IoByteBuffer;

fn sentinel(err: io::Error) -> Result<isize> {
    match err.raw_os_error() {
        Some(libc::EAGAIN) => Ok(UNAVAILABLE),
        Some(libc::EINTR) => Ok(INTERRUPTED),
        Some(libc::ECONNREFUSED) => Err(Error::PortUnreachable),
        _ => Err(err.into()),
    }
}

/// Receive one datagram into `buf`, returning its size and sender.
///
/// The sender is `None` when the call produced a sentinel. A datagram
/// longer than the remaining space is truncated.
pub fn recv_from(fd: RawFd, buf: &mut IoByteBuffer) -> Result<(isize, Option<SocketAddr>)> {
    let len = buf.remaining();
    let ptr = buf.write_ptr()?;
    // Safety: ptr addresses `len` writable bytes; storage and length come
    // from try_init and are sized for any socket address
    let received = unsafe {
        SockAddr::try_init(|storage, addr_len| {
            let r = libc::recvfrom(
                fd,
                ptr as *mut libc::c_void,
                len,
                0,
                storage as *mut libc::sockaddr,
                addr_len,
            );
            if r < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(r)
            }
        })
    };
    match received {
        Ok((n, addr)) => {
            buf.advance((n as usize).min(len));
            Ok((n, addr.as_socket()))
        }
        Err(e) => sentinel(e).map(|n| (n, None)),
    }
}

/// Send `buf` as one datagram to `target`.
pub fn send_to(fd: RawFd, buf: &mut IoByteBuffer, target: &SocketAddr) -> Result<isize> {
    let addr = SockAddr::from(*target);
    let len = buf.remaining();
    // Safety: read_ptr addresses `len` readable bytes; addr outlives the call
    let r = unsafe {
        libc::sendto(
            fd,
            buf.read_ptr() as *const libc::c_void,
            len,
            0,
            addr.as_ptr() as *const libc::sockaddr,
            addr.len(),
        )
    };
    let n = super::convert(r, false, FdKind::Datagram)?;
    if n > 0 {
        buf.advance(n as usize);
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_send_and_receive_with_peer_address() {
        let a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut out = IoByteBuffer::wrap(b"datagram".to_vec());
        let target = b.local_addr().unwrap();
        assert_eq!(send_to(a.as_raw_fd(), &mut out, &target).unwrap(), 8);

        let mut inb = IoByteBuffer::allocate(64).unwrap();
        let (n, from) = recv_from(b.as_raw_fd(), &mut inb).unwrap();
        assert_eq!(n, 8);
        assert_eq!(from, Some(a.local_addr().unwrap()));
        assert_eq!(inb.position(), 8);
    }

    #[test]
    fn test_nonblocking_receive_is_unavailable() {
        let s = UdpSocket::bind("127.0.0.1:0").unwrap();
        s.set_nonblocking(true).unwrap();
        let mut inb = IoByteBuffer::allocate(8).unwrap();
        assert_eq!(recv_from(s.as_raw_fd(), &mut inb).unwrap(), (UNAVAILABLE, None));
    }
}
