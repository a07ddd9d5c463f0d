//! Descriptor dispatch
//!
//! One free-function surface over regular files, stream sockets and
//! datagram sockets. Transient outcomes come back as negative sentinels so
//! callers can loop or translate them with context; fatal kernel errors
//! come back as `Err`.
//!
//! | Sentinel | Meaning |
//! |----------|---------|
//! | [`EOF`] | end of stream |
//! | [`UNAVAILABLE`] | would block |
//! | [`INTERRUPTED`] | syscall interrupted by a signal |
//! | [`UNSUPPORTED`] | not available on this platform |
//! | [`THROWN`] | reserved; never produced |
//! | [`UNSUPPORTED_CASE`] | not available for this descriptor kind |

mod datagram;
mod lock;
mod transfer;

pub use datagram::{recv_from, send_to};
pub use lock::{lock, release, LockResult};
pub use transfer::transfer;

use std::os::unix::io::RawFd;

use nix::errno::Errno;

use efc_core::{Error, Result, SpinLock};

use crate::buffer::IoByteBuffer;

pub const EOF: isize = -1;
pub const UNAVAILABLE: isize = -2;
pub const INTERRUPTED: isize = -3;
pub const UNSUPPORTED: isize = -4;
pub const THROWN: isize = -5;
pub const UNSUPPORTED_CASE: isize = -6;

/// Most buffers handed to one vectored syscall.
pub const IOV_MAX: usize = 1024;

/// Descriptor family an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdKind {
    File,
    Stream,
    Datagram,
}

/// Treat would-block as zero bytes processed.
#[inline]
pub fn normalize(n: isize) -> isize {
    if n == UNAVAILABLE {
        0
    } else {
        n
    }
}

/// Accept a count or a known sentinel; reject anything else.
pub fn check(n: isize) -> Result<isize> {
    if n >= UNSUPPORTED_CASE {
        Ok(n)
    } else {
        Err(Error::illegal_argument(format!("bad dispatch result {}", n)))
    }
}

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

/// Translate a raw syscall return.
///
/// `zero_is_eof` applies to stream reads; a zero-length datagram is data.
pub(crate) fn convert(r: isize, zero_is_eof: bool, kind: FdKind) -> Result<isize> {
    if r > 0 {
        return Ok(r);
    }
    if r == 0 {
        return Ok(if zero_is_eof { EOF } else { 0 });
    }
    match Errno::last() {
        Errno::EAGAIN => Ok(UNAVAILABLE),
        Errno::EINTR => Ok(INTERRUPTED),
        Errno::ECONNREFUSED if kind == FdKind::Datagram => Err(Error::PortUnreachable),
        e => {
            log::debug!("dispatch: {:?} failed: {}", kind, e);
            Err(Error::from_errno(e as i32))
        }
    }
}

fn convert_unit(r: libc::c_int) -> Result<()> {
    if r == -1 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

// ── Single-buffer I/O ──

/// Read into `[position, limit)` of `buf`, advancing its position.
pub fn read(fd: RawFd, kind: FdKind, buf: &mut IoByteBuffer) -> Result<isize> {
    let len = buf.remaining();
    if len == 0 {
        return Ok(0);
    }
    let ptr = buf.write_ptr()?;
    // Safety: ptr addresses `len` writable bytes of buf
    let r = unsafe {
        match kind {
            FdKind::File => libc::read(fd, ptr as *mut libc::c_void, len),
            _ => libc::recv(fd, ptr as *mut libc::c_void, len, 0),
        }
    };
    let n = convert(r, kind != FdKind::Datagram, kind)?;
    if n > 0 {
        buf.advance(n as usize);
    }
    Ok(n)
}

/// Write `[position, limit)` of `buf`, advancing its position.
pub fn write(fd: RawFd, kind: FdKind, buf: &mut IoByteBuffer) -> Result<isize> {
    let len = buf.remaining();
    if len == 0 && kind != FdKind::Datagram {
        return Ok(0);
    }
    let ptr = buf.read_ptr();
    // Safety: ptr addresses `len` readable bytes of buf
    let r = unsafe {
        match kind {
            FdKind::File => libc::write(fd, ptr as *const libc::c_void, len),
            _ => libc::send(fd, ptr as *const libc::c_void, len, SEND_FLAGS),
        }
    };
    let n = convert(r, false, kind)?;
    if n > 0 {
        buf.advance(n as usize);
    }
    Ok(n)
}

// ── Scatter / gather ──

/// Indices of buffers with room, capped at [`IOV_MAX`].
fn active(bufs: &[IoByteBuffer]) -> Vec<usize> {
    bufs.iter()
        .enumerate()
        .filter(|(_, b)| b.has_remaining())
        .map(|(i, _)| i)
        .take(IOV_MAX)
        .collect()
}

/// Advance buffers in order until `n` bytes are accounted for.
fn attribute(bufs: &mut [IoByteBuffer], used: &[usize], mut n: usize) {
    for &i in used {
        if n == 0 {
            break;
        }
        let take = bufs[i].remaining().min(n);
        bufs[i].advance(take);
        n -= take;
    }
}

/// Scatter one read across `bufs`.
pub fn read_vectored(fd: RawFd, kind: FdKind, bufs: &mut [IoByteBuffer]) -> Result<isize> {
    let used = active(bufs);
    if used.is_empty() {
        return Ok(0);
    }
    let mut iov = Vec::with_capacity(used.len());
    for &i in &used {
        let len = bufs[i].remaining();
        iov.push(libc::iovec {
            iov_base: bufs[i].write_ptr()? as *mut libc::c_void,
            iov_len: len,
        });
    }
    // Safety: every iovec addresses writable bytes of a live buffer
    let r = unsafe { libc::readv(fd, iov.as_ptr(), iov.len() as libc::c_int) };
    let n = convert(r, kind != FdKind::Datagram, kind)?;
    if n > 0 {
        attribute(bufs, &used, n as usize);
    }
    Ok(n)
}

/// Gather one write from `bufs`.
pub fn write_vectored(fd: RawFd, kind: FdKind, bufs: &mut [IoByteBuffer]) -> Result<isize> {
    let used = active(bufs);
    if used.is_empty() {
        return Ok(0);
    }
    let iov: Vec<libc::iovec> = used
        .iter()
        .map(|&i| libc::iovec {
            iov_base: bufs[i].read_ptr() as *mut libc::c_void,
            iov_len: bufs[i].remaining(),
        })
        .collect();
    // Safety: every iovec addresses readable bytes of a live buffer
    let r = unsafe { libc::writev(fd, iov.as_ptr(), iov.len() as libc::c_int) };
    let n = convert(r, false, kind)?;
    if n > 0 {
        attribute(bufs, &used, n as usize);
    }
    Ok(n)
}

// ── Positional I/O ──

fn to_off(position: u64) -> Result<libc::off_t> {
    libc::off_t::try_from(position)
        .map_err(|_| Error::illegal_argument(format!("position {} out of range", position)))
}

/// Read at `position` without moving the file offset.
pub fn pread(fd: RawFd, kind: FdKind, buf: &mut IoByteBuffer, position: u64) -> Result<isize> {
    if kind != FdKind::File {
        return Ok(UNSUPPORTED_CASE);
    }
    let off = to_off(position)?;
    let len = buf.remaining();
    if len == 0 {
        return Ok(0);
    }
    let ptr = buf.write_ptr()?;
    // Safety: ptr addresses `len` writable bytes of buf
    let r = unsafe { libc::pread(fd, ptr as *mut libc::c_void, len, off) };
    let n = convert(r, true, kind)?;
    if n > 0 {
        buf.advance(n as usize);
    }
    Ok(n)
}

/// Write at `position` without moving the file offset.
pub fn pwrite(fd: RawFd, kind: FdKind, buf: &mut IoByteBuffer, position: u64) -> Result<isize> {
    if kind != FdKind::File {
        return Ok(UNSUPPORTED_CASE);
    }
    let off = to_off(position)?;
    let len = buf.remaining();
    if len == 0 {
        return Ok(0);
    }
    // Safety: read_ptr addresses `len` readable bytes of buf
    let r = unsafe { libc::pwrite(fd, buf.read_ptr() as *const libc::c_void, len, off) };
    let n = convert(r, false, kind)?;
    if n > 0 {
        buf.advance(n as usize);
    }
    Ok(n)
}

// ── Close ──

/// Write end of a socket pair whose peer is closed: reads see EOF,
/// writes see EPIPE.
static PRECLOSE_FD: SpinLock<RawFd> = SpinLock::new(-1);

fn preclose_fd() -> Result<RawFd> {
    let mut fd = PRECLOSE_FD.lock();
    if *fd < 0 {
        let mut pair = [0 as libc::c_int; 2];
        // Safety: pair has room for two descriptors
        convert_unit(unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, pair.as_mut_ptr())
        })?;
        // Safety: both fds were just created and are owned here
        unsafe {
            libc::close(pair[1]);
            libc::fcntl(pair[0], libc::F_SETFD, libc::FD_CLOEXEC);
        }
        *fd = pair[0];
    }
    Ok(*fd)
}

/// Close `fd`. An `EINTR` still releases the descriptor.
pub fn close(fd: RawFd) -> Result<()> {
    // Safety: the caller owns fd and never uses it again
    let r = unsafe { libc::close(fd) };
    if r == -1 && Errno::last() != Errno::EINTR {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Swap `fd` for the sentinel so blocked and late readers see EOF while
/// the number stays reserved until the real close.
pub fn preclose(fd: RawFd) -> Result<()> {
    let sentinel = preclose_fd()?;
    loop {
        // Safety: dup2 onto a descriptor the caller owns
        let r = unsafe { libc::dup2(sentinel, fd) };
        if r != -1 {
            return Ok(());
        }
        if Errno::last() != Errno::EINTR {
            return Err(Error::last_os_error());
        }
    }
}

// ── File state ──

pub fn size(fd: RawFd) -> Result<u64> {
    let st = nix::sys::stat::fstat(fd).map_err(|e| Error::from_errno(e as i32))?;
    Ok(st.st_size as u64)
}

/// Current file offset.
pub fn position(fd: RawFd) -> Result<u64> {
    // Safety: lseek has no memory effects
    let r = unsafe { libc::lseek(fd, 0, libc::SEEK_CUR) };
    if r == -1 {
        return Err(Error::last_os_error());
    }
    Ok(r as u64)
}

/// Set the file offset.
pub fn seek(fd: RawFd, position: u64) -> Result<u64> {
    let off = to_off(position)?;
    // Safety: lseek has no memory effects
    let r = unsafe { libc::lseek(fd, off, libc::SEEK_SET) };
    if r == -1 {
        return Err(Error::last_os_error());
    }
    Ok(r as u64)
}

/// Move the file offset to end of file.
pub fn seek_end(fd: RawFd) -> Result<u64> {
    // Safety: lseek has no memory effects
    let r = unsafe { libc::lseek(fd, 0, libc::SEEK_END) };
    if r == -1 {
        return Err(Error::last_os_error());
    }
    Ok(r as u64)
}

pub fn truncate(fd: RawFd, size: u64) -> Result<()> {
    let len = to_off(size)?;
    loop {
        // Safety: ftruncate has no memory effects
        let r = unsafe { libc::ftruncate(fd, len) };
        if r != -1 {
            return Ok(());
        }
        if Errno::last() != Errno::EINTR {
            return Err(Error::last_os_error());
        }
    }
}

/// Flush file data, and metadata when `metadata` is set.
pub fn force(fd: RawFd, metadata: bool) -> Result<()> {
    // Safety: sync calls have no memory effects
    let r = unsafe {
        if metadata {
            libc::fsync(fd)
        } else {
            data_sync(fd)
        }
    };
    convert_unit(r)
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
unsafe fn data_sync(fd: RawFd) -> libc::c_int {
    libc::fdatasync(fd)
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
unsafe fn data_sync(fd: RawFd) -> libc::c_int {
    libc::fsync(fd)
}

/// Switch `O_NONBLOCK` on or off.
pub fn set_blocking(fd: RawFd, blocking: bool) -> Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};

    let bits = fcntl(fd, FcntlArg::F_GETFL).map_err(|e| Error::from_errno(e as i32))?;
    let mut flags = OFlag::from_bits_truncate(bits);
    flags.set(OFlag::O_NONBLOCK, !blocking);
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(|e| Error::from_errno(e as i32))?;
    Ok(())
}

/// Set close-on-exec on a freshly created descriptor.
pub(crate) fn set_cloexec(fd: RawFd) -> Result<()> {
    // Safety: fcntl on an owned descriptor
    convert_unit(unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) })
}

// ── Lifecycle ──

pub fn init() -> Result<()> {
    preclose_fd().map(|_| ())
}

pub fn teardown() {
    let mut fd = PRECLOSE_FD.lock();
    if *fd >= 0 {
        // Safety: the sentinel is owned by this module
        unsafe { libc::close(*fd) };
        *fd = -1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;

    fn socket_pair() -> (RawFd, RawFd) {
        let mut pair = [0 as libc::c_int; 2];
        let r = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, pair.as_mut_ptr()) };
        assert_eq!(r, 0);
        (pair[0], pair[1])
    }

    #[test]
    fn test_normalize_and_check() {
        assert_eq!(normalize(UNAVAILABLE), 0);
        assert_eq!(normalize(EOF), EOF);
        assert_eq!(normalize(7), 7);
        assert_eq!(check(UNSUPPORTED_CASE).unwrap(), UNSUPPORTED_CASE);
        assert!(check(-7).is_err());
    }

    #[test]
    fn test_stream_round_trip_and_eof() {
        let (a, b) = socket_pair();
        let mut out = IoByteBuffer::wrap(b"ping".to_vec());
        assert_eq!(write(a, FdKind::Stream, &mut out).unwrap(), 4);
        assert!(!out.has_remaining());

        let mut inb = IoByteBuffer::allocate(16).unwrap();
        assert_eq!(read(b, FdKind::Stream, &mut inb).unwrap(), 4);
        assert_eq!(inb.position(), 4);

        close(a).unwrap();
        assert_eq!(read(b, FdKind::Stream, &mut inb).unwrap(), EOF);
        close(b).unwrap();
    }

    #[test]
    fn test_would_block_sentinel() {
        let (a, b) = socket_pair();
        set_blocking(b, false).unwrap();
        let mut inb = IoByteBuffer::allocate(8).unwrap();
        assert_eq!(read(b, FdKind::Stream, &mut inb).unwrap(), UNAVAILABLE);
        close(a).unwrap();
        close(b).unwrap();
    }

    #[test]
    fn test_scatter_gather_attribution() {
        let (a, b) = socket_pair();
        let mut src = vec![
            IoByteBuffer::wrap(b"ab".to_vec()),
            IoByteBuffer::allocate(0).unwrap(),
            IoByteBuffer::wrap(b"cdef".to_vec()),
        ];
        assert_eq!(write_vectored(a, FdKind::Stream, &mut src).unwrap(), 6);
        assert!(src.iter().all(|b| !b.has_remaining()));

        let mut dst = vec![
            IoByteBuffer::allocate(3).unwrap(),
            IoByteBuffer::allocate(10).unwrap(),
        ];
        assert_eq!(read_vectored(b, FdKind::Stream, &mut dst).unwrap(), 6);
        assert_eq!(dst[0].position(), 3);
        assert_eq!(dst[1].position(), 3);
        assert_eq!(dst[1].limit(), 10);
        dst[0].flip();
        dst[1].flip();
        assert_eq!(dst[0].as_slice(), b"abc");
        assert_eq!(dst[1].as_slice(), b"def");
        close(a).unwrap();
        close(b).unwrap();
    }

    #[test]
    fn test_positional_io() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[0u8; 64]).unwrap();
        let fd = file.as_raw_fd();
        let before = position(fd).unwrap();

        let mut out = IoByteBuffer::wrap(b"xyz".to_vec());
        assert_eq!(pwrite(fd, FdKind::File, &mut out, 10).unwrap(), 3);
        let mut inb = IoByteBuffer::allocate(3).unwrap();
        assert_eq!(pread(fd, FdKind::File, &mut inb, 10).unwrap(), 3);
        inb.flip();
        assert_eq!(inb.as_slice(), b"xyz");
        assert_eq!(position(fd).unwrap(), before);

        let mut past = IoByteBuffer::allocate(3).unwrap();
        assert_eq!(pread(fd, FdKind::File, &mut past, 1000).unwrap(), EOF);
        assert_eq!(pread(fd, FdKind::Stream, &mut past, 0).unwrap(), UNSUPPORTED_CASE);
    }

    #[test]
    fn test_size_truncate_seek() {
        let file = tempfile::tempfile().unwrap();
        let fd = file.as_raw_fd();
        truncate(fd, 100).unwrap();
        assert_eq!(size(fd).unwrap(), 100);
        assert_eq!(seek(fd, 40).unwrap(), 40);
        assert_eq!(position(fd).unwrap(), 40);
        assert_eq!(seek_end(fd).unwrap(), 100);
        force(fd, true).unwrap();
        force(fd, false).unwrap();
    }

    #[test]
    fn test_preclose_reads_eof() {
        init().unwrap();
        let (a, b) = socket_pair();
        preclose(b).unwrap();
        let mut inb = IoByteBuffer::allocate(4).unwrap();
        assert_eq!(read(b, FdKind::Stream, &mut inb).unwrap(), EOF);
        close(b).unwrap();
        close(a).unwrap();
    }

    #[test]
    fn test_read_only_target_rejected() {
        let (a, b) = socket_pair();
        let ro = IoByteBuffer::allocate(4).unwrap();
        let mut ro = ro.as_read_only_buffer();
        assert!(matches!(read(b, FdKind::Stream, &mut ro), Err(Error::ReadOnlyBuffer)));
        close(a).unwrap();
        close(b).unwrap();
    }
}
