//! Kernel-to-kernel transfer

use std::os::unix::io::RawFd;

use nix::errno::Errno;

use efc_core::{Error, Result};

use super::{INTERRUPTED, UNAVAILABLE, UNSUPPORTED, UNSUPPORTED_CASE};

/// Send up to `count` bytes of `src` starting at `position` to `dst`
/// without copying through user space.
///
/// Returns the byte count or a sentinel: `UNSUPPORTED` when the platform
/// has no such call, `UNSUPPORTED_CASE` when this pair of descriptors
/// cannot use it.
pub fn transfer(src: RawFd, position: u64, count: usize, dst: RawFd) -> Result<isize> {
    if count == 0 {
        return Ok(0);
    }
    let position = libc::off_t::try_from(position)
        .map_err(|_| Error::illegal_argument("transfer position out of range"))?;
    imp::transfer(src, position, count, dst)
}

fn classify(count: usize) -> Result<isize> {
    match Errno::last() {
        Errno::EAGAIN => Ok(UNAVAILABLE),
        Errno::EINTR => Ok(INTERRUPTED),
        Errno::EINVAL | Errno::ENOTSOCK | Errno::EOPNOTSUPP if count > 0 => Ok(UNSUPPORTED_CASE),
        Errno::ENOSYS => Ok(UNSUPPORTED),
        e => Err(Error::from_errno(e as i32)),
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod imp {
            use super::*;

            pub(super) fn transfer(src: RawFd, position: libc::off_t, count: usize, dst: RawFd) -> Result<isize> {
                let mut offset = position;
                // Safety: offset outlives the call
                let r = unsafe { libc::sendfile(dst, src, &mut offset, count) };
                if r >= 0 {
                    return Ok(r as isize);
                }
                classify(count)
            }
        }
    } else if #[cfg(any(target_os = "macos", target_os = "ios"))] {
        mod imp {
            use super::*;

            pub(super) fn transfer(src: RawFd, position: libc::off_t, count: usize, dst: RawFd) -> Result<isize> {
                let mut len = count as libc::off_t;
                // Safety: len outlives the call; no header/trailer vectors
                let r = unsafe { libc::sendfile(src, dst, position, &mut len, std::ptr::null_mut(), 0) };
                if r == 0 || len > 0 {
                    return Ok(len as isize);
                }
                classify(count)
            }
        }
    } else {
        mod imp {
            use super::*;

            pub(super) fn transfer(_src: RawFd, _position: libc::off_t, _count: usize, _dst: RawFd) -> Result<isize> {
                Ok(UNSUPPORTED)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_zero_count_is_noop() {
        assert_eq!(transfer(-1, 0, 0, -1).unwrap(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_file_to_file() {
        let mut src = tempfile::tempfile().unwrap();
        src.write_all(b"0123456789").unwrap();
        let mut dst = tempfile::tempfile().unwrap();
        let n = transfer(src.as_raw_fd(), 2, 5, dst.as_raw_fd()).unwrap();
        assert_eq!(n, 5);
        dst.seek(SeekFrom::Start(0)).unwrap();
        let mut out = String::new();
        dst.read_to_string(&mut out).unwrap();
        assert_eq!(out, "23456");
    }
}
