//! Advisory byte-range locks over `fcntl`

use std::os::unix::io::RawFd;

use nix::errno::Errno;

use efc_core::{Error, Result};

/// Outcome of a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum LockResult {
    /// A non-blocking request found the range held
    NoLock = -1,
    Locked = 0,
    /// A shared request was granted as exclusive
    RetExLock = 1,
    /// The blocking request was interrupted
    Interrupted = 2,
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        // Open-file-description locks: owned per open file, so two
        // channels in one process exclude each other.
        const SET_LOCK: libc::c_int = libc::F_OFD_SETLK;
        const SET_LOCK_WAIT: libc::c_int = libc::F_OFD_SETLKW;
    } else {
        const SET_LOCK: libc::c_int = libc::F_SETLK;
        const SET_LOCK_WAIT: libc::c_int = libc::F_SETLKW;
    }
}

fn range(position: u64, size: u64, lock_type: libc::c_int) -> Result<libc::flock> {
    let start = libc::off_t::try_from(position)
        .map_err(|_| Error::illegal_argument("lock position out of range"))?;
    // u64::MAX means "to end of file, however far it grows"
    let len = if size == u64::MAX {
        0
    } else {
        libc::off_t::try_from(size).map_err(|_| Error::illegal_argument("lock size out of range"))?
    };
    // Safety: flock is plain data; zero is a valid bit pattern
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = lock_type as _;
    fl.l_whence = libc::SEEK_SET as _;
    fl.l_start = start;
    fl.l_len = len;
    fl.l_pid = 0;
    Ok(fl)
}

/// Acquire a shared or exclusive lock on `[position, position + size)`.
pub fn lock(fd: RawFd, blocking: bool, position: u64, size: u64, shared: bool) -> Result<LockResult> {
    let fl = range(position, size, if shared { libc::F_RDLCK } else { libc::F_WRLCK })?;
    let cmd = if blocking { SET_LOCK_WAIT } else { SET_LOCK };
    // Safety: fl outlives the call
    let r = unsafe { libc::fcntl(fd, cmd, &fl as *const libc::flock) };
    if r != -1 {
        return Ok(LockResult::Locked);
    }
    match Errno::last() {
        Errno::EAGAIN | Errno::EACCES if !blocking => Ok(LockResult::NoLock),
        Errno::EINTR => Ok(LockResult::Interrupted),
        e => Err(Error::from_errno(e as i32)),
    }
}

/// Drop any lock this descriptor holds on the range.
pub fn release(fd: RawFd, position: u64, size: u64) -> Result<()> {
    let fl = range(position, size, libc::F_UNLCK)?;
    loop {
        // Safety: fl outlives the call
        let r = unsafe { libc::fcntl(fd, SET_LOCK, &fl as *const libc::flock) };
        if r != -1 {
            return Ok(());
        }
        if Errno::last() != Errno::EINTR {
            return Err(Error::last_os_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_exclusive_range_blocks_second_description() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let a = OpenOptions::new().read(true).write(true).open(tmp.path()).unwrap();
        let b = OpenOptions::new().read(true).write(true).open(tmp.path()).unwrap();

        assert_eq!(lock(a.as_raw_fd(), false, 0, 1024, false).unwrap(), LockResult::Locked);
        #[cfg(any(target_os = "linux", target_os = "android"))]
        assert_eq!(lock(b.as_raw_fd(), false, 512, 10, false).unwrap(), LockResult::NoLock);

        release(a.as_raw_fd(), 0, 1024).unwrap();
        assert_eq!(lock(b.as_raw_fd(), false, 512, 10, false).unwrap(), LockResult::Locked);
        release(b.as_raw_fd(), 512, 10).unwrap();
    }

    #[test]
    fn test_shared_locks_coexist() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let a = OpenOptions::new().read(true).open(tmp.path()).unwrap();
        let b = OpenOptions::new().read(true).open(tmp.path()).unwrap();
        assert_eq!(lock(a.as_raw_fd(), false, 0, u64::MAX, true).unwrap(), LockResult::Locked);
        assert_eq!(lock(b.as_raw_fd(), false, 0, u64::MAX, true).unwrap(), LockResult::Locked);
    }

    #[test]
    fn test_range_bounds() {
        let tmp = tempfile::tempfile().unwrap();
        assert!(lock(tmp.as_raw_fd(), false, u64::MAX - 1, 1, false).is_err());
    }
}
