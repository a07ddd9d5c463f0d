//! File channels
//!
//! A [`FileChannel`] reads and writes a regular file through the
//! dispatcher. Relative operations serialize on a position lock;
//! positional ones (`read_at`, `write_at`) do not move the file offset.
//! Blocking calls are tracked in the channel's native-thread set, so a
//! concurrent close signals them out of the kernel.
//!
//! `transfer_to` tries three paths in order:
//!
//! | Path | When | Falls through when |
//! |------|------|--------------------|
//! | kernel (`sendfile`) | blocking target with a descriptor | platform or fd pair unsupported |
//! | mapped | any target channel of this crate | filesystem cannot map |
//! | copy | always | - |
//!
//! A path found unsupported by the platform stays disabled for the rest
//! of the process.

mod lock;
mod mapped;

pub use lock::FileLock;
pub use mapped::{MapMode, MappedByteBuffer};

use std::any::Any;
use std::fs;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use efc_core::constants::MAX_BUFFER_SPAN;
use efc_core::{config, Error, Result};

use crate::buffer::IoByteBuffer;
use crate::channel::{
    bracket, Channel, ChannelCore, GatheringByteChannel, ReadableByteChannel, Role,
    ScatteringByteChannel, SelectableChannel, WritableByteChannel,
};
use crate::dispatch::{self, normalize, FdKind, LockResult, UNSUPPORTED, UNSUPPORTED_CASE};
use crate::net::{DatagramChannel, SinkChannel, SocketChannel};
use lock::LockTable;

static DIRECT_UNSUPPORTED: AtomicBool = AtomicBool::new(false);
static MAPPED_UNSUPPORTED: AtomicBool = AtomicBool::new(false);

// ── Open options ──

/// How to open a [`FileChannel`]; mirrors `std::fs::OpenOptions`.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    read: bool,
    write: bool,
    append: bool,
    truncate: bool,
    create: bool,
    create_new: bool,
    mode: u32,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        OpenOptions {
            read: false,
            write: false,
            append: false,
            truncate: false,
            create: false,
            create_new: false,
            mode: 0o666,
        }
    }

    pub fn read(&mut self, on: bool) -> &mut Self {
        self.read = on;
        self
    }

    pub fn write(&mut self, on: bool) -> &mut Self {
        self.write = on;
        self
    }

    /// Every relative write goes to end of file. Implies `write`.
    pub fn append(&mut self, on: bool) -> &mut Self {
        self.append = on;
        self
    }

    pub fn truncate(&mut self, on: bool) -> &mut Self {
        self.truncate = on;
        self
    }

    pub fn create(&mut self, on: bool) -> &mut Self {
        self.create = on;
        self
    }

    pub fn create_new(&mut self, on: bool) -> &mut Self {
        self.create_new = on;
        self
    }

    /// Permission bits for a newly created file.
    pub fn mode(&mut self, mode: u32) -> &mut Self {
        self.mode = mode;
        self
    }

    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<FileChannel> {
        let path = path.as_ref();
        let writable = self.write || self.append;
        if !self.read && !writable {
            return Err(Error::illegal_argument("open for neither reading nor writing"));
        }
        // Append is emulated with a seek so positional writes stay positional
        let file = fs::OpenOptions::new()
            .read(self.read)
            .write(writable)
            .truncate(self.truncate)
            .create(self.create)
            .create_new(self.create_new)
            .mode(self.mode)
            .open(path)?;
        log::trace!("opened {} (read={} write={})", path.display(), self.read, writable);
        Ok(FileChannel::new(
            file,
            self.read,
            writable,
            self.append,
            Some(path.to_path_buf()),
        ))
    }
}

// ── Channel ──

pub struct FileChannel {
    core: Arc<ChannelCore>,
    readable: bool,
    writable: bool,
    append: bool,
    position_lock: Mutex<()>,
    locks: Arc<LockTable>,
    path: Option<PathBuf>,
}

impl FileChannel {
    fn new(file: fs::File, readable: bool, writable: bool, append: bool, path: Option<PathBuf>) -> Self {
        FileChannel {
            core: ChannelCore::new(file.into_raw_fd(), FdKind::File, Role::File),
            readable,
            writable,
            append,
            position_lock: Mutex::new(()),
            locks: Arc::new(LockTable::new()),
            path,
        }
    }

    /// Open `path` for reading.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<FileChannel> {
        OpenOptions::new().read(true).open(path)
    }

    /// Adopt an open `std` file with the given access.
    pub fn from_file(file: fs::File, readable: bool, writable: bool) -> FileChannel {
        Self::new(file, readable, writable, false, None)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_append(&self) -> bool {
        self.append
    }

    fn position_guard(&self) -> MutexGuard<'_, ()> {
        self.position_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_readable(&self) -> Result<()> {
        self.core.ensure_open()?;
        if self.readable {
            Ok(())
        } else {
            Err(Error::NonReadableChannel)
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        self.core.ensure_open()?;
        if self.writable {
            Ok(())
        } else {
            Err(Error::NonWritableChannel)
        }
    }

    // ── Positional I/O ──

    /// Read at `position` without moving the channel position. Returns
    /// -1 at or past end of file.
    pub fn read_at(&self, dst: &mut IoByteBuffer, position: u64) -> Result<isize> {
        self.ensure_readable()?;
        let n = bracket(&self.core, |fd| dispatch::pread(fd, FdKind::File, dst, position))?;
        Ok(normalize(n))
    }

    /// Write at `position` without moving the channel position. Writing
    /// past end of file extends it.
    pub fn write_at(&self, src: &mut IoByteBuffer, position: u64) -> Result<usize> {
        self.ensure_writable()?;
        let n = bracket(&self.core, |fd| dispatch::pwrite(fd, FdKind::File, src, position))?;
        written(n)
    }

    // ── File state ──

    /// Current position; in append mode, the file size.
    pub fn position(&self) -> Result<u64> {
        self.core.ensure_open()?;
        let _p = self.position_guard();
        if self.append {
            dispatch::size(self.core.fd())
        } else {
            dispatch::position(self.core.fd())
        }
    }

    pub fn set_position(&self, position: u64) -> Result<()> {
        self.core.ensure_open()?;
        let _p = self.position_guard();
        dispatch::seek(self.core.fd(), position)?;
        Ok(())
    }

    pub fn size(&self) -> Result<u64> {
        self.core.ensure_open()?;
        dispatch::size(self.core.fd())
    }

    /// Shrink the file to `size`; a larger `size` leaves it alone. The
    /// position is pulled back to `size` if it was beyond.
    pub fn truncate(&self, size: u64) -> Result<()> {
        self.ensure_writable()?;
        let _p = self.position_guard();
        let fd = self.core.fd();
        if size < dispatch::size(fd)? {
            dispatch::truncate(fd, size)?;
        }
        if dispatch::position(fd)? > size {
            dispatch::seek(fd, size)?;
        }
        Ok(())
    }

    /// Flush written data to storage; `metadata` also flushes metadata.
    pub fn force(&self, metadata: bool) -> Result<()> {
        self.core.ensure_open()?;
        let op = self.core.begin(true)?;
        let r = dispatch::force(self.core.fd(), metadata);
        op.end(r.is_ok())?;
        r
    }

    // ── Locks ──

    /// Lock `[position, position + size)`, waiting for conflicting
    /// holders in other processes or channels. `size == u64::MAX` locks
    /// to end of file however it grows.
    pub fn lock(&self, position: u64, size: u64, shared: bool) -> Result<FileLock> {
        self.acquire(position, size, shared, true)?
            .ok_or_else(|| Error::illegal_state("blocking lock not granted"))
    }

    /// Like [`lock`](Self::lock) but `None` if the range is held elsewhere.
    pub fn try_lock(&self, position: u64, size: u64, shared: bool) -> Result<Option<FileLock>> {
        self.acquire(position, size, shared, false)
    }

    /// Exclusive lock on the whole file.
    pub fn lock_all(&self) -> Result<FileLock> {
        self.lock(0, u64::MAX, false)
    }

    pub fn try_lock_all(&self) -> Result<Option<FileLock>> {
        self.try_lock(0, u64::MAX, false)
    }

    fn acquire(&self, position: u64, size: u64, shared: bool, blocking: bool) -> Result<Option<FileLock>> {
        if size != u64::MAX && position.checked_add(size).is_none() {
            return Err(Error::illegal_argument("lock range overflows"));
        }
        if shared {
            self.ensure_readable()?;
        } else {
            self.ensure_writable()?;
        }
        let valid = self.locks.reserve(position, size)?;
        let op = match self.core.begin(blocking) {
            Ok(op) => op,
            Err(e) => {
                self.locks.remove(&valid);
                return Err(e);
            }
        };
        let fd = self.core.fd();
        let r = loop {
            match dispatch::lock(fd, blocking, position, size, shared) {
                Ok(LockResult::Interrupted) if self.core.is_open() => continue,
                other => break other,
            }
        };
        let granted = matches!(r, Ok(LockResult::Locked) | Ok(LockResult::RetExLock));
        if let Err(e) = op.end(granted) {
            self.locks.remove(&valid);
            return Err(e);
        }
        match r {
            Ok(LockResult::Locked) | Ok(LockResult::RetExLock) => {
                let shared = shared && matches!(r, Ok(LockResult::Locked));
                log::debug!(
                    "locked fd={} [{}, +{}) shared={}",
                    fd,
                    position,
                    size,
                    shared
                );
                Ok(Some(FileLock::new(
                    Arc::clone(&self.core),
                    Arc::clone(&self.locks),
                    position,
                    size,
                    shared,
                    valid,
                )))
            }
            Ok(_) => {
                self.locks.remove(&valid);
                Ok(None)
            }
            Err(e) => {
                self.locks.remove(&valid);
                Err(e)
            }
        }
    }

    // ── Mapping ──

    /// Map `[position, position + size)` of the file.
    ///
    /// A range past end of file extends the file first, which requires a
    /// writable channel.
    pub fn map(&self, mode: MapMode, position: u64, size: u64) -> Result<MappedByteBuffer> {
        self.core.ensure_open()?;
        if size > MAX_BUFFER_SPAN as u64 {
            return Err(Error::illegal_argument(format!("map size {} too large", size)));
        }
        let end = position
            .checked_add(size)
            .ok_or_else(|| Error::illegal_argument("map range overflows"))?;
        match mode {
            MapMode::ReadOnly | MapMode::Private => self.ensure_readable()?,
            MapMode::ReadWrite => {
                self.ensure_readable()?;
                self.ensure_writable()?;
            }
        }
        let fd = self.core.fd();
        if end > dispatch::size(fd)? {
            if !self.writable {
                return Err(Error::NonWritableChannel);
            }
            dispatch::truncate(fd, end)?;
        }
        MappedByteBuffer::map(fd, mode, position, size as usize)
    }

    // ── Transfer ──

    /// Copy up to `count` bytes starting at `position` into `target`.
    /// The channel position does not move. Returns the bytes written,
    /// which is short when a non-blocking target fills up.
    pub fn transfer_to(&self, position: u64, count: u64, target: &dyn WritableByteChannel) -> Result<u64> {
        self.ensure_readable()?;
        if !target.is_open() {
            return Err(Error::ClosedChannel);
        }
        let size = self.size()?;
        if position >= size || count == 0 {
            return Ok(0);
        }
        let count = count.min(size - position);
        if let Some(n) = self.transfer_direct(position, count, target)? {
            return Ok(n);
        }
        if let Some(n) = self.transfer_mapped(position, count, target)? {
            return Ok(n);
        }
        self.transfer_copy(position, count, target)
    }

    fn transfer_direct(&self, position: u64, count: u64, target: &dyn WritableByteChannel) -> Result<Option<u64>> {
        if DIRECT_UNSUPPORTED.load(Ordering::Relaxed) {
            return Ok(None);
        }
        let Some(dst) = target_core(target.as_any()) else {
            return Ok(None);
        };
        if !dst.is_blocking() {
            return Ok(None);
        }
        let dst_fd = dst.fd();
        let count = count.min(MAX_BUFFER_SPAN as u64) as usize;
        let n = bracket(&self.core, |fd| dispatch::transfer(fd, position, count, dst_fd))?;
        match n {
            UNSUPPORTED => {
                if !DIRECT_UNSUPPORTED.swap(true, Ordering::Relaxed) {
                    log::info!("kernel transfer unsupported; using mapped/copy paths");
                }
                Ok(None)
            }
            UNSUPPORTED_CASE => Ok(None),
            n if n >= 0 => Ok(Some(n as u64)),
            _ => Ok(Some(0)),
        }
    }

    fn transfer_mapped(&self, position: u64, count: u64, target: &dyn WritableByteChannel) -> Result<Option<u64>> {
        if MAPPED_UNSUPPORTED.load(Ordering::Relaxed) || target_core(target.as_any()).is_none() {
            return Ok(None);
        }
        let step = config::global().mapped_transfer_max.max(1) as u64;
        let mut done = 0u64;
        while done < count {
            let len = (count - done).min(step) as usize;
            let mut mapped = match self.map(MapMode::ReadOnly, position + done, len as u64) {
                Ok(m) => m,
                Err(e) if done == 0 && e.raw_os_error() == Some(libc::ENODEV) => {
                    if !MAPPED_UNSUPPORTED.swap(true, Ordering::Relaxed) {
                        log::info!("file mapping unsupported; using copy path");
                    }
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };
            let written = drain_into(target, &mut mapped)?;
            done += written as u64;
            if written < len {
                break;
            }
        }
        Ok(Some(done))
    }

    fn transfer_copy(&self, position: u64, count: u64, target: &dyn WritableByteChannel) -> Result<u64> {
        let chunk = (config::global().transfer_chunk.max(1) as u64).min(count) as usize;
        let mut buf = IoByteBuffer::allocate(chunk)?;
        let mut done = 0u64;
        while done < count {
            buf.clear();
            buf.set_limit((count - done).min(chunk as u64) as usize)?;
            let n = self.read_at(&mut buf, position + done)?;
            if n <= 0 {
                break;
            }
            buf.flip();
            let written = drain_into(target, &mut buf)?;
            done += written as u64;
            if buf.has_remaining() {
                break;
            }
        }
        Ok(done)
    }

    /// Copy up to `count` bytes from `src` into this file at `position`.
    /// The channel position does not move; a file source advances its
    /// own position. A `position` past end of file transfers nothing.
    pub fn transfer_from(&self, src: &dyn ReadableByteChannel, position: u64, count: u64) -> Result<u64> {
        self.ensure_writable()?;
        if !src.is_open() {
            return Err(Error::ClosedChannel);
        }
        if position > self.size()? || count == 0 {
            return Ok(0);
        }
        if let Some(file) = src.as_any().downcast_ref::<FileChannel>() {
            return self.transfer_from_file(file, position, count);
        }
        let chunk = (config::global().transfer_chunk.max(1) as u64).min(count) as usize;
        let mut buf = IoByteBuffer::allocate(chunk)?;
        let mut done = 0u64;
        while done < count {
            buf.clear();
            buf.set_limit((count - done).min(chunk as u64) as usize)?;
            let n = src.read(&mut buf)?;
            if n <= 0 {
                break;
            }
            buf.flip();
            self.write_fully_at(&mut buf, position + done)?;
            done += n as u64;
        }
        Ok(done)
    }

    fn transfer_from_file(&self, src: &FileChannel, position: u64, count: u64) -> Result<u64> {
        let start = src.position()?;
        let size = src.size()?;
        if start >= size {
            return Ok(0);
        }
        let count = count.min(size - start);
        let step = config::global().mapped_transfer_max.max(1) as u64;
        let mut done = 0u64;
        while done < count {
            let len = (count - done).min(step);
            let mut mapped = src.map(MapMode::ReadOnly, start + done, len)?;
            self.write_fully_at(&mut mapped, position + done)?;
            done += len;
        }
        src.set_position(start + done)?;
        Ok(done)
    }

    fn write_fully_at(&self, buf: &mut IoByteBuffer, position: u64) -> Result<()> {
        let mut at = position;
        while buf.has_remaining() {
            let n = self.write_at(buf, at)?;
            if n == 0 {
                self.core.ensure_open()?;
            }
            at += n as u64;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

/// The core of a channel type from this crate, for descriptor-level paths.
fn target_core(channel: &dyn Any) -> Option<&Arc<ChannelCore>> {
    if let Some(f) = channel.downcast_ref::<FileChannel>() {
        return Some(&f.core);
    }
    if let Some(s) = channel.downcast_ref::<SocketChannel>() {
        return Some(s.core());
    }
    if let Some(s) = channel.downcast_ref::<SinkChannel>() {
        return Some(s.core());
    }
    channel.downcast_ref::<DatagramChannel>().map(|d| d.core())
}

/// Byte count of a write. A sentinel other than would-block surviving
/// the retry loop means the descriptor went away mid-call.
fn written(n: isize) -> Result<usize> {
    let n = normalize(n);
    if n < 0 {
        return Err(Error::AsynchronousClose);
    }
    Ok(n as usize)
}

/// Write `buf` into `target` until empty or the target takes nothing.
fn drain_into(target: &dyn WritableByteChannel, buf: &mut IoByteBuffer) -> Result<usize> {
    let mut total = 0;
    while buf.has_remaining() {
        let n = target.write(buf)?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

impl Channel for FileChannel {
    fn is_open(&self) -> bool {
        self.core.is_open()
    }

    fn close(&self) -> Result<()> {
        self.locks.invalidate_all();
        self.core.close()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ReadableByteChannel for FileChannel {
    fn read(&self, dst: &mut IoByteBuffer) -> Result<isize> {
        self.ensure_readable()?;
        let _p = self.position_guard();
        let n = bracket(&self.core, |fd| dispatch::read(fd, FdKind::File, dst))?;
        Ok(normalize(n))
    }
}

impl ScatteringByteChannel for FileChannel {
    fn read_vectored(&self, dsts: &mut [IoByteBuffer]) -> Result<isize> {
        self.ensure_readable()?;
        let _p = self.position_guard();
        let n = bracket(&self.core, |fd| dispatch::read_vectored(fd, FdKind::File, dsts))?;
        Ok(normalize(n))
    }
}

impl WritableByteChannel for FileChannel {
    fn write(&self, src: &mut IoByteBuffer) -> Result<usize> {
        self.ensure_writable()?;
        let _p = self.position_guard();
        let append = self.append;
        let n = bracket(&self.core, |fd| {
            if append {
                dispatch::seek_end(fd)?;
            }
            dispatch::write(fd, FdKind::File, src)
        })?;
        written(n)
    }
}

impl GatheringByteChannel for FileChannel {
    fn write_vectored(&self, srcs: &mut [IoByteBuffer]) -> Result<usize> {
        self.ensure_writable()?;
        let _p = self.position_guard();
        let append = self.append;
        let n = bracket(&self.core, |fd| {
            if append {
                dispatch::seek_end(fd)?;
            }
            dispatch::write_vectored(fd, FdKind::File, srcs)
        })?;
        written(n)
    }
}

impl AsRawFd for FileChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.core.fd()
    }
}

impl std::fmt::Debug for FileChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileChannel")
            .field("core", &self.core)
            .field("path", &self.path)
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .field("append", &self.append)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::EOF;
    use crate::net::Pipe;
    use tempfile::NamedTempFile;

    fn rw(path: &Path) -> FileChannel {
        OpenOptions::new().read(true).write(true).open(path).unwrap()
    }

    fn with_contents(bytes: &[u8]) -> (NamedTempFile, FileChannel) {
        let tmp = NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), bytes).unwrap();
        let ch = rw(tmp.path());
        (tmp, ch)
    }

    fn read_all(ch: &FileChannel) -> Vec<u8> {
        let size = ch.size().unwrap() as usize;
        let mut buf = IoByteBuffer::allocate(size).unwrap();
        let mut at = 0;
        while buf.has_remaining() {
            let n = ch.read_at(&mut buf, at).unwrap();
            assert!(n > 0);
            at += n as u64;
        }
        buf.flip();
        buf.to_vec()
    }

    #[test]
    fn test_relative_read_write_moves_position() {
        crate::init().unwrap();
        let tmp = NamedTempFile::new().unwrap();
        let ch = rw(tmp.path());
        let mut src = IoByteBuffer::wrap(b"hello world".to_vec());
        assert_eq!(ch.write(&mut src).unwrap(), 11);
        assert_eq!(ch.position().unwrap(), 11);
        assert_eq!(ch.size().unwrap(), 11);

        ch.set_position(6).unwrap();
        let mut dst = IoByteBuffer::allocate(16).unwrap();
        assert_eq!(ch.read(&mut dst).unwrap(), 5);
        dst.flip();
        assert_eq!(dst.as_slice(), b"world");
        dst.clear();
        assert_eq!(ch.read(&mut dst).unwrap(), EOF);
    }

    #[test]
    fn test_positional_io_keeps_position() {
        crate::init().unwrap();
        let (_tmp, ch) = with_contents(b"0123456789");
        let mut dst = IoByteBuffer::allocate(3).unwrap();
        assert_eq!(ch.read_at(&mut dst, 4).unwrap(), 3);
        dst.flip();
        assert_eq!(dst.as_slice(), b"456");
        assert_eq!(ch.position().unwrap(), 0);

        let mut src = IoByteBuffer::wrap(b"xy".to_vec());
        assert_eq!(ch.write_at(&mut src, 12).unwrap(), 2);
        assert_eq!(ch.size().unwrap(), 14);
        assert_eq!(ch.position().unwrap(), 0);

        dst.clear();
        assert_eq!(ch.read_at(&mut dst, 14).unwrap(), EOF);
    }

    #[test]
    fn test_write_sentinels() {
        assert_eq!(written(7).unwrap(), 7);
        assert_eq!(written(dispatch::UNAVAILABLE).unwrap(), 0);
        assert!(matches!(written(dispatch::INTERRUPTED), Err(Error::AsynchronousClose)));
    }

    #[test]
    fn test_write_fully_at_stops_on_close() {
        crate::init().unwrap();
        let (_tmp, ch) = with_contents(b"");
        let mut src = IoByteBuffer::wrap(vec![7u8; 64]);
        ch.write_fully_at(&mut src, 0).unwrap();
        assert_eq!(ch.size().unwrap(), 64);

        ch.close().unwrap();
        let mut src = IoByteBuffer::wrap(vec![1u8; 8]);
        assert!(ch.write_fully_at(&mut src, 0).is_err());
        assert_eq!(src.remaining(), 8);
    }

    #[test]
    fn test_append_mode() {
        crate::init().unwrap();
        let tmp = NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), b"abc").unwrap();
        let ch = OpenOptions::new().append(true).open(tmp.path()).unwrap();
        assert!(ch.is_writable());
        assert!(!ch.is_readable());
        let mut src = IoByteBuffer::wrap(b"def".to_vec());
        ch.write(&mut src).unwrap();
        assert_eq!(ch.position().unwrap(), 6);
        assert_eq!(std::fs::read(tmp.path()).unwrap(), b"abcdef");
        let mut dst = IoByteBuffer::allocate(1).unwrap();
        assert!(matches!(ch.read(&mut dst), Err(Error::NonReadableChannel)));
    }

    #[test]
    fn test_access_checks() {
        crate::init().unwrap();
        let (tmp, _) = with_contents(b"data");
        let ro = FileChannel::open(tmp.path()).unwrap();
        let mut src = IoByteBuffer::wrap(vec![1]);
        assert!(matches!(ro.write(&mut src), Err(Error::NonWritableChannel)));
        assert!(matches!(ro.truncate(0), Err(Error::NonWritableChannel)));
        assert!(matches!(ro.lock(0, 1, false), Err(Error::NonWritableChannel)));
        assert!(matches!(ro.map(MapMode::ReadWrite, 0, 4), Err(Error::NonWritableChannel)));
        assert!(matches!(ro.map(MapMode::ReadOnly, 0, 64), Err(Error::NonWritableChannel)));
        assert!(OpenOptions::new().open(tmp.path()).is_err());
    }

    #[test]
    fn test_truncate_rules() {
        crate::init().unwrap();
        let (_tmp, ch) = with_contents(b"0123456789");
        ch.set_position(8).unwrap();
        ch.truncate(20).unwrap();
        assert_eq!(ch.size().unwrap(), 10);
        assert_eq!(ch.position().unwrap(), 8);
        ch.truncate(4).unwrap();
        assert_eq!(ch.size().unwrap(), 4);
        assert_eq!(ch.position().unwrap(), 4);
    }

    #[test]
    fn test_vectored_io() {
        crate::init().unwrap();
        let tmp = NamedTempFile::new().unwrap();
        let ch = rw(tmp.path());
        let mut srcs = [IoByteBuffer::wrap(b"ab".to_vec()), IoByteBuffer::wrap(b"cd".to_vec())];
        assert_eq!(ch.write_vectored(&mut srcs).unwrap(), 4);
        ch.set_position(0).unwrap();
        let mut dsts = [IoByteBuffer::allocate(3).unwrap(), IoByteBuffer::allocate(3).unwrap()];
        assert_eq!(ch.read_vectored(&mut dsts).unwrap(), 4);
        dsts[0].flip();
        dsts[1].flip();
        assert_eq!(dsts[0].as_slice(), b"abc");
        assert_eq!(dsts[1].as_slice(), b"d");
    }

    #[test]
    fn test_lock_overlap_in_one_channel() {
        crate::init().unwrap();
        let (_tmp, ch) = with_contents(b"0123456789");
        let a = ch.lock(0, 5, false).unwrap();
        assert!(a.is_valid());
        assert!(!a.is_shared());
        assert!(a.overlaps(4, 1));
        assert!(matches!(ch.try_lock(3, 4, false), Err(Error::OverlappingFileLock)));
        let b = ch.try_lock(5, 5, true).unwrap().unwrap();
        assert!(b.is_shared());
        a.release().unwrap();
        a.release().unwrap();
        assert!(!a.is_valid());
        let c = ch.lock(0, 2, false).unwrap();
        drop(c);
        assert_eq!(ch.lock_count(), 1);
        drop(b);
        assert_eq!(ch.lock_count(), 0);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_lock_excludes_second_channel() {
        crate::init().unwrap();
        let (tmp, first) = with_contents(b"0123456789");
        let second = rw(tmp.path());
        let held = first.lock_all().unwrap();
        assert!(second.try_lock(0, 10, false).unwrap().is_none());
        assert!(second.try_lock(0, 10, true).unwrap().is_none());
        held.release().unwrap();
        let now = second.try_lock(0, 10, false).unwrap();
        assert!(now.is_some());
    }

    #[test]
    fn test_close_invalidates_locks() {
        crate::init().unwrap();
        let (_tmp, ch) = with_contents(b"0123");
        let l = ch.lock(0, 4, false).unwrap();
        ch.close().unwrap();
        assert!(!l.is_valid());
        assert!(l.release().is_ok());
        assert!(matches!(ch.size(), Err(Error::ClosedChannel)));
    }

    #[test]
    fn test_map_read_write_and_extend() {
        crate::init().unwrap();
        let (tmp, ch) = with_contents(b"abcd");
        let mut m = ch.map(MapMode::ReadWrite, 2, 6).unwrap();
        assert_eq!(ch.size().unwrap(), 8);
        assert_eq!(m.get_at(0).unwrap(), b'c');
        m.put_slice(b"XYZ").unwrap();
        m.force().unwrap();
        assert_eq!(&std::fs::read(tmp.path()).unwrap()[..5], b"abXYZ");

        let mut p = ch.map(MapMode::Private, 0, 2).unwrap();
        p.put_slice(b"!!").unwrap();
        assert_eq!(&read_all(&ch)[..2], b"ab");

        let ro = ch.map(MapMode::ReadOnly, 0, 4).unwrap();
        assert!(ro.is_read_only());
        assert_eq!(ro.as_slice(), b"abXY");
    }

    #[test]
    fn test_transfer_to_file_and_pipe() {
        crate::init().unwrap();
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let (_src_tmp, src) = with_contents(&data);
        let dst_tmp = NamedTempFile::new().unwrap();
        let dst = rw(dst_tmp.path());
        assert_eq!(src.transfer_to(0, u64::MAX, &dst).unwrap(), data.len() as u64);
        assert_eq!(read_all(&dst), data);
        assert_eq!(src.position().unwrap(), 0);
        assert_eq!(src.transfer_to(data.len() as u64, 10, &dst).unwrap(), 0);

        let pipe = Pipe::open().unwrap();
        let sink = pipe.sink();
        assert_eq!(src.transfer_to(100, 10, &*sink).unwrap(), 10);
        let mut got = IoByteBuffer::allocate(10).unwrap();
        assert_eq!(pipe.source().read(&mut got).unwrap(), 10);
        got.flip();
        assert_eq!(got.as_slice(), &data[100..110]);
    }

    #[test]
    fn test_copy_path_matches_direct() {
        crate::init().unwrap();
        let (_tmp, src) = with_contents(b"copy path bytes");
        let pipe = Pipe::open().unwrap();
        let sink = pipe.sink();
        assert_eq!(src.transfer_copy(5, 4, &*sink).unwrap(), 4);
        let mut got = IoByteBuffer::allocate(4).unwrap();
        pipe.source().read(&mut got).unwrap();
        got.flip();
        assert_eq!(got.as_slice(), b"path");
    }

    #[test]
    fn test_transfer_from_pipe_and_file() {
        crate::init().unwrap();
        let tmp = NamedTempFile::new().unwrap();
        let ch = rw(tmp.path());
        let pipe = Pipe::open().unwrap();
        let mut src = IoByteBuffer::wrap(b"piped".to_vec());
        pipe.sink().write(&mut src).unwrap();
        pipe.sink().close().unwrap();
        assert_eq!(ch.transfer_from(&*pipe.source(), 0, 100).unwrap(), 5);
        assert_eq!(ch.position().unwrap(), 0);
        assert_eq!(read_all(&ch), b"piped");

        let (_other_tmp, other) = with_contents(b"0123456789");
        other.set_position(3).unwrap();
        assert_eq!(ch.transfer_from(&other, 5, 4).unwrap(), 4);
        assert_eq!(other.position().unwrap(), 7);
        assert_eq!(read_all(&ch), b"piped3456");
        // Past end of file: nothing happens
        assert_eq!(ch.transfer_from(&other, 100, 4).unwrap(), 0);
    }
}
