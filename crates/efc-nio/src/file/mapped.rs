//! Memory-mapped file regions

use std::ops::{Deref, DerefMut};
use std::os::unix::io::RawFd;

use memmap2::MmapOptions;

use efc_core::Result;

use crate::buffer::IoByteBuffer;

/// How a region is mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    ReadOnly,
    /// Writes reach the file
    ReadWrite,
    /// Copy-on-write; writes stay in this process
    Private,
}

/// A mapped file region, usable as an [`IoByteBuffer`].
///
/// The mapping stays alive while this buffer or any view derived from it
/// exists, even after the channel that created it closes.
pub struct MappedByteBuffer {
    buf: IoByteBuffer,
    mode: MapMode,
}

impl MappedByteBuffer {
    pub(crate) fn map(fd: RawFd, mode: MapMode, position: u64, len: usize) -> Result<Self> {
        if len == 0 {
            let buf = IoByteBuffer::allocate(0)?;
            let buf = if mode == MapMode::ReadOnly {
                buf.as_read_only_buffer()
            } else {
                buf
            };
            return Ok(MappedByteBuffer { buf, mode });
        }
        let mut opts = MmapOptions::new();
        opts.offset(position).len(len);
        // Safety: the mapping is exposed only through IoByteBuffer, which
        // treats the bytes as shared memory that may change underneath
        let buf = unsafe {
            match mode {
                MapMode::ReadOnly => IoByteBuffer::from_mmap(opts.map(fd)?),
                MapMode::ReadWrite => IoByteBuffer::from_mmap_mut(opts.map_mut(fd)?),
                MapMode::Private => IoByteBuffer::from_mmap_mut(opts.map_copy(fd)?),
            }
        };
        log::trace!("mapped fd={} {:?} [{}, +{})", fd, mode, position, len);
        Ok(MappedByteBuffer { buf, mode })
    }

    pub fn mode(&self) -> MapMode {
        self.mode
    }

    /// Write modified pages of a read-write mapping back to the file.
    pub fn force(&self) -> Result<()> {
        if self.mode != MapMode::ReadWrite || self.buf.capacity() == 0 {
            return Ok(());
        }
        let (region, offset) = self.buf.region();
        region.flush(offset, self.buf.capacity())?;
        Ok(())
    }

    pub fn into_buffer(self) -> IoByteBuffer {
        self.buf
    }
}

impl Deref for MappedByteBuffer {
    type Target = IoByteBuffer;

    fn deref(&self) -> &IoByteBuffer {
        &self.buf
    }
}

impl DerefMut for MappedByteBuffer {
    fn deref_mut(&mut self) -> &mut IoByteBuffer {
        &mut self.buf
    }
}

impl std::fmt::Debug for MappedByteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedByteBuffer")
            .field("mode", &self.mode)
            .field("buf", &self.buf)
            .finish()
    }
}
