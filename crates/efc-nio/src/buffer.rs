//! Position/limit/capacity cursor over a byte region
//!
//! ```text
//! 0 <= mark <= position <= limit <= capacity
//! ```
//!
//! Relative operations read or write at `position` and advance it;
//! absolute operations take an index and leave the cursors alone.
//!
//! A buffer either owns its region (heap or memory map) or borrows one
//! the caller keeps alive. `slice`, `duplicate` and `as_read_only_buffer`
//! produce views over the same bytes with independent cursors; writes
//! through one view are visible through the others, and callers
//! synchronize views used from different threads.

use std::fmt;
use std::io;
use std::ptr;
use std::sync::Arc;

use efc_core::constants::MAX_BUFFER_SPAN;
use efc_core::{Error, Result};

/// Byte order for multi-byte accessors. Big-endian by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    BigEndian,
    LittleEndian,
}

impl ByteOrder {
    #[cfg(target_endian = "little")]
    pub const NATIVE: ByteOrder = ByteOrder::LittleEndian;
    #[cfg(target_endian = "big")]
    pub const NATIVE: ByteOrder = ByteOrder::BigEndian;
}

enum Owner {
    Heap,
    MapMut(memmap2::MmapMut),
    Map(memmap2::Mmap),
    Foreign,
}

/// Backing bytes shared by every view.
pub(crate) struct Region {
    ptr: *mut u8,
    len: usize,
    owner: Owner,
}

// Safety: the region is plain memory; views synchronize externally
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    fn heap(bytes: Box<[u8]>) -> Arc<Region> {
        let len = bytes.len();
        let ptr = Box::into_raw(bytes) as *mut u8;
        Arc::new(Region {
            ptr,
            len,
            owner: Owner::Heap,
        })
    }

    pub(crate) fn flush(&self, offset: usize, len: usize) -> io::Result<()> {
        match &self.owner {
            Owner::MapMut(m) => m.flush_range(offset, len),
            _ => Ok(()),
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Owner::Heap = self.owner {
            // Safety: ptr/len came from Box::into_raw in Region::heap
            unsafe {
                drop(Box::from_raw(ptr::slice_from_raw_parts_mut(self.ptr, self.len)));
            }
        }
    }
}

pub struct IoByteBuffer {
    region: Arc<Region>,
    offset: usize,
    capacity: usize,
    limit: usize,
    position: usize,
    mark: Option<usize>,
    read_only: bool,
    order: ByteOrder,
}

impl IoByteBuffer {
    fn view(region: Arc<Region>, offset: usize, capacity: usize, read_only: bool) -> Self {
        IoByteBuffer {
            region,
            offset,
            capacity,
            limit: capacity,
            position: 0,
            mark: None,
            read_only,
            order: ByteOrder::default(),
        }
    }

    /// A zero-filled buffer owning `capacity` bytes.
    pub fn allocate(capacity: usize) -> Result<Self> {
        if capacity > MAX_BUFFER_SPAN {
            return Err(Error::illegal_argument(format!(
                "capacity {} exceeds {}",
                capacity, MAX_BUFFER_SPAN
            )));
        }
        let region = Region::heap(vec![0u8; capacity].into_boxed_slice());
        Ok(Self::view(region, 0, capacity, false))
    }

    /// Take ownership of `bytes`; position 0, limit and capacity = len.
    pub fn wrap(bytes: Vec<u8>) -> Self {
        let capacity = bytes.len();
        Self::view(Region::heap(bytes.into_boxed_slice()), 0, capacity, false)
    }

    /// Like [`wrap`](Self::wrap) with position = `offset` and limit =
    /// `offset + length`.
    pub fn wrap_range(bytes: Vec<u8>, offset: usize, length: usize) -> Result<Self> {
        let end = offset
            .checked_add(length)
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| {
                Error::index_out_of_bounds(format!("{}+{} > {}", offset, length, bytes.len()))
            })?;
        let mut buf = Self::wrap(bytes);
        buf.limit = end;
        buf.position = offset;
        Ok(buf)
    }

    /// Borrow `capacity` bytes at `ptr` with position = `offset`.
    ///
    /// # Safety
    ///
    /// The memory must stay valid and writable for the lifetime of this
    /// buffer and every view derived from it.
    pub unsafe fn from_raw_parts(ptr: *mut u8, capacity: usize, offset: usize) -> Result<Self> {
        if ptr.is_null() {
            return Err(Error::null_pointer("buffer address"));
        }
        if offset > capacity || capacity > MAX_BUFFER_SPAN {
            return Err(Error::index_out_of_bounds(format!(
                "offset {} capacity {}",
                offset, capacity
            )));
        }
        let region = Arc::new(Region {
            ptr,
            len: capacity,
            owner: Owner::Foreign,
        });
        let mut buf = Self::view(region, 0, capacity, false);
        buf.position = offset;
        Ok(buf)
    }

    pub(crate) fn from_mmap_mut(mut map: memmap2::MmapMut) -> Self {
        let len = map.len();
        let ptr = map.as_mut_ptr();
        let region = Arc::new(Region {
            ptr,
            len,
            owner: Owner::MapMut(map),
        });
        Self::view(region, 0, len, false)
    }

    pub(crate) fn from_mmap(map: memmap2::Mmap) -> Self {
        let len = map.len();
        let ptr = map.as_ptr() as *mut u8;
        let region = Arc::new(Region {
            ptr,
            len,
            owner: Owner::Map(map),
        });
        Self::view(region, 0, len, true)
    }

    pub(crate) fn region(&self) -> (&Arc<Region>, usize) {
        (&self.region, self.offset)
    }

    // ── Cursors ──

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Move the position; a mark beyond it is discarded.
    pub fn set_position(&mut self, position: usize) -> Result<&mut Self> {
        if position > self.limit {
            return Err(Error::illegal_argument(format!(
                "position {} > limit {}",
                position, self.limit
            )));
        }
        if self.mark.map_or(false, |m| m > position) {
            self.mark = None;
        }
        self.position = position;
        Ok(self)
    }

    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Move the limit; position and mark are pulled back if beyond it.
    pub fn set_limit(&mut self, limit: usize) -> Result<&mut Self> {
        if limit > self.capacity {
            return Err(Error::illegal_argument(format!(
                "limit {} > capacity {}",
                limit, self.capacity
            )));
        }
        self.limit = limit;
        if self.position > limit {
            self.position = limit;
        }
        if self.mark.map_or(false, |m| m > limit) {
            self.mark = None;
        }
        Ok(self)
    }

    pub fn mark(&mut self) -> &mut Self {
        self.mark = Some(self.position);
        self
    }

    /// Restore the position saved by [`mark`](Self::mark).
    pub fn reset(&mut self) -> Result<&mut Self> {
        let m = self.mark.ok_or(Error::InvalidMark)?;
        self.position = m;
        Ok(self)
    }

    pub fn clear(&mut self) -> &mut Self {
        self.position = 0;
        self.limit = self.capacity;
        self.mark = None;
        self
    }

    /// Prepare to drain what was just filled.
    pub fn flip(&mut self) -> &mut Self {
        self.limit = self.position;
        self.position = 0;
        self.mark = None;
        self
    }

    pub fn rewind(&mut self) -> &mut Self {
        self.position = 0;
        self.mark = None;
        self
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    #[inline]
    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    pub fn set_order(&mut self, order: ByteOrder) -> &mut Self {
        self.order = order;
        self
    }

    // ── Views ──

    /// View of `[position, limit)` with its own cursors starting at 0.
    pub fn slice(&self) -> IoByteBuffer {
        let mut v = Self::view(
            Arc::clone(&self.region),
            self.offset + self.position,
            self.remaining(),
            self.read_only,
        );
        v.order = self.order;
        v
    }

    /// Same bytes and cursor values; cursors move independently after.
    pub fn duplicate(&self) -> IoByteBuffer {
        IoByteBuffer {
            region: Arc::clone(&self.region),
            offset: self.offset,
            capacity: self.capacity,
            limit: self.limit,
            position: self.position,
            mark: self.mark,
            read_only: self.read_only,
            order: self.order,
        }
    }

    pub fn as_read_only_buffer(&self) -> IoByteBuffer {
        let mut d = self.duplicate();
        d.read_only = true;
        d
    }

    /// Move `[position, limit)` to the front; position = bytes moved,
    /// limit = capacity.
    pub fn compact(&mut self) -> Result<&mut Self> {
        if self.read_only {
            return Err(Error::ReadOnlyBuffer);
        }
        let n = self.remaining();
        // Safety: both ranges lie within this view; copy handles overlap
        unsafe {
            let base = self.base_ptr();
            ptr::copy(base.add(self.position), base, n);
        }
        self.position = n;
        self.limit = self.capacity;
        self.mark = None;
        Ok(self)
    }

    // ── Raw access ──

    #[inline]
    fn base_ptr(&self) -> *mut u8 {
        // Safety: offset <= region.len by construction
        unsafe { self.region.ptr.add(self.offset) }
    }

    /// Pointer to `position` for a syscall reading from the buffer.
    pub(crate) fn read_ptr(&self) -> *const u8 {
        // Safety: position <= capacity
        unsafe { self.base_ptr().add(self.position) }
    }

    /// Pointer to `position` for a syscall filling the buffer.
    pub(crate) fn write_ptr(&mut self) -> Result<*mut u8> {
        if self.read_only {
            return Err(Error::ReadOnlyBuffer);
        }
        // Safety: position <= capacity
        Ok(unsafe { self.base_ptr().add(self.position) })
    }

    /// Advance position after a syscall moved `n` bytes.
    pub(crate) fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.remaining());
        self.position = (self.position + n).min(self.limit);
    }

    /// Remaining bytes, `[position, limit)`.
    pub fn as_slice(&self) -> &[u8] {
        // Safety: the range lies within the region
        unsafe { std::slice::from_raw_parts(self.read_ptr(), self.remaining()) }
    }

    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        let n = self.remaining();
        let p = self.write_ptr()?;
        // Safety: the range lies within the region
        Ok(unsafe { std::slice::from_raw_parts_mut(p, n) })
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }

    // ── Index arithmetic ──

    fn check_index(&self, index: usize, n: usize) -> Result<usize> {
        match index.checked_add(n) {
            Some(end) if end <= self.limit && n <= MAX_BUFFER_SPAN => Ok(index),
            _ => Err(Error::index_out_of_bounds(format!(
                "index {} len {} limit {}",
                index, n, self.limit
            ))),
        }
    }

    fn next_get_index(&mut self, n: usize) -> Result<usize> {
        if self.remaining() < n {
            return Err(Error::BufferUnderflow);
        }
        let p = self.position;
        self.position += n;
        Ok(p)
    }

    fn next_put_index(&mut self, n: usize) -> Result<usize> {
        if self.read_only {
            return Err(Error::ReadOnlyBuffer);
        }
        if self.remaining() < n {
            return Err(Error::BufferOverflow);
        }
        let p = self.position;
        self.position += n;
        Ok(p)
    }

    #[inline]
    fn load(&self, index: usize, out: &mut [u8]) {
        // Safety: callers bounds-check index + out.len() against limit
        unsafe { ptr::copy_nonoverlapping(self.base_ptr().add(index), out.as_mut_ptr(), out.len()) }
    }

    #[inline]
    fn store(&mut self, index: usize, bytes: &[u8]) {
        // Safety: callers bounds-check and reject read-only buffers
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.base_ptr().add(index), bytes.len()) }
    }

    // ── Single bytes and bulk ──

    pub fn get(&mut self) -> Result<u8> {
        let i = self.next_get_index(1)?;
        let mut b = [0u8];
        self.load(i, &mut b);
        Ok(b[0])
    }

    pub fn get_at(&self, index: usize) -> Result<u8> {
        let i = self.check_index(index, 1)?;
        let mut b = [0u8];
        self.load(i, &mut b);
        Ok(b[0])
    }

    pub fn put(&mut self, value: u8) -> Result<&mut Self> {
        let i = self.next_put_index(1)?;
        self.store(i, &[value]);
        Ok(self)
    }

    pub fn put_at(&mut self, index: usize, value: u8) -> Result<&mut Self> {
        if self.read_only {
            return Err(Error::ReadOnlyBuffer);
        }
        let i = self.check_index(index, 1)?;
        self.store(i, &[value]);
        Ok(self)
    }

    /// Fill `dst` entirely from the buffer.
    pub fn get_into(&mut self, dst: &mut [u8]) -> Result<&mut Self> {
        let i = self.next_get_index(dst.len())?;
        self.load(i, dst);
        Ok(self)
    }

    pub fn put_slice(&mut self, src: &[u8]) -> Result<&mut Self> {
        let i = self.next_put_index(src.len())?;
        self.store(i, src);
        Ok(self)
    }

    /// Move every remaining byte of `src` into this buffer.
    pub fn put_buffer(&mut self, src: &mut IoByteBuffer) -> Result<&mut Self> {
        let n = src.remaining();
        let i = self.next_put_index(n)?;
        // Safety: source range within src, target range checked above;
        // copy tolerates views over the same region
        unsafe { ptr::copy(src.read_ptr(), self.base_ptr().add(i), n) };
        src.position += n;
        Ok(self)
    }
}

macro_rules! typed_access {
    ($($ty:ty => $get:ident, $get_at:ident, $put:ident, $put_at:ident;)*) => {$(
        impl IoByteBuffer {
            pub fn $get(&mut self) -> Result<$ty> {
                let i = self.next_get_index(std::mem::size_of::<$ty>())?;
                Ok(self.decode::<{ std::mem::size_of::<$ty>() }, $ty>(i, <$ty>::from_be_bytes, <$ty>::from_le_bytes))
            }

            pub fn $get_at(&self, index: usize) -> Result<$ty> {
                let i = self.check_index(index, std::mem::size_of::<$ty>())?;
                Ok(self.decode::<{ std::mem::size_of::<$ty>() }, $ty>(i, <$ty>::from_be_bytes, <$ty>::from_le_bytes))
            }

            pub fn $put(&mut self, value: $ty) -> Result<&mut Self> {
                let i = self.next_put_index(std::mem::size_of::<$ty>())?;
                let bytes = match self.order {
                    ByteOrder::BigEndian => value.to_be_bytes(),
                    ByteOrder::LittleEndian => value.to_le_bytes(),
                };
                self.store(i, &bytes);
                Ok(self)
            }

            pub fn $put_at(&mut self, index: usize, value: $ty) -> Result<&mut Self> {
                if self.read_only {
                    return Err(Error::ReadOnlyBuffer);
                }
                let i = self.check_index(index, std::mem::size_of::<$ty>())?;
                let bytes = match self.order {
                    ByteOrder::BigEndian => value.to_be_bytes(),
                    ByteOrder::LittleEndian => value.to_le_bytes(),
                };
                self.store(i, &bytes);
                Ok(self)
            }
        }
    )*};
}

typed_access! {
    i16 => get_i16, get_i16_at, put_i16, put_i16_at;
    u16 => get_u16, get_u16_at, put_u16, put_u16_at;
    i32 => get_i32, get_i32_at, put_i32, put_i32_at;
    u32 => get_u32, get_u32_at, put_u32, put_u32_at;
    i64 => get_i64, get_i64_at, put_i64, put_i64_at;
    u64 => get_u64, get_u64_at, put_u64, put_u64_at;
    f32 => get_f32, get_f32_at, put_f32, put_f32_at;
    f64 => get_f64, get_f64_at, put_f64, put_f64_at;
}

impl IoByteBuffer {
    #[inline]
    fn decode<const N: usize, T>(&self, index: usize, be: fn([u8; N]) -> T, le: fn([u8; N]) -> T) -> T {
        let mut raw = [0u8; N];
        self.load(index, &mut raw);
        match self.order {
            ByteOrder::BigEndian => be(raw),
            ByteOrder::LittleEndian => le(raw),
        }
    }
}

impl io::Read for IoByteBuffer {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = out.len().min(self.remaining());
        self.load(self.position, &mut out[..n]);
        self.position += n;
        Ok(n)
    }
}

impl io::Write for IoByteBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.read_only {
            return Err(Error::ReadOnlyBuffer.into());
        }
        let n = data.len().min(self.remaining());
        let i = self.position;
        self.store(i, &data[..n]);
        self.position += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl PartialEq for IoByteBuffer {
    /// Buffers are equal when their remaining bytes are.
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl fmt::Debug for IoByteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IoByteBuffer[pos={} lim={} cap={}{}]",
            self.position,
            self.limit,
            self.capacity,
            if self.read_only { " ro" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_cursor_invariants() {
        let mut b = IoByteBuffer::allocate(16).unwrap();
        assert_eq!((b.position(), b.limit(), b.capacity()), (0, 16, 16));
        b.put_slice(b"hello").unwrap();
        assert_eq!(b.position(), 5);
        b.flip();
        assert_eq!((b.position(), b.limit()), (0, 5));
        assert_eq!(b.get().unwrap(), b'h');
        b.mark();
        b.get().unwrap();
        b.get().unwrap();
        b.reset().unwrap();
        assert_eq!(b.position(), 1);
        b.clear();
        assert_eq!((b.position(), b.limit()), (0, 16));
        assert!(matches!(b.reset(), Err(Error::InvalidMark)));
    }

    #[test]
    fn test_limit_pulls_position_and_mark() {
        let mut b = IoByteBuffer::allocate(10).unwrap();
        b.set_position(8).unwrap().mark();
        b.set_limit(4).unwrap();
        assert_eq!(b.position(), 4);
        assert!(b.reset().is_err());
        assert!(b.set_position(5).is_err());
        assert!(b.set_limit(11).is_err());
    }

    #[test]
    fn test_underflow_and_overflow() {
        let mut b = IoByteBuffer::allocate(3).unwrap();
        assert!(matches!(b.put_i32(1), Err(Error::BufferOverflow)));
        b.put_slice(&[1, 2, 3]).unwrap();
        b.flip();
        assert!(matches!(b.get_i32(), Err(Error::BufferUnderflow)));
        // Failed ops do not move the cursor
        assert_eq!(b.position(), 0);
        assert!(matches!(b.get_at(3), Err(Error::IndexOutOfBounds(_))));
        assert!(matches!(b.get_i16_at(usize::MAX), Err(Error::IndexOutOfBounds(_))));
    }

    #[test]
    fn test_compact_after_partial_drain() {
        let mut b = IoByteBuffer::wrap(b"abcdef".to_vec());
        b.get().unwrap();
        b.get().unwrap();
        b.compact().unwrap();
        assert_eq!(b.position(), 4);
        assert_eq!(b.limit(), 6);
        b.flip();
        assert_eq!(b.as_slice(), b"cdef");
    }

    #[test]
    fn test_views_share_bytes() {
        let mut b = IoByteBuffer::wrap(b"0123456789".to_vec());
        b.set_position(2).unwrap().set_limit(6).unwrap();
        let mut s = b.slice();
        assert_eq!((s.position(), s.limit(), s.capacity()), (0, 4, 4));
        s.put(b'X').unwrap();
        assert_eq!(b.get_at(2).unwrap(), b'X');

        let d = b.duplicate();
        assert_eq!(d.position(), 2);
        let mut ro = b.as_read_only_buffer();
        assert!(ro.is_read_only());
        assert!(matches!(ro.put(1), Err(Error::ReadOnlyBuffer)));
        assert!(matches!(ro.compact(), Err(Error::ReadOnlyBuffer)));
    }

    #[test]
    fn test_typed_orders() {
        let mut b = IoByteBuffer::allocate(32).unwrap();
        b.put_i32(0x0102_0304).unwrap();
        b.set_order(ByteOrder::LittleEndian);
        b.put_u16(0xAABB).unwrap();
        b.put_f64(1.5).unwrap();
        b.flip();
        b.set_order(ByteOrder::BigEndian);
        assert_eq!(b.get_at(0).unwrap(), 0x01);
        assert_eq!(b.get_i32().unwrap(), 0x0102_0304);
        b.set_order(ByteOrder::LittleEndian);
        assert_eq!(b.get_u16().unwrap(), 0xAABB);
        assert_eq!(b.get_f64().unwrap(), 1.5);
        assert!(!b.has_remaining());
    }

    #[test]
    fn test_wrap_range() {
        let b = IoByteBuffer::wrap_range(vec![0; 8], 2, 4).unwrap();
        assert_eq!((b.position(), b.limit()), (2, 6));
        assert!(IoByteBuffer::wrap_range(vec![0; 8], 6, 4).is_err());
    }

    #[test]
    fn test_borrowed_region() {
        let mut backing = [0u8; 8];
        let mut b = unsafe { IoByteBuffer::from_raw_parts(backing.as_mut_ptr(), 8, 2).unwrap() };
        b.put_slice(b"hi").unwrap();
        drop(b);
        assert_eq!(&backing[2..4], b"hi");
    }

    #[test]
    fn test_io_traits() {
        let mut b = IoByteBuffer::allocate(4).unwrap();
        assert_eq!(b.write(b"abcdef").unwrap(), 4);
        assert_eq!(b.write(b"x").unwrap(), 0);
        b.flip();
        let mut out = Vec::new();
        b.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abcd");
    }

    #[test]
    fn test_put_buffer() {
        let mut src = IoByteBuffer::wrap(b"xyz".to_vec());
        let mut dst = IoByteBuffer::allocate(2).unwrap();
        assert!(matches!(dst.put_buffer(&mut src), Err(Error::BufferOverflow)));
        let mut dst = IoByteBuffer::allocate(5).unwrap();
        dst.put_buffer(&mut src).unwrap();
        assert!(!src.has_remaining());
        dst.flip();
        assert_eq!(dst, IoByteBuffer::wrap(b"xyz".to_vec()));
    }
}
