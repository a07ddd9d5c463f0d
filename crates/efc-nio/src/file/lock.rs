//! File range locks and the per-channel table of held ranges

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use efc_core::{Error, Result};

use crate::channel::ChannelCore;
use crate::dispatch;

/// End of `[position, position + size)`, open-ended when it overflows.
fn range_end(position: u64, size: u64) -> u64 {
    position.saturating_add(size)
}

fn ranges_overlap(a_pos: u64, a_size: u64, b_pos: u64, b_size: u64) -> bool {
    a_pos < range_end(b_pos, b_size) && b_pos < range_end(a_pos, a_size)
}

struct Held {
    position: u64,
    size: u64,
    valid: Arc<AtomicBool>,
}

/// Ranges locked through one channel.
///
/// The kernel merges overlapping locks taken through the same open file,
/// so overlap is refused here before the request reaches it.
#[derive(Default)]
pub(crate) struct LockTable {
    held: Mutex<Vec<Held>>,
}

impl LockTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Reserve a range, failing with `OverlappingFileLock` if any part
    /// of it is already held or pending.
    pub(crate) fn reserve(&self, position: u64, size: u64) -> Result<Arc<AtomicBool>> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if held
            .iter()
            .any(|h| ranges_overlap(h.position, h.size, position, size))
        {
            return Err(Error::OverlappingFileLock);
        }
        let valid = Arc::new(AtomicBool::new(true));
        held.push(Held {
            position,
            size,
            valid: Arc::clone(&valid),
        });
        Ok(valid)
    }

    pub(crate) fn remove(&self, valid: &Arc<AtomicBool>) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|h| !Arc::ptr_eq(&h.valid, valid));
    }

    /// Invalidate every lock; closing the descriptor releases them.
    pub(crate) fn invalidate_all(&self) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        for h in held.drain(..) {
            h.valid.store(false, Ordering::SeqCst);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.held.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// A lock on a byte range of a file, held until released, dropped or
/// until its channel closes.
pub struct FileLock {
    core: Arc<ChannelCore>,
    table: Arc<LockTable>,
    position: u64,
    size: u64,
    shared: bool,
    valid: Arc<AtomicBool>,
}

impl FileLock {
    pub(crate) fn new(
        core: Arc<ChannelCore>,
        table: Arc<LockTable>,
        position: u64,
        size: u64,
        shared: bool,
        valid: Arc<AtomicBool>,
    ) -> Self {
        FileLock {
            core,
            table,
            position,
            size,
            shared,
            valid,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Length of the range; `u64::MAX` covers the file however it grows.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst) && self.core.is_open()
    }

    pub fn overlaps(&self, position: u64, size: u64) -> bool {
        ranges_overlap(self.position, self.size, position, size)
    }

    /// Release the lock. Releasing twice does nothing; releasing a
    /// still-valid lock after its channel closed fails.
    pub fn release(&self) -> Result<()> {
        if !self.valid.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.core.ensure_open()?;
        if !self.valid.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.table.remove(&self.valid);
        dispatch::release(self.core.fd(), self.position, self.size)?;
        log::debug!(
            "released lock fd={} [{}, +{})",
            self.core.fd(),
            self.position,
            self.size
        );
        Ok(())
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if self.valid.load(Ordering::SeqCst) && self.core.is_open() {
            if let Err(e) = self.release() {
                log::debug!("release on drop: {}", e);
            }
        }
    }
}

impl fmt::Debug for FileLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileLock")
            .field("position", &self.position)
            .field("size", &self.size)
            .field("shared", &self.shared)
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlap() {
        assert!(ranges_overlap(0, 10, 5, 10));
        assert!(!ranges_overlap(0, 10, 10, 10));
        assert!(ranges_overlap(100, u64::MAX, 1 << 40, 1));
        assert!(!ranges_overlap(0, 0, 0, 10));
    }

    #[test]
    fn test_table_reserve_and_remove() {
        let t = LockTable::new();
        let a = t.reserve(0, 10).unwrap();
        assert!(matches!(t.reserve(5, 1), Err(Error::OverlappingFileLock)));
        let b = t.reserve(10, 10).unwrap();
        t.remove(&a);
        assert!(t.reserve(0, 10).is_ok());
        t.invalidate_all();
        assert!(!b.load(Ordering::SeqCst));
        assert_eq!(t.len(), 0);
    }
}
