//! Ordered loads, stores and compare-and-swap per scalar width
//!
//! Every lock-free field in EFC goes through these operations. The
//! pairing rule is the usual one: a value published with `release_store`
//! and observed with `load_acquire` makes every write the publisher did
//! before the store visible to the reader after the load.
//!
//! `cmpxchg` is a full barrier and returns the *prior* value; callers
//! compare it with their expected value to learn whether they won.

use core::sync::atomic::{
    AtomicI16, AtomicI32, AtomicI64, AtomicI8, AtomicIsize, AtomicPtr, AtomicU16, AtomicU32,
    AtomicU64, AtomicU8, AtomicUsize, Ordering,
};

/// Full two-way memory fence.
#[inline]
pub fn fence() {
    core::sync::atomic::fence(Ordering::SeqCst);
}

/// Loads cannot move above this point.
#[inline]
pub fn acquire_fence() {
    core::sync::atomic::fence(Ordering::Acquire);
}

/// Stores cannot move below this point.
#[inline]
pub fn release_fence() {
    core::sync::atomic::fence(Ordering::Release);
}

/// Ordered access to a scalar-width atomic cell.
pub trait OrderedAtomic {
    type Value: Copy + PartialEq;

    /// Load with acquire ordering.
    fn load_acquire(&self) -> Self::Value;

    /// Store with release ordering.
    fn release_store(&self, value: Self::Value);

    /// Release store followed by a full fence.
    ///
    /// Used where a later load of a *different* variable must not be
    /// reordered before this store (Dekker-style handshakes).
    fn release_store_fence(&self, value: Self::Value);

    /// Compare-and-swap with a full barrier. Returns the prior value.
    fn cmpxchg(&self, expected: Self::Value, new: Self::Value) -> Self::Value;

    /// Exchange with a full barrier. Returns the prior value.
    fn xchg(&self, value: Self::Value) -> Self::Value;

    /// Convenience: `cmpxchg(expected, new) == expected`.
    #[inline]
    fn cas(&self, expected: Self::Value, new: Self::Value) -> bool {
        self.cmpxchg(expected, new) == expected
    }
}

/// Arithmetic on integer atomic cells. All operations return the new value.
pub trait OrderedCounter: OrderedAtomic {
    fn add(&self, delta: Self::Value) -> Self::Value;
    fn inc(&self) -> Self::Value;
    fn dec(&self) -> Self::Value;
}

macro_rules! impl_ordered_int {
    ($($atomic:ty => $int:ty),* $(,)?) => {$(
        impl OrderedAtomic for $atomic {
            type Value = $int;

            #[inline]
            fn load_acquire(&self) -> $int {
                self.load(Ordering::Acquire)
            }

            #[inline]
            fn release_store(&self, value: $int) {
                self.store(value, Ordering::Release);
            }

            #[inline]
            fn release_store_fence(&self, value: $int) {
                self.store(value, Ordering::Release);
                fence();
            }

            #[inline]
            fn cmpxchg(&self, expected: $int, new: $int) -> $int {
                match self.compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst) {
                    Ok(prev) | Err(prev) => prev,
                }
            }

            #[inline]
            fn xchg(&self, value: $int) -> $int {
                self.swap(value, Ordering::SeqCst)
            }
        }

        impl OrderedCounter for $atomic {
            #[inline]
            fn add(&self, delta: $int) -> $int {
                self.fetch_add(delta, Ordering::SeqCst).wrapping_add(delta)
            }

            #[inline]
            fn inc(&self) -> $int {
                self.add(1)
            }

            #[inline]
            fn dec(&self) -> $int {
                self.fetch_sub(1, Ordering::SeqCst).wrapping_sub(1)
            }
        }
    )*};
}

impl_ordered_int! {
    AtomicI8 => i8,
    AtomicU8 => u8,
    AtomicI16 => i16,
    AtomicU16 => u16,
    AtomicI32 => i32,
    AtomicU32 => u32,
    AtomicI64 => i64,
    AtomicU64 => u64,
    AtomicIsize => isize,
    AtomicUsize => usize,
}

impl<T> OrderedAtomic for AtomicPtr<T> {
    type Value = *mut T;

    #[inline]
    fn load_acquire(&self) -> *mut T {
        self.load(Ordering::Acquire)
    }

    #[inline]
    fn release_store(&self, value: *mut T) {
        self.store(value, Ordering::Release);
    }

    #[inline]
    fn release_store_fence(&self, value: *mut T) {
        self.store(value, Ordering::Release);
        fence();
    }

    #[inline]
    fn cmpxchg(&self, expected: *mut T, new: *mut T) -> *mut T {
        match self.compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(prev) | Err(prev) => prev,
        }
    }

    #[inline]
    fn xchg(&self, value: *mut T) -> *mut T {
        self.swap(value, Ordering::SeqCst)
    }
}

/// Byte CAS synthesized on the enclosing 32-bit word.
///
/// `index` selects the byte in little-endian lane order (0 = lowest).
/// The loop re-reads the word until either the target byte no longer
/// matches `expected` or the word CAS succeeds; neighbouring bytes may
/// change concurrently without causing a spurious failure.
///
/// Returns the prior value of the byte.
pub fn cmpxchg_byte(word: &AtomicU32, index: usize, expected: u8, new: u8) -> u8 {
    assert!(index < 4, "byte index out of range: {}", index);
    let shift = (index * 8) as u32;
    let mask = 0xFFu32 << shift;

    let mut current = word.load(Ordering::Relaxed);
    loop {
        let current_byte = ((current & mask) >> shift) as u8;
        if current_byte != expected {
            return current_byte;
        }
        let replaced = (current & !mask) | ((new as u32) << shift);
        match word.compare_exchange(current, replaced, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return expected,
            Err(observed) => current = observed,
        }
    }
}

/// Acquire-load a single byte lane of a 32-bit word.
#[inline]
pub fn load_byte_acquire(word: &AtomicU32, index: usize) -> u8 {
    debug_assert!(index < 4);
    (word.load(Ordering::Acquire) >> (index * 8)) as u8
}
