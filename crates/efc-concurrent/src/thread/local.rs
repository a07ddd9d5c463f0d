//! Thread-local values
//!
//! Each thread owns an open-addressed table keyed by [`ThreadLocal`]
//! identity. Hash codes step by the golden-ratio increment so consecutive
//! keys spread across a power-of-two table; collisions probe linearly.
//!
//! Keys are held weakly. An entry whose key has been dropped is stale and
//! is turned into a tombstone when a probe runs over it. The table is
//! rebuilt when live entries plus tombstones pass 2/3 of capacity, and
//! doubled when live entries alone do.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use efc_core::{config, Result};

use super::with_locals;

const HASH_INCREMENT: u32 = 0x61c8_8647;

static NEXT_HASH: AtomicU32 = AtomicU32::new(0);

type InheritFn = dyn Fn(&dyn Any) -> Option<Box<dyn Any + Send>> + Send + Sync;

pub(crate) struct LocalKey {
    hash: u32,
    inherit: Option<Box<InheritFn>>,
}

/// A value copied from the creating thread, installed when the child runs.
pub(crate) struct InheritedValue {
    key: Arc<LocalKey>,
    value: Box<dyn Any + Send>,
}

enum Slot {
    Empty,
    Tombstone,
    Live {
        key: Weak<LocalKey>,
        value: Box<dyn Any>,
    },
}

/// Per-thread table.
pub(crate) struct LocalMap {
    slots: Vec<Slot>,
    live: usize,
    tombstones: usize,
}

impl Default for LocalMap {
    fn default() -> Self {
        LocalMap {
            slots: Vec::new(),
            live: 0,
            tombstones: 0,
        }
    }
}

impl LocalMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn ensure_allocated(&mut self) {
        if self.slots.is_empty() {
            let cap = config::global().thread_local_capacity.max(2).next_power_of_two();
            self.slots = (0..cap).map(|_| Slot::Empty).collect();
        }
    }

    #[inline]
    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    #[inline]
    fn threshold(&self) -> usize {
        self.slots.len() * 2 / 3
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }

    /// Index of `key`'s entry, turning stale entries met on the way into
    /// tombstones.
    fn find(&mut self, key: &Arc<LocalKey>) -> Option<usize> {
        if self.slots.is_empty() {
            return None;
        }
        let mask = self.mask();
        let mut i = key.hash as usize & mask;
        for _ in 0..self.slots.len() {
            let stale = match &self.slots[i] {
                Slot::Empty => return None,
                Slot::Tombstone => false,
                Slot::Live { key: k, .. } => {
                    if k.as_ptr() == Arc::as_ptr(key) {
                        return Some(i);
                    }
                    k.strong_count() == 0
                }
            };
            if stale {
                self.slots[i] = Slot::Tombstone;
                self.live -= 1;
                self.tombstones += 1;
            }
            i = (i + 1) & mask;
        }
        None
    }

    pub(crate) fn get_mut(&mut self, key: &Arc<LocalKey>) -> Option<&mut Box<dyn Any>> {
        let i = self.find(key)?;
        match &mut self.slots[i] {
            Slot::Live { value, .. } => Some(value),
            _ => None,
        }
    }

    pub(crate) fn remove(&mut self, key: &Arc<LocalKey>) -> Option<Box<dyn Any>> {
        let i = self.find(key)?;
        let old = std::mem::replace(&mut self.slots[i], Slot::Tombstone);
        self.live -= 1;
        self.tombstones += 1;
        match old {
            Slot::Live { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Insert or replace; returns the previous value.
    pub(crate) fn set(&mut self, key: &Arc<LocalKey>, value: Box<dyn Any>) -> Option<Box<dyn Any>> {
        self.ensure_allocated();
        if let Some(i) = self.find(key) {
            if let Slot::Live { value: v, .. } = &mut self.slots[i] {
                return Some(std::mem::replace(v, value));
            }
        }

        let mask = self.mask();
        let mut i = key.hash as usize & mask;
        loop {
            match &self.slots[i] {
                Slot::Empty => break,
                Slot::Tombstone => {
                    self.tombstones -= 1;
                    break;
                }
                Slot::Live { .. } => i = (i + 1) & mask,
            }
        }
        self.slots[i] = Slot::Live {
            key: Arc::downgrade(key),
            value,
        };
        self.live += 1;

        if self.live + self.tombstones > self.threshold() {
            self.rehash();
        }
        None
    }

    /// Drop stale entries and tombstones; double when still crowded.
    fn rehash(&mut self) {
        let current = self.slots.len();
        let entries: Vec<(u32, Weak<LocalKey>, Box<dyn Any>)> = std::mem::take(&mut self.slots)
            .into_iter()
            .filter_map(|s| match s {
                Slot::Live { key, value } => key.upgrade().map(|k| (k.hash, key, value)),
                _ => None,
            })
            .collect();

        let cap = if entries.len() > current * 2 / 3 {
            current * 2
        } else {
            current
        };
        self.slots = (0..cap).map(|_| Slot::Empty).collect();
        self.live = entries.len();
        self.tombstones = 0;

        let mask = cap - 1;
        for (hash, key, value) in entries {
            let mut i = hash as usize & mask;
            while matches!(self.slots[i], Slot::Live { .. }) {
                i = (i + 1) & mask;
            }
            self.slots[i] = Slot::Live { key, value };
        }
    }

    /// Install values inherited from the creating thread.
    pub(crate) fn seed(&mut self, inherited: Vec<InheritedValue>) {
        for InheritedValue { key, value } in inherited {
            self.set(&key, value);
        }
    }

    /// Child copies of every inheritable entry.
    fn inheritable(&self) -> Vec<InheritedValue> {
        let mut out = Vec::new();
        for slot in &self.slots {
            if let Slot::Live { key, value } = slot {
                let Some(key) = key.upgrade() else { continue };
                let Some(inherit) = key.inherit.as_ref() else { continue };
                if let Some(child) = inherit(value.as_ref()) {
                    out.push(InheritedValue {
                        key: Arc::clone(&key),
                        value: child,
                    });
                }
            }
        }
        out
    }
}

/// Inheritable values of the calling thread, transformed for a child.
pub(crate) fn inherit_from_current() -> Vec<InheritedValue> {
    with_locals(|map| map.inheritable()).unwrap_or_default()
}

/// A per-thread variable.
///
/// Each thread sees its own value, created on first access by the
/// initializer (or absent when there is none).
pub struct ThreadLocal<T: 'static> {
    key: Arc<LocalKey>,
    init: Option<Box<dyn Fn() -> T + Send + Sync>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> ThreadLocal<T> {
    fn with_key(inherit: Option<Box<InheritFn>>, init: Option<Box<dyn Fn() -> T + Send + Sync>>) -> Self {
        let hash = NEXT_HASH.fetch_add(HASH_INCREMENT, Ordering::Relaxed);
        ThreadLocal {
            key: Arc::new(LocalKey { hash, inherit }),
            init,
            _marker: PhantomData,
        }
    }

    /// A local with no initial value.
    pub fn new() -> Self {
        Self::with_key(None, None)
    }

    /// A local whose first access on each thread calls `init`.
    pub fn with_initial<F>(init: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::with_key(None, Some(Box::new(init)))
    }

    /// Run `f` on this thread's value, creating it first if needed.
    ///
    /// The value is taken out of the table while `f` runs; a nested access
    /// to the same local from inside `f` sees a fresh initial value.
    pub fn with<R>(&self, f: impl FnOnce(Option<&mut T>) -> R) -> Result<R> {
        let existing = with_locals(|map| map.remove(&self.key))?;
        let mut value: Option<Box<T>> = match existing {
            Some(boxed) => boxed.downcast::<T>().ok(),
            None => self.init.as_ref().map(|init| Box::new(init())),
        };
        let out = f(value.as_deref_mut());
        if let Some(v) = value {
            with_locals(|map| map.set(&self.key, v))?;
        }
        Ok(out)
    }

    /// Replace this thread's value.
    pub fn set(&self, value: T) -> Result<()> {
        let old = with_locals(|map| map.set(&self.key, Box::new(value)))?;
        drop(old);
        Ok(())
    }

    /// Remove and return this thread's value.
    pub fn take(&self) -> Result<Option<T>> {
        let old = with_locals(|map| map.remove(&self.key))?;
        Ok(old.and_then(|b| b.downcast::<T>().ok()).map(|b| *b))
    }

    /// Forget this thread's value; the next access re-initializes.
    pub fn remove(&self) -> Result<()> {
        self.take().map(drop)
    }
}

impl<T: Clone + 'static> ThreadLocal<T> {
    /// Copy of this thread's value.
    pub fn get(&self) -> Result<Option<T>> {
        self.with(|v| v.map(|v| v.clone()))
    }
}

impl<T: 'static> Default for ThreadLocal<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A thread-local whose value is copied into threads created by the
/// owning thread, through the `child_value` hook.
pub struct InheritableThreadLocal<T: Send + 'static> {
    local: ThreadLocal<T>,
}

impl<T: Clone + Send + 'static> InheritableThreadLocal<T> {
    /// Children receive a clone of the parent's value.
    pub fn new() -> Self {
        Self::with_child_value(|v: &T| v.clone())
    }
}

impl<T: Clone + Send + 'static> Default for InheritableThreadLocal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> InheritableThreadLocal<T> {
    /// Children receive `child_value(parent_value)`.
    pub fn with_child_value<F>(child_value: F) -> Self
    where
        F: Fn(&T) -> T + Send + Sync + 'static,
    {
        let inherit: Box<InheritFn> = Box::new(move |v: &dyn Any| {
            v.downcast_ref::<T>()
                .map(|v| Box::new(child_value(v)) as Box<dyn Any + Send>)
        });
        InheritableThreadLocal {
            local: ThreadLocal::with_key(Some(inherit), None),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(Option<&mut T>) -> R) -> Result<R> {
        self.local.with(f)
    }

    pub fn set(&self, value: T) -> Result<()> {
        self.local.set(value)
    }

    pub fn take(&self) -> Result<Option<T>> {
        self.local.take()
    }

    pub fn remove(&self) -> Result<()> {
        self.local.remove()
    }
}

impl<T: Clone + Send + 'static> InheritableThreadLocal<T> {
    pub fn get(&self) -> Result<Option<T>> {
        self.local.get()
    }
}
