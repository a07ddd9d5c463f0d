//! FIFO blocking queue on one `ReentrantLock` and two conditions
//!
//! `not_empty` wakes takers, `not_full` wakes putters. A queue created
//! with capacity 0 is a hand-off: an offer succeeds only while a taker is
//! waiting to receive it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use efc_core::{Result, SpinLock};

use crate::lock::{Condition, ReentrantLock};

pub struct LinkedBlockingQueue<T> {
    capacity: usize,
    lock: ReentrantLock,
    not_empty: Condition,
    not_full: Condition,
    // Only touched while `lock` is held
    items: SpinLock<VecDeque<T>>,
    waiting_takers: AtomicUsize,
}

impl<T> LinkedBlockingQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let lock = ReentrantLock::new();
        LinkedBlockingQueue {
            capacity,
            not_empty: lock.new_condition(),
            not_full: lock.new_condition(),
            lock,
            items: SpinLock::new(VecDeque::new()),
            waiting_takers: AtomicUsize::new(0),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    /// A queue that only hands items straight to waiting takers.
    pub fn hand_off() -> Self {
        Self::new(0)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // Room for one more item; lock held
    fn has_room(&self, len: usize) -> bool {
        if self.capacity == 0 {
            len < self.waiting_takers.load(Ordering::SeqCst)
        } else {
            len < self.capacity
        }
    }

    fn push_locked(&self, item: T) {
        self.items.lock().push_back(item);
        // Owner check cannot fail: callers hold the lock
        let _ = self.not_empty.signal();
    }

    fn pop_locked(&self) -> Option<T> {
        let item = self.items.lock().pop_front();
        if item.is_some() {
            let _ = self.not_full.signal();
        }
        item
    }

    /// Insert, waiting for space. Interruptible.
    pub fn put(&self, item: T) -> Result<()> {
        self.lock.lock_interruptibly()?;
        let _guard = Unlock(&self.lock);
        while !self.has_room(self.items.lock().len()) {
            self.not_full.wait()?;
        }
        self.push_locked(item);
        Ok(())
    }

    /// Insert if there is room now; hands the item back otherwise.
    pub fn offer(&self, item: T) -> std::result::Result<(), T> {
        let _guard = self.lock.guard();
        if !self.has_room(self.items.lock().len()) {
            return Err(item);
        }
        self.push_locked(item);
        Ok(())
    }

    /// Insert, waiting at most `timeout` for space. `Ok(false)` drops
    /// the item.
    pub fn offer_timeout(&self, item: T, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        self.lock.lock_interruptibly()?;
        let _guard = Unlock(&self.lock);
        while !self.has_room(self.items.lock().len()) {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(false);
            }
            self.not_full.wait_timeout(left)?;
        }
        self.push_locked(item);
        Ok(true)
    }

    /// Remove the head, waiting until one arrives. Interruptible.
    pub fn take(&self) -> Result<T> {
        self.lock.lock_interruptibly()?;
        let _guard = Unlock(&self.lock);
        self.waiting_takers.fetch_add(1, Ordering::SeqCst);
        let _taker = Taker(&self.waiting_takers);
        let _ = self.not_full.signal();
        loop {
            if let Some(item) = self.pop_locked() {
                return Ok(item);
            }
            self.not_empty.wait()?;
        }
    }

    /// Remove the head if present.
    pub fn poll(&self) -> Option<T> {
        let _guard = self.lock.guard();
        self.pop_locked()
    }

    /// Remove the head, waiting at most `timeout`.
    pub fn poll_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        let deadline = Instant::now() + timeout;
        self.lock.lock_interruptibly()?;
        let _guard = Unlock(&self.lock);
        self.waiting_takers.fetch_add(1, Ordering::SeqCst);
        let _taker = Taker(&self.waiting_takers);
        let _ = self.not_full.signal();
        loop {
            if let Some(item) = self.pop_locked() {
                return Ok(Some(item));
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(None);
            }
            self.not_empty.wait_timeout(left)?;
        }
    }

    /// Move every queued item into `out`; returns how many moved.
    pub fn drain_to(&self, out: &mut Vec<T>) -> usize {
        self.drain_to_max(out, usize::MAX)
    }

    pub fn drain_to_max(&self, out: &mut Vec<T>, max: usize) -> usize {
        let _guard = self.lock.guard();
        let mut items = self.items.lock();
        let n = items.len().min(max);
        out.extend(items.drain(..n));
        drop(items);
        if n > 0 {
            let _ = self.not_full.signal_all();
        }
        n
    }

    /// Remove every item matching `pred`; returns how many were removed.
    pub fn remove_if(&self, mut pred: impl FnMut(&T) -> bool) -> usize {
        let _guard = self.lock.guard();
        let mut items = self.items.lock();
        let before = items.len();
        items.retain(|t| !pred(t));
        let removed = before - items.len();
        drop(items);
        if removed > 0 {
            let _ = self.not_full.signal_all();
        }
        removed
    }

    pub fn clear(&self) {
        self.remove_if(|_| true);
    }

    pub fn len(&self) -> usize {
        let _guard = self.lock.guard();
        let n = self.items.lock().len();
        n
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remaining_capacity(&self) -> usize {
        if self.capacity == usize::MAX {
            return usize::MAX;
        }
        self.capacity.saturating_sub(self.len())
    }
}

impl<T: Clone> LinkedBlockingQueue<T> {
    pub fn peek(&self) -> Option<T> {
        let _guard = self.lock.guard();
        let head = self.items.lock().front().cloned();
        head
    }

    /// Copy of the queue contents, head first.
    pub fn snapshot(&self) -> Vec<T> {
        let _guard = self.lock.guard();
        let items = self.items.lock().iter().cloned().collect();
        items
    }
}

impl<T> std::fmt::Debug for LinkedBlockingQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkedBlockingQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

/// Releases a lock taken with `lock_interruptibly`.
struct Unlock<'a>(&'a ReentrantLock);

impl Drop for Unlock<'_> {
    fn drop(&mut self) {
        let _ = self.0.unlock();
    }
}

struct Taker<'a>(&'a AtomicUsize);

impl Drop for Taker<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::Thread;
    use efc_core::Error;
    use std::sync::Arc;

    #[test]
    fn test_fifo_and_capacity() {
        let q = LinkedBlockingQueue::new(2);
        assert!(q.offer(1).is_ok());
        assert!(q.offer(2).is_ok());
        assert_eq!(q.offer(3), Err(3));
        assert_eq!(q.remaining_capacity(), 0);
        assert_eq!(q.peek(), Some(1));
        assert_eq!(q.poll(), Some(1));
        assert_eq!(q.take().unwrap(), 2);
        assert!(q.poll().is_none());
    }

    #[test]
    fn test_take_blocks_until_put() {
        let q = Arc::new(LinkedBlockingQueue::unbounded());
        let q2 = Arc::clone(&q);
        let t = Thread::spawn(move || {
            assert_eq!(q2.take().unwrap(), "hello");
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        q.put("hello").unwrap();
        t.join().unwrap();
    }

    #[test]
    fn test_put_blocks_until_space() {
        let q = Arc::new(LinkedBlockingQueue::new(1));
        q.put(1).unwrap();
        let q2 = Arc::clone(&q);
        let t = Thread::spawn(move || q2.put(2).unwrap()).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(q.len(), 1);
        assert_eq!(q.take().unwrap(), 1);
        t.join().unwrap();
        assert_eq!(q.take().unwrap(), 2);
    }

    #[test]
    fn test_timeouts() {
        let q: LinkedBlockingQueue<u8> = LinkedBlockingQueue::new(1);
        assert_eq!(q.poll_timeout(Duration::from_millis(20)).unwrap(), None);
        assert!(q.offer_timeout(1, Duration::from_millis(5)).unwrap());
        assert!(!q.offer_timeout(2, Duration::from_millis(20)).unwrap());
    }

    #[test]
    fn test_take_interrupted() {
        let q: Arc<LinkedBlockingQueue<u8>> = Arc::new(LinkedBlockingQueue::unbounded());
        let q2 = Arc::clone(&q);
        let t = Thread::spawn(move || {
            assert!(matches!(q2.take(), Err(Error::Interrupted)));
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        t.interrupt();
        t.join().unwrap();
    }

    #[test]
    fn test_hand_off_needs_taker() {
        let q = Arc::new(LinkedBlockingQueue::hand_off());
        assert_eq!(q.offer(7), Err(7));
        let q2 = Arc::clone(&q);
        let t = Thread::spawn(move || assert_eq!(q2.take().unwrap(), 7)).unwrap();
        // Retry until the taker is waiting
        let mut item = 7;
        while let Err(back) = q.offer(item) {
            item = back;
            Thread::yield_now();
        }
        t.join().unwrap();
    }

    #[test]
    fn test_drain_and_remove_if() {
        let q = LinkedBlockingQueue::unbounded();
        for i in 0..10 {
            q.offer(i).unwrap();
        }
        assert_eq!(q.remove_if(|v| v % 2 == 0), 5);
        let mut out = Vec::new();
        assert_eq!(q.drain_to_max(&mut out, 2), 2);
        assert_eq!(out, vec![1, 3]);
        assert_eq!(q.snapshot(), vec![5, 7, 9]);
        assert_eq!(q.drain_to(&mut out), 3);
        assert!(q.is_empty());
    }
}
