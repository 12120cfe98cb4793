//! Object pools for work items, stat records and scratch buffers.
//!
//! A [`Pool`] hands out previously used objects so that the hot paths of the generators, the
//! decode stage and the workers can run without allocating once their buffers have grown to
//! steady-state size. Objects are [recycled](Recycle::recycle) on return: contents are cleared,
//! capacity is kept.
//!
//! Pools are shared through an [`Arc`] and are safe to use from any number of tasks. There is
//! no ordering guarantee on which idle object [`Pool::get`] returns, so callers must never keep
//! a reference to an object across a [`Pool::put`].

use std::fmt;
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;

/// Default number of idle objects a pool keeps around before dropping returned ones.
pub const DEFAULT_MAX_IDLE: usize = 1024;

/// Objects that can be reset for reuse.
pub trait Recycle {
    /// Clears all contents, retaining allocated capacity where possible.
    fn recycle(&mut self);
}

impl Recycle for Vec<u8> {
    fn recycle(&mut self) {
        self.clear();
    }
}

impl Recycle for String {
    fn recycle(&mut self) {
        self.clear();
    }
}

/// A bounded, lock-free free list of reusable objects.
pub struct Pool<T> {
    idle: ArrayQueue<T>,
}

impl<T: Recycle + Default> Pool<T> {
    /// Creates a pool that keeps at most [`DEFAULT_MAX_IDLE`] idle objects.
    pub fn new() -> Self {
        Self::with_max_idle(DEFAULT_MAX_IDLE)
    }

    /// Creates a pool that keeps at most `max_idle` idle objects, but at least one.
    pub fn with_max_idle(max_idle: usize) -> Self {
        Self {
            idle: ArrayQueue::new(max_idle.max(1)),
        }
    }

    /// Creates a new shared pool.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Takes an idle object from the pool, or creates a fresh one.
    pub fn get(&self) -> T {
        self.idle.pop().unwrap_or_default()
    }

    /// Recycles `item` and returns it to the pool.
    ///
    /// If the pool already holds `max_idle` objects, the item is dropped instead.
    pub fn put(&self, mut item: T) {
        item.recycle();
        // A full pool hands the item back, and it is dropped.
        let _ = self.idle.push(item);
    }

    /// Returns the number of idle objects currently held.
    pub fn idle(&self) -> usize {
        self.idle.len()
    }

    /// Maximum number of idle objects this pool keeps.
    pub fn max_idle(&self) -> usize {
        self.idle.capacity()
    }
}

impl<T: Recycle + Default> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("idle", &self.idle.len())
            .field("max_idle", &self.idle.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returned_buffers_are_cleared_but_keep_capacity() {
        let pool = Pool::<Vec<u8>>::new();

        let mut buf = pool.get();
        buf.extend_from_slice(b"hello world");
        let capacity = buf.capacity();
        pool.put(buf);

        let buf = pool.get();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), capacity);
    }

    #[test]
    fn max_idle_bounds_the_free_list() {
        let pool = Pool::<String>::with_max_idle(2);
        for _ in 0..5 {
            pool.put(String::from("x"));
        }
        assert_eq!(pool.idle(), 2);

        pool.get();
        pool.get();
        assert_eq!(pool.idle(), 0);
        assert!(pool.get().is_empty());
    }

    #[test]
    fn zero_max_idle_keeps_one() {
        let pool = Pool::<String>::with_max_idle(0);
        assert_eq!(pool.max_idle(), 1);
        pool.put(String::from("a"));
        pool.put(String::from("b"));
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn concurrent_returns_never_exceed_capacity() {
        let pool = Arc::new(Pool::<Vec<u8>>::with_max_idle(8));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        pool.put(vec![1, 2, 3]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(pool.idle(), 8);
        for _ in 0..8 {
            assert!(pool.get().is_empty());
        }
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn shared_across_threads() {
        let pool = Pool::<Vec<u8>>::shared();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let mut buf = pool.get();
                        buf.push(1);
                        pool.put(buf);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(pool.idle() <= 4);
        assert!(pool.get().is_empty());
    }
}
