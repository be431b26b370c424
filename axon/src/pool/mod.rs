//! Bounded object pools for hot-path records and scratch buffers.
//!
//! A [`Pool`] is a free-list with a capacity cap. Checkout resets the
//! object (maps cleared, buffers truncated with capacity kept) and hands
//! out a [`PoolGuard`]; dropping the guard returns the object unless the
//! pool is full, in which case it is dropped to cap memory. The guard is
//! the only handle, so a pooled object cannot be referenced after return.
//!
//! Process-wide pools (the scratch-buffer pool here, the middleware record
//! pools next to their types) are `once_cell` singletons with an explicit
//! shutdown hook; leaf code reaches them through accessors, not ad-hoc
//! globals.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use once_cell::sync::Lazy;

/// An object that can be recycled through a [`Pool`].
pub trait Poolable: Send + 'static {
    /// Clears content while keeping allocated capacity where possible.
    fn reset(&mut self);
}

impl Poolable for String {
    fn reset(&mut self) {
        self.clear();
    }
}

/// Counters describing pool behavior since process start.
#[derive(Clone, Copy, Debug, Default)]
pub struct PoolStats {
    pub created: u64,
    pub reused: u64,
    pub returned: u64,
    pub dropped: u64,
}

/// Bounded free-list of reusable objects.
pub struct Pool<T: Poolable> {
    free: Mutex<Vec<T>>,
    capacity: usize,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    created: AtomicU64,
    reused: AtomicU64,
    returned: AtomicU64,
    dropped: AtomicU64,
}

impl<T: Poolable> Pool<T> {
    pub fn new(capacity: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            factory: Box::new(factory),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            returned: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Takes an object from the free list (or creates one) and resets it.
    pub fn checkout(&self) -> PoolGuard<'_, T> {
        let reused = self.free.lock().expect("pool lock").pop();
        let mut value = match reused {
            Some(value) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                value
            }
            None => {
                self.created.fetch_add(1, Ordering::Relaxed);
                (self.factory)()
            }
        };
        value.reset();
        PoolGuard {
            pool: self,
            value: Some(value),
        }
    }

    /// Objects currently parked on the free list.
    pub fn idle(&self) -> usize {
        self.free.lock().expect("pool lock").len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Drops every idle object (shutdown hook).
    pub fn clear(&self) {
        self.free.lock().expect("pool lock").clear();
    }

    /// Records are also cleared on release so idle objects hold no stale
    /// content.
    fn give_back(&self, mut value: T) {
        value.reset();
        let mut free = self.free.lock().expect("pool lock");
        if free.len() < self.capacity {
            free.push(value);
            self.returned.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl<T: Poolable> std::fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("capacity", &self.capacity)
            .field("idle", &self.idle())
            .finish()
    }
}

/// Exclusive handle to a checked-out object; returns it on drop.
pub struct PoolGuard<'a, T: Poolable> {
    pool: &'a Pool<T>,
    value: Option<T>,
}

impl<T: Poolable> Deref for PoolGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().unwrap_or_else(|| unreachable!("guard emptied only on drop"))
    }
}

impl<T: Poolable> DerefMut for PoolGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().unwrap_or_else(|| unreachable!("guard emptied only on drop"))
    }
}

impl<T: Poolable> Drop for PoolGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.give_back(value);
        }
    }
}

/// Scratch string buffers for prompt and scratchpad assembly.
static SCRATCH_POOL: Lazy<Pool<String>> =
    Lazy::new(|| Pool::new(32, || String::with_capacity(4 * 1024)));

/// The process-wide scratch-buffer pool.
pub fn scratch_pool() -> &'static Pool<String> {
    &SCRATCH_POOL
}

/// Drops idle objects in every process-wide pool. Call at process end;
/// safe to call more than once.
pub fn shutdown_pools() {
    SCRATCH_POOL.clear();
    crate::middleware::clear_record_pools();
    crate::tool::clear_pattern_cache();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_resets_but_keeps_capacity() {
        let pool: Pool<String> = Pool::new(4, || String::with_capacity(64));
        {
            let mut s = pool.checkout();
            s.push_str("hello");
        }
        assert_eq!(pool.idle(), 1);
        let s = pool.checkout();
        assert!(s.is_empty());
        assert!(s.capacity() >= 64);
    }

    #[test]
    fn returns_are_capped_at_capacity() {
        let pool: Pool<String> = Pool::new(1, String::new);
        let a = pool.checkout();
        let b = pool.checkout();
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 1);
        let stats = pool.stats();
        assert_eq!(stats.created, 2);
        assert_eq!(stats.returned, 1);
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn reuse_is_counted() {
        let pool: Pool<String> = Pool::new(4, String::new);
        drop(pool.checkout());
        drop(pool.checkout());
        let stats = pool.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.reused, 1);
    }

    #[test]
    fn clear_empties_the_free_list() {
        let pool: Pool<String> = Pool::new(4, String::new);
        drop(pool.checkout());
        assert_eq!(pool.idle(), 1);
        pool.clear();
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn scratch_pool_hands_out_empty_buffers() {
        let mut buf = scratch_pool().checkout();
        assert!(buf.is_empty());
        buf.push_str("prompt text");
    }
}
