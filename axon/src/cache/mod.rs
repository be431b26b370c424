//! Invocation cache: fingerprint → cached output with single-compute
//! coalescing.
//!
//! On a hit within TTL the loop short-circuits entirely. On a miss, a
//! per-fingerprint sentinel coalesces concurrent identical requests so at
//! most one compute runs at a time; the winner stores and everyone
//! observes the stored value. Eviction is LRU bounded by `max_size`.
//!
//! # Main types
//!
//! - [`InvocationCache`]: `get` / `insert` /
//!   [`get_or_compute`](InvocationCache::get_or_compute).
//! - [`CacheStats`]: hits, misses, evictions, average hit/miss times.
//! - [`fingerprint`]: the key derivation (see `fingerprint` module).
//!
//! The cache is opt-in; an agent without one computes every invocation.

mod fingerprint;

pub use fingerprint::fingerprint;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::error::AgentError;

struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    ttl: Option<Duration>,
    hit_count: u64,
    last_access: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.ttl.is_some_and(|ttl| self.created_at + ttl <= now)
    }
}

/// Aggregate cache behavior since construction.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub avg_hit_time: Duration,
    pub avg_miss_time: Duration,
}

/// Fingerprint-keyed cache with TTL, LRU bound, and compute coalescing.
///
/// `V` is cloned out on every hit; keep it cheap (the agent caches an
/// `Arc`'d output).
pub struct InvocationCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    entries: DashMap<String, CacheEntry<V>>,
    inflight: DashMap<String, Arc<OnceCell<V>>>,
    max_size: usize,
    default_ttl: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    hit_nanos: AtomicU64,
    miss_nanos: AtomicU64,
}

impl<V> InvocationCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(max_size: usize, default_ttl: Option<Duration>) -> Self {
        Self {
            entries: DashMap::new(),
            inflight: DashMap::new(),
            max_size: max_size.max(1),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            hit_nanos: AtomicU64::new(0),
            miss_nanos: AtomicU64::new(0),
        }
    }

    /// Looks up a live entry, bumping hit statistics and recency.
    pub fn get(&self, fingerprint: &str) -> Option<V> {
        let started = Instant::now();
        let now = Instant::now();
        let found = match self.entries.get_mut(fingerprint) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.hit_count += 1;
                entry.last_access = now;
                Some(entry.value.clone())
            }
            Some(entry) => {
                drop(entry);
                self.entries.remove(fingerprint);
                None
            }
            None => None,
        };
        match &found {
            Some(_) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.hit_nanos
                    .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
            }
        }
        found
    }

    /// Stores a value under the default TTL, evicting the least recently
    /// used entry when over capacity.
    pub fn insert(&self, fingerprint: impl Into<String>, value: V) {
        self.insert_with_ttl(fingerprint, value, self.default_ttl)
    }

    pub fn insert_with_ttl(
        &self,
        fingerprint: impl Into<String>,
        value: V,
        ttl: Option<Duration>,
    ) {
        let now = Instant::now();
        self.entries.insert(
            fingerprint.into(),
            CacheEntry {
                value,
                created_at: now,
                ttl,
                hit_count: 0,
                last_access: now,
            },
        );
        while self.entries.len() > self.max_size {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.value().last_access)
                .map(|e| e.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
    }

    /// Hit → cached value. Miss → at most one concurrent `compute` per
    /// fingerprint; losers wait for the winner's value.
    ///
    /// A failed compute releases the sentinel so the next caller may try
    /// again; waiting callers serialize, never overlap.
    pub async fn get_or_compute<F, Fut>(
        &self,
        fingerprint: &str,
        compute: F,
    ) -> Result<V, AgentError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<V, AgentError>>,
    {
        if let Some(value) = self.get(fingerprint) {
            return Ok(value);
        }
        self.coalesce_compute(fingerprint, compute).await
    }

    /// The miss path of [`get_or_compute`](Self::get_or_compute), for
    /// callers that already observed the miss via [`get`](Self::get).
    pub async fn coalesce_compute<F, Fut>(
        &self,
        fingerprint: &str,
        compute: F,
    ) -> Result<V, AgentError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<V, AgentError>>,
    {
        let cell = self
            .inflight
            .entry(fingerprint.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let result = cell
            .get_or_try_init(|| async {
                let started = Instant::now();
                let value = compute().await?;
                self.miss_nanos
                    .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
                self.insert(fingerprint, value.clone());
                Ok::<V, AgentError>(value)
            })
            .await
            .cloned();

        // Winner or waiter, drop the sentinel once a value exists; later
        // calls will hit the entry map directly.
        if result.is_ok() {
            self.inflight
                .remove_if(fingerprint, |_, existing| Arc::ptr_eq(existing, &cell));
        }
        result
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Per-entry hit count, when the entry is live.
    pub fn hit_count(&self, fingerprint: &str) -> Option<u64> {
        self.entries.get(fingerprint).map(|e| e.hit_count)
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.inflight.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let avg = |total: u64, count: u64| {
            if count == 0 {
                Duration::ZERO
            } else {
                Duration::from_nanos(total / count)
            }
        };
        CacheStats {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            avg_hit_time: avg(self.hit_nanos.load(Ordering::Relaxed), hits),
            avg_miss_time: avg(self.miss_nanos.load(Ordering::Relaxed), misses),
        }
    }
}

impl<V> std::fmt::Debug for InvocationCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationCache")
            .field("len", &self.entries.len())
            .field("max_size", &self.max_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn hit_within_ttl_skips_compute() {
        let cache: InvocationCache<String> =
            InvocationCache::new(16, Some(Duration::from_secs(60)));
        cache.insert("fp", "cached".to_string());
        let computed = Arc::new(AtomicU32::new(0));
        let computed_clone = Arc::clone(&computed);
        let value = cache
            .get_or_compute("fp", || async move {
                computed_clone.fetch_add(1, Ordering::SeqCst);
                Ok("fresh".to_string())
            })
            .await
            .unwrap();
        assert_eq!(value, "cached");
        assert_eq!(computed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_entry_recomputes() {
        let cache: InvocationCache<u32> =
            InvocationCache::new(16, Some(Duration::from_millis(5)));
        cache.insert("fp", 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let value = cache.get_or_compute("fp", || async { Ok(2) }).await.unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn concurrent_identical_requests_compute_once() {
        let cache: Arc<InvocationCache<u32>> = Arc::new(InvocationCache::new(16, None));
        let computes = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let computes = Arc::clone(&computes);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("same", || async move {
                        computes.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(7)
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 7);
        }
        assert_eq!(computes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_compute_releases_the_sentinel() {
        let cache: InvocationCache<u32> = InvocationCache::new(16, None);
        let err = cache
            .get_or_compute("fp", || async { Err(AgentError::Transient("down".into())) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transient);

        let value = cache.get_or_compute("fp", || async { Ok(9) }).await.unwrap();
        assert_eq!(value, 9);
    }

    #[tokio::test]
    async fn lru_eviction_bounds_size() {
        let cache: InvocationCache<u32> = InvocationCache::new(2, None);
        cache.insert("a", 1);
        tokio::time::sleep(Duration::from_millis(2)).await;
        cache.insert("b", 2);
        tokio::time::sleep(Duration::from_millis(2)).await;
        // Touch "a" so "b" is now least recently used.
        assert_eq!(cache.get("a"), Some(1));
        tokio::time::sleep(Duration::from_millis(2)).await;
        cache.insert("c", 3);

        assert_eq!(cache.len(), 2);
        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("c"), Some(3));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn stats_track_hits_and_misses() {
        let cache: InvocationCache<u32> = InvocationCache::new(4, None);
        assert!(cache.get("missing").is_none());
        cache.insert("k", 1);
        assert_eq!(cache.get("k"), Some(1));
        assert_eq!(cache.get("k"), Some(1));

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(cache.hit_count("k"), Some(2));
    }
}
