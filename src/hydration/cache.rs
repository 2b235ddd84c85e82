//! # Hydration Cache
//!
//! Bounded in-memory store of resolved references with LRU eviction and
//! lazy TTL expiry. Failed references are stored as negative entries with a
//! short TTL so a persistently failing key is not fetched on every event.
//!
//! The LRU list sits behind a `parking_lot::Mutex`; every critical section is
//! a handful of pointer updates and never awaits.

use crate::models::{Payload, ReferenceKey};
use lru::LruCache;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    Resolved(Payload),
    /// Retries were exhausted; holds the last error
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: CachedValue,
    pub fetched_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.fetched_at) >= self.ttl
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub size: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct HydrationCache {
    capacity: usize,
    entries: Mutex<LruCache<ReferenceKey, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl HydrationCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            // Capacity is enforced by evict_if_over_capacity so evictions are counted
            entries: Mutex::new(LruCache::unbounded()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Look up a key, refreshing its recency. Expired entries are removed
    /// and reported as absent.
    pub fn get(&self, key: &ReferenceKey) -> Option<CacheEntry> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.peek(key).map(|entry| entry.is_expired(now)) {
            None => {
                drop(entries);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(true) => {
                entries.pop(key);
                drop(entries);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Cache entry expired");
                None
            }
            Some(false) => {
                let entry = entries.get(key).cloned();
                drop(entries);
                self.hits.fetch_add(1, Ordering::Relaxed);
                entry
            }
        }
    }

    /// Fresh entry for `key` without touching recency or hit statistics
    pub fn peek(&self, key: &ReferenceKey) -> Option<CacheEntry> {
        let now = Instant::now();
        self.entries
            .lock()
            .peek(key)
            .filter(|entry| !entry.is_expired(now))
            .cloned()
    }

    pub fn put(&self, key: ReferenceKey, value: CachedValue, ttl: Duration) {
        let entry = CacheEntry {
            value,
            fetched_at: Instant::now(),
            ttl,
        };
        let mut entries = self.entries.lock();
        entries.put(key, entry);
        let evicted = Self::evict_locked(&mut entries, self.capacity);
        drop(entries);
        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        }
    }

    pub fn put_resolved(&self, key: ReferenceKey, payload: Payload, ttl: Duration) {
        self.put(key, CachedValue::Resolved(payload), ttl);
    }

    pub fn put_failed(&self, key: ReferenceKey, error: impl Into<String>, ttl: Duration) {
        self.put(key, CachedValue::Failed(error.into()), ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Evict least-recently-used entries until the cache is within capacity.
    /// Returns how many entries were evicted.
    pub fn evict_if_over_capacity(&self) -> usize {
        let evicted = Self::evict_locked(&mut self.entries.lock(), self.capacity);
        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        }
        evicted
    }

    fn evict_locked(entries: &mut LruCache<ReferenceKey, CacheEntry>, capacity: usize) -> usize {
        let mut evicted = 0;
        while entries.len() > capacity {
            if entries.pop_lru().is_none() {
                break;
            }
            evicted += 1;
        }
        evicted
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            size: self.len(),
            capacity: self.capacity,
        }
    }

    pub fn hit_rate(&self) -> f64 {
        self.stats().hit_rate()
    }
}

impl std::fmt::Debug for HydrationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HydrationCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
