//! In-memory query result cache with per-entry TTL and LRU eviction.
//!
//! Expiry is checked lazily on lookup. When the cache is full, the least
//! recently used quarter is evicted in one sweep before the new entry goes in.

use lru::LruCache;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::db::rows::Row;

/// Cached rows, shared with callers without copying.
pub type CachedRows = Arc<Vec<Row>>;

struct CacheEntry {
    rows: CachedRows,
    inserted_at: Instant,
    ttl: Duration,
    hit_count: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) > self.ttl
    }
}

/// Counters exposed through [`super::QueryOptimizer::cache_stats`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub hit_rate: f64,
    /// Hits recorded against entries still cached.
    pub entry_hits: u64,
}

pub(crate) struct QueryCache {
    // Recency is tracked by the LRU list; eviction is done here in quarter
    // sweeps, so the list never evicts on its own.
    entries: LruCache<String, CacheEntry>,
    capacity: usize,
    generation: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl QueryCache {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            capacity: capacity.get(),
            generation: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
        }
    }

    /// Bumped by every invalidation. Results computed before a bump must not
    /// be cached after it.
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Look up `key`, dropping it if its TTL has elapsed. A hit marks the
    /// entry most recently used.
    pub(crate) fn get(&mut self, key: &str, now: Instant) -> Option<CachedRows> {
        let expired = match self.entries.peek(key) {
            None => {
                self.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            self.entries.pop(key);
            self.expirations += 1;
            self.misses += 1;
            return None;
        }

        let entry = self.entries.get_mut(key)?;
        entry.hit_count += 1;
        self.hits += 1;
        Some(Arc::clone(&entry.rows))
    }

    pub(crate) fn insert(&mut self, key: String, rows: CachedRows, ttl: Duration, now: Instant) {
        if !self.entries.contains(&key) && self.entries.len() >= self.capacity {
            self.evict_least_recent();
        }
        self.entries.put(
            key,
            CacheEntry {
                rows,
                inserted_at: now,
                ttl,
                hit_count: 0,
            },
        );
    }

    /// Insert only if nothing was invalidated since `generation` was read.
    pub(crate) fn insert_if_current(
        &mut self,
        generation: u64,
        key: String,
        rows: CachedRows,
        ttl: Duration,
        now: Instant,
    ) -> bool {
        if generation != self.generation {
            return false;
        }
        self.insert(key, rows, ttl, now);
        true
    }

    /// Remove the least recently used 25% of entries (at least one).
    fn evict_least_recent(&mut self) -> usize {
        let count = (self.entries.len() / 4).max(1);
        let mut evicted = 0;
        while evicted < count && self.entries.pop_lru().is_some() {
            evicted += 1;
        }
        self.evictions += evicted as u64;
        tracing::debug!(evicted, remaining = self.entries.len(), "query cache eviction");
        evicted
    }

    /// Drop entries whose key starts with `prefix`; all entries when `None`.
    pub(crate) fn invalidate(&mut self, prefix: Option<&str>) -> usize {
        self.generation += 1;
        match prefix {
            None => {
                let removed = self.entries.len();
                self.entries.clear();
                removed
            }
            Some(p) => {
                let keys: Vec<String> = self
                    .entries
                    .iter()
                    .filter(|(key, _)| key.starts_with(p))
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in &keys {
                    self.entries.pop(key);
                }
                keys.len()
            }
        }
    }

    /// Drop every expired entry.
    pub(crate) fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.entries.pop(key);
        }
        self.expirations += expired.len() as u64;
        expired.len()
    }

    /// Total hits recorded on the entries currently cached.
    pub(crate) fn live_hits(&self) -> u64 {
        self.entries.iter().map(|(_, entry)| entry.hit_count).sum()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn stats(&self) -> CacheStats {
        let lookups = self.hits + self.misses;
        CacheStats {
            entries: self.len(),
            capacity: self.capacity,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            expirations: self.expirations,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                self.hits as f64 / lookups as f64
            },
            entry_hits: self.live_hits(),
        }
    }
}
