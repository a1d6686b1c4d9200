//! Process-wide fingerprint to series identity cache.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;

use crate::{labels::Fingerprint, labels::LabelSet, model::SeriesId};

const MAX_SHARDS: usize = 16;

type Shard = Mutex<LruCache<Fingerprint, CachedSeries>>;

/// A cached identity together with the label set it was resolved for, so
/// fingerprint collisions can be told apart from hits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedSeries {
    pub id: SeriesId,
    pub labels: LabelSet,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub len: usize,
    pub capacity: usize,
}

/// Bounded LRU cache split into independently locked shards.
///
/// The bound is global: shards grow freely and an insert that takes the
/// total past `capacity` evicts one least recently used entry, from its own
/// shard when that holds anything older, otherwise from the next non-empty
/// one. Recency is therefore exact within a shard and approximate across
/// shards.
///
/// A capacity of zero disables caching: every lookup misses and inserts are
/// ignored, which is always safe because the catalog is authoritative.
#[derive(Debug)]
pub struct SeriesCache {
    shards: Vec<Shard>,
    capacity: usize,
    len: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl SeriesCache {
    pub fn new(capacity: usize) -> Self {
        let shards = (0..capacity.min(MAX_SHARDS))
            .map(|_| Mutex::new(LruCache::unbounded()))
            .collect();
        Self {
            shards,
            capacity,
            len: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.shards.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn shard_index(&self, fp: &Fingerprint) -> Option<usize> {
        if self.shards.is_empty() {
            return None;
        }
        let mut head = [0u8; 8];
        head.copy_from_slice(&fp.as_bytes()[..8]);
        Some((u64::from_le_bytes(head) % self.shards.len() as u64) as usize)
    }

    /// Returns the cached entry for `fp` and marks it most recently used.
    pub fn lookup(&self, fp: &Fingerprint) -> Option<CachedSeries> {
        let found = self
            .shard_index(fp)
            .and_then(|i| self.shards[i].lock().get(fp).cloned());
        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Caches `entry` under `fp`.
    ///
    /// An existing entry for a different label set is left untouched and
    /// returned as the error: that is a fingerprint collision.
    pub fn insert(&self, fp: Fingerprint, entry: CachedSeries) -> Result<(), CachedSeries> {
        let Some(index) = self.shard_index(&fp) else {
            return Ok(());
        };
        {
            let mut shard = self.shards[index].lock();
            if let Some(existing) = shard.get(&fp) {
                if existing.labels != entry.labels {
                    return Err(existing.clone());
                }
            }
            if shard.put(fp, entry).is_some() {
                return Ok(());
            }
        }
        if self.len.fetch_add(1, Ordering::AcqRel) >= self.capacity {
            self.evict_one(index);
        }
        Ok(())
    }

    // Only one shard lock is held at a time.
    fn evict_one(&self, home: usize) {
        {
            let mut shard = self.shards[home].lock();
            if shard.len() > 1 && shard.pop_lru().is_some() {
                self.evicted();
                return;
            }
        }
        let count = self.shards.len();
        for offset in 0..count {
            let index = (home + 1 + offset) % count;
            if self.shards[index].lock().pop_lru().is_some() {
                self.evicted();
                return;
            }
        }
    }

    fn evicted(&self) {
        self.len.fetch_sub(1, Ordering::AcqRel);
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            len: self.len(),
            capacity: self.capacity,
        }
    }
}
