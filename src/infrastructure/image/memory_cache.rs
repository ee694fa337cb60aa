//! In-memory, cost-bounded LRU image cache.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::domain::entities::CacheKey;

/// Default total decoded-byte budget (64 MiB).
pub const DEFAULT_COST_LIMIT: usize = 64 * 1024 * 1024;

struct MemoryEntry {
    image: Arc<image::DynamicImage>,
    cost: usize,
}

struct Inner {
    entries: LruCache<CacheKey, MemoryEntry>,
    total_cost: usize,
}

impl Inner {
    fn detach(&mut self, key: &CacheKey) -> bool {
        if let Some(entry) = self.entries.pop(key) {
            self.total_cost -= entry.cost;
            true
        } else {
            false
        }
    }
}

/// In-memory LRU cache for decoded images, bounded by total cost.
///
/// Cost is the decoded byte size of an image. A limit of zero disables
/// eviction. All operations are serialized under one lock and never touch
/// the disk.
pub struct MemoryImageCache {
    inner: Mutex<Inner>,
    cost_limit: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryImageCache {
    /// Creates a cache that holds at most `cost_limit` decoded bytes.
    #[must_use]
    pub fn new(cost_limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                total_cost: 0,
            }),
            cost_limit,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the configured cost limit.
    #[must_use]
    pub const fn cost_limit(&self) -> usize {
        self.cost_limit
    }

    /// Looks up an image and marks it most recently used.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<image::DynamicImage>> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Memory cache hit");
            Some(entry.image.clone())
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Memory cache miss");
            None
        }
    }

    /// Looks up an image without promoting it in the LRU.
    pub fn peek(&self, key: &CacheKey) -> Option<Arc<image::DynamicImage>> {
        let inner = self.inner.lock();
        inner.entries.peek(key).map(|entry| entry.image.clone())
    }

    /// Inserts or replaces an image, then evicts least recently used
    /// entries until the total cost fits the limit.
    ///
    /// Returns false if the image alone exceeds the limit and was not
    /// admitted.
    pub fn put(&self, key: CacheKey, image: Arc<image::DynamicImage>, cost: usize) -> bool {
        let mut inner = self.inner.lock();
        inner.detach(&key);

        if self.cost_limit > 0 && cost > self.cost_limit {
            debug!(key = %key, cost, limit = self.cost_limit, "Image exceeds memory budget, not cached");
            return false;
        }

        debug!(key = %key, cost, "Storing image in memory cache");
        inner.entries.push(key, MemoryEntry { image, cost });
        inner.total_cost += cost;

        if self.cost_limit > 0 {
            while inner.total_cost > self.cost_limit {
                let Some((evicted, entry)) = inner.entries.pop_lru() else {
                    break;
                };
                inner.total_cost -= entry.cost;
                debug!(key = %evicted, cost = entry.cost, "Evicted image from memory cache");
            }
        }
        true
    }

    /// Removes one entry.
    pub fn remove(&self, key: &CacheKey) -> bool {
        let removed = self.inner.lock().detach(key);
        if removed {
            debug!(key = %key, "Removed image from memory cache");
        }
        removed
    }

    /// Removes every variant cached for `url`. Returns how many were removed.
    pub fn remove_all_for_url(&self, url: &str) -> usize {
        let mut inner = self.inner.lock();
        let keys: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(key, _)| key.url() == url)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            inner.detach(key);
        }
        if !keys.is_empty() {
            debug!(url, count = keys.len(), "Removed all variants from memory cache");
        }
        keys.len()
    }

    /// Removes every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.total_cost = 0;
        debug!("Cleared memory image cache");
    }

    /// Number of cached images.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns true if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of the costs of all cached images.
    #[must_use]
    pub fn total_cost(&self) -> usize {
        self.inner.lock().total_cost
    }

    /// Returns true if `key` is cached, without promoting it.
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.lock().entries.contains(key)
    }

    /// Returns cache statistics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        let inner = self.inner.lock();
        CacheStats {
            hits,
            misses,
            hit_rate,
            size: inner.entries.len(),
            total_cost: inner.total_cost,
        }
    }
}

impl Default for MemoryImageCache {
    fn default() -> Self {
        Self::new(DEFAULT_COST_LIMIT)
    }
}

impl std::fmt::Debug for MemoryImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryImageCache")
            .field("cost_limit", &self.cost_limit)
            .finish_non_exhaustive()
    }
}

/// Statistics about cache performance.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Hit rate as a percentage.
    pub hit_rate: f64,
    /// Current number of cached images.
    pub size: usize,
    /// Decoded bytes currently held.
    pub total_cost: usize,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cache: {} images ({} bytes), {:.1}% hit rate ({} hits, {} misses)",
            self.size, self.total_cost, self.hit_rate, self.hits, self.misses
        )
    }
}
