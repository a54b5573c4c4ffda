//! Entry-count bounded LRU map with first-writer-wins inserts

use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Shared cache that never overwrites a live entry
///
/// Entries leave only through LRU eviction; there is no time-based expiry.
pub struct BoundedCache<K: Hash + Eq, V: Clone> {
    entries: Mutex<LruCache<K, V>>,
    stats: CacheStats,
}

impl<K: Hash + Eq, V: Clone> BoundedCache<K, V> {
    /// Create a cache holding at most `capacity` entries (minimum one)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            stats: CacheStats::default(),
        }
    }

    /// Look up an entry, refreshing its recency
    pub fn get(&self, key: &K) -> Option<V> {
        let found = self.entries.lock().get(key).cloned();
        match found {
            Some(_) => self.stats.record_hit(),
            None => self.stats.record_miss(),
        }
        found
    }

    /// Insert unless the key is already present. Returns whether it was stored.
    pub fn put_if_absent(&self, key: K, value: V) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains(&key) {
            return false;
        }
        entries.put(key, value);
        self.stats.record_insert();
        true
    }

    /// Insert unless present and return whichever value the cache now holds
    pub fn get_or_insert(&self, key: K, value: V) -> V {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&key) {
            return existing.clone();
        }
        entries.put(key, value.clone());
        self.stats.record_insert();
        value
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.clone()
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicUsize,
    misses: AtomicUsize,
    inserts: AtomicUsize,
}

impl Clone for CacheStats {
    fn clone(&self) -> Self {
        Self {
            hits: AtomicUsize::new(self.hits()),
            misses: AtomicUsize::new(self.misses()),
            inserts: AtomicUsize::new(self.inserts()),
        }
    }
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn inserts(&self) -> usize {
        self.inserts.load(Ordering::Relaxed)
    }

    /// Get cache hit rate (0.0-1.0)
    #[must_use]
    pub fn hit_rate(&self) -> f32 {
        let total = self.hits() + self.misses();
        if total == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            {
                self.hits() as f32 / total as f32
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_writer_wins() {
        let cache = BoundedCache::new(4);
        assert!(cache.put_if_absent("k", 1));
        assert!(!cache.put_if_absent("k", 2));
        assert_eq!(cache.get_or_insert("k", 3), 1);
        assert_eq!(cache.get(&"k"), Some(1));
        assert_eq!(cache.stats().inserts(), 1);
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = BoundedCache::new(2);
        cache.put_if_absent(1, "a");
        cache.put_if_absent(2, "b");
        assert_eq!(cache.get(&1), Some("a"));
        cache.put_if_absent(3, "c");

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some("a"));
        assert_eq!(cache.get(&3), Some("c"));
    }

    #[test]
    fn zero_capacity_still_holds_one_entry() {
        let cache = BoundedCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.put_if_absent("x", ());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn hit_rate_counts_lookups() {
        let cache = BoundedCache::new(2);
        cache.put_if_absent(1, 1);
        let _ = cache.get(&1);
        let _ = cache.get(&2);
        let stats = cache.stats();
        assert_eq!(stats.hits(), 1);
        assert_eq!(stats.misses(), 1);
        assert!((stats.hit_rate() - 0.5).abs() < f32::EPSILON);
    }
}
