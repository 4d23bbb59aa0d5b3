//! Deduplication filter using LRU cache.

use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::config::DEFAULT_SEEN_CACHE_CAPACITY;

/// LRU-based deduplication filter.
pub struct SeenFilter<K: Hash + Eq> {
    /// LRU cache of seen keys.
    cache: LruCache<K, ()>,
}

impl<K: Hash + Eq> SeenFilter<K> {
    /// Create a new filter with the specified capacity (at least 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
        }
    }

    /// Check if a key has been seen before, marking it seen.
    ///
    /// Returns true if the key was NOT seen before (i.e., is new).
    /// Returns false if the key WAS seen before (i.e., is duplicate).
    pub fn check(&mut self, key: K) -> bool {
        if self.cache.contains(&key) {
            self.cache.promote(&key);
            false
        } else {
            self.cache.put(key, ());
            true
        }
    }

    /// Check if a key is in the filter without modifying it.
    pub fn contains(&self, key: &K) -> bool {
        self.cache.contains(key)
    }

    /// Mark a key as seen.
    pub fn mark_seen(&mut self, key: K) {
        self.cache.put(key, ());
    }

    /// Get the number of keys in the filter.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Check if the filter is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Clear the filter.
    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

impl<K: Hash + Eq> Default for SeenFilter<K> {
    fn default() -> Self {
        Self::new(DEFAULT_SEEN_CACHE_CAPACITY)
    }
}

impl<K: Hash + Eq> std::fmt::Debug for SeenFilter<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeenFilter")
            .field("len", &self.cache.len())
            .field("cap", &self.cache.cap())
            .finish()
    }
}
