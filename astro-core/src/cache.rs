//! In-memory keyed cache shared by every pipeline.
//!
//! Values are swapped in whole under a shard lock, so a reader either sees the
//! previous value or the new one. Nothing here performs I/O, and there is no
//! eviction: entries live as long as the cache does.

use dashmap::DashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::photo::PhotoId;

/// Cache of fetched image bytes keyed by photo id.
pub type ImageCache = KeyedCache<PhotoId, Bytes>;

/// Thread-safe key/value store. Cloning yields another handle to the same
/// storage.
pub struct KeyedCache<K, V> {
    entries: Arc<DashMap<K, V>>,
    counters: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
}

impl<K, V> KeyedCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Insert or overwrite the value stored for `key`.
    pub fn put(&self, key: K, value: V) {
        self.entries.insert(key, value);
        self.counters.inserts.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value for `key`, if any.
    pub fn get(&self, key: &K) -> Option<V> {
        let value = self.entries.get(key).map(|entry| entry.value().clone());
        let counter = if value.is_some() {
            &self.counters.hits
        } else {
            &self.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        value
    }

    /// Presence check that does not count as a hit or miss.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            inserts: self.counters.inserts.load(Ordering::Relaxed),
        }
    }
}

impl<K, V> Default for KeyedCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Clone for KeyedCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<K, V> fmt::Debug for KeyedCache<K, V>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedCache")
            .field("entries", &self.entries.len())
            .field("hits", &self.counters.hits.load(Ordering::Relaxed))
            .field("misses", &self.counters.misses.load(Ordering::Relaxed))
            .finish()
    }
}
