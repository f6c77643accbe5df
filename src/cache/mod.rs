//! Read-path record cache.
//!
//! A key→record LRU consulted between the memtables and the SSTable
//! levels: a lookup that misses every memtable probes the cache before
//! touching disk, and an SSTable hit populates it. Writes and deletes
//! invalidate the key so the cache never shadows newer data.
//!
//! Cached records may be tombstones — a cached tombstone answers the
//! lookup with "deleted" without a disk probe.


use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use crate::record::Record;

/// Thread-safe LRU of the most recently read records.
#[derive(Debug)]
pub struct RecordCache {
    inner: Mutex<LruCache<String, Record>>,
}

impl RecordCache {
    /// Creates a cache holding at most `capacity` records (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("non-zero after max(1)");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Looks up `key`, promoting it to most-recently-used on a hit.
    pub fn get(&self, key: &str) -> Option<Record> {
        match self.inner.lock() {
            Ok(mut cache) => cache.get(key).cloned(),
            Err(_) => None,
        }
    }

    /// Inserts or refreshes the record for its key.
    pub fn insert(&self, record: Record) {
        if let Ok(mut cache) = self.inner.lock() {
            cache.put(record.key.clone(), record);
        }
    }

    /// Drops any cached record for `key`.
    pub fn invalidate(&self, key: &str) {
        if let Ok(mut cache) = self.inner.lock() {
            cache.pop(key);
        }
    }

    /// Number of cached records.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|cache| cache.len()).unwrap_or(0)
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
