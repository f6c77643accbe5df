//! # Memtable Module
//!
//! The mutable, in-memory write buffer of the storage engine.
//!
//! ## Design Invariants
//!
//! - At most one record per key; a later `add` of the same key replaces
//!   the record, never failing on capacity.
//! - Deletes are tombstone records, not physical removal; a delete of an
//!   absent key inserts a blind tombstone, subject to capacity.
//! - `total_entries` counts distinct keys (live and tombstoned); `size`
//!   counts only live keys.
//! - `is_full` holds exactly when a new distinct key would exceed the
//!   configured capacity; updates to existing keys never flip it.
//! - `retrieve_sorted_records` yields every record — tombstones included —
//!   in ascending key order, deterministically.
//!
//! ## Variants
//!
//! Three interchangeable implementations sit behind the [`MemtableInner`]
//! sum type, selected by [`MemtableKind`]:
//!
//! - [`btree::BTreeMemtable`] — an order-`m` B-tree with median-promoting
//!   splits and automatic rebuilds once tombstones reach 30% of entries;
//! - [`skiplist::SkipListMemtable`] — a probabilistic skip list with 50/50
//!   level promotion;
//! - [`hashmap::HashMapMemtable`] — a hash map that sorts on retrieval.
//!
//! ## Thread safety
//!
//! [`MemTable`] is the thread-safe decorator: reads take a shared lock,
//! mutations and `flush` take the exclusive lock.

pub mod btree;
pub mod hashmap;
pub mod skiplist;

#[cfg(test)]
mod tests;

use std::path::Path;
use std::sync::RwLock;

use thiserror::Error;
use tracing::{debug, trace};

use crate::record::Record;
use crate::sstable::{SstableError, SstableOptions, persist_memtable};

use btree::BTreeMemtable;
use hashmap::HashMapMemtable;
use skiplist::SkipListMemtable;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by memtable operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// Inserting a new distinct key would exceed the configured capacity.
    #[error("memtable capacity exceeded")]
    CapacityExceeded,

    /// Flushing to an SSTable failed.
    #[error("SSTable error: {0}")]
    Sstable(#[from] SstableError),

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Which in-memory container backs a [`MemTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemtableKind {
    /// Order-`m` B-tree with tombstone-ratio auto-rebuild.
    BTree,
    /// Probabilistic skip list.
    SkipList,
    /// Hash map, sorted on retrieval.
    HashMap,
}

/// Construction parameters for a [`MemTable`].
#[derive(Debug, Clone, Copy)]
pub struct MemtableConfig {
    /// Variant selection.
    pub kind: MemtableKind,
    /// Maximum number of distinct keys.
    pub capacity: usize,
    /// B-tree order (ignored by other variants). Must be ≥ 3.
    pub btree_order: usize,
    /// Skip list tower height limit (ignored by other variants).
    pub skiplist_max_height: usize,
}

impl Default for MemtableConfig {
    fn default() -> Self {
        Self {
            kind: MemtableKind::BTree,
            capacity: 1024,
            btree_order: 16,
            skiplist_max_height: 16,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Lookup outcome
// ------------------------------------------------------------------------------------------------

/// Result of a raw key lookup, distinguishing a tombstone hit from
/// absence so the coordinator can short-circuit deleted keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    /// A live record for the key.
    Found(Record),
    /// The key is tombstoned in this memtable.
    Tombstone,
    /// This memtable holds nothing for the key.
    Absent,
}

// ------------------------------------------------------------------------------------------------
// Variant dispatch
// ------------------------------------------------------------------------------------------------

/// The tagged union of memtable variants.
///
/// Dispatch happens here, at the decorator boundary; the variants expose
/// a uniform inherent API (`upsert`, `find`, counters, ordered access).
#[derive(Debug)]
pub enum MemtableInner {
    /// B-tree variant.
    BTree(BTreeMemtable),
    /// Skip-list variant.
    SkipList(SkipListMemtable),
    /// Hash-map variant.
    HashMap(HashMapMemtable),
}

macro_rules! dispatch {
    ($self:expr, $inner:ident => $body:expr) => {
        match $self {
            MemtableInner::BTree($inner) => $body,
            MemtableInner::SkipList($inner) => $body,
            MemtableInner::HashMap($inner) => $body,
        }
    };
}

impl MemtableInner {
    fn new(config: &MemtableConfig) -> Self {
        match config.kind {
            MemtableKind::BTree => Self::BTree(BTreeMemtable::new(config.btree_order)),
            MemtableKind::SkipList => {
                Self::SkipList(SkipListMemtable::new(config.skiplist_max_height))
            }
            MemtableKind::HashMap => Self::HashMap(HashMapMemtable::new()),
        }
    }

    fn upsert(&mut self, record: Record) -> Option<Record> {
        dispatch!(self, inner => inner.upsert(record))
    }

    fn find(&self, key: &str) -> Option<&Record> {
        dispatch!(self, inner => inner.find(key))
    }

    fn total_entries(&self) -> usize {
        dispatch!(self, inner => inner.total_entries())
    }

    fn tombstoned(&self) -> usize {
        dispatch!(self, inner => inner.tombstoned())
    }

    fn sorted_records(&self) -> Vec<Record> {
        dispatch!(self, inner => inner.sorted_records())
    }

    fn next_after(&self, current: Option<&str>) -> Option<Record> {
        dispatch!(self, inner => inner.next_after(current))
    }

    fn clear(&mut self) {
        dispatch!(self, inner => inner.clear())
    }
}

// ------------------------------------------------------------------------------------------------
// MemTable — thread-safe decorator
// ------------------------------------------------------------------------------------------------

/// Capacity-bounded, ordered, thread-safe in-memory record buffer.
///
/// All read operations take the shared lock; all mutating operations and
/// `flush` take the exclusive lock.
#[derive(Debug)]
pub struct MemTable {
    inner: RwLock<MemtableInner>,
    capacity: usize,
}

impl MemTable {
    /// Creates an empty memtable per the configuration.
    pub fn new(config: &MemtableConfig) -> Self {
        Self {
            inner: RwLock::new(MemtableInner::new(config)),
            capacity: config.capacity,
        }
    }

    /// Inserts or updates a record.
    ///
    /// Updates of existing keys always succeed; a new distinct key fails
    /// with [`MemtableError::CapacityExceeded`] once `total_entries()`
    /// has reached the capacity.
    pub fn add(&self, record: Record) -> Result<(), MemtableError> {
        let mut inner = self.write()?;
        if inner.find(&record.key).is_none() && inner.total_entries() >= self.capacity {
            return Err(MemtableError::CapacityExceeded);
        }
        trace!(key = %record.key, tombstone = record.tombstone, "memtable add");
        inner.upsert(record);
        Ok(())
    }

    /// Inserts a tombstone for the record's key.
    ///
    /// Returns `true` when the key was present and has been replaced by
    /// the tombstone. An absent key is inserted as a blind tombstone —
    /// unless that new distinct key would exceed capacity, in which case
    /// the delete is a no-op — and `false` is returned either way.
    pub fn delete(&self, mut record: Record) -> Result<bool, MemtableError> {
        record.tombstone = true;
        record.value.clear();

        let mut inner = self.write()?;
        if inner.find(&record.key).is_some() {
            inner.upsert(record);
            return Ok(true);
        }
        if inner.total_entries() < self.capacity {
            trace!(key = %record.key, "memtable blind tombstone");
            inner.upsert(record);
        }
        Ok(false)
    }

    /// Returns the latest record for `key` iff it is not tombstoned.
    pub fn get(&self, key: &str) -> Result<Option<Record>, MemtableError> {
        let inner = self.read()?;
        Ok(inner
            .find(key)
            .filter(|record| !record.tombstone)
            .cloned())
    }

    /// Raw lookup distinguishing tombstones from absence.
    pub fn entry(&self, key: &str) -> Result<LookupOutcome, MemtableError> {
        let inner = self.read()?;
        Ok(match inner.find(key) {
            Some(record) if record.tombstone => LookupOutcome::Tombstone,
            Some(record) => LookupOutcome::Found(record.clone()),
            None => LookupOutcome::Absent,
        })
    }

    /// Number of live (non-tombstoned) keys.
    pub fn size(&self) -> Result<usize, MemtableError> {
        let inner = self.read()?;
        Ok(inner.total_entries() - inner.tombstoned())
    }

    /// Number of distinct keys, tombstoned or not.
    pub fn total_entries(&self) -> Result<usize, MemtableError> {
        Ok(self.read()?.total_entries())
    }

    /// Configured capacity in distinct keys.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether inserting a new distinct key would exceed capacity.
    pub fn is_full(&self) -> Result<bool, MemtableError> {
        Ok(self.read()?.total_entries() >= self.capacity)
    }

    /// Whether adding `key` would exceed capacity (existing keys never
    /// would).
    pub fn would_overflow(&self, key: &str) -> Result<bool, MemtableError> {
        let inner = self.read()?;
        Ok(inner.find(key).is_none() && inner.total_entries() >= self.capacity)
    }

    /// All records — tombstones included — in ascending key order.
    pub fn retrieve_sorted_records(&self) -> Result<Vec<Record>, MemtableError> {
        Ok(self.read()?.sorted_records())
    }

    /// The record with the smallest key strictly greater than `current`
    /// (or the smallest key overall when `current` is `None`), tombstones
    /// included.
    pub fn next_record_after(&self, current: Option<&str>) -> Result<Option<Record>, MemtableError> {
        Ok(self.read()?.next_after(current))
    }

    /// Writes this memtable's sorted records as SSTable `index`, then
    /// clears the memtable. The exclusive lock is held throughout; the
    /// caller guarantees the memtable receives no further writes.
    pub fn flush(
        &self,
        index: u64,
        options: &SstableOptions,
        dir: &Path,
    ) -> Result<(), MemtableError> {
        let mut inner = self.write()?;
        let records = inner.sorted_records();
        debug!(index, records = records.len(), "memtable flush");
        persist_memtable(&records, index, options, dir)?;
        inner.clear();
        Ok(())
    }

    /// Writes this memtable's sorted records as SSTable `index` without
    /// clearing. The flush pool uses this so the memtable stays readable
    /// until the new table is committed to level 0.
    pub fn persist(
        &self,
        index: u64,
        options: &SstableOptions,
        dir: &Path,
    ) -> Result<(), MemtableError> {
        let records = self.read()?.sorted_records();
        debug!(index, records = records.len(), "memtable persist");
        persist_memtable(&records, index, options, dir)?;
        Ok(())
    }

    /// Discards every record.
    pub fn clear(&self) -> Result<(), MemtableError> {
        self.write()?.clear();
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MemtableInner>, MemtableError> {
        self.inner
            .read()
            .map_err(|_| MemtableError::Internal("memtable lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemtableInner>, MemtableError> {
        self.inner
            .write()
            .map_err(|_| MemtableError::Internal("memtable lock poisoned".into()))
    }
}
