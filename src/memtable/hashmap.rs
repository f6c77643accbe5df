//! Hash-map memtable variant.
//!
//! `add`/`delete`/`get` are O(1); key order is imposed lazily —
//! `sorted_records` collects and sorts on demand, cloning each record so
//! callers can never mutate buffered state.

use std::collections::HashMap;

use crate::record::Record;

/// Unordered memtable backed by a hash map, sorted on retrieval.
#[derive(Debug, Default)]
pub struct HashMapMemtable {
    entries: HashMap<String, Record>,
    tombstoned: usize,
}

impl HashMapMemtable {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces `record`, returning the previous record for
    /// the key if one existed.
    pub fn upsert(&mut self, record: Record) -> Option<Record> {
        let tombstone = record.tombstone;
        let previous = self.entries.insert(record.key.clone(), record);
        match &previous {
            Some(old) => {
                if old.tombstone && !tombstone {
                    self.tombstoned -= 1;
                } else if !old.tombstone && tombstone {
                    self.tombstoned += 1;
                }
            }
            None => {
                if tombstone {
                    self.tombstoned += 1;
                }
            }
        }
        previous
    }

    /// Looks up the record for `key`.
    pub fn find(&self, key: &str) -> Option<&Record> {
        self.entries.get(key)
    }

    /// Distinct key count.
    pub fn total_entries(&self) -> usize {
        self.entries.len()
    }

    /// Tombstoned key count.
    pub fn tombstoned(&self) -> usize {
        self.tombstoned
    }

    /// Every record in ascending key order (O(n log n)).
    pub fn sorted_records(&self) -> Vec<Record> {
        let mut records: Vec<Record> = self.entries.values().cloned().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    /// Smallest-keyed record strictly greater than `current`.
    pub fn next_after(&self, current: Option<&str>) -> Option<Record> {
        self.entries
            .values()
            .filter(|record| match current {
                Some(key) => record.key.as_str() > key,
                None => true,
            })
            .min_by(|a, b| a.key.cmp(&b.key))
            .cloned()
    }

    /// Discards every record.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.tombstoned = 0;
    }
}
