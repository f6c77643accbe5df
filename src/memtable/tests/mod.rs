mod tests_concurrency;

use super::{MemTable, MemtableConfig, MemtableKind};

pub(super) fn config_of(kind: MemtableKind, capacity: usize) -> MemtableConfig {
    MemtableConfig {
        kind,
        capacity,
        btree_order: 4,
        skiplist_max_height: 8,
    }
}

pub(super) fn all_kinds() -> [MemtableKind; 3] {
    [
        MemtableKind::BTree,
        MemtableKind::SkipList,
        MemtableKind::HashMap,
    ]
}

pub(super) fn table_of(kind: MemtableKind, capacity: usize) -> MemTable {
    MemTable::new(&config_of(kind, capacity))
}
