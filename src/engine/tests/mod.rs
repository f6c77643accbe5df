mod tests_flush;
mod tests_scan;

use std::path::Path;

use tracing_subscriber::EnvFilter;

use crate::engine::{Engine, EngineConfig};
use crate::memtable::MemtableKind;

/// Initialize tracing controlled by `RUST_LOG`. Safe to call repeatedly.
pub(super) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small blocks, roomy memtable — no flush unless forced.
pub(super) fn memtable_only_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        block_size: 256,
        memtable_capacity: 4096,
        max_memtables: 64,
        ..EngineConfig::default()
    }
}

/// Tiny memtables so rotation and pool flushing kick in quickly.
pub(super) fn small_memtable_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        block_size: 256,
        memtable_capacity: 4,
        max_memtables: 4,
        max_tables_per_level: 64,
        flush_worker_count: 3,
        ..EngineConfig::default()
    }
}

pub(super) fn open(path: &Path, config: EngineConfig) -> Engine {
    Engine::open(path, config).expect("open engine")
}

pub(super) fn all_kinds() -> [MemtableKind; 3] {
    [
        MemtableKind::BTree,
        MemtableKind::SkipList,
        MemtableKind::HashMap,
    ]
}
