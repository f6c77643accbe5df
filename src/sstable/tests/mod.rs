mod tests_integrity;
mod tests_iteration;

use std::path::Path;

use tempfile::TempDir;

use crate::record::Record;
use crate::sstable::{SstableOptions, persist_memtable};

pub(super) const BLOCK: usize = 256;

pub(super) fn options() -> SstableOptions {
    SstableOptions {
        use_separate_files: true,
        compression_enabled: false,
        sparse_step: 10,
        block_size: BLOCK,
        bloom_fp_rate: 0.01,
    }
}

pub(super) fn single_file_options() -> SstableOptions {
    SstableOptions {
        use_separate_files: false,
        ..options()
    }
}

/// `key_000..key_{n}` with matching `value_{i}` payloads.
pub(super) fn numbered_records(n: usize) -> Vec<Record> {
    (0..n)
        .map(|i| Record::with_timestamp(format!("key_{i:03}"), format!("value_{i:03}").into_bytes(), 1_000 + i as u64, false))
        .collect()
}

pub(super) fn persist(records: &[Record], index: u64, opts: &SstableOptions, dir: &Path) {
    persist_memtable(records, index, opts, dir).expect("persist");
}

pub(super) fn scratch() -> TempDir {
    TempDir::new().expect("tempdir")
}
