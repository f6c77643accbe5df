//! Sorted String Table (SSTable) module.
//!
//! An SSTable is an **immutable**, ordered, on-disk table of records laid
//! out in five components, each an integral number of CRC-protected
//! blocks (see [`crate::block`]):
//!
//! | Component | Contents |
//! |-----------|----------|
//! | Config    | 1 block: file-mode flag, compression flag, sparse step; in single-file mode also the ⟨content length, offset⟩ pair of every component |
//! | Data      | `[len u64][record blob]` tuples in ascending key order |
//! | Index     | last-entry pointer, 24-byte entries `⟨data_offset, key_len, key_offset⟩`, packed key bytes |
//! | Summary   | every `sparse_step`-th index entry plus the last one, same layout as Index |
//! | Filter    | serialized bloom filter over every key |
//! | Metadata  | serialized Merkle tree over the record blobs |
//!
//! Every non-Config component's logical stream opens with an 8-byte
//! content length. **All offsets stored on disk are physical** — they
//! count the interleaved CRC bytes — and are component-relative;
//! conversion always goes through [`crate::block::CrcCodec`].
//!
//! # File modes
//!
//! - *Separate files*: `sstable_{i}.db` holds the Config block and each
//!   component lives in `sstable_{i}_{data,index,summary,filter,metadata}.db`.
//! - *Single file*: everything lives in `sstable_{i}.db`, components
//!   block-aligned in the order Data, Index, Summary, Filter, Metadata,
//!   located via the pairs in the Config block.
//!
//! # Read path
//!
//! [`SsTable::get`] is staged to minimize disk access: bloom filter →
//! summary bounds → binary search over the summary → binary search over
//! the bounded index window → exactly one data read.
//!
//! # Concurrency
//!
//! SSTables never change after [`persist_memtable`] returns, so readers
//! share them without locks.

pub mod integrity;
pub mod writer;

#[cfg(test)]
mod tests;

pub use integrity::{CorruptBlock, IntegrityReport, check_integrity};
pub use writer::persist_memtable;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bloomfilter::Bloom;
use memmap2::Mmap;
use thiserror::Error;
use tracing::{trace, warn};

use crate::block::{BlockError, BlockManager, CrcCodec};
use crate::encoding::EncodingError;
use crate::record::Record;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Width of a component's logical content-length prefix.
pub(crate) const LEN_PREFIX: u64 = 8;

/// Width of one index/summary metadata entry.
pub(crate) const INDEX_ENTRY_SIZE: u64 = 24;

/// Logical offset of the first index/summary entry: the content-length
/// prefix plus the last-entry header.
pub(crate) const ENTRIES_START: u64 = LEN_PREFIX + 8;

/// Smallest accepted block size; the Config payload must fit one block.
pub(crate) const MIN_BLOCK_SIZE: usize = 128;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by SSTable operations.
#[derive(Debug, Error)]
pub enum SstableError {
    /// Block-level failure: I/O, CRC mismatch, or short read.
    #[error(transparent)]
    Block(#[from] BlockError),

    /// A component's bytes did not decode.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Malformed arguments (unsorted input, bad options, bad index).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Structural corruption that is not a plain CRC mismatch.
    #[error("corrupt SSTable {path}: {detail}")]
    Corrupt {
        /// The offending file.
        path: PathBuf,
        /// What went wrong.
        detail: String,
    },

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Options
// ------------------------------------------------------------------------------------------------

/// Settings an SSTable is written with.
///
/// The first three are persisted in the table's Config block and
/// recovered by [`SsTable::open`]; readers never rely on ambient state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SstableOptions {
    /// One file per component vs. a single file.
    pub use_separate_files: bool,
    /// Whether record blobs use the compacted (varint) form.
    pub compression_enabled: bool,
    /// Every `sparse_step`-th index entry is promoted to the summary.
    pub sparse_step: u64,
    /// On-disk block size; every component is padded to a multiple.
    pub block_size: usize,
    /// Bloom filter false-positive rate.
    pub bloom_fp_rate: f64,
}

impl Default for SstableOptions {
    fn default() -> Self {
        Self {
            use_separate_files: true,
            compression_enabled: false,
            sparse_step: 10,
            block_size: crate::block::DEFAULT_BLOCK_SIZE,
            bloom_fp_rate: 0.01,
        }
    }
}

impl SstableOptions {
    /// Validates the option set.
    pub fn validate(&self) -> Result<(), SstableError> {
        if self.sparse_step == 0 {
            return Err(SstableError::InvalidArgument(
                "sparse_step must be at least 1".into(),
            ));
        }
        if self.block_size < MIN_BLOCK_SIZE {
            return Err(SstableError::InvalidArgument(format!(
                "block_size {} below minimum {MIN_BLOCK_SIZE}",
                self.block_size
            )));
        }
        if !(self.bloom_fp_rate > 0.0 && self.bloom_fp_rate < 1.0) {
            return Err(SstableError::InvalidArgument(format!(
                "bloom_fp_rate {} outside (0, 1)",
                self.bloom_fp_rate
            )));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Components and paths
// ------------------------------------------------------------------------------------------------

/// The five logical sections of an SSTable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    /// Record payloads.
    Data,
    /// Dense key directory.
    Index,
    /// Sparse key directory.
    Summary,
    /// Bloom filter.
    Filter,
    /// Merkle tree.
    Metadata,
}

impl Component {
    /// All components in on-disk order.
    pub const ALL: [Component; 5] = [
        Component::Data,
        Component::Index,
        Component::Summary,
        Component::Filter,
        Component::Metadata,
    ];

    fn suffix(self) -> &'static str {
        match self {
            Component::Data => "data",
            Component::Index => "index",
            Component::Summary => "summary",
            Component::Filter => "filter",
            Component::Metadata => "metadata",
        }
    }

    fn slot(self) -> usize {
        match self {
            Component::Data => 0,
            Component::Index => 1,
            Component::Summary => 2,
            Component::Filter => 3,
            Component::Metadata => 4,
        }
    }
}

/// Path of the table's main file (`sstable_{i}.db`).
pub fn table_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("sstable_{index}.db"))
}

/// Path of one component's file in separate-files mode.
pub fn component_file_path(dir: &Path, index: u64, component: Component) -> PathBuf {
    dir.join(format!("sstable_{index}_{}.db", component.suffix()))
}

/// Every file a table with the given index may own (config file first).
pub fn all_table_paths(dir: &Path, index: u64) -> Vec<PathBuf> {
    let mut paths = vec![table_path(dir, index)];
    paths.extend(Component::ALL.map(|c| component_file_path(dir, index, c)));
    paths
}

// ------------------------------------------------------------------------------------------------
// Index entries
// ------------------------------------------------------------------------------------------------

/// One 24-byte index or summary metadata entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IndexEntry {
    /// Physical offset of the record's length field within Data.
    pub(crate) data_offset: u64,
    /// Length of the key in bytes.
    pub(crate) key_len: u64,
    /// Physical offset of the key bytes within this component.
    pub(crate) key_offset: u64,
}

#[derive(Debug, Clone)]
struct ComponentHandle {
    path: PathBuf,
    /// The file's read-only map, created once at open. Single-file
    /// tables share one map across all five handles.
    mapped: Arc<Mmap>,
    /// Physical byte offset of the component's first block in `path`.
    base: u64,
    /// Logical content length, excluding the 8-byte prefix.
    content_len: u64,
}

// ------------------------------------------------------------------------------------------------
// SsTable — immutable reader
// ------------------------------------------------------------------------------------------------

/// An open, immutable SSTable.
///
/// Construction reads and verifies the Config block and locates every
/// component; record data is read on demand.
#[derive(Debug)]
pub struct SsTable {
    index: u64,
    codec: CrcCodec,
    use_separate_files: bool,
    compression_enabled: bool,
    sparse_step: u64,
    components: [ComponentHandle; 5],
}

impl SsTable {
    /// Opens table `index` in `dir`, recovering its settings from the
    /// Config block.
    pub fn open(dir: &Path, index: u64, block_size: usize) -> Result<Self, SstableError> {
        let codec = CrcCodec::new(block_size)?;
        let config_path = table_path(dir, index);

        // One map per file for the table's lifetime; every later read
        // borrows from it.
        let config_map = Arc::new(BlockManager::map_file(&config_path)?);

        let block = BlockManager::read_block(&config_map, &config_path, 0, block_size)?;
        let payload = codec.verify_block(block, &config_path, 0)?;

        let use_separate_files = decode_flag(payload[0], &config_path)?;
        let compression_enabled = decode_flag(payload[1], &config_path)?;
        let sparse_step = u64::from_le_bytes(
            payload[2..10]
                .try_into()
                .map_err(|_| SstableError::Internal("config slice width".into()))?,
        );
        if sparse_step == 0 {
            return Err(SstableError::Corrupt {
                path: config_path,
                detail: "sparse_step is zero".into(),
            });
        }

        let components = if use_separate_files {
            let mut handles = Vec::with_capacity(5);
            for component in Component::ALL {
                let path = component_file_path(dir, index, component);
                let mapped = Arc::new(BlockManager::map_file(&path)?);
                let content_len = read_content_len(&mapped, &path, &codec)?;
                handles.push(ComponentHandle {
                    path,
                    mapped,
                    base: 0,
                    content_len,
                });
            }
            handles
        } else {
            let mut handles = Vec::with_capacity(5);
            let mut cursor = 10usize;
            for _ in Component::ALL {
                let content_len = u64::from_le_bytes(
                    payload[cursor..cursor + 8]
                        .try_into()
                        .map_err(|_| SstableError::Internal("config slice width".into()))?,
                );
                let base = u64::from_le_bytes(
                    payload[cursor + 8..cursor + 16]
                        .try_into()
                        .map_err(|_| SstableError::Internal("config slice width".into()))?,
                );
                cursor += 16;
                handles.push(ComponentHandle {
                    path: config_path.clone(),
                    mapped: Arc::clone(&config_map),
                    base,
                    content_len,
                });
            }
            handles
        };

        let components: [ComponentHandle; 5] = components
            .try_into()
            .map_err(|_| SstableError::Internal("component handle count".into()))?;

        trace!(index, use_separate_files, compression_enabled, sparse_step, "sstable opened");

        Ok(Self {
            index,
            codec,
            use_separate_files,
            compression_enabled,
            sparse_step,
            components,
        })
    }

    /// The table's numeric identifier.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Whether this table stores components in separate files.
    pub fn use_separate_files(&self) -> bool {
        self.use_separate_files
    }

    /// Whether record blobs use the compacted form.
    pub fn compression_enabled(&self) -> bool {
        self.compression_enabled
    }

    /// The summary's sparse step.
    pub fn sparse_step(&self) -> u64 {
        self.sparse_step
    }

    /// Number of records in the table.
    pub fn record_count(&self) -> Result<u64, SstableError> {
        self.entry_count(Component::Index)
    }

    /// Smallest key, from the summary's first entry.
    pub fn min_key(&self) -> Result<Option<String>, SstableError> {
        let count = self.entry_count(Component::Summary)?;
        if count == 0 {
            return Ok(None);
        }
        let entry = self.entry(Component::Summary, 0)?;
        Ok(Some(self.entry_key(Component::Summary, &entry)?))
    }

    /// Largest key, from the summary's last entry.
    pub fn max_key(&self) -> Result<Option<String>, SstableError> {
        let count = self.entry_count(Component::Summary)?;
        if count == 0 {
            return Ok(None);
        }
        let entry = self.entry(Component::Summary, count - 1)?;
        Ok(Some(self.entry_key(Component::Summary, &entry)?))
    }

    // --------------------------------------------------------------------------------------------
    // Point lookup
    // --------------------------------------------------------------------------------------------

    /// Looks up `key`, returning its record — possibly a tombstone — or
    /// `None` when the table holds nothing for the key.
    ///
    /// Stages: bloom filter, summary bounds, binary search over the
    /// summary, binary search over the derived index window, one data
    /// read.
    pub fn get(&self, key: &str) -> Result<Option<Record>, SstableError> {
        // 1. Bloom filter: a definitive "absent" skips all further I/O.
        if let Some(bloom) = self.load_bloom()? {
            if !bloom.check(&key.to_string()) {
                trace!(index = self.index, key, "bloom reject");
                return Ok(None);
            }
        }

        // 2. Summary bounds.
        let summary_count = self.entry_count(Component::Summary)?;
        if summary_count == 0 {
            return Ok(None);
        }
        let first = self.entry(Component::Summary, 0)?;
        let first_key = self.entry_key(Component::Summary, &first)?;
        if key < first_key.as_str() {
            return Ok(None);
        }
        if key == first_key {
            return self.read_record_at(first.data_offset).map(Some);
        }
        let last = self.entry(Component::Summary, summary_count - 1)?;
        let last_key = self.entry_key(Component::Summary, &last)?;
        if key > last_key.as_str() {
            return Ok(None);
        }
        if key == last_key {
            return self.read_record_at(last.data_offset).map(Some);
        }

        // 3. Binary search the summary for the greatest entry ≤ key.
        let mut lo = 0u64;
        let mut hi = summary_count - 1;
        while lo + 1 < hi {
            let mid = lo + (hi - lo) / 2;
            let entry = self.entry(Component::Summary, mid)?;
            let mid_key = self.entry_key(Component::Summary, &entry)?;
            match mid_key.as_str().cmp(key) {
                std::cmp::Ordering::Equal => {
                    return self.read_record_at(entry.data_offset).map(Some);
                }
                std::cmp::Ordering::Less => lo = mid,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }

        // 4. Binary search the index window derived from [lo, hi].
        let index_count = self.entry_count(Component::Index)?;
        if index_count == 0 {
            return Ok(None);
        }
        let win_lo = self.index_position_of_summary(lo, summary_count, index_count);
        let win_hi = self.index_position_of_summary(hi, summary_count, index_count);

        let mut lo = win_lo;
        let mut hi = win_hi;
        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            let entry = self.entry(Component::Index, mid)?;
            let mid_key = self.entry_key(Component::Index, &entry)?;
            match mid_key.as_str().cmp(key) {
                std::cmp::Ordering::Equal => {
                    // 5. Exactly one data read.
                    return self.read_record_at(entry.data_offset).map(Some);
                }
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => {
                    if mid == 0 {
                        break;
                    }
                    hi = mid - 1;
                }
            }
        }

        Ok(None)
    }

    // --------------------------------------------------------------------------------------------
    // Iteration primitives
    // --------------------------------------------------------------------------------------------

    /// Raw successor within a prefix: the record with the smallest key
    /// that starts with `prefix` and is strictly greater than `current`
    /// (or the first prefixed key when `current` is `None`). Tombstones
    /// are returned like any other record.
    pub fn next_in_prefix(
        &self,
        prefix: &str,
        current: Option<&str>,
    ) -> Result<Option<Record>, SstableError> {
        let count = self.entry_count(Component::Index)?;
        let from_prefix = self.lower_bound(prefix, false)?;
        let from_current = match current {
            Some(key) => self.lower_bound(key, true)?,
            None => 0,
        };
        let pos = from_prefix.max(from_current);
        if pos >= count {
            return Ok(None);
        }

        let entry = self.entry(Component::Index, pos)?;
        let key = self.entry_key(Component::Index, &entry)?;
        if !key.starts_with(prefix) {
            return Ok(None);
        }
        self.read_record_at(entry.data_offset).map(Some)
    }

    /// Raw successor within an inclusive range `[range_start, range_end]`.
    pub fn next_in_range(
        &self,
        range_start: &str,
        range_end: &str,
        current: Option<&str>,
    ) -> Result<Option<Record>, SstableError> {
        let count = self.entry_count(Component::Index)?;
        let from_start = self.lower_bound(range_start, false)?;
        let from_current = match current {
            Some(key) => self.lower_bound(key, true)?,
            None => 0,
        };
        let pos = from_start.max(from_current);
        if pos >= count {
            return Ok(None);
        }

        let entry = self.entry(Component::Index, pos)?;
        let key = self.entry_key(Component::Index, &entry)?;
        if key.as_str() > range_end {
            return Ok(None);
        }
        self.read_record_at(entry.data_offset).map(Some)
    }

    /// Prefix successor with tombstone bookkeeping: skips keys already
    /// in `tombstoned_keys`, records tombstones it meets in the set and
    /// continues, and returns the first live record.
    pub fn get_next_for_prefix(
        &self,
        prefix: &str,
        current: Option<&str>,
        tombstoned_keys: &mut HashSet<String>,
    ) -> Result<Option<Record>, SstableError> {
        let mut cursor = current.map(str::to_string);
        loop {
            let Some(record) = self.next_in_prefix(prefix, cursor.as_deref())? else {
                return Ok(None);
            };
            if tombstoned_keys.contains(&record.key) {
                cursor = Some(record.key);
                continue;
            }
            if record.tombstone {
                tombstoned_keys.insert(record.key.clone());
                cursor = Some(record.key);
                continue;
            }
            return Ok(Some(record));
        }
    }

    /// Range successor with tombstone bookkeeping; the range is
    /// inclusive at both ends.
    pub fn get_next_for_range(
        &self,
        range_start: &str,
        range_end: &str,
        current: Option<&str>,
        tombstoned_keys: &mut HashSet<String>,
    ) -> Result<Option<Record>, SstableError> {
        let mut cursor = current.map(str::to_string);
        loop {
            let Some(record) = self.next_in_range(range_start, range_end, cursor.as_deref())?
            else {
                return Ok(None);
            };
            if tombstoned_keys.contains(&record.key) {
                cursor = Some(record.key);
                continue;
            }
            if record.tombstone {
                tombstoned_keys.insert(record.key.clone());
                cursor = Some(record.key);
                continue;
            }
            return Ok(Some(record));
        }
    }

    /// Walks every key starting with `prefix`, feeding live records into
    /// `collected` and tombstones into `tombstoned_keys`. Keys already
    /// claimed by either set — by a newer table — are skipped, so calling
    /// this newest-table-first preserves newest-wins. Pagination is the
    /// caller's job.
    pub fn scan_for_prefix(
        &self,
        prefix: &str,
        tombstoned_keys: &mut HashSet<String>,
        collected: &mut BTreeMap<String, Record>,
    ) -> Result<(), SstableError> {
        let count = self.entry_count(Component::Index)?;
        let mut pos = self.lower_bound(prefix, false)?;
        while pos < count {
            let entry = self.entry(Component::Index, pos)?;
            let key = self.entry_key(Component::Index, &entry)?;
            if !key.starts_with(prefix) {
                break;
            }
            self.collect_scanned(&entry, key, tombstoned_keys, collected)?;
            pos += 1;
        }
        Ok(())
    }

    /// Walks every key in the inclusive range `[range_start, range_end]`,
    /// with the same accumulator semantics as [`Self::scan_for_prefix`].
    pub fn scan_for_range(
        &self,
        range_start: &str,
        range_end: &str,
        tombstoned_keys: &mut HashSet<String>,
        collected: &mut BTreeMap<String, Record>,
    ) -> Result<(), SstableError> {
        let count = self.entry_count(Component::Index)?;
        let mut pos = self.lower_bound(range_start, false)?;
        while pos < count {
            let entry = self.entry(Component::Index, pos)?;
            let key = self.entry_key(Component::Index, &entry)?;
            if key.as_str() > range_end {
                break;
            }
            self.collect_scanned(&entry, key, tombstoned_keys, collected)?;
            pos += 1;
        }
        Ok(())
    }

    fn collect_scanned(
        &self,
        entry: &IndexEntry,
        key: String,
        tombstoned_keys: &mut HashSet<String>,
        collected: &mut BTreeMap<String, Record>,
    ) -> Result<(), SstableError> {
        if tombstoned_keys.contains(&key) || collected.contains_key(&key) {
            return Ok(());
        }
        let record = self.read_record_at(entry.data_offset)?;
        if record.tombstone {
            tombstoned_keys.insert(key);
        } else {
            collected.insert(key, record);
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Component access
    // --------------------------------------------------------------------------------------------

    /// Reads `len` logical bytes at `offset` within a component,
    /// verifying every touched block's CRC.
    pub(crate) fn read_logical(
        &self,
        component: Component,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>, SstableError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let handle = &self.components[component.slot()];
        let block = self.codec.block_size() as u64;
        let payload = self.codec.payload_size() as u64;

        let first_block = offset / payload;
        let last_block = (offset + len as u64 - 1) / payload;

        let mut bytes = Vec::with_capacity(((last_block - first_block + 1) * payload) as usize);
        for b in first_block..=last_block {
            let file_offset = handle.base + b * block;
            let (raw, _) = BlockManager::read_from_disk(
                &handle.mapped,
                &handle.path,
                file_offset,
                block as usize,
            )?;
            let verified = self
                .codec
                .verify_block(raw, &handle.path, file_offset / block)?;
            bytes.extend_from_slice(verified);
        }

        let skip = (offset - first_block * payload) as usize;
        Ok(bytes[skip..skip + len].to_vec())
    }

    /// Reads the record whose length field sits at the given physical
    /// offset within the Data component.
    pub(crate) fn read_record_at(&self, data_offset: u64) -> Result<Record, SstableError> {
        let logical = self.codec.logical_of_physical(data_offset);
        let len_bytes = self.read_logical(Component::Data, logical, 8)?;
        let len = u64::from_le_bytes(
            len_bytes
                .as_slice()
                .try_into()
                .map_err(|_| SstableError::Internal("length slice width".into()))?,
        );
        let len = usize::try_from(len).map_err(|_| {
            SstableError::Corrupt {
                path: self.components[Component::Data.slot()].path.clone(),
                detail: format!("record length {len} overflows"),
            }
        })?;
        let blob = self.read_logical(Component::Data, logical + 8, len)?;
        Ok(Record::decode_blob(&blob, self.compression_enabled)?)
    }

    /// Number of metadata entries in the Index or Summary component.
    pub(crate) fn entry_count(&self, component: Component) -> Result<u64, SstableError> {
        let handle = &self.components[component.slot()];
        if handle.content_len < 8 {
            return Ok(0);
        }
        let header = self.read_logical(component, LEN_PREFIX, 8)?;
        let last_phys = u64::from_le_bytes(
            header
                .as_slice()
                .try_into()
                .map_err(|_| SstableError::Internal("header slice width".into()))?,
        );
        if last_phys == 0 {
            return Ok(0);
        }
        let last_logical = self.codec.logical_of_physical(last_phys);
        if last_logical < ENTRIES_START {
            return Err(SstableError::Corrupt {
                path: handle.path.clone(),
                detail: format!("last entry offset {last_phys} precedes the entry region"),
            });
        }
        Ok((last_logical - ENTRIES_START) / INDEX_ENTRY_SIZE + 1)
    }

    /// Reads the `i`-th metadata entry of the Index or Summary.
    pub(crate) fn entry(&self, component: Component, i: u64) -> Result<IndexEntry, SstableError> {
        let offset = ENTRIES_START + i * INDEX_ENTRY_SIZE;
        let raw = self.read_logical(component, offset, INDEX_ENTRY_SIZE as usize)?;
        let word = |range: std::ops::Range<usize>| -> Result<u64, SstableError> {
            Ok(u64::from_le_bytes(raw[range].try_into().map_err(|_| {
                SstableError::Internal("entry slice width".into())
            })?))
        };
        Ok(IndexEntry {
            data_offset: word(0..8)?,
            key_len: word(8..16)?,
            key_offset: word(16..24)?,
        })
    }

    /// Reads the key bytes an entry points at.
    pub(crate) fn entry_key(
        &self,
        component: Component,
        entry: &IndexEntry,
    ) -> Result<String, SstableError> {
        let logical = self.codec.logical_of_physical(entry.key_offset);
        let len = usize::try_from(entry.key_len).map_err(|_| {
            SstableError::Corrupt {
                path: self.components[component.slot()].path.clone(),
                detail: format!("key length {} overflows", entry.key_len),
            }
        })?;
        let raw = self.read_logical(component, logical, len)?;
        String::from_utf8(raw).map_err(|e| SstableError::Corrupt {
            path: self.components[component.slot()].path.clone(),
            detail: format!("key is not UTF-8: {e}"),
        })
    }

    /// Index position of the `j`-th summary entry: `j * sparse_step`,
    /// except that the last summary entry is always the last index entry.
    fn index_position_of_summary(&self, j: u64, summary_count: u64, index_count: u64) -> u64 {
        if j + 1 == summary_count {
            index_count - 1
        } else {
            (j * self.sparse_step).min(index_count - 1)
        }
    }

    /// First index position whose key is ≥ `key` (or > with `strict`).
    fn lower_bound(&self, key: &str, strict: bool) -> Result<u64, SstableError> {
        let count = self.entry_count(Component::Index)?;
        let mut lo = 0u64;
        let mut hi = count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let entry = self.entry(Component::Index, mid)?;
            let mid_key = self.entry_key(Component::Index, &entry)?;
            let before = if strict {
                mid_key.as_str() <= key
            } else {
                mid_key.as_str() < key
            };
            if before {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// Deserializes the bloom filter, or `None` when the component is
    /// empty or unreadable (treated as "cannot exclude").
    fn load_bloom(&self) -> Result<Option<Bloom<String>>, SstableError> {
        let handle = &self.components[Component::Filter.slot()];
        if handle.content_len == 0 {
            return Ok(None);
        }
        let raw = self.read_logical(Component::Filter, LEN_PREFIX, handle.content_len as usize)?;
        match Bloom::from_slice(&raw) {
            Ok(bloom) => Ok(Some(bloom)),
            Err(err) => {
                warn!(index = self.index, error = %err, "bloom filter undecodable, skipping");
                Ok(None)
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Helpers shared with the writer
// ------------------------------------------------------------------------------------------------

fn decode_flag(byte: u8, path: &Path) -> Result<bool, SstableError> {
    match byte {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(SstableError::Corrupt {
            path: path.to_path_buf(),
            detail: format!("config flag byte 0x{other:02X}"),
        }),
    }
}

/// Reads a component's 8-byte content-length prefix from its first
/// block in an already-mapped file.
fn read_content_len(mapped: &Mmap, path: &Path, codec: &CrcCodec) -> Result<u64, SstableError> {
    let block = BlockManager::read_block(mapped, path, 0, codec.block_size())?;
    let payload = codec.verify_block(block, path, 0)?;
    Ok(u64::from_le_bytes(
        payload[..8]
            .try_into()
            .map_err(|_| SstableError::Internal("prefix slice width".into()))?,
    ))
}
