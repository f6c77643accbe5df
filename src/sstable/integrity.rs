//! SSTable integrity verification.
//!
//! [`check_integrity`] rebuilds the Merkle tree from the Data component
//! as it exists on disk, compares it against the tree stored in the
//! Metadata component, and translates every mismatched leaf back to a
//! `(file, block)` coordinate. Leaf digests cover the record blob only —
//! the 8-byte length prefix is excluded, matching the writer's
//! construction.
//!
//! A failure that prevents the walk from completing — an unreadable
//! Config block, a CRC mismatch mid-stream, a truncated component — is
//! *fatal*: the report carries `fatal = true`, the error text, and the
//! block on which the walk stopped.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::block::BlockError;
use crate::encoding::decode_from_slice;
use crate::merkle::{MerkleTree, hash_bytes};

use super::{Component, LEN_PREFIX, SsTable, SstableError, table_path};

/// One corrupt block coordinate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptBlock {
    /// File containing the block.
    pub path: PathBuf,
    /// Zero-based block index within the file.
    pub block_index: u64,
}

/// Outcome of an integrity check.
#[derive(Debug, Default)]
pub struct IntegrityReport {
    /// True when the rebuilt tree matches the stored tree exactly.
    pub ok: bool,
    /// Blocks found to be corrupt, if any.
    pub corrupt_blocks: Vec<CorruptBlock>,
    /// True when the check could not run to completion.
    pub fatal: bool,
    /// Human-readable cause when `ok` is false.
    pub error: Option<String>,
}

impl IntegrityReport {
    fn clean() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }

    fn fatal(block: CorruptBlock, error: String) -> Self {
        Self {
            ok: false,
            corrupt_blocks: vec![block],
            fatal: true,
            error: Some(error),
        }
    }
}

/// Verifies SSTable `index` under `dir`.
///
/// Never returns `Err`: every failure mode is folded into the report.
pub fn check_integrity(dir: &Path, index: u64, block_size: usize) -> IntegrityReport {
    // 1. Config. Failure here is fatal and indicts block 0 of the table
    //    file.
    let table = match SsTable::open(dir, index, block_size) {
        Ok(table) => table,
        Err(err) => {
            let (path, block_index) = match &err {
                SstableError::Block(BlockError::CrcMismatch { path, block_index }) => {
                    (path.clone(), *block_index)
                }
                _ => (table_path(dir, index), 0),
            };
            warn!(index, error = %err, "integrity: config unreadable");
            return IntegrityReport::fatal(CorruptBlock { path, block_index }, err.to_string());
        }
    };
    table.check_integrity()
}

impl SsTable {
    /// Verifies this table's Data component against its stored Merkle
    /// tree. See [`check_integrity`].
    pub fn check_integrity(&self) -> IntegrityReport {
        let data_path = self.component_path(Component::Data);
        let data_base = self.component_base(Component::Data);
        let block = self.codec().block_size() as u64;

        // 2. Stream the Data component record by record, hashing each
        //    blob and remembering where the record starts on disk.
        let content_len = self.component_content_len(Component::Data);
        let mut leaves = Vec::new();
        let mut record_blocks: Vec<u64> = Vec::new();

        let mut cursor = LEN_PREFIX;
        let end = LEN_PREFIX + content_len;
        while cursor < end {
            let record_phys = self.codec().physical_of_logical(cursor);
            let block_index = (data_base + record_phys) / block;

            let len_bytes = match self.read_logical(Component::Data, cursor, 8) {
                Ok(bytes) => bytes,
                Err(err) => return self.fatal_at(&data_path, block_index, err),
            };
            let len = u64::from_le_bytes(len_bytes.as_slice().try_into().unwrap_or_default());
            let Ok(len) = usize::try_from(len) else {
                return self.fatal_at(
                    &data_path,
                    block_index,
                    SstableError::Corrupt {
                        path: data_path.clone(),
                        detail: format!("record length {len} overflows"),
                    },
                );
            };
            if cursor + 8 + len as u64 > end {
                return self.fatal_at(
                    &data_path,
                    block_index,
                    SstableError::Corrupt {
                        path: data_path.clone(),
                        detail: "record runs past the data component".into(),
                    },
                );
            }

            let blob = match self.read_logical(Component::Data, cursor + 8, len) {
                Ok(bytes) => bytes,
                Err(err) => return self.fatal_at(&data_path, block_index, err),
            };

            leaves.push(hash_bytes(&blob));
            record_blocks.push(block_index);
            cursor += 8 + len as u64;
        }

        // 3. Rebuild and 4. load the stored tree.
        let rebuilt = MerkleTree::from_leaves(leaves);

        let metadata_len = self.component_content_len(Component::Metadata) as usize;
        let metadata_path = self.component_path(Component::Metadata);
        let metadata_block = self.component_base(Component::Metadata) / block;
        let raw = match self.read_logical(Component::Metadata, LEN_PREFIX, metadata_len) {
            Ok(bytes) => bytes,
            Err(err) => return self.fatal_at(&metadata_path, metadata_block, err),
        };
        let stored = match decode_from_slice::<MerkleTree>(&raw) {
            Ok((tree, _)) => tree,
            Err(err) => {
                return self.fatal_at(
                    &metadata_path,
                    metadata_block,
                    SstableError::Encoding(err),
                );
            }
        };

        // 5. Compare and translate mismatched leaves to blocks.
        let mismatched = rebuilt.diff(&stored);
        if mismatched.is_empty() {
            return IntegrityReport::clean();
        }

        let mut corrupt_blocks: Vec<CorruptBlock> = mismatched
            .iter()
            .map(|&pos| CorruptBlock {
                path: data_path.clone(),
                block_index: record_blocks
                    .get(pos)
                    .or(record_blocks.last())
                    .copied()
                    .unwrap_or(data_base / block),
            })
            .collect();
        corrupt_blocks.dedup();

        IntegrityReport {
            ok: false,
            corrupt_blocks,
            fatal: false,
            error: Some(format!("{} record(s) diverge from the stored tree", mismatched.len())),
        }
    }

    fn fatal_at(&self, fallback_path: &Path, fallback_block: u64, err: SstableError) -> IntegrityReport {
        let block = match &err {
            SstableError::Block(BlockError::CrcMismatch { path, block_index }) => CorruptBlock {
                path: path.clone(),
                block_index: *block_index,
            },
            _ => CorruptBlock {
                path: fallback_path.to_path_buf(),
                block_index: fallback_block,
            },
        };
        warn!(index = self.index(), error = %err, "integrity check aborted");
        IntegrityReport::fatal(block, err.to_string())
    }

    fn component_path(&self, component: Component) -> PathBuf {
        self.components[component.slot()].path.clone()
    }

    fn component_base(&self, component: Component) -> u64 {
        self.components[component.slot()].base
    }

    fn component_content_len(&self, component: Component) -> u64 {
        self.components[component.slot()].content_len
    }

    fn codec(&self) -> &crate::block::CrcCodec {
        &self.codec
    }
}
