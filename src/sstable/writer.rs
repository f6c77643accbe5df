//! SSTable writer — persists a sorted record stream as a complete table.
//!
//! [`persist_memtable`] serializes the five components described in the
//! [module docs](super), computing every stored offset in *physical*
//! terms (CRC bytes included) through [`CrcCodec`]. Given the same
//! records and options the output is byte-identical, except for the bloom
//! filter's randomized keys.

use std::path::Path;

use bloomfilter::Bloom;
use tracing::{debug, info};

use crate::block::{BlockManager, CrcCodec};
use crate::encoding::encode_to_vec;
use crate::merkle::MerkleTree;
use crate::record::Record;

use super::{
    Component, ENTRIES_START, INDEX_ENTRY_SIZE, LEN_PREFIX, SstableError, SstableOptions,
    all_table_paths, component_file_path, table_path,
};

/// Writes `records` as SSTable `index` under `dir`.
///
/// Preconditions: `records` are key-ascending and unique (verified;
/// violations return [`SstableError::InvalidArgument`]). An empty slice
/// produces a valid empty table — compaction can merge everything away.
pub fn persist_memtable(
    records: &[Record],
    index: u64,
    options: &SstableOptions,
    dir: &Path,
) -> Result<(), SstableError> {
    options.validate()?;
    for pair in records.windows(2) {
        if pair[0].key >= pair[1].key {
            return Err(SstableError::InvalidArgument(format!(
                "records not sorted/unique at key {:?}",
                pair[1].key
            )));
        }
    }

    // Any leftover files for this index (failed flush, mode change)
    // would otherwise shadow or trail the fresh table.
    for path in all_table_paths(dir, index) {
        if path.exists() {
            std::fs::remove_file(&path).map_err(crate::block::BlockError::Io)?;
        }
    }

    let codec = CrcCodec::new(options.block_size)?;
    debug!(
        index,
        records = records.len(),
        separate = options.use_separate_files,
        compressed = options.compression_enabled,
        "persisting sstable"
    );

    // 1. Data: [len u64][blob] per record, tracking each record's
    //    physical offset for the index.
    let blobs: Vec<Vec<u8>> = records
        .iter()
        .map(|r| r.encode_blob(options.compression_enabled))
        .collect();

    let mut data_content = Vec::new();
    let mut record_offsets = Vec::with_capacity(records.len());
    for blob in &blobs {
        let logical = LEN_PREFIX + data_content.len() as u64;
        record_offsets.push(codec.physical_of_logical(logical));
        data_content.extend_from_slice(&(blob.len() as u64).to_le_bytes());
        data_content.extend_from_slice(blob);
    }

    // 2. Index: every record.
    let index_items: Vec<(&str, u64)> = records
        .iter()
        .zip(&record_offsets)
        .map(|(r, &off)| (r.key.as_str(), off))
        .collect();
    let index_content = build_entries_component(&codec, &index_items);

    // 3. Summary: every sparse_step-th index entry, plus the last entry
    //    so the summary's bounds are the table's true min/max keys.
    let summary_positions = summary_positions(records.len(), options.sparse_step);
    let summary_items: Vec<(&str, u64)> = summary_positions
        .iter()
        .map(|&p| index_items[p])
        .collect();
    let summary_content = build_entries_component(&codec, &summary_items);

    // 4. Filter: every key, tombstoned or not, so a deletion still
    //    answers through this table instead of resurrecting from an
    //    older one.
    let mut bloom = Bloom::new_for_fp_rate(records.len().max(1), options.bloom_fp_rate)
        .map_err(|e| SstableError::Internal(format!("bloom construction: {e}")))?;
    for record in records {
        bloom.set(&record.key);
    }
    let filter_content = bloom.as_slice().to_vec();

    // 5. Metadata: Merkle tree over the blobs (length prefixes excluded).
    let merkle = MerkleTree::from_payloads(blobs.iter().map(Vec::as_slice));
    let metadata_content = encode_to_vec(&merkle)?;

    let framed: [(Component, Vec<u8>); 5] = [
        (Component::Data, frame_component(&codec, &data_content)),
        (Component::Index, frame_component(&codec, &index_content)),
        (Component::Summary, frame_component(&codec, &summary_content)),
        (Component::Filter, frame_component(&codec, &filter_content)),
        (Component::Metadata, frame_component(&codec, &metadata_content)),
    ];
    let content_lens = [
        data_content.len() as u64,
        index_content.len() as u64,
        summary_content.len() as u64,
        filter_content.len() as u64,
        metadata_content.len() as u64,
    ];

    // 6. Config block, then the components; in single-file mode the
    //    config carries each component's ⟨content length, offset⟩ pair.
    let config_file = table_path(dir, index);
    if options.use_separate_files {
        let config = config_content(options, None);
        write_config_block(&codec, &config, &config_file)?;

        for (component, bytes) in &framed {
            let path = component_file_path(dir, index, *component);
            BlockManager::write_to_disk(bytes, &path, 0)?;
            BlockManager::sync(&path)?;
        }
    } else {
        let mut pairs = Vec::with_capacity(5);
        let mut base = options.block_size as u64;
        for ((_, bytes), &content_len) in framed.iter().zip(&content_lens) {
            pairs.push((content_len, base));
            base += bytes.len() as u64;
        }

        let config = config_content(options, Some(&pairs));
        write_config_block(&codec, &config, &config_file)?;

        let mut offset = options.block_size as u64;
        for (_, bytes) in &framed {
            BlockManager::write_to_disk(bytes, &config_file, offset)?;
            offset += bytes.len() as u64;
        }
    }
    BlockManager::sync(&config_file)?;

    info!(index, records = records.len(), "sstable persisted");
    Ok(())
}

/// Index positions promoted to the summary: `{0, s, 2s, …} ∪ {n-1}`.
fn summary_positions(n: usize, sparse_step: u64) -> Vec<usize> {
    if n == 0 {
        return Vec::new();
    }
    let step = sparse_step.max(1) as usize;
    let mut positions: Vec<usize> = (0..n).step_by(step).collect();
    if *positions.last().expect("non-empty for n > 0") != n - 1 {
        positions.push(n - 1);
    }
    positions
}

/// Builds the Index/Summary content: an 8-byte pointer to the last
/// 24-byte entry, the entries, then the packed key bytes. All offsets
/// are physical; key offsets point into this same component.
fn build_entries_component(codec: &CrcCodec, items: &[(&str, u64)]) -> Vec<u8> {
    let n = items.len() as u64;
    let last_entry_phys = if n == 0 {
        0
    } else {
        codec.physical_of_logical(ENTRIES_START + (n - 1) * INDEX_ENTRY_SIZE)
    };

    let keys_logical_start = ENTRIES_START + n * INDEX_ENTRY_SIZE;
    let mut content = Vec::new();
    content.extend_from_slice(&last_entry_phys.to_le_bytes());

    let mut key_cursor = 0u64;
    for (key, data_offset) in items {
        let key_phys = codec.physical_of_logical(keys_logical_start + key_cursor);
        content.extend_from_slice(&data_offset.to_le_bytes());
        content.extend_from_slice(&(key.len() as u64).to_le_bytes());
        content.extend_from_slice(&key_phys.to_le_bytes());
        key_cursor += key.len() as u64;
    }
    for (key, _) in items {
        content.extend_from_slice(key.as_bytes());
    }
    content
}

/// Prepends the logical content-length prefix and frames the stream into
/// CRC-protected blocks.
fn frame_component(codec: &CrcCodec, content: &[u8]) -> Vec<u8> {
    let mut logical = Vec::with_capacity(content.len() + LEN_PREFIX as usize);
    logical.extend_from_slice(&(content.len() as u64).to_le_bytes());
    logical.extend_from_slice(content);
    codec.add_crcs_to_data(&logical)
}

/// Serializes the Config payload: flags, sparse step, and (single-file
/// mode) the five ⟨content length, offset⟩ pairs.
fn config_content(options: &SstableOptions, pairs: Option<&[(u64, u64)]>) -> Vec<u8> {
    let mut content = Vec::with_capacity(90);
    content.push(u8::from(options.use_separate_files));
    content.push(u8::from(options.compression_enabled));
    content.extend_from_slice(&options.sparse_step.to_le_bytes());
    if let Some(pairs) = pairs {
        for (len, offset) in pairs {
            content.extend_from_slice(&len.to_le_bytes());
            content.extend_from_slice(&offset.to_le_bytes());
        }
    }
    content
}

/// Writes the Config payload as block 0 of `path`.
fn write_config_block(
    codec: &CrcCodec,
    content: &[u8],
    path: &Path,
) -> Result<(), SstableError> {
    if content.len() > codec.payload_size() {
        return Err(SstableError::InvalidArgument(format!(
            "config payload {} exceeds one block payload {}",
            content.len(),
            codec.payload_size()
        )));
    }
    let framed = codec.add_crcs_to_data(content);
    debug_assert_eq!(framed.len(), codec.block_size());
    BlockManager::write_to_disk(&framed, path, 0)?;
    Ok(())
}
