use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;

use crc32fast::Hasher as Crc32;

use super::{BLOCK, numbered_records, options, persist, scratch, single_file_options};
use crate::block::CRC_SIZE;
use crate::sstable::check_integrity;

/// Flips one byte at `offset`, leaving the block CRC stale.
fn flip_byte(path: &Path, offset: u64) {
    let file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    let mut byte = [0u8; 1];
    file.read_exact_at(&mut byte, offset).unwrap();
    byte[0] ^= 0xFF;
    file.write_all_at(&byte, offset).unwrap();
    file.sync_all().unwrap();
}

/// Flips one byte at `offset` and rewrites its block's CRC so the block
/// still verifies — only the Merkle comparison can catch it.
fn flip_byte_fixing_crc(path: &Path, offset: u64) {
    flip_byte(path, offset);

    let block_index = offset / BLOCK as u64;
    let file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    let mut block = vec![0u8; BLOCK];
    file.read_exact_at(&mut block, block_index * BLOCK as u64).unwrap();

    let mut hasher = Crc32::new();
    hasher.update(&block[CRC_SIZE..]);
    let crc = hasher.finalize();
    file.write_all_at(&crc.to_le_bytes(), block_index * BLOCK as u64)
        .unwrap();
    file.sync_all().unwrap();
}

#[test]
fn untouched_table_verifies_clean() {
    let tmp = scratch();
    persist(&numbered_records(50), 1, &options(), tmp.path());

    let report = check_integrity(tmp.path(), 1, BLOCK);
    assert!(report.ok, "{:?}", report.error);
    assert!(report.corrupt_blocks.is_empty());
    assert!(!report.fatal);
    assert!(report.error.is_none());
}

#[test]
fn untouched_single_file_table_verifies_clean() {
    let tmp = scratch();
    persist(&numbered_records(50), 2, &single_file_options(), tmp.path());

    let report = check_integrity(tmp.path(), 2, BLOCK);
    assert!(report.ok, "{:?}", report.error);
}

#[test]
fn empty_table_verifies_clean() {
    let tmp = scratch();
    persist(&[], 3, &options(), tmp.path());
    let report = check_integrity(tmp.path(), 3, BLOCK);
    assert!(report.ok);
}

#[test]
fn crc_breaking_mutation_is_fatal_and_locates_the_block() {
    let tmp = scratch();
    persist(&numbered_records(50), 1, &options(), tmp.path());

    // Deep inside the data component: block 2.
    let data = tmp.path().join("sstable_1_data.db");
    let offset = 2 * BLOCK as u64 + 40;
    flip_byte(&data, offset);

    let report = check_integrity(tmp.path(), 1, BLOCK);
    assert!(!report.ok);
    assert!(report.fatal);
    assert!(report.error.is_some());
    assert!(
        report
            .corrupt_blocks
            .iter()
            .any(|b| b.path == data && b.block_index == 2),
        "{:?}",
        report.corrupt_blocks
    );
}

#[test]
fn crc_preserving_mutation_is_caught_by_the_merkle_tree() {
    let tmp = scratch();
    persist(&numbered_records(50), 1, &options(), tmp.path());

    // Offset 24 = logical 20, inside the first record's blob.
    let data = tmp.path().join("sstable_1_data.db");
    flip_byte_fixing_crc(&data, 24);

    let report = check_integrity(tmp.path(), 1, BLOCK);
    assert!(!report.ok);
    assert!(!report.fatal, "CRC passes, so the walk completes");
    assert_eq!(report.corrupt_blocks.len(), 1);
    assert_eq!(report.corrupt_blocks[0].path, data);
    assert_eq!(report.corrupt_blocks[0].block_index, 0);
}

#[test]
fn corrupt_config_block_is_fatal() {
    let tmp = scratch();
    persist(&numbered_records(10), 4, &options(), tmp.path());

    let config = tmp.path().join("sstable_4.db");
    flip_byte(&config, 6);

    let report = check_integrity(tmp.path(), 4, BLOCK);
    assert!(!report.ok);
    assert!(report.fatal);
    assert_eq!(report.corrupt_blocks[0].path, config);
    assert_eq!(report.corrupt_blocks[0].block_index, 0);
}

#[test]
fn missing_table_is_fatal() {
    let tmp = scratch();
    let report = check_integrity(tmp.path(), 42, BLOCK);
    assert!(!report.ok);
    assert!(report.fatal);
}

#[test]
fn single_file_mutation_locates_block_in_the_one_file() {
    let tmp = scratch();
    persist(&numbered_records(50), 5, &single_file_options(), tmp.path());

    let path = tmp.path().join("sstable_5.db");
    // Data starts at block 1 in single-file mode.
    let offset = BLOCK as u64 + 40;
    flip_byte(&path, offset);

    let report = check_integrity(tmp.path(), 5, BLOCK);
    assert!(!report.ok);
    assert!(report.fatal);
    assert!(
        report
            .corrupt_blocks
            .iter()
            .any(|b| b.path == path && b.block_index == 1),
        "{:?}",
        report.corrupt_blocks
    );
}
