use super::*;
use tempfile::TempDir;

#[test]
fn codec_rejects_degenerate_block_size() {
    assert!(CrcCodec::new(4).is_err());
    assert!(CrcCodec::new(0).is_err());
    assert!(CrcCodec::new(5).is_ok());
}

#[test]
fn offset_conversions_are_inverse() {
    let codec = CrcCodec::new(64).unwrap();
    for logical in [0u64, 1, 59, 60, 61, 119, 120, 500, 10_000] {
        let physical = codec.physical_of_logical(logical);
        assert_eq!(
            codec.logical_of_physical(physical),
            logical,
            "logical {logical} → physical {physical}"
        );
    }
}

#[test]
fn physical_offsets_skip_crc_prefixes() {
    let codec = CrcCodec::new(64).unwrap();
    // First payload byte sits right after the first CRC.
    assert_eq!(codec.physical_of_logical(0), 4);
    // Payload is 60 bytes per block: logical 60 is the first byte of the
    // second block, after two CRC prefixes.
    assert_eq!(codec.physical_of_logical(60), 68);
    assert_eq!(codec.physical_of_logical(59), 63);
}

#[test]
fn add_crcs_pads_to_block_boundary() {
    let codec = CrcCodec::new(32).unwrap();
    let framed = codec.add_crcs_to_data(&[0xABu8; 10]);
    assert_eq!(framed.len(), 32);

    let framed = codec.add_crcs_to_data(&[0xABu8; 28]);
    assert_eq!(framed.len(), 32);

    let framed = codec.add_crcs_to_data(&[0xABu8; 29]);
    assert_eq!(framed.len(), 64);

    // Empty stream still occupies one block.
    let framed = codec.add_crcs_to_data(&[]);
    assert_eq!(framed.len(), 32);
}

#[test]
fn verify_block_accepts_framed_blocks() {
    let codec = CrcCodec::new(32).unwrap();
    let data: Vec<u8> = (0u8..100).collect();
    let framed = codec.add_crcs_to_data(&data);

    let mut recovered = Vec::new();
    for (i, block) in framed.chunks(32).enumerate() {
        let payload = codec
            .verify_block(block, Path::new("mem"), i as u64)
            .unwrap();
        recovered.extend_from_slice(payload);
    }
    assert_eq!(&recovered[..data.len()], &data[..]);
    // Padding is zeros.
    assert!(recovered[data.len()..].iter().all(|&b| b == 0));
}

#[test]
fn verify_block_detects_flipped_bit() {
    let codec = CrcCodec::new(32).unwrap();
    let mut framed = codec.add_crcs_to_data(&[7u8; 40]);
    framed[10] ^= 0x01;

    let err = codec
        .verify_block(&framed[..32], Path::new("mem"), 0)
        .unwrap_err();
    assert!(matches!(err, BlockError::CrcMismatch { block_index: 0, .. }));

    // The second block is untouched.
    assert!(codec.verify_block(&framed[32..], Path::new("mem"), 1).is_ok());
}

#[test]
fn block_manager_positioned_write_and_read() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("blocks.db");

    BlockManager::write_to_disk(b"hello", &path, 0).unwrap();
    BlockManager::write_to_disk(b"world", &path, 100).unwrap();

    let mapped = BlockManager::map_file(&path).unwrap();
    let (bytes, next) = BlockManager::read_from_disk(&mapped, &path, 0, 5).unwrap();
    assert_eq!(bytes, b"hello");
    assert_eq!(next, 5);

    let (bytes, _) = BlockManager::read_from_disk(&mapped, &path, 100, 5).unwrap();
    assert_eq!(bytes, b"world");

    // The hole in between reads back as zeros.
    let (bytes, _) = BlockManager::read_from_disk(&mapped, &path, 5, 10).unwrap();
    assert!(bytes.iter().all(|&b| b == 0));
}

#[test]
fn block_manager_rejects_short_reads() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("short.db");
    BlockManager::write_to_disk(b"abc", &path, 0).unwrap();

    let mapped = BlockManager::map_file(&path).unwrap();
    let err = BlockManager::read_from_disk(&mapped, &path, 0, 8).unwrap_err();
    assert!(matches!(err, BlockError::OutOfBounds { .. }));
}

#[test]
fn missing_file_fails_to_map() {
    let tmp = TempDir::new().unwrap();
    let err = BlockManager::map_file(&tmp.path().join("absent.db")).unwrap_err();
    assert!(matches!(err, BlockError::Io(_)));
}

#[test]
fn read_block_round_trips_framed_stream() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("framed.db");
    let codec = CrcCodec::new(64).unwrap();

    let data: Vec<u8> = (0..200).map(|i| (i % 251) as u8).collect();
    let framed = codec.add_crcs_to_data(&data);
    BlockManager::write_to_disk(&framed, &path, 0).unwrap();

    let mapped = BlockManager::map_file(&path).unwrap();
    let blocks = framed.len() / 64;
    for i in 0..blocks as u64 {
        let block = BlockManager::read_block(&mapped, &path, i, 64).unwrap();
        codec.verify_block(block, &path, i).unwrap();
    }
}
