//! Fixed-size block I/O and CRC-punctuated offset arithmetic.
//!
//! Every on-disk component of the engine is laid out in fixed-size blocks.
//! Each block begins with a 4-byte CRC32 covering the remaining
//! `block_size - 4` payload bytes; the final block of a stream is
//! zero-padded and its CRC is computed over the padded payload.
//!
//! Two views of a stream exist:
//!
//! - the **physical** stream — the bytes as stored, CRCs included;
//! - the **logical** stream — the payload bytes with CRCs stripped.
//!
//! All offsets persisted inside SSTables are physical. [`CrcCodec`] is the
//! single authority for converting between the two views; every reader
//! routes through it rather than doing its own arithmetic.
//!
//! # Conversion invariants
//!
//! With `B = block_size` and `C = 4`:
//!
//! - `physical(L) = L + ((L / (B - C)) + 1) * C`
//! - `logical(P)  = P - ((P / B) + 1) * C`
//!
//! [`BlockManager`] provides the raw positioned I/O: `pwrite` by
//! `(path, offset)`, exact-length reads, and whole-block reads. A file is
//! memory-mapped **once** via [`BlockManager::map_file`] — engine files
//! are immutable once written — and every read borrows from that map, so
//! repeated lookups never reopen or remap the file.

#[cfg(test)]
mod tests;

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;

/// Width of the per-block CRC32 prefix in bytes.
pub const CRC_SIZE: usize = 4;

/// Default block size used when the engine configuration does not override
/// it.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by block I/O and CRC verification.
#[derive(Debug, Error)]
pub enum BlockError {
    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A block's stored CRC did not match its payload.
    #[error("CRC mismatch in {path} at block {block_index}")]
    CrcMismatch {
        /// File containing the corrupt block.
        path: PathBuf,
        /// Zero-based index of the corrupt block within the file.
        block_index: u64,
    },

    /// A read reached past the end of the file.
    #[error("read past end of {path}: offset {offset} + len {len} > file size {file_size}")]
    OutOfBounds {
        /// File being read.
        path: PathBuf,
        /// Requested start offset.
        offset: u64,
        /// Requested length.
        len: usize,
        /// Actual file size.
        file_size: u64,
    },

    /// Malformed arguments (zero/undersized block size, misaligned block).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

// ------------------------------------------------------------------------------------------------
// CrcCodec — physical/logical arithmetic and block framing
// ------------------------------------------------------------------------------------------------

/// Converts between logical (CRC-stripped) and physical (CRC-punctuated)
/// offsets and frames byte streams into CRC-protected blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrcCodec {
    block_size: usize,
}

impl CrcCodec {
    /// Creates a codec for the given block size. The size must leave room
    /// for the CRC prefix and at least one payload byte.
    pub fn new(block_size: usize) -> Result<Self, BlockError> {
        if block_size <= CRC_SIZE {
            return Err(BlockError::InvalidArgument(format!(
                "block size {block_size} must exceed the CRC width {CRC_SIZE}"
            )));
        }
        Ok(Self { block_size })
    }

    /// The configured block size in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Payload bytes carried by one block.
    pub fn payload_size(&self) -> usize {
        self.block_size - CRC_SIZE
    }

    /// Physical offset of the byte at logical offset `logical`.
    pub fn physical_of_logical(&self, logical: u64) -> u64 {
        let payload = self.payload_size() as u64;
        logical + (logical / payload + 1) * CRC_SIZE as u64
    }

    /// Logical offset of the byte at physical offset `physical`.
    ///
    /// `physical` must address a payload byte, not a CRC byte.
    pub fn logical_of_physical(&self, physical: u64) -> u64 {
        let block = self.block_size as u64;
        physical - (physical / block + 1) * CRC_SIZE as u64
    }

    /// Frames `data` into CRC-protected blocks.
    ///
    /// The output is `ceil(len / payload) * block_size` bytes (at least one
    /// block): each payload chunk is prefixed with the CRC32 of the chunk,
    /// and the final chunk is zero-padded before its CRC is computed so the
    /// stored checksum covers the padded payload.
    pub fn add_crcs_to_data(&self, data: &[u8]) -> Vec<u8> {
        let payload = self.payload_size();
        let block_count = data.len().div_ceil(payload).max(1);
        let mut out = Vec::with_capacity(block_count * self.block_size);

        for i in 0..block_count {
            let start = i * payload;
            let end = (start + payload).min(data.len());
            let mut chunk = vec![0u8; payload];
            if start < data.len() {
                chunk[..end - start].copy_from_slice(&data[start..end]);
            }

            let mut hasher = Crc32::new();
            hasher.update(&chunk);
            out.extend_from_slice(&hasher.finalize().to_le_bytes());
            out.extend_from_slice(&chunk);
        }

        out
    }

    /// Verifies one block and returns its payload slice.
    pub fn verify_block<'a>(
        &self,
        block: &'a [u8],
        path: &Path,
        block_index: u64,
    ) -> Result<&'a [u8], BlockError> {
        if block.len() != self.block_size {
            return Err(BlockError::InvalidArgument(format!(
                "block length {} does not match block size {}",
                block.len(),
                self.block_size
            )));
        }

        let stored = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        let mut hasher = Crc32::new();
        hasher.update(&block[CRC_SIZE..]);
        if hasher.finalize() != stored {
            return Err(BlockError::CrcMismatch {
                path: path.to_path_buf(),
                block_index,
            });
        }
        Ok(&block[CRC_SIZE..])
    }
}

// ------------------------------------------------------------------------------------------------
// BlockManager — positioned file I/O
// ------------------------------------------------------------------------------------------------

/// Positioned block-level file I/O.
///
/// Writes create the file when missing. Readers call
/// [`BlockManager::map_file`] once per file lifetime and pass the map to
/// every subsequent read, which borrows the requested range without
/// copying; concurrent readers need no coordination on immutable files.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockManager;

impl BlockManager {
    /// Writes `bytes` at `offset` in `path`, creating the file if missing.
    pub fn write_to_disk(bytes: &[u8], path: &Path, offset: u64) -> Result<(), BlockError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        file.write_at(bytes, offset)?;
        Ok(())
    }

    /// Flushes a file's contents to stable storage.
    pub fn sync(path: &Path) -> Result<(), BlockError> {
        let file = OpenOptions::new().read(true).open(path)?;
        file.sync_all()?;
        Ok(())
    }

    /// Memory-maps `path` read-only, once. Callers keep the map alive
    /// for the file's lifetime and hand it to the read methods below.
    pub fn map_file(path: &Path) -> Result<Mmap, BlockError> {
        let file = OpenOptions::new().read(true).open(path)?;
        // Immutable once written; the map is read-only and every read
        // below is bounds-checked.
        Ok(unsafe { Mmap::map(&file)? })
    }

    /// Reads exactly `len` bytes at `offset` from an already-mapped file.
    ///
    /// Returns the borrowed bytes together with the offset one past the
    /// last byte read, so sequential callers can chain reads. `path` is
    /// only for error reporting.
    pub fn read_from_disk<'a>(
        mapped: &'a [u8],
        path: &Path,
        offset: u64,
        len: usize,
    ) -> Result<(&'a [u8], u64), BlockError> {
        if len == 0 {
            return Ok((&[], offset));
        }

        let start = usize::try_from(offset).map_err(|_| {
            BlockError::InvalidArgument(format!("offset {offset} exceeds addressable range"))
        })?;
        let end = start.checked_add(len).ok_or_else(|| {
            BlockError::InvalidArgument("offset + len overflows usize".to_string())
        })?;
        if end > mapped.len() {
            return Err(BlockError::OutOfBounds {
                path: path.to_path_buf(),
                offset,
                len,
                file_size: mapped.len() as u64,
            });
        }

        Ok((&mapped[start..end], offset + len as u64))
    }

    /// Reads the whole block at `block_index` from an already-mapped
    /// file.
    pub fn read_block<'a>(
        mapped: &'a [u8],
        path: &Path,
        block_index: u64,
        block_size: usize,
    ) -> Result<&'a [u8], BlockError> {
        let offset = block_index
            .checked_mul(block_size as u64)
            .ok_or_else(|| BlockError::InvalidArgument("block offset overflow".to_string()))?;
        let (bytes, _) = Self::read_from_disk(mapped, path, offset, block_size)?;
        Ok(bytes)
    }

    /// Size of `path` in bytes.
    pub fn file_size(path: &Path) -> Result<u64, BlockError> {
        Ok(std::fs::metadata(path)?.len())
    }
}
