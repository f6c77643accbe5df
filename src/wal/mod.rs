//! Segmented write-ahead log.
//!
//! Every mutation is appended to the current WAL segment before it
//! touches a memtable, so a crash can always be replayed back to the
//! last acknowledged write.
//!
//! # On-disk layout
//!
//! Segments are named `wal_{seq:06}.db` with monotonically increasing
//! sequence numbers. Each segment is:
//!
//! ```text
//! [HEADER_BYTES][HEADER_CRC32_LE]
//! [REC_LEN_LE u32][REC_BYTES][REC_CRC32_LE]
//! [REC_LEN_LE u32][REC_BYTES][REC_CRC32_LE]
//! ...
//! ```
//!
//! The header carries a magic, a format version, the record-size limit,
//! and the segment's sequence number; the per-record CRC covers
//! `len || record_bytes`.
//!
//! # Rotation and reclamation
//!
//! The engine rotates to a new segment whenever it seals a memtable, and
//! records the new sequence number as the sealed memtable's **low
//! watermark**. Once that memtable is durably flushed,
//! [`Wal::delete_old_logs`] removes every segment whose sequence is
//! below the watermark — they can only contain records from memtables
//! flushed earlier (level-0 commits are in order).
//!
//! # Replay
//!
//! [`replay`] walks all segments in sequence order. A torn or corrupt
//! tail stops that segment's replay with a warning and moves to the next
//! segment — a crash mid-append must not take the engine down.

#[cfg(test)]
mod tests;

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::record::Record;

const MAGIC: [u8; 4] = *b"SWAL";
const VERSION: u32 = 1;
const U32_SIZE: usize = 4;
/// Header: magic(4) + version(4) + max_record_size(4) + seq(8).
const HEADER_SIZE: usize = 20;
/// Header plus its trailing CRC.
const HEADER_DISK_SIZE: u64 = (HEADER_SIZE + U32_SIZE) as u64;

/// Default cap on one encoded record (1 MiB).
pub const DEFAULT_MAX_RECORD_SIZE: u32 = 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A record's stored checksum did not match.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// A record exceeds the configured size limit.
    #[error("record size {0} exceeds limit")]
    RecordTooLarge(usize),

    /// A segment header failed validation.
    #[error("invalid segment header: {0}")]
    InvalidHeader(String),

    /// Internal consistency or locking error.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Segment naming
// ------------------------------------------------------------------------------------------------

/// Path of the segment with the given sequence number.
pub fn segment_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("wal_{seq:06}.db"))
}

fn parse_segment_seq(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix("wal_")?
        .strip_suffix(".db")?
        .parse()
        .ok()
}

/// Existing segments in `dir`, sorted by sequence number.
pub fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>, WalError> {
    let mut segments = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(seq) = parse_segment_seq(&path) {
            segments.push((seq, path));
        }
    }
    segments.sort_by_key(|(seq, _)| *seq);
    Ok(segments)
}

// ------------------------------------------------------------------------------------------------
// WAL core
// ------------------------------------------------------------------------------------------------

struct WalInner {
    file: File,
    seq: u64,
}

/// Append-only, segmented record log.
///
/// Appends are serialized through an internal mutex and fsynced before
/// returning; the WAL is single-writer at the record level.
pub struct Wal {
    dir: PathBuf,
    max_record_size: u32,
    inner: Mutex<WalInner>,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("dir", &self.dir)
            .field("max_record_size", &self.max_record_size)
            .finish_non_exhaustive()
    }
}

impl Wal {
    /// Opens the WAL in `dir`, continuing the highest existing segment
    /// or creating segment 1.
    pub fn open(dir: &Path, max_record_size: Option<u32>) -> Result<Self, WalError> {
        let max_record_size = max_record_size.unwrap_or(DEFAULT_MAX_RECORD_SIZE);
        let seq = list_segments(dir)?
            .last()
            .map(|(seq, _)| *seq)
            .unwrap_or(1);

        let file = open_segment(dir, seq, max_record_size)?;
        info!(dir = %dir.display(), seq, "WAL opened");

        Ok(Self {
            dir: dir.to_path_buf(),
            max_record_size,
            inner: Mutex::new(WalInner { file, seq }),
        })
    }

    /// Appends one record and fsyncs. Returns the sequence number of the
    /// segment the record landed in.
    pub fn append(&self, record: &Record) -> Result<u64, WalError> {
        let record_bytes = encoding::encode_to_vec(record)?;
        let record_len = u32::try_from(record_bytes.len())
            .map_err(|_| WalError::RecordTooLarge(record_bytes.len()))?;
        if record_len > self.max_record_size {
            return Err(WalError::RecordTooLarge(record_len as usize));
        }

        let len_bytes = record_len.to_le_bytes();
        let mut hasher = Crc32::new();
        hasher.update(&len_bytes);
        hasher.update(&record_bytes);
        let checksum = hasher.finalize();

        let mut inner = self.lock()?;
        inner.file.write_all(&len_bytes)?;
        inner.file.write_all(&record_bytes)?;
        inner.file.write_all(&checksum.to_le_bytes())?;
        inner.file.sync_all()?;

        trace!(seq = inner.seq, len = record_len, "WAL record appended");
        Ok(inner.seq)
    }

    /// Rotates to a fresh segment, returning its sequence number.
    pub fn rotate(&self) -> Result<u64, WalError> {
        let mut inner = self.lock()?;
        inner.file.sync_all()?;

        let next_seq = inner
            .seq
            .checked_add(1)
            .ok_or_else(|| WalError::Internal("segment sequence overflow".into()))?;
        let file = open_segment(&self.dir, next_seq, self.max_record_size)?;

        inner.file = file;
        inner.seq = next_seq;
        debug!(seq = next_seq, "WAL rotated");
        Ok(next_seq)
    }

    /// Sequence number of the segment currently being appended to.
    pub fn current_seq(&self) -> Result<u64, WalError> {
        Ok(self.lock()?.seq)
    }

    /// Removes every segment whose sequence number is below `watermark`.
    /// The active segment is never removed.
    pub fn delete_old_logs(&self, watermark: u64) -> Result<(), WalError> {
        let current = self.current_seq()?;
        for (seq, path) in list_segments(&self.dir)? {
            if seq < watermark && seq != current {
                std::fs::remove_file(&path)?;
                debug!(seq, watermark, "WAL segment reclaimed");
            }
        }
        Ok(())
    }

    /// The configured record-size limit.
    pub fn max_record_size(&self) -> u32 {
        self.max_record_size
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, WalInner>, WalError> {
        self.inner
            .lock()
            .map_err(|_| WalError::Internal("WAL mutex poisoned".into()))
    }
}

/// Opens (or creates) one segment, validating or writing its header.
fn open_segment(dir: &Path, seq: u64, max_record_size: u32) -> Result<File, WalError> {
    let path = segment_path(dir, seq);
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(&path)?;

    if file.metadata()?.len() == 0 {
        write_header(&mut file, seq, max_record_size)?;
        file.sync_all()?;
    } else {
        file.seek(SeekFrom::Start(0))?;
        let header_seq = read_and_validate_header(&mut file)?;
        if header_seq != seq {
            return Err(WalError::InvalidHeader(format!(
                "segment {} carries sequence {header_seq}",
                path.display()
            )));
        }
        file.seek(SeekFrom::End(0))?;
    }

    Ok(file)
}

fn write_header(file: &mut File, seq: u64, max_record_size: u32) -> Result<(), WalError> {
    let mut header = Vec::with_capacity(HEADER_SIZE);
    MAGIC.encode_to(&mut header)?;
    VERSION.encode_to(&mut header)?;
    max_record_size.encode_to(&mut header)?;
    seq.encode_to(&mut header)?;

    let mut hasher = Crc32::new();
    hasher.update(&header);
    file.write_all(&header)?;
    file.write_all(&hasher.finalize().to_le_bytes())?;
    Ok(())
}

/// Reads the header at the current position, returning the segment's
/// sequence number.
fn read_and_validate_header<R: Read>(reader: &mut R) -> Result<u64, WalError> {
    let mut header = vec![0u8; HEADER_SIZE];
    reader.read_exact(&mut header)?;
    let mut crc_bytes = [0u8; U32_SIZE];
    reader.read_exact(&mut crc_bytes)?;

    let mut hasher = Crc32::new();
    hasher.update(&header);
    if hasher.finalize() != u32::from_le_bytes(crc_bytes) {
        return Err(WalError::InvalidHeader("header checksum mismatch".into()));
    }

    let mut off = 0;
    let (magic, n) = <[u8; 4]>::decode_from(&header[off..])?;
    off += n;
    if magic != MAGIC {
        return Err(WalError::InvalidHeader("bad magic".into()));
    }
    let (version, n) = u32::decode_from(&header[off..])?;
    off += n;
    if version != VERSION {
        return Err(WalError::InvalidHeader(format!("unsupported version {version}")));
    }
    let (_max_record_size, n) = u32::decode_from(&header[off..])?;
    off += n;
    let (seq, _) = u64::decode_from(&header[off..])?;
    Ok(seq)
}

// ------------------------------------------------------------------------------------------------
// Replay
// ------------------------------------------------------------------------------------------------

/// One replayed record together with the segment it came from.
#[derive(Debug)]
pub struct ReplayedRecord {
    /// Sequence number of the segment holding the record.
    pub segment_seq: u64,
    /// The decoded record.
    pub record: Record,
}

/// Replays every segment in `dir` in sequence order.
///
/// Corruption or truncation inside a segment ends that segment's replay
/// with a warning; later segments are still replayed.
pub fn replay(dir: &Path, max_record_size: u32) -> Result<Vec<ReplayedRecord>, WalError> {
    let mut out = Vec::new();
    for (seq, path) in list_segments(dir)? {
        debug!(seq, path = %path.display(), "replaying WAL segment");
        let mut file = File::open(&path)?;

        match read_and_validate_header(&mut file) {
            Ok(header_seq) if header_seq == seq => {}
            Ok(header_seq) => {
                warn!(seq, header_seq, "segment header sequence mismatch, skipping");
                continue;
            }
            Err(err) => {
                warn!(seq, error = %err, "segment header invalid, skipping");
                continue;
            }
        }

        let mut offset = HEADER_DISK_SIZE;
        loop {
            match read_one_record(&mut file, &mut offset, max_record_size) {
                Ok(Some(record)) => out.push(ReplayedRecord {
                    segment_seq: seq,
                    record,
                }),
                Ok(None) => break,
                Err(err) => {
                    warn!(seq, offset, error = %err, "segment replay stopped");
                    break;
                }
            }
        }
    }
    Ok(out)
}

/// Reads one framed record at `offset`. `Ok(None)` is clean end-of-file.
fn read_one_record(
    file: &mut File,
    offset: &mut u64,
    max_record_size: u32,
) -> Result<Option<Record>, WalError> {
    file.seek(SeekFrom::Start(*offset))?;

    let mut len_bytes = [0u8; U32_SIZE];
    match file.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let record_len = u32::from_le_bytes(len_bytes) as usize;
    if record_len > max_record_size as usize {
        return Err(WalError::RecordTooLarge(record_len));
    }

    let mut record_bytes = vec![0u8; record_len];
    file.read_exact(&mut record_bytes)?;

    let mut crc_bytes = [0u8; U32_SIZE];
    file.read_exact(&mut crc_bytes)?;

    let mut hasher = Crc32::new();
    hasher.update(&len_bytes);
    hasher.update(&record_bytes);
    if hasher.finalize() != u32::from_le_bytes(crc_bytes) {
        return Err(WalError::ChecksumMismatch);
    }

    *offset += (U32_SIZE + record_len + U32_SIZE) as u64;
    let (record, _) = encoding::decode_from_slice::<Record>(&record_bytes)?;
    Ok(Some(record))
}
