//! The storage engine's record type and its binary encodings.
//!
//! A [`Record`] is the unit every layer of the engine moves around: the
//! WAL appends records, memtables buffer them, SSTables persist them, and
//! compaction merges them. A record is an immutable
//! ⟨key, value, timestamp, tombstone⟩ quadruple; deletions travel as
//! tombstoned records with an empty value.
//!
//! Two encodings exist:
//!
//! - the *WAL form* ([`encoding::Encode`]/[`encoding::Decode`] impls),
//!   fixed-width and framed by the WAL's own length/CRC envelope;
//! - the *SSTable blob* ([`Record::encode_blob`] / [`Record::decode_blob`]),
//!   self-describing given the table's compression flag. The compacted
//!   form stores the integer fields as LEB128 varints.


use std::time::{SystemTime, UNIX_EPOCH};

use crate::encoding::{self, Decode, Encode, EncodingError, put_uvarint, take_uvarint};

/// A single versioned key-value entry.
///
/// Invariant: when `tombstone` is set the value is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// UTF-8 key; ordering is plain byte order of the key string.
    pub key: String,

    /// Opaque value bytes. Empty for tombstones.
    pub value: Vec<u8>,

    /// Wall-clock timestamp in nanoseconds since UNIX epoch. Used as the
    /// merge tie-break: newer timestamps win, equal timestamps fall back
    /// to coordinator scan order.
    pub timestamp: u64,

    /// Whether this record marks a logical deletion.
    pub tombstone: bool,
}

impl Record {
    /// Creates a live record stamped with the current time.
    pub fn put(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value,
            timestamp: now_nanos(),
            tombstone: false,
        }
    }

    /// Creates a tombstone stamped with the current time.
    pub fn tombstone(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Vec::new(),
            timestamp: now_nanos(),
            tombstone: true,
        }
    }

    /// Creates a record with an explicit timestamp. Tombstones drop any
    /// provided value to uphold the empty-value invariant.
    pub fn with_timestamp(
        key: impl Into<String>,
        value: Vec<u8>,
        timestamp: u64,
        tombstone: bool,
    ) -> Self {
        Self {
            key: key.into(),
            value: if tombstone { Vec::new() } else { value },
            timestamp,
            tombstone,
        }
    }

    /// Serializes this record into an SSTable blob.
    ///
    /// Layout (fixed form):
    /// `[timestamp u64][tombstone u8][key_len u64][key][value_len u64][value]`.
    /// With `compacted` the three integers become LEB128 varints.
    pub fn encode_blob(&self, compacted: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.key.len() + self.value.len() + 24);
        if compacted {
            put_uvarint(self.timestamp, &mut buf);
            buf.push(u8::from(self.tombstone));
            put_uvarint(self.key.len() as u64, &mut buf);
            buf.extend_from_slice(self.key.as_bytes());
            put_uvarint(self.value.len() as u64, &mut buf);
            buf.extend_from_slice(&self.value);
        } else {
            buf.extend_from_slice(&self.timestamp.to_le_bytes());
            buf.push(u8::from(self.tombstone));
            buf.extend_from_slice(&(self.key.len() as u64).to_le_bytes());
            buf.extend_from_slice(self.key.as_bytes());
            buf.extend_from_slice(&(self.value.len() as u64).to_le_bytes());
            buf.extend_from_slice(&self.value);
        }
        buf
    }

    /// Deserializes an SSTable blob produced by [`Record::encode_blob`]
    /// with the same compression flag.
    pub fn decode_blob(buf: &[u8], compacted: bool) -> Result<Self, EncodingError> {
        let mut cursor = Cursor::new(buf);

        let timestamp = cursor.integer(compacted)?;
        let tombstone = cursor.flag()?;
        let key_len = cursor.length(compacted)?;
        let key = String::from_utf8(cursor.bytes(key_len)?.to_vec())?;
        let value_len = cursor.length(compacted)?;
        let value = cursor.bytes(value_len)?.to_vec();

        Ok(Self {
            key,
            value,
            timestamp,
            tombstone,
        })
    }
}

impl encoding::Encode for Record {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.key.encode_to(buf)?;
        self.value.encode_to(buf)?;
        self.timestamp.encode_to(buf)?;
        self.tombstone.encode_to(buf)?;
        Ok(())
    }
}

impl encoding::Decode for Record {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (key, n) = String::decode_from(&buf[off..])?;
        off += n;
        let (value, n) = <Vec<u8>>::decode_from(&buf[off..])?;
        off += n;
        let (timestamp, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (tombstone, n) = bool::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                key,
                value,
                timestamp,
                tombstone,
            },
            off,
        ))
    }
}

/// Current wall-clock time in nanoseconds since the UNIX epoch.
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

// ------------------------------------------------------------------------------------------------
// Cursor — sequential blob reader
// ------------------------------------------------------------------------------------------------

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn integer(&mut self, compacted: bool) -> Result<u64, EncodingError> {
        let (value, n) = if compacted {
            take_uvarint(self.rest())?
        } else {
            u64::decode_from(self.rest())?
        };
        self.pos += n;
        Ok(value)
    }

    fn length(&mut self, compacted: bool) -> Result<usize, EncodingError> {
        let raw = self.integer(compacted)?;
        usize::try_from(raw).map_err(|_| EncodingError::LengthOverflow(format!("length {raw}")))
    }

    fn flag(&mut self) -> Result<bool, EncodingError> {
        let (flag, n) = bool::decode_from(self.rest())?;
        self.pos += n;
        Ok(flag)
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], EncodingError> {
        if self.buf.len() - self.pos < len {
            return Err(EncodingError::UnexpectedEof {
                needed: len,
                available: self.buf.len() - self.pos,
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}
