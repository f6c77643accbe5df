//! # StratumDB
//!
//! An embeddable, persistent, ordered key-value storage engine built on a
//! **leveled Log-Structured Merge Tree (LSM-tree)**. Designed for fast
//! writes, crash-safe operation, and verifiable on-disk integrity.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                       Engine                           │
//! │  ┌────────────┐  ┌──────────────┐  ┌───────────────┐   │
//! │  │  Active    │  │   Sealed     │  │  SSTables     │   │
//! │  │  Memtable  │  │  Memtables   │  │  (levels 0..N)│   │
//! │  └─────┬──────┘  └──────┬───────┘  └──────┬────────┘   │
//! │        │   rotate       │  FlushPool      │            │
//! │        └─────────►      └────────►        │            │
//! │                                           │            │
//! │  ┌──────────────┐   ┌─────────────────────┘            │
//! │  │  Read cache  │   │  Leveled compaction              │
//! │  └──────────────┘   └──────────────────────────────────┤
//! │                                                        │
//! │  ┌──────────────────────────────────────────────────┐  │
//! │  │        Level state (lsm.db) + WAL segments       │  │
//! │  └──────────────────────────────────────────────────┘  │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | Core coordinator — open, read, write, iterate, flush, compact |
//! | [`memtable`] | Ordered in-memory write buffer (B-tree, skip list, or hash map) |
//! | [`wal`] | Segmented, CRC-protected write-ahead log with watermark reclamation |
//! | [`sstable`] | Immutable multi-component on-disk tables with sparse index, bloom filter, and Merkle metadata |
//! | [`compaction`] | Newest-wins multi-way merge and the leveled trigger policy |
//! | [`block`] | Fixed-size block I/O with per-block CRC32 and physical↔logical offset arithmetic |
//! | [`merkle`] | MD5-leaf Merkle trees for data-component integrity verification |
//! | [`cache`] | Key→record LRU consulted between memtables and SSTables |
//! | [`record`] | The ⟨key, value, timestamp, tombstone⟩ record and its binary encodings |
//! | [`encoding`] | Deterministic little-endian wire format shared by all persistence |
//!
//! ## Key features
//!
//! - **Write-ahead logging** — every mutation is appended to a WAL segment
//!   before it touches the memtable; segments below a flush watermark are
//!   reclaimed automatically.
//! - **Block-level CRC32 integrity** — every on-disk block starts with a
//!   4-byte CRC over its payload; all stored offsets are physical and
//!   converted through a single arithmetic authority.
//! - **Merkle-verified data** — each SSTable carries a Merkle tree over its
//!   record blobs; corrupt blocks are pinpointed by file and block index.
//! - **Sparse-index reads** — point lookups touch the bloom filter, a
//!   summary interval, a bounded index window, and exactly one data read.
//! - **Concurrent flushes** — a worker pool flushes sealed memtables in
//!   parallel while a collector commits them to level 0 in order.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use stratumdb::engine::{Engine, EngineConfig};
//!
//! let engine = Engine::open("/tmp/my_db", EngineConfig::default()).unwrap();
//!
//! engine.put("hello", b"world".to_vec()).unwrap();
//! assert_eq!(engine.get("hello").unwrap(), Some(b"world".to_vec()));
//!
//! engine.delete("hello").unwrap();
//! assert_eq!(engine.get("hello").unwrap(), None);
//!
//! engine.close().unwrap();
//! ```

pub mod block;
pub mod cache;
pub mod compaction;
pub mod encoding;
pub mod engine;
pub mod memtable;
pub mod merkle;
pub mod record;
pub mod sstable;
pub mod wal;

pub use engine::{Engine, EngineConfig, EngineError};
pub use record::Record;
