//! # LSM Storage Engine
//!
//! The coordinator tying every subsystem together: ordered lookups and
//! iteration across the mutable memtables, the read-path cache, and the
//! leveled SSTable hierarchy, plus the concurrent flush and compaction
//! pipeline.
//!
//! ## Write path
//!
//! `put`/`delete` append to the WAL, then mutate the newest memtable.
//! A memtable that cannot take another distinct key is sealed and a
//! fresh one rotated in (together with a fresh WAL segment whose
//! sequence number becomes the sealed memtable's reclamation watermark).
//! Once the memtable count reaches `max_memtables`, every sealed
//! memtable is handed to the [`flush::FlushPool`], which persists them
//! concurrently and commits them to level 0 in order.
//!
//! ## Read path
//!
//! `get` consults the memtables newest-first (a tombstone hit
//! short-circuits to "absent"), then the record cache, then the levels
//! top-down — within a level newest table first. The first SSTable hit
//! populates the cache.
//!
//! ## Level state
//!
//! Level membership lives in [`levels::LevelSet`] under its two-tier
//! lock discipline and persists to `lsm.db`; an unparseable state file
//! surfaces as [`Engine::data_lost`] and the engine starts empty rather
//! than failing.

pub mod levels;

pub(crate) mod flush;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::block::BlockError;
use crate::cache::RecordCache;
use crate::compaction::{CompactionError, maybe_compact};
use crate::memtable::{LookupOutcome, MemTable, MemtableConfig, MemtableError, MemtableKind};
use crate::record::Record;
use crate::sstable::{IntegrityReport, SsTable, SstableError, SstableOptions, check_integrity};
use crate::wal::{Wal, WalError};

use flush::{FlushContext, FlushPool};
use levels::{LevelSet, LevelsError};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WAL failure.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Memtable failure.
    #[error("memtable error: {0}")]
    Memtable(#[from] MemtableError),

    /// SSTable failure.
    #[error("SSTable error: {0}")]
    Sstable(#[from] SstableError),

    /// Compaction failure.
    #[error("compaction error: {0}")]
    Compaction(#[from] CompactionError),

    /// Level-state failure.
    #[error("level state error: {0}")]
    Levels(#[from] LevelsError),

    /// Malformed user input or configuration.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Compaction trigger policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionType {
    /// Table-count thresholds per level ("size" policy).
    Size,
}

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of SSTable levels.
    pub max_levels: usize,
    /// Tables a level may hold before it is compacted into the next.
    pub max_tables_per_level: usize,
    /// Memtables (active + sealed) before flushes are scheduled.
    pub max_memtables: usize,
    /// Compaction trigger policy.
    pub compaction_type: CompactionType,
    /// On-disk block size.
    pub block_size: usize,
    /// Summary sparseness of written SSTables.
    pub sparse_step: u64,
    /// Component-per-file vs. single-file SSTables.
    pub use_separate_files: bool,
    /// Compact (varint) record blobs.
    pub compression_enabled: bool,
    /// Bloom filter false-positive rate.
    pub bloom_fp_rate: f64,
    /// Which container backs the memtables.
    pub memtable_type: MemtableKind,
    /// Distinct keys one memtable may hold.
    pub memtable_capacity: usize,
    /// Order of the B-tree memtable variant.
    pub btree_order: usize,
    /// Tower height limit of the skip-list memtable variant.
    pub skiplist_max_height: usize,
    /// Read-path record cache capacity.
    pub cache_capacity: usize,
    /// Flush pool worker count.
    pub flush_worker_count: usize,
    /// Largest encoded WAL record accepted.
    pub wal_max_record_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_levels: 4,
            max_tables_per_level: 4,
            max_memtables: 4,
            compaction_type: CompactionType::Size,
            block_size: crate::block::DEFAULT_BLOCK_SIZE,
            sparse_step: 10,
            use_separate_files: true,
            compression_enabled: false,
            bloom_fp_rate: 0.01,
            memtable_type: MemtableKind::SkipList,
            memtable_capacity: 1024,
            btree_order: 16,
            skiplist_max_height: 16,
            cache_capacity: 1024,
            flush_worker_count: 2,
            wal_max_record_size: crate::wal::DEFAULT_MAX_RECORD_SIZE,
        }
    }
}

impl EngineConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_levels == 0 {
            return Err(EngineError::InvalidArgument("max_levels must be ≥ 1".into()));
        }
        if self.max_tables_per_level == 0 {
            return Err(EngineError::InvalidArgument(
                "max_tables_per_level must be ≥ 1".into(),
            ));
        }
        if self.max_memtables == 0 {
            return Err(EngineError::InvalidArgument("max_memtables must be ≥ 1".into()));
        }
        if self.memtable_capacity == 0 {
            return Err(EngineError::InvalidArgument(
                "memtable_capacity must be ≥ 1".into(),
            ));
        }
        if self.flush_worker_count == 0 {
            return Err(EngineError::InvalidArgument(
                "flush_worker_count must be ≥ 1".into(),
            ));
        }
        self.sstable_options().validate()?;
        Ok(())
    }

    /// The SSTable writer settings this configuration implies.
    pub fn sstable_options(&self) -> SstableOptions {
        SstableOptions {
            use_separate_files: self.use_separate_files,
            compression_enabled: self.compression_enabled,
            sparse_step: self.sparse_step,
            block_size: self.block_size,
            bloom_fp_rate: self.bloom_fp_rate,
        }
    }

    fn memtable_config(&self) -> MemtableConfig {
        MemtableConfig {
            kind: self.memtable_type,
            capacity: self.memtable_capacity,
            btree_order: self.btree_order,
            skiplist_max_height: self.skiplist_max_height,
        }
    }
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Distinct keys in the active memtable.
    pub active_entries: usize,
    /// Sealed memtables awaiting or undergoing flush.
    pub sealed_memtables: usize,
    /// Table count per level.
    pub tables_per_level: Vec<usize>,
    /// Whether the level state file was present but unparseable at open.
    pub data_lost: bool,
}

// ------------------------------------------------------------------------------------------------
// Memtable set
// ------------------------------------------------------------------------------------------------

/// A sealed memtable awaiting flush.
pub(crate) struct SealedTable {
    pub(crate) table: Arc<MemTable>,
    /// WAL segments below this sequence may be reclaimed once flushed.
    pub(crate) watermark: u64,
    /// Whether a flush job has been submitted for it.
    pub(crate) queued: bool,
}

/// The active memtable plus sealed ones, newest sealed first.
pub(crate) struct MemtableSet {
    pub(crate) active: Arc<MemTable>,
    pub(crate) sealed: Vec<SealedTable>,
}

impl MemtableSet {
    fn count(&self) -> usize {
        1 + self.sealed.len()
    }
}

// ------------------------------------------------------------------------------------------------
// Engine
// ------------------------------------------------------------------------------------------------

struct EngineShared {
    dir: PathBuf,
    config: EngineConfig,
    options: SstableOptions,
    wal: Arc<Wal>,
    tables: Arc<RwLock<MemtableSet>>,
    cache: RecordCache,
    levels: Arc<LevelSet>,
    next_index: Arc<AtomicU64>,
    compaction_lock: Arc<Mutex<()>>,
    pool: Mutex<Option<FlushPool>>,
    data_lost: bool,
}

/// The storage engine handle. Cheap to clone; clones share all state.
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Clone for Engine {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Engine {
    /// Opens (or creates) an engine rooted at `dir`.
    ///
    /// Recovery sequence: load the level state, drop orphaned SSTable
    /// files no level references, replay every WAL segment into fresh
    /// memtables, then start the flush pool and schedule any backlog.
    pub fn open(dir: impl AsRef<Path>, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let loaded = LevelSet::load(&dir, config.max_levels);
        let data_lost = loaded.data_lost;
        let levels = Arc::new(LevelSet::from_levels(loaded.levels));

        let next_index = levels.max_index()?.map(|max| max + 1).unwrap_or(1);
        let next_index = Arc::new(AtomicU64::new(next_index));

        remove_orphan_tables(&dir, &levels)?;

        let wal = Arc::new(Wal::open(&dir, Some(config.wal_max_record_size))?);

        // Replay the WAL into memtables, sealing on capacity the same
        // way live writes do.
        let mem_config = config.memtable_config();
        let mut set = MemtableSet {
            active: Arc::new(MemTable::new(&mem_config)),
            sealed: Vec::new(),
        };
        let replayed = crate::wal::replay(&dir, config.wal_max_record_size)?;
        let replayed_count = replayed.len();
        for item in replayed {
            if set.active.would_overflow(&item.record.key)? {
                set.sealed.insert(
                    0,
                    SealedTable {
                        table: Arc::clone(&set.active),
                        watermark: item.segment_seq,
                        queued: false,
                    },
                );
                set.active = Arc::new(MemTable::new(&mem_config));
            }
            set.active.add(item.record)?;
        }
        if replayed_count > 0 {
            info!(records = replayed_count, sealed = set.sealed.len(), "WAL replayed");
        }

        let tables = Arc::new(RwLock::new(set));
        let compaction_lock = Arc::new(Mutex::new(()));
        let options = config.sstable_options();

        let pool = FlushPool::start(
            config.flush_worker_count,
            FlushContext {
                dir: dir.clone(),
                options,
                levels: Arc::clone(&levels),
                wal: Arc::clone(&wal),
                tables: Arc::clone(&tables),
                compaction_lock: Arc::clone(&compaction_lock),
                next_index: Arc::clone(&next_index),
                max_tables_per_level: config.max_tables_per_level,
            },
        );

        let cache_capacity = config.cache_capacity;
        let engine = Self {
            shared: Arc::new(EngineShared {
                dir,
                config,
                options,
                wal,
                tables,
                cache: RecordCache::new(cache_capacity),
                levels,
                next_index,
                compaction_lock,
                pool: Mutex::new(Some(pool)),
                data_lost,
            }),
        };

        // Replay may have left a backlog of sealed memtables.
        {
            let mut set = engine.tables_write()?;
            if set.count() >= engine.shared.config.max_memtables {
                engine.schedule_flushes(&mut set)?;
            }
        }

        info!(dir = %engine.shared.dir.display(), "engine opened");
        Ok(engine)
    }

    /// Whether the level state file existed but could not be parsed.
    pub fn data_lost(&self) -> bool {
        self.shared.data_lost
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Inserts or updates a key.
    pub fn put(&self, key: impl AsRef<str>, value: Vec<u8>) -> Result<(), EngineError> {
        let key = key.as_ref();
        validate_key(key)?;
        let record = Record::put(key, value);

        let mut set = self.tables_write()?;
        // Rotate before logging so a record is never in a segment below
        // its memtable's watermark.
        if set.active.would_overflow(key)? {
            self.rotate(&mut set)?;
        }
        self.shared.wal.append(&record)?;
        set.active.add(record)?;
        self.shared.cache.invalidate(key);

        if set.count() >= self.shared.config.max_memtables {
            self.schedule_flushes(&mut set)?;
        }
        Ok(())
    }

    /// Deletes a key, returning whether it was live beforehand.
    pub fn delete(&self, key: impl AsRef<str>) -> Result<bool, EngineError> {
        let key = key.as_ref();
        validate_key(key)?;
        let was_live = self.get(key)?.is_some();
        let record = Record::tombstone(key);

        let mut set = self.tables_write()?;
        if set.active.would_overflow(key)? {
            self.rotate(&mut set)?;
        }
        self.shared.wal.append(&record)?;
        set.active.delete(record)?;
        self.shared.cache.invalidate(key);

        if set.count() >= self.shared.config.max_memtables {
            self.schedule_flushes(&mut set)?;
        }
        Ok(was_live)
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Looks up a key's value.
    pub fn get(&self, key: impl AsRef<str>) -> Result<Option<Vec<u8>>, EngineError> {
        let key = key.as_ref();
        validate_key(key)?;
        Ok(self
            .get_record(key)?
            .filter(|record| !record.tombstone)
            .map(|record| record.value))
    }

    fn get_record(&self, key: &str) -> Result<Option<Record>, EngineError> {
        // 1. Memtables, newest first. A tombstone short-circuits.
        {
            let set = self.tables_read()?;
            match set.active.entry(key)? {
                LookupOutcome::Found(record) => return Ok(Some(record)),
                LookupOutcome::Tombstone => return Ok(None),
                LookupOutcome::Absent => {}
            }
            for sealed in &set.sealed {
                match sealed.table.entry(key)? {
                    LookupOutcome::Found(record) => return Ok(Some(record)),
                    LookupOutcome::Tombstone => return Ok(None),
                    LookupOutcome::Absent => {}
                }
            }
        }

        // 2. Read-path cache.
        if let Some(record) = self.shared.cache.get(key) {
            return Ok(Some(record));
        }

        // 3. Levels, top-down, newest table first within a level. A
        //    table unlinked by a concurrent compaction triggers one
        //    retry against a fresh snapshot.
        for attempt in 0..2 {
            let snapshot = self.shared.levels.snapshot()?;
            match self.search_levels(&snapshot, key) {
                Ok(found) => {
                    if let Some(record) = &found {
                        self.shared.cache.insert(record.clone());
                    }
                    return Ok(found);
                }
                Err(err) if attempt == 0 && is_missing_table(&err) => {
                    debug!(key, "table vanished mid-lookup, retrying");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    fn search_levels(
        &self,
        snapshot: &[Vec<u64>],
        key: &str,
    ) -> Result<Option<Record>, EngineError> {
        for level_tables in snapshot {
            for &index in level_tables.iter().rev() {
                let table = SsTable::open(&self.shared.dir, index, self.shared.config.block_size)?;
                if let Some(record) = table.get(key)? {
                    return Ok(Some(record));
                }
            }
        }
        Ok(None)
    }

    // --------------------------------------------------------------------------------------------
    // Iteration
    // --------------------------------------------------------------------------------------------

    /// Iterates live records whose keys start with `prefix`, in key
    /// order.
    pub fn prefix_iterate(&self, prefix: impl Into<String>) -> RecordIter {
        RecordIter {
            engine: self.clone(),
            bound: IterBound::Prefix(prefix.into()),
            current: None,
            done: false,
        }
    }

    /// Iterates live records in the inclusive range `[start, end]`, in
    /// key order.
    pub fn range_iterate(&self, start: impl Into<String>, end: impl Into<String>) -> RecordIter {
        RecordIter {
            engine: self.clone(),
            bound: IterBound::Range(start.into(), end.into()),
            current: None,
            done: false,
        }
    }

    /// The next live record with key strictly greater than `current`
    /// that starts with `prefix`.
    pub fn next_for_prefix(
        &self,
        prefix: &str,
        current: Option<&str>,
    ) -> Result<Option<Record>, EngineError> {
        self.next_live_record(&IterBound::Prefix(prefix.to_string()), current)
    }

    /// The next live record with key strictly greater than `current`
    /// inside the inclusive range `[start, end]`.
    pub fn next_for_range(
        &self,
        start: &str,
        end: &str,
        current: Option<&str>,
    ) -> Result<Option<Record>, EngineError> {
        self.next_live_record(&IterBound::Range(start.to_string(), end.to_string()), current)
    }

    /// Page `page_number` (zero-based) of live records under `prefix`.
    pub fn prefix_scan(
        &self,
        prefix: &str,
        page_size: usize,
        page_number: usize,
    ) -> Result<Vec<Record>, EngineError> {
        let collected = self.collect_scan(&IterBound::Prefix(prefix.to_string()))?;
        Ok(page(collected, page_size, page_number))
    }

    /// Page `page_number` (zero-based) of live records in `[start, end]`.
    pub fn range_scan(
        &self,
        start: &str,
        end: &str,
        page_size: usize,
        page_number: usize,
    ) -> Result<Vec<Record>, EngineError> {
        let collected =
            self.collect_scan(&IterBound::Range(start.to_string(), end.to_string()))?;
        Ok(page(collected, page_size, page_number))
    }

    /// One aggregation step: the smallest next key across all sources,
    /// newest source winning ties; winning tombstones consume the key.
    fn next_live_record(
        &self,
        bound: &IterBound,
        current: Option<&str>,
    ) -> Result<Option<Record>, EngineError> {
        let mut cursor: Option<String> = current.map(str::to_string);
        loop {
            let best = self.next_any_record(bound, cursor.as_deref())?;
            match best {
                None => return Ok(None),
                Some(record) if record.tombstone => {
                    cursor = Some(record.key);
                }
                Some(record) => return Ok(Some(record)),
            }
        }
    }

    /// The smallest record (live or tombstone) strictly after `current`
    /// within `bound`, across memtables and every table of every level;
    /// among equal keys the newest source wins.
    fn next_any_record(
        &self,
        bound: &IterBound,
        current: Option<&str>,
    ) -> Result<Option<Record>, EngineError> {
        let mut best: Option<Record> = None;

        {
            let set = self.tables_read()?;
            consider(&mut best, mem_next(&set.active, bound, current)?);
            for sealed in &set.sealed {
                consider(&mut best, mem_next(&sealed.table, bound, current)?);
            }
        }

        let snapshot = self.shared.levels.snapshot()?;
        for level_tables in &snapshot {
            for &index in level_tables.iter().rev() {
                let table = SsTable::open(&self.shared.dir, index, self.shared.config.block_size)?;
                let candidate = match bound {
                    IterBound::Prefix(prefix) => table.next_in_prefix(prefix, current)?,
                    IterBound::Range(start, end) => table.next_in_range(start, end, current)?,
                };
                consider(&mut best, candidate);
            }
        }

        Ok(best)
    }

    /// Full accumulation for paginated scans: memtables newest-first,
    /// then tables newest-first, each source claiming keys before older
    /// ones see them.
    fn collect_scan(&self, bound: &IterBound) -> Result<BTreeMap<String, Record>, EngineError> {
        let mut tombstoned: HashSet<String> = HashSet::new();
        let mut collected: BTreeMap<String, Record> = BTreeMap::new();

        {
            let set = self.tables_read()?;
            scan_memtable(&set.active, bound, &mut tombstoned, &mut collected)?;
            for sealed in &set.sealed {
                scan_memtable(&sealed.table, bound, &mut tombstoned, &mut collected)?;
            }
        }

        let snapshot = self.shared.levels.snapshot()?;
        for level_tables in &snapshot {
            for &index in level_tables.iter().rev() {
                let table = SsTable::open(&self.shared.dir, index, self.shared.config.block_size)?;
                match bound {
                    IterBound::Prefix(prefix) => {
                        table.scan_for_prefix(prefix, &mut tombstoned, &mut collected)?;
                    }
                    IterBound::Range(start, end) => {
                        table.scan_for_range(start, end, &mut tombstoned, &mut collected)?;
                    }
                }
            }
        }

        Ok(collected)
    }

    // --------------------------------------------------------------------------------------------
    // Maintenance
    // --------------------------------------------------------------------------------------------

    /// Verifies one SSTable's data against its stored Merkle tree.
    pub fn check_integrity(&self, index: u64) -> IntegrityReport {
        check_integrity(&self.shared.dir, index, self.shared.config.block_size)
    }

    /// Runs the compaction policy to quiescence, returning how many
    /// compactions ran.
    pub fn compact_now(&self) -> Result<usize, EngineError> {
        let _guard = self
            .shared
            .compaction_lock
            .lock()
            .map_err(|_| EngineError::Internal("compaction lock poisoned".into()))?;
        Ok(maybe_compact(
            &self.shared.levels,
            &self.shared.dir,
            &self.shared.options,
            self.shared.config.max_tables_per_level,
            &self.shared.next_index,
        )?)
    }

    /// Seals the active memtable (if non-empty) and flushes every
    /// unqueued sealed memtable synchronously, oldest first. Returns the
    /// number flushed.
    pub fn flush_all(&self) -> Result<usize, EngineError> {
        // Drain the pool first so level 0 never receives a newer
        // memtable's table ahead of an older one still in flight.
        self.wait_for_flushes()?;

        let mut set = self.tables_write()?;
        if set.active.total_entries()? > 0 {
            self.rotate(&mut set)?;
        }

        let mut flushed = 0usize;
        // Oldest first; skip tables already owned by the pool.
        for position in (0..set.sealed.len()).rev() {
            if set.sealed[position].queued {
                continue;
            }
            let entry = set.sealed.remove(position);
            let index = self.shared.next_index.fetch_add(1, Ordering::SeqCst);
            entry.table.persist(index, &self.shared.options, &self.shared.dir)?;
            self.shared.levels.append_to_level(0, index)?;
            self.shared.levels.save(&self.shared.dir)?;
            self.shared.wal.delete_old_logs(entry.watermark)?;
            flushed += 1;
        }
        drop(set);

        if flushed > 0 {
            self.compact_now()?;
        }
        Ok(flushed)
    }

    /// Blocks until every flush handed to the pool has committed.
    pub fn wait_for_flushes(&self) -> Result<(), EngineError> {
        loop {
            let pending = {
                let pool = self
                    .shared
                    .pool
                    .lock()
                    .map_err(|_| EngineError::Internal("pool mutex poisoned".into()))?;
                match pool.as_ref() {
                    Some(pool) => pool.pending(),
                    None => 0,
                }
            };
            if pending == 0 {
                return Ok(());
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let set = self.tables_read()?;
        let snapshot = self.shared.levels.snapshot()?;
        Ok(EngineStats {
            active_entries: set.active.total_entries()?,
            sealed_memtables: set.sealed.len(),
            tables_per_level: snapshot.iter().map(Vec::len).collect(),
            data_lost: self.shared.data_lost,
        })
    }

    /// A copy of every level's table indices.
    pub fn level_snapshot(&self) -> Result<Vec<Vec<u64>>, EngineError> {
        Ok(self.shared.levels.snapshot()?)
    }

    /// Gracefully shuts down: drains the flush pool, flushes remaining
    /// sealed memtables, persists the level state, and fsyncs the data
    /// directory. The active memtable stays recoverable from the WAL.
    pub fn close(&self) -> Result<(), EngineError> {
        let pool = {
            let mut slot = self
                .shared
                .pool
                .lock()
                .map_err(|_| EngineError::Internal("pool mutex poisoned".into()))?;
            slot.take()
        };
        if let Some(pool) = pool {
            pool.stop();
        }

        // Anything the pool did not commit is flushed synchronously.
        let mut set = self.tables_write()?;
        while let Some(entry) = set.sealed.pop() {
            let index = self.shared.next_index.fetch_add(1, Ordering::SeqCst);
            entry.table.persist(index, &self.shared.options, &self.shared.dir)?;
            self.shared.levels.append_to_level(0, index)?;
            self.shared.wal.delete_old_logs(entry.watermark)?;
        }
        drop(set);

        self.shared.levels.save(&self.shared.dir)?;
        std::fs::File::open(&self.shared.dir)?.sync_all()?;
        info!(dir = %self.shared.dir.display(), "engine closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Internals
    // --------------------------------------------------------------------------------------------

    /// Seals the active memtable and rotates in a fresh one. The new WAL
    /// segment's sequence is the sealed memtable's low watermark.
    fn rotate(&self, set: &mut MemtableSet) -> Result<(), EngineError> {
        let watermark = self.shared.wal.rotate()?;
        let fresh = Arc::new(MemTable::new(&self.shared.config.memtable_config()));
        let old = std::mem::replace(&mut set.active, fresh);
        debug!(watermark, "memtable sealed");
        set.sealed.insert(
            0,
            SealedTable {
                table: old,
                watermark,
                queued: false,
            },
        );
        Ok(())
    }

    /// Submits every unqueued sealed memtable to the flush pool, oldest
    /// first so level-0 commit order matches age.
    fn schedule_flushes(&self, set: &mut MemtableSet) -> Result<(), EngineError> {
        let pool = self
            .shared
            .pool
            .lock()
            .map_err(|_| EngineError::Internal("pool mutex poisoned".into()))?;
        let Some(pool) = pool.as_ref() else {
            return Ok(());
        };

        for entry in set.sealed.iter_mut().rev() {
            if entry.queued {
                continue;
            }
            let index = self.shared.next_index.fetch_add(1, Ordering::SeqCst);
            if pool.submit(Arc::clone(&entry.table), index, entry.watermark) {
                entry.queued = true;
            }
        }
        Ok(())
    }

    fn tables_read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, MemtableSet>, EngineError> {
        self.shared
            .tables
            .read()
            .map_err(|_| EngineError::Internal("tables lock poisoned".into()))
    }

    fn tables_write(&self) -> Result<RwLockWriteGuard<'_, MemtableSet>, EngineError> {
        self.shared
            .tables
            .write()
            .map_err(|_| EngineError::Internal("tables lock poisoned".into()))
    }
}

// ------------------------------------------------------------------------------------------------
// Iteration plumbing
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum IterBound {
    Prefix(String),
    Range(String, String),
}

enum BoundPosition {
    Before,
    Within,
    After,
}

impl IterBound {
    fn position(&self, key: &str) -> BoundPosition {
        match self {
            IterBound::Prefix(prefix) => {
                if key.starts_with(prefix) {
                    BoundPosition::Within
                } else if key < prefix.as_str() {
                    BoundPosition::Before
                } else {
                    BoundPosition::After
                }
            }
            IterBound::Range(start, end) => {
                if key < start.as_str() {
                    BoundPosition::Before
                } else if key <= end.as_str() {
                    BoundPosition::Within
                } else {
                    BoundPosition::After
                }
            }
        }
    }
}

/// Engine-level ordered iterator over live records (prefix or range).
pub struct RecordIter {
    engine: Engine,
    bound: IterBound,
    current: Option<String>,
    done: bool,
}

impl Iterator for RecordIter {
    type Item = Result<Record, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self
            .engine
            .next_live_record(&self.bound, self.current.as_deref())
        {
            Ok(Some(record)) => {
                self.current = Some(record.key.clone());
                Some(Ok(record))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Successor within `bound` from one memtable, tombstones included.
fn mem_next(
    table: &MemTable,
    bound: &IterBound,
    current: Option<&str>,
) -> Result<Option<Record>, EngineError> {
    let mut cursor: Option<String> = current.map(str::to_string);
    loop {
        let Some(record) = table.next_record_after(cursor.as_deref())? else {
            return Ok(None);
        };
        match bound.position(&record.key) {
            BoundPosition::Before => cursor = Some(record.key),
            BoundPosition::Within => return Ok(Some(record)),
            BoundPosition::After => return Ok(None),
        }
    }
}

/// Feeds one memtable's in-bound records into the scan accumulators.
fn scan_memtable(
    table: &MemTable,
    bound: &IterBound,
    tombstoned: &mut HashSet<String>,
    collected: &mut BTreeMap<String, Record>,
) -> Result<(), EngineError> {
    for record in table.retrieve_sorted_records()? {
        match bound.position(&record.key) {
            BoundPosition::Before => continue,
            BoundPosition::After => break,
            BoundPosition::Within => {}
        }
        if tombstoned.contains(&record.key) || collected.contains_key(&record.key) {
            continue;
        }
        if record.tombstone {
            tombstoned.insert(record.key);
        } else {
            collected.insert(record.key.clone(), record);
        }
    }
    Ok(())
}

/// Keeps the smaller-keyed candidate; ties keep the incumbent (which
/// came from a newer source).
fn consider(best: &mut Option<Record>, candidate: Option<Record>) {
    let Some(candidate) = candidate else {
        return;
    };
    let replace = match best.as_ref() {
        Some(current) => candidate.key < current.key,
        None => true,
    };
    if replace {
        *best = Some(candidate);
    }
}

/// Applies `page_number × page_size` slicing to an ordered accumulation.
fn page(collected: BTreeMap<String, Record>, page_size: usize, page_number: usize) -> Vec<Record> {
    if page_size == 0 {
        return Vec::new();
    }
    collected
        .into_values()
        .skip(page_number.saturating_mul(page_size))
        .take(page_size)
        .collect()
}

fn validate_key(key: &str) -> Result<(), EngineError> {
    if key.is_empty() {
        return Err(EngineError::InvalidArgument("key must not be empty".into()));
    }
    Ok(())
}

fn is_missing_table(err: &EngineError) -> bool {
    matches!(
        err,
        EngineError::Sstable(SstableError::Block(BlockError::Io(io_err)))
            if io_err.kind() == std::io::ErrorKind::NotFound
    )
}

/// Removes SSTable files no level references (crash leftovers).
fn remove_orphan_tables(dir: &Path, levels: &LevelSet) -> Result<(), EngineError> {
    let referenced: HashSet<u64> = levels.all_indices()?.into_iter().collect();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(rest) = name.strip_prefix("sstable_") else {
            continue;
        };
        if !name.ends_with(".db") {
            continue;
        }
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        let Ok(index) = digits.parse::<u64>() else {
            continue;
        };
        if !referenced.contains(&index) {
            warn!(path = %path.display(), "removing orphan SSTable file");
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

impl CompactionType {
    /// The policy's configuration name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CompactionType::Size => "size",
        }
    }
}
