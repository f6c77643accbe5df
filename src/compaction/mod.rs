//! Compaction — newest-wins multi-way merge of SSTables, and the leveled
//! trigger policy.
//!
//! [`compact`] merges a set of source tables, ordered newest first, into
//! a single destination table:
//!
//! - at each step the smallest head key across all cursors is resolved;
//! - among cursors at that key, the **newest** source (earliest in the
//!   list) wins;
//! - a winning tombstone emits nothing — the key is globally deleted —
//!   and every cursor at the key advances.
//!
//! A failed compaction leaves the sources untouched and removes any
//! partially written destination files.
//!
//! [`maybe_compact`] is the "size" policy: any level holding more than
//! `max_tables_per_level` tables is merged wholesale into a single table
//! appended to the next level, cascading downward while thresholds are
//! exceeded. Commits go through [`LevelSet`] so the
//! `level_locks[L] → levels` order holds, and source files are unlinked
//! only after the level state no longer references them.


use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::engine::levels::{LevelSet, LevelsError};
use crate::record::Record;
use crate::sstable::{Component, SsTable, SstableError, SstableOptions, all_table_paths, persist_memtable};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by compaction.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// Reading a source or writing the destination failed.
    #[error("SSTable error: {0}")]
    Sstable(#[from] SstableError),

    /// Persisting the level state failed.
    #[error("level state error: {0}")]
    Levels(#[from] LevelsError),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Source cursor
// ------------------------------------------------------------------------------------------------

/// Sequential cursor over one source table's records in key order.
struct TableCursor {
    table: SsTable,
    position: u64,
    count: u64,
    head: Option<String>,
}

impl TableCursor {
    fn open(dir: &Path, index: u64, block_size: usize) -> Result<Self, CompactionError> {
        let table = SsTable::open(dir, index, block_size)?;
        let count = table.entry_count(Component::Index)?;
        let mut cursor = Self {
            table,
            position: 0,
            count,
            head: None,
        };
        cursor.load_head()?;
        Ok(cursor)
    }

    fn load_head(&mut self) -> Result<(), CompactionError> {
        self.head = if self.position < self.count {
            let entry = self.table.entry(Component::Index, self.position)?;
            Some(self.table.entry_key(Component::Index, &entry)?)
        } else {
            None
        };
        Ok(())
    }

    fn read_record(&self) -> Result<Record, CompactionError> {
        let entry = self.table.entry(Component::Index, self.position)?;
        Ok(self.table.read_record_at(entry.data_offset)?)
    }

    fn advance(&mut self) -> Result<(), CompactionError> {
        self.position += 1;
        self.load_head()
    }
}

// ------------------------------------------------------------------------------------------------
// Merge
// ------------------------------------------------------------------------------------------------

/// Merges `source_indices` (newest first) into table `destination_index`.
///
/// The merged stream is written through [`persist_memtable`] with the
/// engine's current `options`. Source files are left in place; removing
/// them is the caller's commit step.
pub fn compact(
    dir: &Path,
    source_indices: &[u64],
    destination_index: u64,
    options: &SstableOptions,
) -> Result<(), CompactionError> {
    if source_indices.is_empty() {
        return Err(CompactionError::Internal("no sources to compact".into()));
    }
    if source_indices.contains(&destination_index) {
        return Err(CompactionError::Internal(format!(
            "destination {destination_index} is among the sources"
        )));
    }

    debug!(?source_indices, destination_index, "compaction merge started");

    let result = merge_sources(dir, source_indices, destination_index, options);
    if result.is_err() {
        discard_table_files(dir, destination_index);
    }
    result
}

fn merge_sources(
    dir: &Path,
    source_indices: &[u64],
    destination_index: u64,
    options: &SstableOptions,
) -> Result<(), CompactionError> {
    let mut cursors = Vec::with_capacity(source_indices.len());
    for &index in source_indices {
        cursors.push(TableCursor::open(dir, index, options.block_size)?);
    }

    let mut merged: Vec<Record> = Vec::new();
    let mut dropped_tombstones = 0u64;

    loop {
        // Smallest head key across all cursors.
        let Some(min_key) = cursors
            .iter()
            .filter_map(|c| c.head.as_deref())
            .min()
            .map(str::to_string)
        else {
            break;
        };

        // The newest cursor at that key wins; source order defines age.
        let mut winner: Option<Record> = None;
        for cursor in cursors.iter_mut() {
            if cursor.head.as_deref() == Some(min_key.as_str()) {
                if winner.is_none() {
                    winner = Some(cursor.read_record()?);
                }
                cursor.advance()?;
            }
        }

        match winner {
            Some(record) if record.tombstone => dropped_tombstones += 1,
            Some(record) => merged.push(record),
            None => {
                return Err(CompactionError::Internal(
                    "merge step resolved no winner".into(),
                ));
            }
        }
    }

    info!(
        destination_index,
        records = merged.len(),
        dropped_tombstones,
        "compaction merge complete"
    );
    persist_memtable(&merged, destination_index, options, dir)?;
    Ok(())
}

/// Best-effort removal of every file a table may own.
fn discard_table_files(dir: &Path, index: u64) {
    for path in all_table_paths(dir, index) {
        if path.exists() {
            if let Err(err) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %err, "could not remove table file");
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Leveled trigger policy ("size" compaction)
// ------------------------------------------------------------------------------------------------

/// Runs compactions while any level above the last exceeds
/// `max_tables_per_level`, merging the whole level into one table on the
/// level below. Returns the number of compactions performed.
///
/// The caller serializes invocations (no overlapping compactions); this
/// function serializes its own commits through `levels`.
pub fn maybe_compact(
    levels: &LevelSet,
    dir: &Path,
    options: &SstableOptions,
    max_tables_per_level: usize,
    next_index: &AtomicU64,
) -> Result<usize, CompactionError> {
    let max_levels = levels.level_count();
    let mut performed = 0usize;

    for level in 0..max_levels.saturating_sub(1) {
        loop {
            let snapshot = levels.tables_at(level)?;
            if snapshot.len() <= max_tables_per_level {
                break;
            }

            // Level vectors append newest rightmost; the merge wants
            // newest first.
            let newest_first: Vec<u64> = snapshot.iter().rev().copied().collect();
            let destination = next_index.fetch_add(1, Ordering::SeqCst);

            info!(
                level,
                sources = snapshot.len(),
                destination,
                "level over threshold, compacting"
            );
            compact(dir, &newest_first, destination, options)?;

            levels.commit_compaction(level, level + 1, &snapshot, destination)?;
            levels.save(dir)?;

            for &source in &snapshot {
                discard_table_files(dir, source);
            }
            performed += 1;
        }
    }

    Ok(performed)
}
