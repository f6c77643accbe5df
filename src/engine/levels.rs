//! Level membership state and its lock discipline.
//!
//! [`LevelSet`] owns the `levels: Vec<Vec<u64>>` structure — one ordered
//! list of SSTable indices per level, newest appended rightmost — behind
//! two tiers of locking:
//!
//! - a **coarse mutex** guarding the vectors themselves;
//! - **per-level locks**, acquired *before* the coarse mutex when
//!   committing a flush or a compaction to specific levels.
//!
//! The lock order is always `level_locks[L] → levels`; when two levels
//! are involved the lower-numbered level lock is taken first. Every
//! mutation lives here so call sites cannot invert the order.
//!
//! The set serializes to `lsm.db` as
//! `[payload_len u64 LE][crc32 u32 LE][ascii "<lvl>[i1,i2,…]…"]`.


use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Name of the level-state file inside the data directory.
pub const LEVEL_STATE_FILE: &str = "lsm.db";

/// Errors returned by level-state operations.
#[derive(Debug, Error)]
pub enum LevelsError {
    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A referenced level does not exist.
    #[error("level {0} out of range")]
    LevelOutOfRange(usize),

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result of loading the persisted level state.
#[derive(Debug)]
pub struct LoadedLevels {
    /// The level vectors (fresh when the file was absent or unreadable).
    pub levels: Vec<Vec<u64>>,
    /// True when the file existed but could not be parsed.
    pub data_lost: bool,
}

/// Thread-safe level membership with the two-tier lock discipline.
#[derive(Debug)]
pub struct LevelSet {
    levels: Mutex<Vec<Vec<u64>>>,
    level_locks: Vec<Mutex<()>>,
}

impl LevelSet {
    /// Creates an empty set with `max_levels` levels.
    pub fn new(max_levels: usize) -> Self {
        Self::from_levels(vec![Vec::new(); max_levels.max(1)])
    }

    /// Wraps pre-loaded level vectors.
    pub fn from_levels(levels: Vec<Vec<u64>>) -> Self {
        let count = levels.len().max(1);
        Self {
            levels: Mutex::new(levels),
            level_locks: (0..count).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Number of levels.
    pub fn level_count(&self) -> usize {
        self.level_locks.len()
    }

    /// A copy of every level's table list.
    pub fn snapshot(&self) -> Result<Vec<Vec<u64>>, LevelsError> {
        Ok(self.coarse()?.clone())
    }

    /// A copy of one level's table list (oldest first, newest last).
    pub fn tables_at(&self, level: usize) -> Result<Vec<u64>, LevelsError> {
        let levels = self.coarse()?;
        levels
            .get(level)
            .cloned()
            .ok_or(LevelsError::LevelOutOfRange(level))
    }

    /// Appends a freshly flushed table to a level.
    ///
    /// Lock order: `level_locks[level]` → coarse `levels`.
    pub fn append_to_level(&self, level: usize, index: u64) -> Result<(), LevelsError> {
        let level_lock = self
            .level_locks
            .get(level)
            .ok_or(LevelsError::LevelOutOfRange(level))?;
        let _guard = level_lock
            .lock()
            .map_err(|_| LevelsError::Internal("level lock poisoned".into()))?;

        let mut levels = self.coarse()?;
        levels
            .get_mut(level)
            .ok_or(LevelsError::LevelOutOfRange(level))?
            .push(index);
        debug!(level, index, "table appended to level");
        Ok(())
    }

    /// Atomically removes `sources` from `src_level` and appends
    /// `destination` to `dst_level`.
    ///
    /// Both level locks are taken lowest level first, then the coarse
    /// mutex; the two list edits happen under one coarse acquisition.
    pub fn commit_compaction(
        &self,
        src_level: usize,
        dst_level: usize,
        sources: &[u64],
        destination: u64,
    ) -> Result<(), LevelsError> {
        let (first, second) = if src_level <= dst_level {
            (src_level, dst_level)
        } else {
            (dst_level, src_level)
        };
        let first_lock = self
            .level_locks
            .get(first)
            .ok_or(LevelsError::LevelOutOfRange(first))?;
        let second_lock = self
            .level_locks
            .get(second)
            .ok_or(LevelsError::LevelOutOfRange(second))?;

        let _first_guard = first_lock
            .lock()
            .map_err(|_| LevelsError::Internal("level lock poisoned".into()))?;
        let _second_guard = if first == second {
            None
        } else {
            Some(
                second_lock
                    .lock()
                    .map_err(|_| LevelsError::Internal("level lock poisoned".into()))?,
            )
        };

        let mut levels = self.coarse()?;
        if src_level >= levels.len() || dst_level >= levels.len() {
            return Err(LevelsError::LevelOutOfRange(src_level.max(dst_level)));
        }
        levels[src_level].retain(|index| !sources.contains(index));
        levels[dst_level].push(destination);
        info!(src_level, dst_level, ?sources, destination, "compaction committed");
        Ok(())
    }

    /// Greatest table index referenced anywhere, if any.
    pub fn max_index(&self) -> Result<Option<u64>, LevelsError> {
        let levels = self.coarse()?;
        Ok(levels.iter().flatten().copied().max())
    }

    /// Every referenced table index.
    pub fn all_indices(&self) -> Result<Vec<u64>, LevelsError> {
        let levels = self.coarse()?;
        Ok(levels.iter().flatten().copied().collect())
    }

    // --------------------------------------------------------------------------------------------
    // Persistence
    // --------------------------------------------------------------------------------------------

    /// Serializes the levels as `"<lvl>[i1,i2,…]…"`.
    pub fn serialize(&self) -> Result<String, LevelsError> {
        let levels = self.coarse()?;
        let mut out = String::new();
        for (level, indices) in levels.iter().enumerate() {
            let joined = indices
                .iter()
                .map(u64::to_string)
                .collect::<Vec<_>>()
                .join(",");
            out.push_str(&format!("{level}[{joined}]"));
        }
        Ok(out)
    }

    /// Writes the state file into `dir`.
    pub fn save(&self, dir: &Path) -> Result<(), LevelsError> {
        let payload = self.serialize()?;
        let mut bytes = Vec::with_capacity(payload.len() + 12);
        bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());

        let mut hasher = Crc32::new();
        hasher.update(payload.as_bytes());
        bytes.extend_from_slice(&hasher.finalize().to_le_bytes());
        bytes.extend_from_slice(payload.as_bytes());

        std::fs::write(state_path(dir), bytes)?;
        Ok(())
    }

    /// Loads the state file from `dir`.
    ///
    /// An absent file is a fresh start. A present but unparseable file
    /// sets `data_lost` and starts empty — the engine keeps running.
    pub fn load(dir: &Path, max_levels: usize) -> LoadedLevels {
        let path = state_path(dir);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return LoadedLevels {
                    levels: vec![Vec::new(); max_levels.max(1)],
                    data_lost: false,
                };
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "level state unreadable");
                return LoadedLevels {
                    levels: vec![Vec::new(); max_levels.max(1)],
                    data_lost: true,
                };
            }
        };

        match parse_state(&bytes, max_levels) {
            Some(levels) => LoadedLevels {
                levels,
                data_lost: false,
            },
            None => {
                warn!(path = %path.display(), "level state corrupt, starting empty");
                LoadedLevels {
                    levels: vec![Vec::new(); max_levels.max(1)],
                    data_lost: true,
                }
            }
        }
    }

    fn coarse(&self) -> Result<std::sync::MutexGuard<'_, Vec<Vec<u64>>>, LevelsError> {
        self.levels
            .lock()
            .map_err(|_| LevelsError::Internal("levels mutex poisoned".into()))
    }
}

/// Path of the level-state file.
pub fn state_path(dir: &Path) -> PathBuf {
    dir.join(LEVEL_STATE_FILE)
}

fn parse_state(bytes: &[u8], max_levels: usize) -> Option<Vec<Vec<u64>>> {
    if bytes.len() < 12 {
        return None;
    }
    let payload_len = u64::from_le_bytes(bytes[0..8].try_into().ok()?) as usize;
    let stored_crc = u32::from_le_bytes(bytes[8..12].try_into().ok()?);
    let payload = bytes.get(12..12 + payload_len)?;

    let mut hasher = Crc32::new();
    hasher.update(payload);
    if hasher.finalize() != stored_crc {
        return None;
    }

    let text = std::str::from_utf8(payload).ok()?;
    let mut levels = vec![Vec::new(); max_levels.max(1)];

    let mut rest = text;
    let mut expected_level = 0usize;
    while !rest.is_empty() {
        let open = rest.find('[')?;
        let level: usize = rest[..open].parse().ok()?;
        if level != expected_level || level >= levels.len() {
            return None;
        }
        let close = rest.find(']')?;
        let inner = &rest[open + 1..close];
        if !inner.is_empty() {
            for token in inner.split(',') {
                levels[level].push(token.parse().ok()?);
            }
        }
        rest = &rest[close + 1..];
        expected_level += 1;
    }

    Some(levels)
}
