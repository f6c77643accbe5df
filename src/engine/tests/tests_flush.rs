use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, RwLock};

use tempfile::TempDir;

use super::{init_tracing, open, small_memtable_config};
use crate::engine::flush::{FlushContext, FlushPool};
use crate::engine::levels::LevelSet;
use crate::engine::{EngineConfig, MemtableSet, SealedTable};
use crate::memtable::{MemTable, MemtableConfig};
use crate::record::Record;
use crate::sstable::SstableOptions;
use crate::wal::{Wal, list_segments};

fn sealed_memtable(keys: &[&str]) -> Arc<MemTable> {
    let table = MemTable::new(&MemtableConfig {
        capacity: keys.len().max(1),
        ..MemtableConfig::default()
    });
    for key in keys {
        table.add(Record::put(*key, key.as_bytes().to_vec())).unwrap();
    }
    Arc::new(table)
}

fn pool_fixture(dir: &std::path::Path) -> (FlushContext, Arc<LevelSet>, Arc<Wal>, Arc<RwLock<MemtableSet>>) {
    let levels = Arc::new(LevelSet::new(4));
    let wal = Arc::new(Wal::open(dir, None).unwrap());
    let tables = Arc::new(RwLock::new(MemtableSet {
        active: sealed_memtable(&[]),
        sealed: Vec::new(),
    }));
    let ctx = FlushContext {
        dir: dir.to_path_buf(),
        options: SstableOptions {
            block_size: 256,
            ..SstableOptions::default()
        },
        levels: Arc::clone(&levels),
        wal: Arc::clone(&wal),
        tables: Arc::clone(&tables),
        compaction_lock: Arc::new(Mutex::new(())),
        next_index: Arc::new(AtomicU64::new(100)),
        max_tables_per_level: 1024,
    };
    (ctx, levels, wal, tables)
}

fn wait_drained(pool: &FlushPool) {
    while pool.pending() > 0 {
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
}

#[test]
fn pool_commits_level_zero_in_submission_order() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let (ctx, levels, _wal, _tables) = pool_fixture(tmp.path());

    // 4 workers flush in parallel; commits must still land 10,11,12,13.
    let pool = FlushPool::start(4, ctx);
    for position in 0..4u64 {
        let keys: Vec<String> = (0..20).map(|i| format!("p{position}_k{i:02}")).collect();
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let table = sealed_memtable(&key_refs);
        assert!(pool.submit(table, 10 + position, 0));
    }

    wait_drained(&pool);
    pool.stop();

    assert_eq!(levels.tables_at(0).unwrap(), vec![10, 11, 12, 13]);
}

#[test]
fn pool_reclaims_wal_segments_below_watermarks() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let (ctx, levels, wal, _tables) = pool_fixture(tmp.path());

    // Segments 1..=4 exist; 4 is active.
    wal.append(&Record::put("a", b"1".to_vec())).unwrap();
    wal.rotate().unwrap();
    wal.append(&Record::put("b", b"2".to_vec())).unwrap();
    wal.rotate().unwrap();
    wal.append(&Record::put("c", b"3".to_vec())).unwrap();
    wal.rotate().unwrap();

    let pool = FlushPool::start(2, ctx);
    // Watermarks mirror the engine: each sealed memtable may reclaim
    // everything below the segment that followed it.
    pool.submit(sealed_memtable(&["a"]), 10, 2);
    pool.submit(sealed_memtable(&["b"]), 11, 3);
    pool.submit(sealed_memtable(&["c"]), 12, 4);

    wait_drained(&pool);
    pool.stop();

    assert_eq!(levels.tables_at(0).unwrap(), vec![10, 11, 12]);
    let seqs: Vec<u64> = list_segments(tmp.path()).unwrap().iter().map(|(s, _)| *s).collect();
    assert_eq!(seqs, vec![4], "only the active segment survives");
}

#[test]
fn pool_commit_retires_sealed_memtables() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let (ctx, _levels, _wal, tables) = pool_fixture(tmp.path());

    let table = sealed_memtable(&["x", "y"]);
    tables.write().unwrap().sealed.push(SealedTable {
        table: Arc::clone(&table),
        watermark: 0,
        queued: true,
    });

    let pool = FlushPool::start(1, ctx);
    pool.submit(table, 10, 0);
    wait_drained(&pool);
    pool.stop();

    assert!(tables.read().unwrap().sealed.is_empty());
}

#[test]
fn engine_schedules_pool_flushes_at_max_memtables() {
    let tmp = TempDir::new().unwrap();
    let engine = open(tmp.path(), small_memtable_config());

    // Capacity 4, max 4 memtables: 16 distinct keys guarantee the
    // schedule threshold is crossed at least once.
    for i in 0..16 {
        engine.put(format!("key_{i:02}"), vec![i as u8]).unwrap();
    }
    engine.wait_for_flushes().unwrap();

    let levels = engine.level_snapshot().unwrap();
    assert!(!levels[0].is_empty(), "pool should have committed to L0");
    // Level 0 preserves submission (age) order: ascending indices.
    assert!(levels[0].windows(2).all(|w| w[0] < w[1]));

    // Every key still reads back.
    for i in 0..16 {
        assert_eq!(
            engine.get(format!("key_{i:02}")).unwrap(),
            Some(vec![i as u8]),
            "key_{i:02}"
        );
    }
    engine.close().unwrap();
}

#[test]
fn compaction_triggers_when_a_level_overflows() {
    let tmp = TempDir::new().unwrap();
    let config = EngineConfig {
        max_tables_per_level: 2,
        ..super::memtable_only_config()
    };
    let engine = open(tmp.path(), config);

    // Three flush cycles put three tables in level 0 — over the
    // threshold of 2 — so flush_all's compaction pass folds them into
    // level 1.
    for round in 0..3 {
        for i in 0..8 {
            engine
                .put(format!("r{round}_k{i}"), vec![round as u8, i as u8])
                .unwrap();
        }
        engine.flush_all().unwrap();
    }

    let levels = engine.level_snapshot().unwrap();
    assert!(levels[0].len() <= 2);
    assert_eq!(levels[1].len(), 1);

    for round in 0..3 {
        for i in 0..8 {
            assert_eq!(
                engine.get(format!("r{round}_k{i}")).unwrap(),
                Some(vec![round as u8, i as u8])
            );
        }
    }
    engine.close().unwrap();
}

#[test]
fn compaction_applies_newest_wins_and_drops_tombstones() {
    let tmp = TempDir::new().unwrap();
    let config = EngineConfig {
        max_tables_per_level: 1,
        ..super::memtable_only_config()
    };
    let engine = open(tmp.path(), config);

    engine.put("shared", b"old".to_vec()).unwrap();
    engine.put("stale", b"bye".to_vec()).unwrap();
    engine.flush_all().unwrap();

    engine.put("shared", b"new".to_vec()).unwrap();
    engine.delete("stale").unwrap();
    engine.flush_all().unwrap();

    // Threshold 1 forces the two L0 tables through compaction.
    assert_eq!(engine.get("shared").unwrap(), Some(b"new".to_vec()));
    assert_eq!(engine.get("stale").unwrap(), None);

    let levels = engine.level_snapshot().unwrap();
    assert!(levels[0].len() <= 1);
    engine.close().unwrap();
}
