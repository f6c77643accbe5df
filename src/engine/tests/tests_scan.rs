use tempfile::TempDir;

use super::{memtable_only_config, open};
use crate::record::Record;

fn seeded_engine(tmp: &TempDir) -> crate::engine::Engine {
    let engine = open(tmp.path(), memtable_only_config());
    for key in [
        "a_test",
        "admin_001",
        "admin_003",
        "admin_007",
        "user_001",
        "user_005",
    ] {
        engine.put(key, key.as_bytes().to_vec()).unwrap();
    }
    engine
}

fn keys_of(records: &[Record]) -> Vec<&str> {
    records.iter().map(|r| r.key.as_str()).collect()
}

#[test]
fn prefix_iteration_over_memtable() {
    let tmp = TempDir::new().unwrap();
    let engine = seeded_engine(&tmp);

    let records: Vec<Record> = engine
        .prefix_iterate("user")
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(keys_of(&records), ["user_001", "user_005"]);
    engine.close().unwrap();
}

#[test]
fn prefix_iteration_over_sstables() {
    let tmp = TempDir::new().unwrap();
    let engine = seeded_engine(&tmp);
    engine.flush_all().unwrap();

    let records: Vec<Record> = engine
        .prefix_iterate("admin")
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(keys_of(&records), ["admin_001", "admin_003", "admin_007"]);

    // Stepping manually from a cursor matches the iterator.
    let first = engine.next_for_prefix("user", Some("user")).unwrap().unwrap();
    assert_eq!(first.key, "user_001");
    let second = engine.next_for_prefix("user", Some("user_001")).unwrap().unwrap();
    assert_eq!(second.key, "user_005");
    assert!(engine.next_for_prefix("user", Some("user_005")).unwrap().is_none());
    engine.close().unwrap();
}

#[test]
fn range_iteration_is_inclusive() {
    let tmp = TempDir::new().unwrap();
    let engine = open(tmp.path(), memtable_only_config());
    for i in 0..10 {
        engine
            .put(format!("user_{i:03}"), format!("v{i}").into_bytes())
            .unwrap();
    }
    engine.flush_all().unwrap();

    let records: Vec<Record> = engine
        .range_iterate("user_005", "user_020")
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(
        keys_of(&records),
        ["user_005", "user_006", "user_007", "user_008", "user_009"]
    );

    // From a cursor at the range start, only strictly-greater keys come
    // back, and the end bound stays inclusive.
    let next = engine
        .next_for_range("user_005", "user_007", Some("user_005"))
        .unwrap()
        .unwrap();
    assert_eq!(next.key, "user_006");
    let last = engine
        .next_for_range("user_005", "user_007", Some("user_006"))
        .unwrap()
        .unwrap();
    assert_eq!(last.key, "user_007");
    assert!(
        engine
            .next_for_range("user_005", "user_007", Some("user_007"))
            .unwrap()
            .is_none()
    );
    engine.close().unwrap();
}

#[test]
fn newest_version_wins_across_layers() {
    let tmp = TempDir::new().unwrap();
    let engine = open(tmp.path(), memtable_only_config());

    engine.put("dup", b"old".to_vec()).unwrap();
    engine.put("other", b"x".to_vec()).unwrap();
    engine.flush_all().unwrap();
    engine.put("dup", b"new".to_vec()).unwrap();

    let records: Vec<Record> = engine
        .prefix_iterate("")
        .collect::<Result<_, _>>()
        .unwrap();
    let dup = records.iter().find(|r| r.key == "dup").unwrap();
    assert_eq!(dup.value, b"new");
    engine.close().unwrap();
}

#[test]
fn deleted_keys_vanish_from_iteration() {
    let tmp = TempDir::new().unwrap();
    let engine = open(tmp.path(), memtable_only_config());

    for i in 0..6 {
        engine.put(format!("it_{i}"), vec![i as u8]).unwrap();
    }
    engine.flush_all().unwrap();
    engine.delete("it_2").unwrap();
    engine.delete("it_4").unwrap();

    let records: Vec<Record> = engine
        .prefix_iterate("it_")
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(keys_of(&records), ["it_0", "it_1", "it_3", "it_5"]);

    // The tombstones also hold once flushed into their own table.
    engine.flush_all().unwrap();
    let records: Vec<Record> = engine
        .prefix_iterate("it_")
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(keys_of(&records), ["it_0", "it_1", "it_3", "it_5"]);
    engine.close().unwrap();
}

#[test]
fn paginated_prefix_scan() {
    let tmp = TempDir::new().unwrap();
    let engine = open(tmp.path(), memtable_only_config());
    for i in 0..25 {
        engine.put(format!("pg_{i:02}"), vec![i as u8]).unwrap();
    }
    engine.flush_all().unwrap();

    let page0 = engine.prefix_scan("pg_", 10, 0).unwrap();
    assert_eq!(page0.len(), 10);
    assert_eq!(page0[0].key, "pg_00");
    assert_eq!(page0[9].key, "pg_09");

    let page2 = engine.prefix_scan("pg_", 10, 2).unwrap();
    assert_eq!(keys_of(&page2), ["pg_20", "pg_21", "pg_22", "pg_23", "pg_24"]);

    assert!(engine.prefix_scan("pg_", 10, 3).unwrap().is_empty());
    assert!(engine.prefix_scan("pg_", 0, 0).unwrap().is_empty());
    engine.close().unwrap();
}

#[test]
fn paginated_scan_prefers_newest_version() {
    let tmp = TempDir::new().unwrap();
    let engine = open(tmp.path(), memtable_only_config());

    engine.put("s_1", b"old".to_vec()).unwrap();
    engine.put("s_2", b"keep".to_vec()).unwrap();
    engine.put("s_3", b"drop".to_vec()).unwrap();
    engine.flush_all().unwrap();

    engine.put("s_1", b"new".to_vec()).unwrap();
    engine.delete("s_3").unwrap();

    let records = engine.prefix_scan("s_", 10, 0).unwrap();
    assert_eq!(keys_of(&records), ["s_1", "s_2"]);
    assert_eq!(records[0].value, b"new");
    engine.close().unwrap();
}

#[test]
fn range_scan_pages_inclusively() {
    let tmp = TempDir::new().unwrap();
    let engine = open(tmp.path(), memtable_only_config());
    for i in 0..10 {
        engine.put(format!("rs_{i}"), vec![i as u8]).unwrap();
    }

    let records = engine.range_scan("rs_2", "rs_6", 3, 0).unwrap();
    assert_eq!(keys_of(&records), ["rs_2", "rs_3", "rs_4"]);
    let records = engine.range_scan("rs_2", "rs_6", 3, 1).unwrap();
    assert_eq!(keys_of(&records), ["rs_5", "rs_6"]);
    engine.close().unwrap();
}
