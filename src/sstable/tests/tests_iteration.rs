use std::collections::{BTreeMap, HashSet};

use super::{BLOCK, options, persist, scratch};
use crate::record::Record;
use crate::sstable::SsTable;

fn keyed(keys: &[&str]) -> Vec<Record> {
    keys.iter()
        .enumerate()
        .map(|(i, k)| Record::with_timestamp(*k, k.as_bytes().to_vec(), 100 + i as u64, false))
        .collect()
}

fn mixed_table(dir: &std::path::Path) -> SsTable {
    let records = keyed(&[
        "a_test",
        "admin_001",
        "admin_003",
        "admin_007",
        "user_001",
        "user_005",
    ]);
    persist(&records, 1, &options(), dir);
    SsTable::open(dir, 1, BLOCK).unwrap()
}

#[test]
fn prefix_iteration_yields_matching_keys_in_order() {
    let tmp = scratch();
    let table = mixed_table(tmp.path());

    let mut tombstoned = HashSet::new();
    let mut current = Some("user".to_string());
    let mut seen = Vec::new();
    while let Some(record) = table
        .get_next_for_prefix("user", current.as_deref(), &mut tombstoned)
        .unwrap()
    {
        seen.push(record.key.clone());
        current = Some(record.key);
    }
    assert_eq!(seen, ["user_001", "user_005"]);
}

#[test]
fn prefix_iteration_from_none_starts_at_first_match() {
    let tmp = scratch();
    let table = mixed_table(tmp.path());

    let mut tombstoned = HashSet::new();
    let first = table
        .get_next_for_prefix("admin", None, &mut tombstoned)
        .unwrap()
        .unwrap();
    assert_eq!(first.key, "admin_001");

    let none = table
        .get_next_for_prefix("nothing", None, &mut tombstoned)
        .unwrap();
    assert!(none.is_none());
}

#[test]
fn prefix_iteration_consumes_tombstones() {
    let tmp = scratch();
    let mut records = keyed(&["p_1", "p_2", "p_3", "p_4"]);
    records[1].tombstone = true;
    records[1].value.clear();
    persist(&records, 2, &options(), tmp.path());
    let table = SsTable::open(tmp.path(), 2, BLOCK).unwrap();

    let mut tombstoned = HashSet::new();
    let mut seen = Vec::new();
    let mut current: Option<String> = None;
    while let Some(record) = table
        .get_next_for_prefix("p_", current.as_deref(), &mut tombstoned)
        .unwrap()
    {
        seen.push(record.key.clone());
        current = Some(record.key);
    }
    assert_eq!(seen, ["p_1", "p_3", "p_4"]);
    assert!(tombstoned.contains("p_2"));
}

#[test]
fn prefix_iteration_skips_caller_tombstoned_keys() {
    let tmp = scratch();
    let table = mixed_table(tmp.path());

    let mut tombstoned: HashSet<String> = ["admin_001".to_string()].into();
    let first = table
        .get_next_for_prefix("admin", None, &mut tombstoned)
        .unwrap()
        .unwrap();
    assert_eq!(first.key, "admin_003");
}

#[test]
fn range_iteration_is_inclusive_at_both_ends() {
    let tmp = scratch();
    let records = keyed(&[
        "user_000", "user_001", "user_002", "user_003", "user_004", "user_005", "user_006",
        "user_007", "user_008", "user_009",
    ]);
    persist(&records, 3, &options(), tmp.path());
    let table = SsTable::open(tmp.path(), 3, BLOCK).unwrap();

    let mut tombstoned = HashSet::new();
    let mut current = Some("user_005".to_string());
    let mut seen = Vec::new();
    while let Some(record) = table
        .get_next_for_range("user_005", "user_020", current.as_deref(), &mut tombstoned)
        .unwrap()
    {
        seen.push(record.key.clone());
        current = Some(record.key);
    }
    // Strictly after the cursor, inclusive at the range end.
    assert_eq!(seen, ["user_006", "user_007", "user_008", "user_009"]);

    // Starting fresh, the inclusive start bound itself is yielded.
    let mut tombstoned = HashSet::new();
    let first = table
        .get_next_for_range("user_003", "user_004", None, &mut tombstoned)
        .unwrap()
        .unwrap();
    assert_eq!(first.key, "user_003");
    let second = table
        .get_next_for_range("user_003", "user_004", Some("user_003"), &mut tombstoned)
        .unwrap()
        .unwrap();
    assert_eq!(second.key, "user_004");
    assert!(
        table
            .get_next_for_range("user_003", "user_004", Some("user_004"), &mut tombstoned)
            .unwrap()
            .is_none()
    );
}

#[test]
fn scan_for_prefix_fills_accumulators() {
    let tmp = scratch();
    let mut records = keyed(&["q_1", "q_2", "q_3", "zz"]);
    records[2].tombstone = true;
    records[2].value.clear();
    persist(&records, 4, &options(), tmp.path());
    let table = SsTable::open(tmp.path(), 4, BLOCK).unwrap();

    let mut tombstoned = HashSet::new();
    let mut collected = BTreeMap::new();
    table
        .scan_for_prefix("q_", &mut tombstoned, &mut collected)
        .unwrap();

    let keys: Vec<&str> = collected.keys().map(String::as_str).collect();
    assert_eq!(keys, ["q_1", "q_2"]);
    assert!(tombstoned.contains("q_3"));
    assert!(!collected.contains_key("zz"));
}

#[test]
fn scan_for_prefix_respects_prior_claims() {
    let tmp = scratch();
    persist(&keyed(&["q_1", "q_2"]), 5, &options(), tmp.path());
    let table = SsTable::open(tmp.path(), 5, BLOCK).unwrap();

    // A newer table already claimed q_1 (live) and q_2 (tombstoned).
    let mut tombstoned: HashSet<String> = ["q_2".to_string()].into();
    let mut collected = BTreeMap::new();
    collected.insert(
        "q_1".to_string(),
        Record::with_timestamp("q_1", b"newer".to_vec(), 999, false),
    );

    table
        .scan_for_prefix("q_", &mut tombstoned, &mut collected)
        .unwrap();

    assert_eq!(collected.len(), 1);
    assert_eq!(collected["q_1"].value, b"newer");
}

#[test]
fn scan_for_range_inclusive_bounds() {
    let tmp = scratch();
    persist(
        &keyed(&["k_1", "k_2", "k_3", "k_4", "k_5"]),
        6,
        &options(),
        tmp.path(),
    );
    let table = SsTable::open(tmp.path(), 6, BLOCK).unwrap();

    let mut tombstoned = HashSet::new();
    let mut collected = BTreeMap::new();
    table
        .scan_for_range("k_2", "k_4", &mut tombstoned, &mut collected)
        .unwrap();

    let keys: Vec<&str> = collected.keys().map(String::as_str).collect();
    assert_eq!(keys, ["k_2", "k_3", "k_4"]);
}
