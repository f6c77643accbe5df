use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;

use tempfile::TempDir;

use super::*;

fn rec(key: &str, value: &[u8]) -> Record {
    Record::put(key, value.to_vec())
}

#[test]
fn append_and_replay_round_trip() {
    let tmp = TempDir::new().unwrap();
    let wal = Wal::open(tmp.path(), None).unwrap();

    wal.append(&rec("a", b"1")).unwrap();
    wal.append(&rec("b", b"2")).unwrap();
    wal.append(&Record::tombstone("a")).unwrap();

    let replayed = replay(tmp.path(), DEFAULT_MAX_RECORD_SIZE).unwrap();
    assert_eq!(replayed.len(), 3);
    assert_eq!(replayed[0].record.key, "a");
    assert_eq!(replayed[1].record.value, b"2");
    assert!(replayed[2].record.tombstone);
    assert!(replayed.iter().all(|r| r.segment_seq == 1));
}

#[test]
fn reopen_continues_highest_segment() {
    let tmp = TempDir::new().unwrap();
    {
        let wal = Wal::open(tmp.path(), None).unwrap();
        wal.append(&rec("before", b"x")).unwrap();
        wal.rotate().unwrap();
        wal.append(&rec("after", b"y")).unwrap();
    }

    let wal = Wal::open(tmp.path(), None).unwrap();
    assert_eq!(wal.current_seq().unwrap(), 2);
    wal.append(&rec("more", b"z")).unwrap();

    let replayed = replay(tmp.path(), DEFAULT_MAX_RECORD_SIZE).unwrap();
    let keys: Vec<&str> = replayed.iter().map(|r| r.record.key.as_str()).collect();
    assert_eq!(keys, ["before", "after", "more"]);
    assert_eq!(replayed[1].segment_seq, 2);
}

#[test]
fn rotation_creates_sequenced_segments() {
    let tmp = TempDir::new().unwrap();
    let wal = Wal::open(tmp.path(), None).unwrap();
    assert_eq!(wal.current_seq().unwrap(), 1);

    assert_eq!(wal.rotate().unwrap(), 2);
    assert_eq!(wal.rotate().unwrap(), 3);

    let segments = list_segments(tmp.path()).unwrap();
    let seqs: Vec<u64> = segments.iter().map(|(s, _)| *s).collect();
    assert_eq!(seqs, [1, 2, 3]);
}

#[test]
fn delete_old_logs_respects_watermark_and_active_segment() {
    let tmp = TempDir::new().unwrap();
    let wal = Wal::open(tmp.path(), None).unwrap();
    wal.append(&rec("one", b"1")).unwrap();
    wal.rotate().unwrap();
    wal.append(&rec("two", b"2")).unwrap();
    wal.rotate().unwrap();
    wal.append(&rec("three", b"3")).unwrap();

    // Watermark 3: segments 1 and 2 go, the active segment 3 stays.
    wal.delete_old_logs(3).unwrap();
    let seqs: Vec<u64> = list_segments(tmp.path()).unwrap().iter().map(|(s, _)| *s).collect();
    assert_eq!(seqs, [3]);

    // A watermark past the active segment still keeps it.
    wal.delete_old_logs(10).unwrap();
    assert_eq!(list_segments(tmp.path()).unwrap().len(), 1);
}

#[test]
fn oversized_records_are_rejected() {
    let tmp = TempDir::new().unwrap();
    let wal = Wal::open(tmp.path(), Some(64)).unwrap();
    let err = wal.append(&rec("big", &[0u8; 256])).unwrap_err();
    assert!(matches!(err, WalError::RecordTooLarge(_)));

    // Nothing was written; replay sees an empty log.
    assert!(replay(tmp.path(), 64).unwrap().is_empty());
}

#[test]
fn torn_tail_stops_replay_cleanly() {
    let tmp = TempDir::new().unwrap();
    let wal = Wal::open(tmp.path(), None).unwrap();
    wal.append(&rec("good", b"1")).unwrap();
    wal.append(&rec("torn", b"2")).unwrap();

    // Truncate the last record mid-payload.
    let path = segment_path(tmp.path(), 1);
    let len = std::fs::metadata(&path).unwrap().len();
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - 5).unwrap();

    let replayed = replay(tmp.path(), DEFAULT_MAX_RECORD_SIZE).unwrap();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].record.key, "good");
}

#[test]
fn corrupt_record_stops_its_segment_but_not_later_ones() {
    let tmp = TempDir::new().unwrap();
    let wal = Wal::open(tmp.path(), None).unwrap();
    wal.append(&rec("seg1", b"1")).unwrap();
    wal.rotate().unwrap();
    wal.append(&rec("seg2", b"2")).unwrap();

    // Flip a payload byte in segment 1's record.
    let path = segment_path(tmp.path(), 1);
    let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
    let mut byte = [0u8; 1];
    let target = HEADER_DISK_SIZE + 8;
    file.read_exact_at(&mut byte, target).unwrap();
    byte[0] ^= 0xFF;
    file.write_all_at(&byte, target).unwrap();

    let replayed = replay(tmp.path(), DEFAULT_MAX_RECORD_SIZE).unwrap();
    let keys: Vec<&str> = replayed.iter().map(|r| r.record.key.as_str()).collect();
    assert_eq!(keys, ["seg2"]);
}

#[test]
fn bad_header_segment_is_skipped() {
    let tmp = TempDir::new().unwrap();
    let wal = Wal::open(tmp.path(), None).unwrap();
    wal.append(&rec("keep", b"1")).unwrap();

    // Fabricate a garbage segment 2.
    std::fs::write(segment_path(tmp.path(), 2), b"not a wal segment").unwrap();

    let replayed = replay(tmp.path(), DEFAULT_MAX_RECORD_SIZE).unwrap();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].record.key, "keep");
}
