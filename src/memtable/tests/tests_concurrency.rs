use std::sync::Arc;
use std::thread;

use super::{all_kinds, config_of};
use crate::memtable::MemTable;
use crate::record::Record;

#[test]
fn concurrent_readers_and_writers() {
    for kind in all_kinds() {
        let table = Arc::new(MemTable::new(&config_of(kind, 4096)));

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for i in 0..100 {
                        table
                            .add(Record::put(format!("w{w}_k{i:03}"), vec![w as u8]))
                            .unwrap();
                    }
                })
            })
            .collect();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for i in 0..100 {
                        // Whatever is visible must be well-formed.
                        if let Some(record) = table.get(&format!("w0_k{i:03}")).unwrap() {
                            assert_eq!(record.value, vec![0u8]);
                        }
                    }
                })
            })
            .collect();

        for handle in writers.into_iter().chain(readers) {
            handle.join().unwrap();
        }

        assert_eq!(table.total_entries().unwrap(), 400, "{kind:?}");
        let records = table.retrieve_sorted_records().unwrap();
        assert!(records.windows(2).all(|w| w[0].key < w[1].key));
    }
}

#[test]
fn concurrent_updates_of_one_key_keep_one_entry() {
    for kind in all_kinds() {
        let table = Arc::new(MemTable::new(&config_of(kind, 64)));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for _ in 0..50 {
                        table.add(Record::put("hot", vec![t as u8])).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.total_entries().unwrap(), 1, "{kind:?}");
        assert!(table.get("hot").unwrap().is_some());
    }
}
