//! Concurrent memtable flushing.
//!
//! [`FlushPool`] is a fixed-size worker pool fed over a crossbeam
//! channel. Workers persist sealed memtables to SSTables independently
//! and in parallel; a single **collector** thread reassembles their
//! results in submission order through a position-keyed reorder buffer,
//! so level 0 always receives tables oldest-first even when a newer
//! memtable finishes flushing earlier.
//!
//! A successful commit, in order:
//!
//! 1. appends the new table index to level 0 (`level_locks[0] → levels`);
//! 2. persists the level state;
//! 3. reclaims WAL segments below the job's watermark;
//! 4. drops the sealed memtable from the read path — the data is now
//!    served from level 0;
//! 5. triggers the compaction policy (skipped if one is already running).
//!
//! A failed flush leaves its memtable sealed and readable, keeps its WAL
//! segments, marks it schedulable again, and does **not** block later
//! positions from committing.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use crossbeam::channel::{Receiver, Sender, unbounded};
use tracing::{debug, error, info, warn};

use crate::compaction::maybe_compact;
use crate::memtable::{MemTable, MemtableError};
use crate::sstable::SstableOptions;
use crate::wal::Wal;

use super::MemtableSet;
use super::levels::LevelSet;

/// Everything a flush commit needs, shared with the collector thread.
pub(crate) struct FlushContext {
    pub dir: PathBuf,
    pub options: SstableOptions,
    pub levels: Arc<LevelSet>,
    pub wal: Arc<Wal>,
    pub tables: Arc<RwLock<MemtableSet>>,
    pub compaction_lock: Arc<Mutex<()>>,
    pub next_index: Arc<AtomicU64>,
    pub max_tables_per_level: usize,
}

struct FlushJob {
    position: u64,
    sstable_index: u64,
    table: Arc<MemTable>,
    watermark: u64,
}

struct FlushOutcome {
    position: u64,
    sstable_index: u64,
    table: Arc<MemTable>,
    watermark: u64,
    result: Result<(), MemtableError>,
}

/// Bounded worker pool with in-order level-0 commit.
pub(crate) struct FlushPool {
    job_tx: Option<Sender<FlushJob>>,
    workers: Vec<JoinHandle<()>>,
    collector: Option<JoinHandle<()>>,
    next_position: AtomicU64,
    pending: Arc<AtomicUsize>,
}

impl FlushPool {
    /// Spawns `worker_count` flush workers and the collector.
    pub(crate) fn start(worker_count: usize, ctx: FlushContext) -> Self {
        let (job_tx, job_rx) = unbounded::<FlushJob>();
        let (out_tx, out_rx) = unbounded::<FlushOutcome>();
        let pending = Arc::new(AtomicUsize::new(0));

        let workers = (0..worker_count.max(1))
            .map(|worker| {
                let job_rx: Receiver<FlushJob> = job_rx.clone();
                let out_tx = out_tx.clone();
                let dir = ctx.dir.clone();
                let options = ctx.options;
                std::thread::Builder::new()
                    .name(format!("flush-worker-{worker}"))
                    .spawn(move || worker_loop(worker, job_rx, out_tx, dir, options))
                    .expect("spawn flush worker")
            })
            .collect();
        // Workers hold the only senders now; the channel closes when the
        // last worker exits.
        drop(out_tx);

        let pending_for_collector = Arc::clone(&pending);
        let collector = std::thread::Builder::new()
            .name("flush-collector".into())
            .spawn(move || collector_loop(ctx, out_rx, pending_for_collector))
            .expect("spawn flush collector");

        Self {
            job_tx: Some(job_tx),
            workers,
            collector: Some(collector),
            next_position: AtomicU64::new(0),
            pending,
        }
    }

    /// Enqueues one memtable flush. Returns `false` if the pool has been
    /// stopped.
    pub(crate) fn submit(&self, table: Arc<MemTable>, sstable_index: u64, watermark: u64) -> bool {
        let Some(tx) = &self.job_tx else {
            return false;
        };
        let position = self.next_position.fetch_add(1, Ordering::SeqCst);
        self.pending.fetch_add(1, Ordering::SeqCst);
        debug!(position, sstable_index, watermark, "flush scheduled");
        let sent = tx
            .send(FlushJob {
                position,
                sstable_index,
                table,
                watermark,
            })
            .is_ok();
        if !sent {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        sent
    }

    /// Jobs submitted but not yet fully committed.
    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Closes the job channel and joins every worker and the collector;
    /// all in-flight flushes complete first.
    pub(crate) fn stop(mut self) {
        self.job_tx.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("flush worker panicked");
            }
        }
        if let Some(collector) = self.collector.take() {
            if collector.join().is_err() {
                error!("flush collector panicked");
            }
        }
    }
}

fn worker_loop(
    worker: usize,
    job_rx: Receiver<FlushJob>,
    out_tx: Sender<FlushOutcome>,
    dir: PathBuf,
    options: SstableOptions,
) {
    while let Ok(job) = job_rx.recv() {
        debug!(worker, position = job.position, index = job.sstable_index, "flush started");
        // Persist without clearing: the memtable stays readable until
        // the collector commits the table to level 0.
        let result = job.table.persist(job.sstable_index, &options, &dir);
        let outcome = FlushOutcome {
            position: job.position,
            sstable_index: job.sstable_index,
            table: job.table,
            watermark: job.watermark,
            result,
        };
        if out_tx.send(outcome).is_err() {
            return;
        }
    }
}

fn collector_loop(ctx: FlushContext, out_rx: Receiver<FlushOutcome>, pending: Arc<AtomicUsize>) {
    let mut reorder: BTreeMap<u64, FlushOutcome> = BTreeMap::new();
    let mut next_position = 0u64;

    while let Ok(outcome) = out_rx.recv() {
        reorder.insert(outcome.position, outcome);
        while let Some(ready) = reorder.remove(&next_position) {
            commit(&ctx, ready);
            pending.fetch_sub(1, Ordering::SeqCst);
            next_position += 1;
        }
    }
}

fn commit(ctx: &FlushContext, outcome: FlushOutcome) {
    match outcome.result {
        Ok(()) => {
            if let Err(err) = ctx.levels.append_to_level(0, outcome.sstable_index) {
                error!(index = outcome.sstable_index, error = %err, "level-0 append failed");
                requeueable(ctx, &outcome.table);
                return;
            }
            if let Err(err) = ctx.levels.save(&ctx.dir) {
                warn!(error = %err, "level state save failed");
            }
            if let Err(err) = ctx.wal.delete_old_logs(outcome.watermark) {
                warn!(watermark = outcome.watermark, error = %err, "WAL reclamation failed");
            }

            // The table is durable and visible in level 0; retire the
            // memtable from the read path.
            if let Ok(mut set) = ctx.tables.write() {
                set.sealed
                    .retain(|entry| !Arc::ptr_eq(&entry.table, &outcome.table));
            }
            info!(
                index = outcome.sstable_index,
                position = outcome.position,
                "flush committed to level 0"
            );

            // Compactions piggyback on flush commits; skip when one is
            // already running.
            if let Ok(_guard) = ctx.compaction_lock.try_lock() {
                match maybe_compact(
                    &ctx.levels,
                    &ctx.dir,
                    &ctx.options,
                    ctx.max_tables_per_level,
                    &ctx.next_index,
                ) {
                    Ok(0) => {}
                    Ok(count) => debug!(count, "compactions performed after flush"),
                    Err(err) => error!(error = %err, "compaction after flush failed"),
                }
            }
        }
        Err(err) => {
            // Keep the memtable sealed and readable, keep its WAL
            // segments, and let a later schedule retry it.
            error!(
                index = outcome.sstable_index,
                position = outcome.position,
                error = %err,
                "flush failed; position left uncommitted"
            );
            requeueable(ctx, &outcome.table);
        }
    }
}

fn requeueable(ctx: &FlushContext, table: &Arc<MemTable>) {
    if let Ok(mut set) = ctx.tables.write() {
        for entry in set.sealed.iter_mut() {
            if Arc::ptr_eq(&entry.table, table) {
                entry.queued = false;
            }
        }
    }
}
