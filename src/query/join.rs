use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::debug;
use thiserror::Error;

use crate::common::types::{Entry, PageNum};
use crate::database::DatabaseError;
use crate::index::hash::HashTable;
use crate::index::{Index, IndexError};
use crate::query::bloom::{BloomFilter, DEFAULT_FILTER_SIZE};
use crate::storage::pager::{Pager, PagerError};

/// Capacity of the join's result channel.
const RESULT_CHANNEL_SIZE: usize = 1024;

/// Upper bound on probe worker threads.
const MAX_PROBE_WORKERS: usize = 8;

#[derive(Error, Debug)]
pub enum JoinError {
    #[error("join cancelled")]
    Cancelled,

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pager error: {0}")]
    Pager(#[from] PagerError),
}

/// A running grace hash join. Results stream out of `receiver`;
/// `wait` reaps the probe workers and surfaces the first error.
/// Temporary partition files are removed when the join is dropped.
pub struct Join {
    pub receiver: Receiver<(Entry, Entry)>,
    workers: Vec<thread::JoinHandle<Result<(), JoinError>>>,
    _scratch: ScratchDirs,
}

impl Join {
    /// Block until every probe worker finishes.
    pub fn wait(mut self) -> Result<(), JoinError> {
        for worker in self.workers.drain(..) {
            worker.join().expect("probe worker panicked")?;
        }
        Ok(())
    }

    /// Drain all results, then reap the workers.
    pub fn collect(self) -> Result<Vec<(Entry, Entry)>, JoinError> {
        let results: Vec<(Entry, Entry)> = self.receiver.clone().iter().collect();
        self.wait()?;
        Ok(results)
    }
}

struct ScratchDirs(Vec<PathBuf>);

impl Drop for ScratchDirs {
    fn drop(&mut self) {
        for dir in &self.0 {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}

/// Grace hash join of `left` against `right` on `key == key`.
///
/// Both inputs are partitioned into temporary hash indexes keyed by
/// the join column (`join_on_*_key` false joins on the value side,
/// storing entries flipped). The smaller directory is doubled until
/// both have the same global depth, then each distinct bucket pair is
/// probed by a pool of worker threads; a Bloom filter over the right
/// bucket's keys guards the inner loop. The cancel token aborts the
/// workers cooperatively.
pub fn grace_hash_join(
    left: &dyn Index,
    right: &dyn Index,
    join_on_left_key: bool,
    join_on_right_key: bool,
    cancel: Arc<AtomicBool>,
) -> Result<Join, JoinError> {
    let scratch_root = std::env::temp_dir().join(format!("ferndb-join-{}", uuid::Uuid::new_v4()));
    let scratch = ScratchDirs(vec![scratch_root.clone()]);
    std::fs::create_dir_all(&scratch_root)?;

    let left_index = build_partition_index(left, join_on_left_key, &scratch_root, "left")?;
    let right_index = build_partition_index(right, join_on_right_key, &scratch_root, "right")?;

    // Make both directories the same size so slot i of one lines up
    // with slot i of the other.
    while left_index.global_depth() != right_index.global_depth() {
        if left_index.global_depth() < right_index.global_depth() {
            left_index.extend_directory();
        } else {
            right_index.extend_directory();
        }
    }

    // Directory slots alias bucket pages, so probe each distinct
    // bucket pair once.
    let left_buckets = left_index.bucket_pns();
    let right_buckets = right_index.bucket_pns();
    let mut seen: HashSet<(PageNum, PageNum)> = HashSet::new();
    let mut pairs = Vec::new();
    for (lpn, rpn) in left_buckets.into_iter().zip(right_buckets) {
        if seen.insert((lpn, rpn)) {
            pairs.push((lpn, rpn));
        }
    }
    debug!("grace hash join: probing {} bucket pair(s)", pairs.len());

    let (result_tx, result_rx) = bounded(RESULT_CHANNEL_SIZE);
    let (work_tx, work_rx) = unbounded();
    for pair in pairs {
        work_tx.send(pair).expect("work queue open");
    }
    drop(work_tx);

    let worker_count = work_rx.len().clamp(1, MAX_PROBE_WORKERS);
    let mut workers = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let left_index = Arc::clone(&left_index);
        let right_index = Arc::clone(&right_index);
        let work_rx: Receiver<(PageNum, PageNum)> = work_rx.clone();
        let result_tx = result_tx.clone();
        let cancel = Arc::clone(&cancel);
        workers.push(thread::spawn(move || {
            while let Ok((lpn, rpn)) = work_rx.recv() {
                if cancel.load(Ordering::Relaxed) {
                    return Err(JoinError::Cancelled);
                }
                probe_buckets(
                    &left_index,
                    &right_index,
                    lpn,
                    rpn,
                    join_on_left_key,
                    join_on_right_key,
                    &result_tx,
                    &cancel,
                )?;
            }
            Ok(())
        }));
    }
    drop(result_tx);

    Ok(Join { receiver: result_rx, workers, _scratch: scratch })
}

/// Partition one input into a temporary hash index keyed by the join
/// column.
fn build_partition_index(
    source: &dyn Index,
    on_key: bool,
    scratch: &Path,
    name: &str,
) -> Result<Arc<HashTable>, JoinError> {
    let pager = Pager::open(scratch.join(format!("{}.db", name)))?;
    let table = HashTable::create(name, pager, &scratch.join(format!("{}.meta", name)))?;
    for entry in source.select()? {
        let (key, value) = if on_key { (entry.key, entry.value) } else { (entry.value, entry.key) };
        table.insert(key, value)?;
    }
    Ok(Arc::new(table))
}

/// Emit every matching pair between one left bucket and one right
/// bucket.
#[allow(clippy::too_many_arguments)]
fn probe_buckets(
    left: &HashTable,
    right: &HashTable,
    left_pn: PageNum,
    right_pn: PageNum,
    join_on_left_key: bool,
    join_on_right_key: bool,
    results: &Sender<(Entry, Entry)>,
    cancel: &AtomicBool,
) -> Result<(), JoinError> {
    let (_, left_entries) = left.bucket_entries(left_pn)?;
    let (_, right_entries) = right.bucket_entries(right_pn)?;

    let mut filter = BloomFilter::new(DEFAULT_FILTER_SIZE);
    for entry in &right_entries {
        filter.insert(entry.key);
    }

    for left_entry in &left_entries {
        if !filter.contains(left_entry.key) {
            continue;
        }
        for right_entry in &right_entries {
            if left_entry.key != right_entry.key {
                continue;
            }
            let pair = (
                orient(*left_entry, join_on_left_key),
                orient(*right_entry, join_on_right_key),
            );
            send_result(results, cancel, pair)?;
        }
    }
    Ok(())
}

/// Entries in a partition index store the join column as the key;
/// flip value-joined entries back to their original orientation.
fn orient(entry: Entry, joined_on_key: bool) -> Entry {
    if joined_on_key {
        entry
    } else {
        Entry::new(entry.value, entry.key)
    }
}

/// Send one result, backing off while the channel is full so a
/// cancellation is still noticed.
fn send_result(
    results: &Sender<(Entry, Entry)>,
    cancel: &AtomicBool,
    pair: (Entry, Entry),
) -> Result<(), JoinError> {
    let mut pair = pair;
    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(JoinError::Cancelled);
        }
        match results.send_timeout(pair, Duration::from_millis(20)) {
            Ok(()) => return Ok(()),
            Err(crossbeam_channel::SendTimeoutError::Timeout(p)) => pair = p,
            Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => {
                return Err(JoinError::Cancelled)
            }
        }
    }
}
