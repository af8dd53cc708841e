use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::error::{Error, ErrorKind, Result};

/// Record type storable in an external-sort run.
pub trait RunRecord: Ord + Serialize + DeserializeOwned + Send + 'static {}

impl<T: Ord + Serialize + DeserializeOwned + Send + 'static> RunRecord for T {}

struct SortedRun {
    seq: u64,
    file: File,
    count: u64,
}

type ErrorSlot = Arc<Mutex<Option<Error>>>;

/// External-merge-sort buffer: producers push records into fixed-size
/// runs, a background pool sorts and spills full runs to scratch files,
/// and `finish` returns a k-way merged stream over all runs.
///
/// Equal records come back in producer order: each run is stably sorted
/// and the merge breaks ties on the run sequence number.
pub struct RunMerger<R: RunRecord> {
    capacity: usize,
    current: Vec<R>,
    next_seq: u64,
    count: u64,
    run_tx: Option<Sender<(u64, Vec<R>)>>,
    sorted_rx: Receiver<SortedRun>,
    workers: Vec<JoinHandle<()>>,
    error: ErrorSlot,
}

impl<R: RunRecord> RunMerger<R> {
    pub fn new(scratch_dir: impl AsRef<Path>, capacity: usize) -> Self {
        let scratch_dir: PathBuf = scratch_dir.as_ref().to_path_buf();
        let (run_tx, run_rx) = bounded::<(u64, Vec<R>)>(8);
        let (sorted_tx, sorted_rx) = unbounded::<SortedRun>();
        let error: ErrorSlot = Arc::new(Mutex::new(None));

        let worker_count = num_cpus::get().clamp(1, 4);
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let run_rx = run_rx.clone();
            let sorted_tx = sorted_tx.clone();
            let error = error.clone();
            let scratch_dir = scratch_dir.clone();
            workers.push(std::thread::spawn(move || {
                for (seq, mut run) in run_rx.iter() {
                    match spill_run(&scratch_dir, seq, &mut run) {
                        Ok(sorted) => {
                            let _ = sorted_tx.send(sorted);
                        }
                        Err(e) => {
                            let mut slot = error.lock();
                            if slot.is_none() {
                                *slot = Some(e);
                            }
                            return;
                        }
                    }
                }
            }));
        }

        RunMerger {
            capacity: capacity.max(1),
            current: Vec::with_capacity(capacity.max(1).min(1 << 20)),
            next_seq: 0,
            count: 0,
            run_tx: Some(run_tx),
            sorted_rx,
            workers,
            error,
        }
    }

    fn check_error(&self) -> Result<()> {
        if let Some(e) = self.error.lock().take() {
            return Err(e);
        }
        Ok(())
    }

    pub fn push(&mut self, record: R) -> Result<()> {
        if self.current.len() >= self.capacity {
            self.flush_run()?;
        }
        self.current.push(record);
        self.count += 1;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn flush_run(&mut self) -> Result<()> {
        self.check_error()?;
        if self.current.is_empty() {
            return Ok(());
        }
        let run = std::mem::replace(&mut self.current, Vec::with_capacity(self.capacity.min(1 << 20)));
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(tx) = &self.run_tx {
            tx.send((seq, run))
                .map_err(|_| Error::new(ErrorKind::Io, "run sorter thread gone"))?;
        }
        Ok(())
    }

    /// Drain the sorters and open the merged stream.
    pub fn finish(mut self) -> Result<MergedStream<R>> {
        self.flush_run()?;
        drop(self.run_tx.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        self.check_error()?;

        let mut heap = BinaryHeap::new();
        for sorted in self.sorted_rx.try_iter() {
            let mut source = RunSource {
                seq: sorted.seq,
                reader: BufReader::new(sorted.file),
                remaining: sorted.count,
                _marker: std::marker::PhantomData,
            };
            if let Some(record) = source.next()? {
                heap.push(HeapItem { record, source });
            }
        }
        Ok(MergedStream { heap })
    }
}

fn spill_run<R: RunRecord>(scratch_dir: &Path, seq: u64, run: &mut [R]) -> Result<SortedRun> {
    // quicksort would lose the producer order of equal records
    run.sort();

    let file = tempfile::tempfile_in(scratch_dir)?;
    let mut writer = BufWriter::new(file);
    for record in run.iter() {
        bincode::serialize_into(&mut writer, record)?;
    }
    let mut file = writer
        .into_inner()
        .map_err(|e| Error::new(ErrorKind::Io, e.to_string()))?;
    file.seek(SeekFrom::Start(0))?;
    Ok(SortedRun { seq, file, count: run.len() as u64 })
}

struct RunSource<R> {
    seq: u64,
    reader: BufReader<File>,
    remaining: u64,
    _marker: std::marker::PhantomData<R>,
}

impl<R: RunRecord> RunSource<R> {
    fn next(&mut self) -> Result<Option<R>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        let record = bincode::deserialize_from(&mut self.reader)?;
        Ok(Some(record))
    }
}

struct HeapItem<R> {
    record: R,
    source: RunSource<R>,
}

impl<R: Ord> PartialEq for HeapItem<R> {
    fn eq(&self, other: &Self) -> bool {
        self.record == other.record && self.source.seq == other.source.seq
    }
}

impl<R: Ord> Eq for HeapItem<R> {}

impl<R: Ord> PartialOrd for HeapItem<R> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<R: Ord> Ord for HeapItem<R> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; reverse for ascending merge order,
        // ties resolved by run sequence to keep the sort stable
        other
            .record
            .cmp(&self.record)
            .then_with(|| other.source.seq.cmp(&self.source.seq))
    }
}

/// Globally sorted stream over all spilled runs.
pub struct MergedStream<R: RunRecord> {
    heap: BinaryHeap<HeapItem<R>>,
}

impl<R: RunRecord> MergedStream<R> {
    pub fn next(&mut self) -> Result<Option<R>> {
        let mut item = match self.heap.pop() {
            Some(item) => item,
            None => return Ok(None),
        };
        let record = match item.source.next()? {
            Some(next) => {
                let record = std::mem::replace(&mut item.record, next);
                self.heap.push(item);
                record
            }
            None => item.record,
        };
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    #[test]
    fn merge_restores_global_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut merger: RunMerger<u32> = RunMerger::new(dir.path(), 100);

        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        let mut values: Vec<u32> = (0..2500).map(|_| rng.gen_range(0..10_000)).collect();
        for &v in &values {
            merger.push(v).unwrap();
        }
        assert_eq!(merger.len(), 2500);

        let mut stream = merger.finish().unwrap();
        let mut out = Vec::new();
        while let Some(v) = stream.next().unwrap() {
            out.push(v);
        }
        values.sort();
        assert_eq!(out, values);
    }

    #[test]
    fn stable_for_equal_keys() {
        // the tag is payload only; ordering looks at the key alone
        #[derive(Serialize, serde::Deserialize, Debug)]
        struct Tagged {
            key: u32,
            tag: u32,
        }
        impl PartialEq for Tagged {
            fn eq(&self, other: &Self) -> bool {
                self.key == other.key
            }
        }
        impl Eq for Tagged {}
        impl PartialOrd for Tagged {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }
        impl Ord for Tagged {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                self.key.cmp(&other.key)
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut merger: RunMerger<Tagged> = RunMerger::new(dir.path(), 10);
        for tag in 0..100 {
            merger.push(Tagged { key: tag % 3, tag }).unwrap();
        }

        let mut stream = merger.finish().unwrap();
        let mut last: Option<Tagged> = None;
        while let Some(rec) = stream.next().unwrap() {
            if let Some(prev) = &last {
                assert!(prev.key < rec.key || (prev.key == rec.key && prev.tag < rec.tag));
            }
            last = Some(rec);
        }
    }

    #[test]
    fn empty_merger() {
        let dir = tempfile::tempdir().unwrap();
        let merger: RunMerger<u64> = RunMerger::new(dir.path(), 8);
        let mut stream = merger.finish().unwrap();
        assert!(stream.next().unwrap().is_none());
    }
}
