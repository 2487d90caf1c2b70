// Copyright 2015 The etcd Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::metrics::{NoopMetrics, StoreMetrics};
use crate::mvcc::backend::{Backend, BackendError, KEY_BUCKET_NAME};
use crate::mvcc::checkpoint;
use crate::mvcc::keep::{KeepSet, KeepSetResolver};
use crate::mvcc::revision::{bytes_to_rev, Revision, REV_BYTES_LEN};
use crate::mvcc::stop::StopSignal;

pub const DEFAULT_BATCH_SIZE: usize = 10000;
pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum CompactionError {
    // InvalidRevision rejects a compaction revision before anything is
    // scanned. Revisions start at zero.
    #[error("compaction revision {0} is out of range")]
    InvalidRevision(i64),
    #[error("compaction aborted by backend: {0}")]
    Backend(#[from] BackendError),
    // Aborted is returned by CompactionHandle::join when the background task
    // panicked or was torn down before it could report.
    #[error("compaction task aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionOutcome {
    // Finished means every revision up to the compaction revision was
    // scanned and the checkpoint was written.
    Finished,
    // Cancelled means the stop signal fired between two batches. The
    // checkpoint is left untouched.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    // batch_size bounds the number of keys scanned while the batch
    // transaction lock is held.
    pub batch_size: usize,
    // batch_interval is the pause between two batches, during which
    // foreground writers get the lock.
    #[serde(rename = "batch_interval_ms", with = "millis")]
    pub batch_interval: Duration,
}

impl CompactionConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_batch_interval(mut self, batch_interval: Duration) -> Self {
        self.batch_interval = batch_interval;
        self
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        CompactionConfig { batch_size: DEFAULT_BATCH_SIZE, batch_interval: DEFAULT_BATCH_INTERVAL }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

// BatchResult is what one locked scan left behind.
enum BatchResult {
    // the range was empty and the checkpoint now reads `checkpoint`
    Finished { checkpoint: i64 },
    Continue { next: Revision, scanned: usize, deleted: usize },
}

// Compactor removes the revisions that no reader can ask for any more.
//
// A run walks the key bucket from the first revision up to the compaction
// revision in batches. Each batch holds the backend's batch transaction lock,
// deletes the scanned revisions that are not in the keep set and releases the
// lock again before pausing, so foreground writes interleave between batches
// but never within one. Only the last batch, the one that finds nothing left
// to scan, writes the checkpoint.
//
// The scan cursor lives in memory. A run that is cancelled or fails starts
// over from the first revision next time; the revisions it already deleted
// are simply not found again.
//
// At most one run may be active per backend; the owner is responsible for
// that.
pub struct Compactor<B: Backend> {
    backend: Arc<B>,
    config: CompactionConfig,
    metrics: Arc<dyn StoreMetrics>,
}

impl<B: Backend> Compactor<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self::with_config(backend, CompactionConfig::default())
    }

    pub fn with_config(backend: Arc<B>, config: CompactionConfig) -> Self {
        assert!(config.batch_size > 0, "compaction batch size must be positive");
        Compactor { backend, config, metrics: Arc::new(NoopMetrics) }
    }

    // with_metrics makes every run report its outcome, the number of deleted
    // revisions and its duration to metrics.
    pub fn with_metrics(mut self, metrics: Arc<dyn StoreMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    // finished_compact_rev returns the revision of the last run that finished.
    pub fn finished_compact_rev(&self) -> Result<Option<i64>, CompactionError> {
        Ok(checkpoint::finished_compact_rev(&*self.backend)?)
    }

    // compact deletes every revision at or below compact_rev that is not in
    // keep. It returns Finished once the checkpoint is written, and Cancelled
    // if stop fired first. A backend error aborts the run without writing the
    // checkpoint; running the same compaction again is always safe. A
    // negative compact_rev is rejected without touching the backend.
    pub async fn compact(&self, compact_rev: i64, keep: &KeepSet, stop: &mut StopSignal) -> Result<CompactionOutcome, CompactionError> {
        if compact_rev < 0 {
            warn!("refuse to compact at revision {}", compact_rev);
            return Err(CompactionError::InvalidRevision(compact_rev));
        }

        let start = Instant::now();
        let mut deleted = 0usize;
        let result = self.run(compact_rev, keep, stop, &mut deleted).await;
        let outcome = match &result {
            Ok(CompactionOutcome::Finished) => "finished",
            Ok(CompactionOutcome::Cancelled) => "cancelled",
            Err(_) => "failed",
        };
        self.metrics.report_compaction(outcome, deleted as u64, start);
        result
    }

    // run is the batch loop of compact. deleted_total is kept up to date
    // after every batch, so it is accurate on every return path.
    async fn run(&self, compact_rev: i64, keep: &KeepSet, stop: &mut StopSignal, deleted_total: &mut usize) -> Result<CompactionOutcome, CompactionError> {
        let start = Instant::now();
        let end = scan_end(compact_rev);
        let mut last = [0u8; REV_BYTES_LEN];
        let mut batches = 0usize;
        let mut scanned_total = 0usize;

        info!("start compaction at revision {} [keep: {}, batch size: {}]", compact_rev, keep.len(), self.config.batch_size);
        loop {
            if stop.is_stopped() {
                info!("compaction at revision {} cancelled before batch {} [deleted: {}]", compact_rev, batches + 1, *deleted_total);
                return Ok(CompactionOutcome::Cancelled);
            }

            let result = self.compact_batch(compact_rev, keep, &last, &end, deleted_total).map_err(|err| {
                error!("compaction at revision {} failed in batch {}: {}", compact_rev, batches + 1, err);
                err
            })?;
            batches += 1;

            match result {
                BatchResult::Finished { checkpoint } => {
                    info!(
                        "finished compaction at revision {} [checkpoint: {}, batches: {}, scanned: {}, deleted: {}, took: {:?}]",
                        compact_rev,
                        checkpoint,
                        batches,
                        scanned_total,
                        *deleted_total,
                        start.elapsed()
                    );
                    return Ok(CompactionOutcome::Finished);
                }
                BatchResult::Continue { next, scanned, deleted } => {
                    debug!("compaction batch {} at revision {}: scanned {}, deleted {}, resume from {}", batches, compact_rev, scanned, deleted, next);
                    scanned_total += scanned;
                    last = next.to_bytes();
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.batch_interval) => {}
                _ = stop.stopped() => {
                    info!("compaction at revision {} cancelled after {} batches [deleted: {}]", compact_rev, batches, *deleted_total);
                    return Ok(CompactionOutcome::Cancelled);
                }
            }
        }
    }

    // compact_with resolves the keep set of compact_rev and compacts with it.
    pub async fn compact_with<R>(&self, compact_rev: i64, resolver: &R, stop: &mut StopSignal) -> Result<CompactionOutcome, CompactionError>
    where
        R: KeepSetResolver + ?Sized,
    {
        let keep = resolver.keep(compact_rev);
        self.compact(compact_rev, &keep, stop).await
    }

    // compact_batch runs one scan under the batch transaction lock. The lock
    // is dropped on return, including the error returns. Every delete that
    // succeeds is counted into deleted_total, even when a later one fails.
    fn compact_batch(&self, compact_rev: i64, keep: &KeepSet, last: &[u8], end: &[u8], deleted_total: &mut usize) -> Result<BatchResult, BackendError> {
        let mut tx = self.backend.batch_tx();
        let (keys, _) = tx.unsafe_range(KEY_BUCKET_NAME, last, end, self.config.batch_size)?;
        if keys.is_empty() {
            let checkpoint = checkpoint::write_finished_compact_rev(&mut *tx, compact_rev)?;
            return Ok(BatchResult::Finished { checkpoint });
        }

        let mut last_rev = Revision::default();
        let mut deleted = 0;
        for key in &keys {
            let rev = bytes_to_rev(key);
            if !keep.contains(&rev) {
                tx.unsafe_delete(KEY_BUCKET_NAME, key)?;
                deleted += 1;
                *deleted_total += 1;
            }
            last_rev = rev;
        }
        Ok(BatchResult::Continue { next: last_rev.successor(), scanned: keys.len(), deleted })
    }
}

// scan_end is the exclusive upper bound of a run at compact_rev: the first
// revision of the next main revision, or past every key when there is none.
fn scan_end(compact_rev: i64) -> [u8; REV_BYTES_LEN] {
    match compact_rev.checked_add(1) {
        Some(next) => Revision::new(next, 0).to_bytes(),
        None => [0xff; REV_BYTES_LEN],
    }
}

impl<B: Backend + 'static> Compactor<B> {
    // schedule runs compact on a background task. The returned handle must be
    // joined before the backend is closed.
    pub fn schedule(self: Arc<Self>, compact_rev: i64, keep: KeepSet, mut stop: StopSignal) -> CompactionHandle {
        let handle = tokio::spawn(async move { self.compact(compact_rev, &keep, &mut stop).await });
        CompactionHandle { compact_rev, handle }
    }
}

// CompactionHandle tracks a scheduled compaction.
#[derive(Debug)]
pub struct CompactionHandle {
    compact_rev: i64,
    handle: JoinHandle<Result<CompactionOutcome, CompactionError>>,
}

impl CompactionHandle {
    pub fn compact_rev(&self) -> i64 {
        self.compact_rev
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    // join waits until the run has returned, and with it released the batch
    // transaction lock.
    pub async fn join(self) -> Result<CompactionOutcome, CompactionError> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) => {
                error!("compaction task at revision {} did not complete: {}", self.compact_rev, err);
                Err(CompactionError::Aborted(err.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{PrometheusMetrics, COMPACTION_DURATION, COMPACTION_KEYS, COMPACTION_RUNS};
    use crate::mvcc::backend::MemoryBackend;
    use crate::mvcc::keep::keep_set;
    use crate::mvcc::stop;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn new_backend(revs: &[(i64, i64)]) -> Arc<MemoryBackend> {
        let backend = Arc::new(MemoryBackend::new());
        {
            let mut tx = backend.batch_tx();
            for &(main, sub) in revs {
                tx.unsafe_put(KEY_BUCKET_NAME, &Revision::new(main, sub).to_bytes(), b"value").unwrap();
            }
        }
        backend
    }

    fn revs(backend: &MemoryBackend) -> Vec<(i64, i64)> {
        backend
            .keys(KEY_BUCKET_NAME)
            .iter()
            .map(|k| {
                let rev = bytes_to_rev(k);
                (rev.main(), rev.sub())
            })
            .collect()
    }

    fn new_compactor(backend: Arc<MemoryBackend>, batch_size: usize) -> Compactor<MemoryBackend> {
        let config = CompactionConfig::default().with_batch_size(batch_size).with_batch_interval(Duration::from_millis(1));
        Compactor::with_config(backend, config)
    }

    #[tokio::test]
    async fn it_compact_single_key_history() {
        init();
        let backend = new_backend(&[(1, 0), (2, 0), (3, 0)]);
        let compactor = new_compactor(backend.clone(), DEFAULT_BATCH_SIZE);
        let (_stopper, mut signal) = stop::channel();
        let keep = keep_set(vec![(3, 0)]);

        let outcome = compactor.compact(3, &keep, &mut signal).await.unwrap();
        assert_eq!(outcome, CompactionOutcome::Finished);
        assert_eq!(revs(&backend), vec![(3, 0)]);
        assert_eq!(compactor.finished_compact_rev().unwrap(), Some(3));

        // a second identical run deletes nothing
        let outcome = compactor.compact(3, &keep, &mut signal).await.unwrap();
        assert_eq!(outcome, CompactionOutcome::Finished);
        assert_eq!(revs(&backend), vec![(3, 0)]);
        assert_eq!(compactor.finished_compact_rev().unwrap(), Some(3));
    }

    #[tokio::test]
    async fn it_compact_any_batch_size() {
        init();
        let history = vec![(1, 0), (2, 0), (2, 1), (2, 2), (3, 0), (4, 0), (4, 1), (5, 0), (6, 0), (6, 1), (7, 0)];
        let keep = keep_set(vec![(2, 2), (4, 1), (5, 0)]);
        // revisions above the compaction revision are never scanned
        let w_revs = vec![(2, 2), (4, 1), (5, 0), (6, 0), (6, 1), (7, 0)];
        let candidates = history.iter().filter(|(main, _)| *main <= 5).count();

        for batch_size in vec![1, 2, 3, 7, candidates, DEFAULT_BATCH_SIZE] {
            let backend = new_backend(&history);
            let compactor = new_compactor(backend.clone(), batch_size);
            let (_stopper, mut signal) = stop::channel();
            let outcome = compactor.compact(5, &keep, &mut signal).await.unwrap();
            assert_eq!(outcome, CompactionOutcome::Finished, "batch size {}", batch_size);
            assert_eq!(revs(&backend), w_revs, "batch size {}", batch_size);
            assert_eq!(compactor.finished_compact_rev().unwrap(), Some(5));
        }
    }

    #[tokio::test]
    async fn it_compact_empty_store() {
        init();
        let backend = new_backend(&[]);
        let compactor = new_compactor(backend.clone(), 1);
        let (_stopper, mut signal) = stop::channel();
        let outcome = compactor.compact(10, &KeepSet::new(), &mut signal).await.unwrap();
        assert_eq!(outcome, CompactionOutcome::Finished);
        assert_eq!(compactor.finished_compact_rev().unwrap(), Some(10));
    }

    #[tokio::test]
    async fn it_checkpoint_never_decreases() {
        init();
        let backend = new_backend(&[(1, 0), (2, 0), (3, 0), (4, 0), (5, 0)]);
        let compactor = new_compactor(backend.clone(), 2);
        let (_stopper, mut signal) = stop::channel();

        compactor.compact(4, &keep_set(vec![(4, 0)]), &mut signal).await.unwrap();
        assert_eq!(compactor.finished_compact_rev().unwrap(), Some(4));
        assert_eq!(revs(&backend), vec![(4, 0), (5, 0)]);

        // an older compaction revision finishes but leaves the checkpoint alone
        let outcome = compactor.compact(2, &KeepSet::new(), &mut signal).await.unwrap();
        assert_eq!(outcome, CompactionOutcome::Finished);
        assert_eq!(compactor.finished_compact_rev().unwrap(), Some(4));
        assert_eq!(revs(&backend), vec![(4, 0), (5, 0)]);
    }

    #[tokio::test]
    async fn it_stopped_before_first_batch() {
        init();
        let history = vec![(1, 0), (2, 0), (3, 0)];
        let backend = new_backend(&history);
        let compactor = new_compactor(backend.clone(), 1);
        let (stopper, mut signal) = stop::channel();
        stopper.stop();

        let outcome = compactor.compact(3, &KeepSet::new(), &mut signal).await.unwrap();
        assert_eq!(outcome, CompactionOutcome::Cancelled);
        assert_eq!(revs(&backend), history);
        assert_eq!(compactor.finished_compact_rev().unwrap(), None);
    }

    #[tokio::test]
    async fn it_compact_with_resolver() {
        init();
        let backend = new_backend(&[(1, 0), (2, 0), (3, 0)]);
        let compactor = new_compactor(backend.clone(), 10);
        let (_stopper, mut signal) = stop::channel();
        // the latest revision at or below the compaction revision survives
        let resolver = |rev: i64| keep_set(vec![(rev, 0)]);

        let outcome = compactor.compact_with(2, &resolver, &mut signal).await.unwrap();
        assert_eq!(outcome, CompactionOutcome::Finished);
        assert_eq!(revs(&backend), vec![(2, 0), (3, 0)]);
    }

    #[tokio::test]
    async fn it_schedule_and_join() {
        init();
        let backend = new_backend(&[(1, 0), (1, 1), (2, 0)]);
        let compactor = Arc::new(new_compactor(backend.clone(), 1));
        let (_stopper, signal) = stop::channel();

        let handle = Arc::clone(&compactor).schedule(2, keep_set(vec![(1, 1), (2, 0)]), signal);
        assert_eq!(handle.compact_rev(), 2);
        assert_eq!(handle.join().await.unwrap(), CompactionOutcome::Finished);
        assert_eq!(revs(&backend), vec![(1, 1), (2, 0)]);
    }

    #[tokio::test]
    async fn it_negative_revision_is_rejected() {
        init();
        let history = vec![(1, 0), (2, 0), (3, 0), (4, 0), (5, 0)];
        let backend = new_backend(&history);
        let compactor = new_compactor(backend.clone(), 2);
        let (_stopper, mut signal) = stop::channel();

        for compact_rev in vec![-1, -2, i64::MIN] {
            match compactor.compact(compact_rev, &KeepSet::new(), &mut signal).await {
                Err(CompactionError::InvalidRevision(rev)) => assert_eq!(rev, compact_rev),
                other => panic!("expected compaction at {} to be rejected, got {:?}", compact_rev, other),
            }
        }
        assert_eq!(revs(&backend), history);
        assert_eq!(compactor.finished_compact_rev().unwrap(), None);
    }

    #[tokio::test]
    async fn it_compact_at_last_revision() {
        init();
        let backend = new_backend(&[(1, 0), (2, 0), (3, 0), (4, 0), (5, 0)]);
        let compactor = new_compactor(backend.clone(), 2);
        let (_stopper, mut signal) = stop::channel();

        let outcome = compactor.compact(i64::MAX, &keep_set(vec![(5, 0)]), &mut signal).await.unwrap();
        assert_eq!(outcome, CompactionOutcome::Finished);
        assert_eq!(revs(&backend), vec![(5, 0)]);
        assert_eq!(compactor.finished_compact_rev().unwrap(), Some(i64::MAX));
    }

    #[test]
    fn it_scan_end() {
        assert_eq!(scan_end(3), Revision::new(4, 0).to_bytes());
        assert!(scan_end(i64::MAX) > Revision::new(i64::MAX, i64::MAX).to_bytes());
    }

    #[tokio::test]
    async fn it_reports_to_metrics() {
        init();
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        let backend = new_backend(&[(1, 0), (2, 0), (3, 0)]);
        let compactor = new_compactor(backend.clone(), 1).with_metrics(metrics.clone());
        let (stopper, mut signal) = stop::channel();

        let outcome = compactor.compact(3, &keep_set(vec![(3, 0)]), &mut signal).await.unwrap();
        assert_eq!(outcome, CompactionOutcome::Finished);
        assert_eq!(metrics.value(COMPACTION_RUNS, &[("outcome", "finished")]), Some(1.0));
        assert_eq!(metrics.value(COMPACTION_KEYS, &[]), Some(2.0));

        stopper.stop();
        let outcome = compactor.compact(3, &KeepSet::new(), &mut signal).await.unwrap();
        assert_eq!(outcome, CompactionOutcome::Cancelled);
        assert_eq!(metrics.value(COMPACTION_RUNS, &[("outcome", "cancelled")]), Some(1.0));
        assert_eq!(metrics.value(COMPACTION_KEYS, &[]), Some(2.0));
        let duration_count = format!("{}_count", COMPACTION_DURATION);
        assert_eq!(metrics.value(&duration_count, &[("outcome", "finished")]), Some(1.0));
    }

    #[test]
    fn it_config() {
        let config = CompactionConfig::default();
        assert_eq!(config.batch_size, 10000);
        assert_eq!(config.batch_interval, Duration::from_millis(100));

        let config: CompactionConfig = serde_json::from_str(r#"{"batch_size": 500}"#).unwrap();
        assert_eq!(config, CompactionConfig::default().with_batch_size(500));

        let config: CompactionConfig = serde_json::from_str(r#"{"batch_interval_ms": 5}"#).unwrap();
        assert_eq!(config.batch_interval, Duration::from_millis(5));
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);

        let encoded = serde_json::to_string(&config).unwrap();
        assert_eq!(encoded, r#"{"batch_size":10000,"batch_interval_ms":5}"#);
    }

    #[test]
    #[should_panic(expected = "batch size must be positive")]
    fn it_zero_batch_size() {
        new_compactor(Arc::new(MemoryBackend::new()), 0);
    }
}
