//! Single admission path: fingerprint, skip, batch, wait, commit.
//!
//! Records stream straight into the worker queue as they are admitted; a batch
//! keeps only fingerprints and ordinals, so memory stays bounded by the queue.
//! Batch `k` is committed only after every one of its outcomes is back, and
//! only after batch `k-1` was committed.

use crate::checkpoint::{CheckpointStore, FingerprintSet};
use crate::error::{PipelineError, PipelineResult};
use crate::fingerprint::{fingerprint, Fingerprint};
use crate::mem::maybe_throttle_low_memory;
use crate::pool::{Job, WorkerPool};
use crate::progress::ProgressScope;
use crate::record::RawRecord;
use crate::report::{OutcomeStatus, ProcessingOutcome, ReportAggregator, StopReason};
use crate::shutdown::ShutdownCoordinator;
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL: Duration = Duration::from_millis(100);

/// Admitted records of one batch, in admission order.
pub struct Batch {
    pub index: u64,
    pub fingerprints: Vec<Fingerprint>,
    pub ordinals: Vec<u64>,
    members: FingerprintSet,
}

impl Batch {
    pub fn new(index: u64, capacity: usize) -> Self {
        Self {
            index,
            fingerprints: Vec::with_capacity(capacity),
            ordinals: Vec::with_capacity(capacity),
            members: FingerprintSet::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }

    pub fn contains(&self, fp: &Fingerprint) -> bool {
        self.members.contains(fp)
    }

    fn push(&mut self, fp: Fingerprint, ordinal: u64) {
        self.fingerprints.push(fp);
        self.ordinals.push(ordinal);
        self.members.insert(fp);
    }
}

enum BatchEnd {
    Committed,
    Abandoned,
}

pub struct BatchScheduler<'a> {
    batch_size: usize,
    low_memory_threshold: f64,
    store: &'a mut CheckpointStore,
    pool: &'a WorkerPool,
    shutdown: &'a ShutdownCoordinator,
    report: &'a mut ReportAggregator,
    progress: Option<&'a ProgressScope>,
}

impl<'a> BatchScheduler<'a> {
    pub fn new(
        batch_size: usize,
        store: &'a mut CheckpointStore,
        pool: &'a WorkerPool,
        shutdown: &'a ShutdownCoordinator,
        report: &'a mut ReportAggregator,
    ) -> Self {
        Self { batch_size: batch_size.max(1), low_memory_threshold: 0.0, store, pool, shutdown, report, progress: None }
    }

    pub fn low_memory_threshold(mut self, frac: f64) -> Self {
        self.low_memory_threshold = frac;
        self
    }

    pub fn progress(mut self, progress: Option<&'a ProgressScope>) -> Self {
        self.progress = progress;
        self
    }

    /// Drain `source` until exhausted or shutdown. Source errors are fatal.
    pub fn run<I>(&mut self, source: I) -> PipelineResult<StopReason>
    where
        I: IntoIterator<Item = anyhow::Result<RawRecord>>,
    {
        let mut batch = Batch::new(self.store.next_batch_index(), self.batch_size);
        let mut position: u64 = 0;
        let mut exhausted = true;

        for item in source {
            if !self.shutdown.is_running() {
                exhausted = false;
                break;
            }
            let record = item.map_err(|source| PipelineError::SourceRead { position, source })?;
            position += 1;

            let fp = fingerprint(&record);
            if self.store.contains(&fp) || batch.contains(&fp) {
                tracing::trace!("skip #{} ({})", record.ordinal, fp.short());
                self.report.record(&ProcessingOutcome::skipped(fp, record.ordinal));
                if let Some(p) = self.progress {
                    p.inc_items(1);
                }
                continue;
            }

            if self.low_memory_threshold > 0.0 {
                maybe_throttle_low_memory(self.low_memory_threshold);
            }
            batch.push(fp, record.ordinal);
            self.pool.submit(Job { batch_index: batch.index, fingerprint: fp, record: Arc::new(record) })?;

            if batch.len() >= self.batch_size {
                let next = Batch::new(batch.index + 1, self.batch_size);
                let full = std::mem::replace(&mut batch, next);
                if let BatchEnd::Abandoned = self.complete(full)? {
                    return Ok(StopReason::Aborted);
                }
            }
        }

        if !batch.is_empty() {
            if let BatchEnd::Abandoned = self.complete(batch)? {
                return Ok(StopReason::Aborted);
            }
        }

        // An interrupt that lands after the last record was read still completes the run.
        Ok(if exhausted { StopReason::Completed } else { StopReason::Drained })
    }

    /// Barrier: collect every outcome of `batch`, then commit it.
    fn complete(&mut self, batch: Batch) -> PipelineResult<BatchEnd> {
        let started = Instant::now();
        let mut outcomes: Vec<ProcessingOutcome> = Vec::with_capacity(batch.len());

        while outcomes.len() < batch.len() {
            if self.shutdown.is_escalated() {
                tracing::warn!(
                    "batch {} abandoned with {}/{} outcomes; it will be redone on resume",
                    batch.index,
                    outcomes.len(),
                    batch.len()
                );
                return Ok(BatchEnd::Abandoned);
            }
            let wait = match self.shutdown.drain_deadline() {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        tracing::warn!(
                            "grace period elapsed; batch {} abandoned with {}/{} outcomes",
                            batch.index,
                            outcomes.len(),
                            batch.len()
                        );
                        return Ok(BatchEnd::Abandoned);
                    }
                    left.min(POLL)
                }
                None => POLL,
            };

            if let Some((index, outcome)) = self.pool.recv_timeout(wait)? {
                if index != batch.index {
                    // Only one batch is ever in flight.
                    return Err(PipelineError::WorkerPool(format!(
                        "outcome for batch {} arrived while waiting on batch {}",
                        index, batch.index
                    )));
                }
                if let Some(p) = self.progress {
                    p.inc_items(1);
                }
                outcomes.push(outcome);
            }
        }

        self.store.commit(batch.index, &outcomes)?;

        for o in outcomes.iter().filter(|o| o.status == OutcomeStatus::Failed) {
            if let Some(err) = &o.error {
                tracing::warn!(
                    "record #{} ({}) failed after {} attempt(s) [{}]: {}",
                    o.ordinal,
                    o.fingerprint,
                    o.attempts,
                    err.kind,
                    err.message
                );
            }
        }
        let committed = outcomes.iter().filter(|o| o.is_committed()).count();
        tracing::info!(
            "batch {} committed: {} ok, {} failed in {:.2?}",
            batch.index,
            committed,
            outcomes.len() - committed,
            started.elapsed()
        );
        self.report.record_batch(&outcomes);
        Ok(BatchEnd::Committed)
    }
}
