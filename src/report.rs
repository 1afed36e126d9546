//! Per-record outcomes and the end-of-run summary.

use crate::checkpoint::CheckpointTotals;
use crate::error::{Failure, FailureKind};
use crate::fingerprint::Fingerprint;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Committed,
    Failed,
    /// Already in the checkpoint (or earlier in the same batch) when the batch was built.
    Skipped,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingOutcome {
    pub fingerprint: Fingerprint,
    pub ordinal: u64,
    pub status: OutcomeStatus,
    pub attempts: u32,
    pub error: Option<Failure>,
}

impl ProcessingOutcome {
    pub fn committed(fingerprint: Fingerprint, ordinal: u64, attempts: u32) -> Self {
        Self { fingerprint, ordinal, status: OutcomeStatus::Committed, attempts, error: None }
    }

    pub fn failed(fingerprint: Fingerprint, ordinal: u64, attempts: u32, error: Failure) -> Self {
        Self { fingerprint, ordinal, status: OutcomeStatus::Failed, attempts, error: Some(error) }
    }

    pub fn skipped(fingerprint: Fingerprint, ordinal: u64) -> Self {
        Self { fingerprint, ordinal, status: OutcomeStatus::Skipped, attempts: 0, error: None }
    }

    pub fn is_committed(&self) -> bool {
        self.status == OutcomeStatus::Committed
    }
}

/// Why the run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Source exhausted, every batch committed.
    Completed,
    /// Interrupted before the source was exhausted; the in-flight batch finished and was committed.
    Drained,
    /// Interrupted twice or grace period elapsed; the in-flight batch was left unrecorded.
    Aborted,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSample {
    pub fingerprint: Fingerprint,
    pub ordinal: u64,
    pub kind: FailureKind,
    pub attempts: u32,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SummaryReport {
    pub committed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub stop_reason: StopReason,
    pub partial: bool,
    pub batches_committed: u64,
    pub last_batch_index: u64,
    pub elapsed_secs: f64,
    pub started_at: Option<String>,
    pub peak_pending_records: usize,
    pub failures_by_kind: Vec<(FailureKind, u64)>,
    pub failure_samples: Vec<FailureSample>,
    /// Cumulative counters from the checkpoint, across every run so far.
    pub historical: CheckpointTotals,
}

impl SummaryReport {
    pub fn processed(&self) -> u64 {
        self.committed + self.failed + self.skipped
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_secs_f64(self.elapsed_secs)
    }
}

impl fmt::Display for SummaryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.stop_reason {
            StopReason::Completed => "completed",
            StopReason::Drained => "stopped (drained)",
            StopReason::Aborted => "stopped (aborted)",
        };
        writeln!(f, "Conversion {}{}", label, if self.partial { " (partial)" } else { "" })?;
        writeln!(
            f,
            "  committed: {}  failed: {}  skipped: {}  (elapsed {:.1}s)",
            self.committed, self.failed, self.skipped, self.elapsed_secs
        )?;
        writeln!(f, "  batches committed: {}  last batch: {}", self.batches_committed, self.last_batch_index)?;
        writeln!(
            f,
            "  all runs: {} committed, {} failed, {} fingerprints",
            self.historical.records_committed, self.historical.records_failed, self.historical.fingerprints
        )?;
        for (kind, n) in &self.failures_by_kind {
            writeln!(f, "  {}: {}", kind, n)?;
        }
        for s in &self.failure_samples {
            writeln!(f, "  ! #{} {} [{} after {} attempt(s)] {}", s.ordinal, s.fingerprint.short(), s.kind, s.attempts, s.message)?;
        }
        Ok(())
    }
}

/// Accumulates outcomes as batches are committed.
pub struct ReportAggregator {
    started: Instant,
    started_at: Option<String>,
    max_samples: usize,
    committed: u64,
    failed: u64,
    skipped: u64,
    batches: u64,
    by_kind: ahash::AHashMap<FailureKind, u64>,
    samples: Vec<FailureSample>,
}

impl ReportAggregator {
    pub fn new(max_samples: usize) -> Self {
        Self {
            started: Instant::now(),
            started_at: OffsetDateTime::now_utc().format(&Rfc3339).ok(),
            max_samples,
            committed: 0,
            failed: 0,
            skipped: 0,
            batches: 0,
            by_kind: ahash::AHashMap::new(),
            samples: Vec::new(),
        }
    }

    pub fn record(&mut self, outcome: &ProcessingOutcome) {
        match outcome.status {
            OutcomeStatus::Committed => self.committed += 1,
            OutcomeStatus::Skipped => self.skipped += 1,
            OutcomeStatus::Failed => {
                self.failed += 1;
                let (kind, message) = match &outcome.error {
                    Some(e) => (e.kind, e.message.clone()),
                    None => (FailureKind::Terminal, String::from("unknown error")),
                };
                *self.by_kind.entry(kind).or_insert(0) += 1;
                if self.samples.len() < self.max_samples {
                    self.samples.push(FailureSample {
                        fingerprint: outcome.fingerprint,
                        ordinal: outcome.ordinal,
                        kind,
                        attempts: outcome.attempts,
                        message,
                    });
                }
            }
        }
    }

    /// Fold a committed batch in.
    pub fn record_batch(&mut self, outcomes: &[ProcessingOutcome]) {
        self.batches += 1;
        for o in outcomes {
            self.record(o);
        }
    }

    pub fn committed(&self) -> u64 {
        self.committed
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn finish(self, stop_reason: StopReason, historical: CheckpointTotals, peak_pending_records: usize) -> SummaryReport {
        let mut failures_by_kind: Vec<(FailureKind, u64)> = self.by_kind.into_iter().collect();
        failures_by_kind.sort_by_key(|(k, _)| k.as_str());
        SummaryReport {
            committed: self.committed,
            failed: self.failed,
            skipped: self.skipped,
            stop_reason,
            partial: stop_reason != StopReason::Completed,
            batches_committed: self.batches,
            last_batch_index: historical.last_batch_index,
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            started_at: self.started_at,
            peak_pending_records,
            failures_by_kind,
            failure_samples: self.samples,
            historical,
        }
    }
}
