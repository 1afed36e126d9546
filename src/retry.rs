//! Bounded retries with exponential backoff around a single sink write.

use crate::error::{Failure, FailureKind, SinkError};
use crate::fingerprint::Fingerprint;
use crate::record::RawRecord;
use crate::report::ProcessingOutcome;
use crate::shutdown::ShutdownCoordinator;
use crate::sink::SinkAdapter;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Option<Duration>,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Some(Duration::from_secs(60)),
            backoff_base: Duration::from_millis(250),
            backoff_max: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `next_attempt` (2-based: the first retry).
    /// base, 2×base, 4×base, ... capped at `backoff_max`.
    pub fn backoff(&self, next_attempt: u32) -> Duration {
        let exp = next_attempt.saturating_sub(2).min(20);
        let delay = self.backoff_base.saturating_mul(1u32 << exp);
        delay.min(self.backoff_max)
    }
}

pub struct RetryExecutor {
    sink: Arc<dyn SinkAdapter>,
    policy: RetryPolicy,
    shutdown: ShutdownCoordinator,
}

impl RetryExecutor {
    pub fn new(sink: Arc<dyn SinkAdapter>, policy: RetryPolicy, shutdown: ShutdownCoordinator) -> Self {
        Self { sink, policy, shutdown }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Drive `record` to a `committed` or `failed` outcome.
    pub fn attempt(&self, record: Arc<RawRecord>, fingerprint: Fingerprint) -> ProcessingOutcome {
        let max = self.policy.max_attempts.max(1);
        let mut attempts = 0u32;
        loop {
            if self.shutdown.is_escalated() {
                return ProcessingOutcome::failed(
                    fingerprint,
                    record.ordinal,
                    attempts,
                    Failure::new(FailureKind::Interrupted, "stopped before attempt"),
                );
            }

            attempts += 1;
            let failure = match self.call_sink(&record, fingerprint) {
                Ok(()) => return ProcessingOutcome::committed(fingerprint, record.ordinal, attempts),
                Err(f) => f,
            };

            if !failure.kind.is_retryable() || attempts >= max {
                return ProcessingOutcome::failed(fingerprint, record.ordinal, attempts, failure);
            }

            let delay = self.policy.backoff(attempts + 1);
            tracing::debug!(
                "record #{} ({}) attempt {}/{} failed ({}): {}; retrying in {:?}",
                record.ordinal,
                fingerprint.short(),
                attempts,
                max,
                failure.kind,
                failure.message,
                delay
            );
            if !self.shutdown.sleep_unless_escalated(delay) {
                return ProcessingOutcome::failed(
                    fingerprint,
                    record.ordinal,
                    attempts,
                    Failure::new(FailureKind::Interrupted, format!("stopped during backoff after: {}", failure.message)),
                );
            }
        }
    }

    fn call_sink(&self, record: &Arc<RawRecord>, fingerprint: Fingerprint) -> Result<(), Failure> {
        let Some(timeout) = self.policy.attempt_timeout else {
            return self.sink.write(record, &fingerprint).map_err(Failure::from);
        };

        // Watchdog. An overrunning call keeps running on its own thread and may
        // overlap the retry; sinks must tolerate that.
        let (tx, rx) = mpsc::sync_channel::<Result<(), SinkError>>(1);
        let sink = Arc::clone(&self.sink);
        let rec = Arc::clone(record);
        let spawned = std::thread::Builder::new()
            .name("mailconv-sink-call".into())
            .spawn(move || {
                let _ = tx.send(sink.write(&rec, &fingerprint));
            });
        if let Err(e) = spawned {
            return Err(Failure::new(FailureKind::Transient, format!("cannot spawn sink call: {}", e)));
        }

        match rx.recv_timeout(timeout) {
            Ok(res) => res.map_err(Failure::from),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                Err(Failure::new(FailureKind::Timeout, format!("sink call exceeded {:?}", timeout)))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(Failure::new(FailureKind::Terminal, "sink call panicked"))
            }
        }
    }
}
