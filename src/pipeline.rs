use crate::checkpoint::CheckpointStore;
use crate::config::ConvertOptions;
use crate::error::{PipelineError, PipelineResult};
use crate::mbox::{MboxFlavor, MboxReader};
use crate::pool::WorkerPool;
use crate::progress::ProgressScope;
use crate::report::{ReportAggregator, StopReason, SummaryReport};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::scheduler::BatchScheduler;
use crate::shutdown::ShutdownCoordinator;
use crate::sink::{DirectorySink, SinkAdapter};
use crate::source::RecordSource;
use crate::util::init_tracing_once;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Builder-style entry point for a checkpointed conversion run.
#[derive(Clone, Default)]
pub struct MailConverter {
    pub(crate) opts: ConvertOptions,
}

impl MailConverter {
    pub fn new() -> Self {
        Self { opts: ConvertOptions::default() }
    }

    pub fn with_options(opts: ConvertOptions) -> Self {
        Self { opts }
    }

    pub fn options(&self) -> &ConvertOptions {
        &self.opts
    }

    // -------- Builder methods --------
    pub fn batch_size(mut self, n: usize) -> Self { self.opts = self.opts.with_batch_size(n); self }
    pub fn workers(mut self, n: usize) -> Self { self.opts = self.opts.with_workers(n); self }
    pub fn queue_capacity(mut self, n: usize) -> Self { self.opts = self.opts.with_queue_capacity(n); self }
    pub fn max_attempts(mut self, n: u32) -> Self { self.opts = self.opts.with_max_attempts(n); self }
    pub fn attempt_timeout(mut self, t: Option<Duration>) -> Self { self.opts = self.opts.with_attempt_timeout(t); self }
    pub fn backoff(mut self, base: Duration, max: Duration) -> Self { self.opts = self.opts.with_backoff(base, max); self }
    pub fn checkpoint_dir(mut self, dir: impl AsRef<Path>) -> Self { self.opts = self.opts.with_checkpoint_dir(dir); self }
    pub fn grace_period(mut self, grace: Duration) -> Self { self.opts = self.opts.with_grace_period(grace); self }
    pub fn failure_samples(mut self, n: usize) -> Self { self.opts = self.opts.with_failure_samples(n); self }
    pub fn progress(mut self, yes: bool) -> Self { self.opts = self.opts.with_progress(yes); self }
    pub fn progress_label(mut self, label: impl Into<String>) -> Self { self.opts = self.opts.with_progress_label(label); self }
    pub fn low_memory_threshold(mut self, frac: f64) -> Self { self.opts = self.opts.with_low_memory_threshold(frac); self }
    pub fn folder(mut self, folder: impl Into<String>) -> Self { self.opts = self.opts.with_folder(folder); self }
    pub fn mbox_flavor(mut self, flavor: MboxFlavor) -> Self { self.opts = self.opts.with_mbox_flavor(flavor); self }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.opts.max_attempts,
            attempt_timeout: self.opts.attempt_timeout,
            backoff_base: self.opts.backoff_base,
            backoff_max: self.opts.backoff_max,
        }
    }

    /// A coordinator using this converter's grace period.
    pub fn shutdown_coordinator(&self) -> ShutdownCoordinator {
        ShutdownCoordinator::new(self.opts.grace_period)
    }

    /// Convert `source` into `sink`, resuming from any checkpoint for this pair.
    ///
    /// Returns the summary on completion or on a cooperative stop (marked
    /// `partial`). Source read and checkpoint persistence failures abort the run.
    pub fn run<S>(&self, source: &S, sink: Arc<dyn SinkAdapter>, shutdown: &ShutdownCoordinator) -> PipelineResult<SummaryReport>
    where
        S: RecordSource + ?Sized,
    {
        init_tracing_once();
        self.opts.validate()?;

        let source_id = source.identity();
        let target_id = sink.identity();
        let mut store = CheckpointStore::open(&self.opts.checkpoint_dir, &source_id, &target_id)?;
        tracing::info!(
            "converting {} -> {} (batch {}, {} workers, queue {}, {} attempts)",
            source_id,
            target_id,
            self.opts.batch_size,
            self.opts.workers,
            self.opts.queue_capacity,
            self.opts.max_attempts
        );

        let records = source
            .records()
            .map_err(|source| PipelineError::SourceRead { position: 0, source })?;

        let executor = RetryExecutor::new(sink, self.retry_policy(), shutdown.clone());
        let mut pool = WorkerPool::start(self.opts.workers, self.opts.queue_capacity, executor)?;
        let mut report = ReportAggregator::new(self.opts.failure_samples);
        let progress = self
            .opts
            .progress
            .then(|| ProgressScope::records(self.opts.progress_label.clone().unwrap_or_else(|| "Converting".into())));

        let result = BatchScheduler::new(self.opts.batch_size, &mut store, &pool, shutdown, &mut report)
            .low_memory_threshold(self.opts.low_memory_threshold)
            .progress(progress.as_ref())
            .run(records);

        let peak = pool.peak_pending();
        pool.close();

        let stop_reason = match result {
            Ok(reason) => reason,
            Err(e) => {
                let totals = store.totals();
                tracing::error!(
                    "run aborted: {}; durable progress: {} committed, last batch {}",
                    e,
                    totals.records_committed,
                    totals.last_batch_index
                );
                if let Some(p) = &progress {
                    p.finish("aborted");
                }
                if !matches!(e, PipelineError::CheckpointPersistence { .. }) {
                    if let Err(flush_err) = shutdown.stop(&mut store) {
                        tracing::error!("final checkpoint flush failed: {}", flush_err);
                    }
                }
                return Err(e);
            }
        };

        shutdown.stop(&mut store)?;
        if let Some(p) = &progress {
            p.finish(match stop_reason {
                StopReason::Completed => "done",
                StopReason::Drained => "stopped",
                StopReason::Aborted => "aborted",
            });
        }

        let summary = report.finish(stop_reason, store.totals(), peak);
        tracing::info!(
            "{}: {} committed, {} failed, {} skipped in {:.1}s",
            if summary.partial { "partial run" } else { "run complete" },
            summary.committed,
            summary.failed,
            summary.skipped,
            summary.elapsed_secs
        );
        Ok(summary)
    }

    /// Convenience: stream `mbox` into a `DirectorySink` rooted at `target_dir`.
    pub fn convert_mbox(&self, mbox: &Path, target_dir: &Path, shutdown: &ShutdownCoordinator) -> anyhow::Result<SummaryReport> {
        let source = MboxReader::new(mbox).with_flavor(self.opts.mbox_flavor);
        let sink = DirectorySink::open(target_dir, self.opts.folder.clone())?;
        Ok(self.run(&source, Arc::new(sink), shutdown)?)
    }
}
