//! Fixed-size worker pool draining a bounded job queue.
//!
//! Workers run as long-lived loops on a dedicated rayon pool. The queue is a
//! `sync_channel` of `queue_capacity`, so `submit` blocks once it is full; outcomes
//! flow back on an unbounded channel tagged with their batch index.

use crate::error::{PipelineError, PipelineResult};
use crate::fingerprint::Fingerprint;
use crate::record::RawRecord;
use crate::report::ProcessingOutcome;
use crate::retry::RetryExecutor;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::Duration;

pub struct Job {
    pub batch_index: u64,
    pub fingerprint: Fingerprint,
    pub record: Arc<RawRecord>,
}

/// Records handed to the pool but not yet finished (queued + being attempted).
#[derive(Default)]
struct PendingGauge {
    current: AtomicIsize,
    peak: AtomicUsize,
}

impl PendingGauge {
    fn enqueued(&self) {
        let now = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        if now > 0 {
            self.peak.fetch_max(now as usize, Ordering::AcqRel);
        }
    }

    fn finished(&self) {
        self.current.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct WorkerPool {
    queue: Option<SyncSender<Job>>,
    results: Receiver<(u64, ProcessingOutcome)>,
    gauge: Arc<PendingGauge>,
    workers: usize,
    capacity: usize,
    _pool: rayon::ThreadPool,
}

impl WorkerPool {
    pub fn start(workers: usize, queue_capacity: usize, executor: RetryExecutor) -> PipelineResult<Self> {
        let workers = workers.max(1);
        let capacity = queue_capacity.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("mailconv-worker-{i}"))
            .build()
            .map_err(|e| PipelineError::WorkerPool(e.to_string()))?;

        let (job_tx, job_rx) = mpsc::sync_channel::<Job>(capacity);
        let (res_tx, res_rx) = mpsc::channel::<(u64, ProcessingOutcome)>();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let executor = Arc::new(executor);
        let gauge = Arc::new(PendingGauge::default());

        for _ in 0..workers {
            let job_rx = Arc::clone(&job_rx);
            let res_tx = res_tx.clone();
            let executor = Arc::clone(&executor);
            let gauge = Arc::clone(&gauge);
            pool.spawn(move || loop {
                // Lock only for the dequeue itself.
                let next = job_rx.lock().recv();
                let Ok(job) = next else { break };
                let outcome = executor.attempt(job.record, job.fingerprint);
                gauge.finished();
                if res_tx.send((job.batch_index, outcome)).is_err() {
                    break;
                }
            });
        }

        tracing::debug!("worker pool started: {} workers, queue capacity {}", workers, capacity);
        Ok(Self { queue: Some(job_tx), results: res_rx, gauge, workers, capacity, _pool: pool })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue a job, blocking while the queue is full.
    pub fn submit(&self, job: Job) -> PipelineResult<()> {
        let queue = self.queue.as_ref().ok_or_else(|| PipelineError::WorkerPool("pool is closed".into()))?;
        queue.send(job).map_err(|_| PipelineError::WorkerPool("all workers have exited".into()))?;
        self.gauge.enqueued();
        Ok(())
    }

    /// Wait up to `timeout` for the next outcome.
    pub fn recv_timeout(&self, timeout: Duration) -> PipelineResult<Option<(u64, ProcessingOutcome)>> {
        match self.results.recv_timeout(timeout) {
            Ok(r) => Ok(Some(r)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(PipelineError::WorkerPool("result channel closed".into())),
        }
    }

    /// Records held by the pool right now.
    pub fn pending(&self) -> usize {
        self.gauge.current.load(Ordering::Acquire).max(0) as usize
    }

    /// Highest `pending()` observed. Bounded by `capacity + workers`.
    pub fn peak_pending(&self) -> usize {
        self.gauge.peak.load(Ordering::Acquire)
    }

    /// Stop accepting jobs; workers exit once the queue is drained.
    pub fn close(&mut self) {
        self.queue.take();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}
