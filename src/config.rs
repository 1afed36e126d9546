use crate::error::{PipelineError, PipelineResult};
use crate::mbox::MboxFlavor;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// User-facing options with sensible defaults and builder chaining.
#[derive(Clone, Debug)]
pub struct ConvertOptions {
    pub batch_size: usize,                // records per checkpointed batch
    pub workers: usize,                   // concurrent sink writers
    pub queue_capacity: usize,            // bounded work queue between scheduler and workers
    pub max_attempts: u32,                // per record, including the first
    pub attempt_timeout: Option<Duration>,// watchdog for a single sink call; None to disable
    pub backoff_base: Duration,           // delay after the first failed attempt
    pub backoff_max: Duration,            // cap for the doubling schedule
    pub checkpoint_dir: PathBuf,
    pub grace_period: Duration,           // how long DRAINING waits for the in-flight batch
    pub failure_samples: usize,           // failures kept verbatim in the summary
    pub progress: bool,
    pub progress_label: Option<String>,
    pub low_memory_threshold: f64,        // throttle admission below this free-RAM fraction
    pub folder: String,                   // target folder inside the mail store
    pub mbox_flavor: MboxFlavor,
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

impl Default for ConvertOptions {
    fn default() -> Self {
        let workers = default_workers();
        Self {
            batch_size: 500,
            workers,
            queue_capacity: workers * 2,
            max_attempts: 3,
            attempt_timeout: Some(Duration::from_secs(60)),
            backoff_base: Duration::from_millis(250),
            backoff_max: Duration::from_secs(10),
            checkpoint_dir: PathBuf::from(".mailconv"),
            grace_period: Duration::from_secs(30),
            failure_samples: 20,
            progress: true,
            progress_label: None,
            low_memory_threshold: 0.10,
            folder: "Inbox".to_string(),
            mbox_flavor: MboxFlavor::Mboxrd,
        }
    }
}

impl ConvertOptions {
    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n.max(1);
        self
    }
    /// Also resizes the queue to twice the worker count; call `with_queue_capacity` after to override.
    pub fn with_workers(mut self, n: usize) -> Self {
        self.workers = n.max(1);
        self.queue_capacity = self.workers * 2;
        self
    }
    pub fn with_queue_capacity(mut self, n: usize) -> Self {
        self.queue_capacity = n.max(1);
        self
    }
    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }
    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max.max(base);
        self
    }
    pub fn with_checkpoint_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.checkpoint_dir = dir.as_ref().to_path_buf();
        self
    }
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }
    pub fn with_failure_samples(mut self, n: usize) -> Self {
        self.failure_samples = n;
        self
    }
    pub fn with_progress(mut self, yes: bool) -> Self {
        self.progress = yes;
        self
    }
    pub fn with_progress_label(mut self, label: impl Into<String>) -> Self {
        self.progress_label = Some(label.into());
        self
    }
    pub fn with_low_memory_threshold(mut self, frac: f64) -> Self {
        self.low_memory_threshold = frac.clamp(0.0, 1.0);
        self
    }
    pub fn with_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = folder.into();
        self
    }
    pub fn with_mbox_flavor(mut self, flavor: MboxFlavor) -> Self {
        self.mbox_flavor = flavor;
        self
    }

    /// Overlay `MAILCONV_*` environment variables on top of the current values.
    /// Unparsable values are logged and ignored.
    pub fn overlay_env(mut self) -> Self {
        if let Some(n) = env_parse::<usize>("MAILCONV_BATCH_SIZE") {
            self = self.with_batch_size(n);
        }
        if let Some(n) = env_parse::<usize>("MAILCONV_WORKERS") {
            self = self.with_workers(n);
        }
        if let Some(n) = env_parse::<usize>("MAILCONV_QUEUE_CAPACITY") {
            self = self.with_queue_capacity(n);
        }
        if let Some(n) = env_parse::<u32>("MAILCONV_MAX_ATTEMPTS") {
            self = self.with_max_attempts(n);
        }
        if let Some(secs) = env_parse::<u64>("MAILCONV_ATTEMPT_TIMEOUT_SECS") {
            // 0 disables the watchdog
            self = self.with_attempt_timeout((secs > 0).then(|| Duration::from_secs(secs)));
        }
        if let Some(secs) = env_parse::<u64>("MAILCONV_GRACE_SECS") {
            self = self.with_grace_period(Duration::from_secs(secs));
        }
        if let Ok(dir) = std::env::var("MAILCONV_CHECKPOINT_DIR") {
            if !dir.trim().is_empty() {
                self = self.with_checkpoint_dir(dir.trim());
            }
        }
        if let Some(flavor) = env_parse::<MboxFlavor>("MAILCONV_MBOX_FLAVOR") {
            self = self.with_mbox_flavor(flavor);
        }
        self
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.batch_size == 0 {
            return Err(PipelineError::Config("batch_size must be positive".into()));
        }
        if self.workers == 0 {
            return Err(PipelineError::Config("workers must be positive".into()));
        }
        if self.queue_capacity == 0 {
            return Err(PipelineError::Config("queue_capacity must be positive".into()));
        }
        if self.max_attempts == 0 {
            return Err(PipelineError::Config("max_attempts must be positive".into()));
        }
        if matches!(self.attempt_timeout, Some(t) if t.is_zero()) {
            return Err(PipelineError::Config("attempt_timeout must be non-zero when set".into()));
        }
        if self.folder.trim().is_empty() {
            return Err(PipelineError::Config("folder name must not be empty".into()));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("{} is set but not a valid value: {:?}", key, raw);
            None
        }
    }
}
