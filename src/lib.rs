mod config;
mod error;
mod record;
mod fingerprint;

mod checkpoint;
mod retry;
mod pool;
mod scheduler;
mod shutdown;
mod report;

mod source;
mod sink;
mod mime;
mod mbox;

mod progress;
mod util;
mod mem;
mod pipeline;

pub use crate::config::{default_workers, ConvertOptions};
pub use crate::error::{Failure, FailureKind, PipelineError, PipelineResult, SinkError};
pub use crate::record::{Attachment, MailBody, RawRecord};
pub use crate::fingerprint::{fingerprint, Fingerprint, FINGERPRINT_LEN};
pub use crate::pipeline::MailConverter;

// Checkpoint store is usable on its own (inspection tools, tests).
pub use crate::checkpoint::{checkpoint_path, Checkpoint, CheckpointStore, CheckpointTotals, FingerprintSet, CHECKPOINT_VERSION};

pub use crate::retry::{RetryExecutor, RetryPolicy};
pub use crate::pool::{Job, WorkerPool};
pub use crate::scheduler::{Batch, BatchScheduler};
pub use crate::shutdown::{ShutdownCoordinator, ShutdownState};
pub use crate::report::{FailureSample, OutcomeStatus, ProcessingOutcome, ReportAggregator, StopReason, SummaryReport};

// Source / sink contracts plus the bundled mbox reader and directory store.
pub use crate::source::{RecordIter, RecordSource, VecSource};
pub use crate::sink::{DirectorySink, SinkAdapter};
pub use crate::mbox::{MboxFlavor, MboxReader, MboxRecords};
pub use crate::mime::parse_message;

pub use crate::progress::ProgressScope;

// Expose memory helpers for adaptive throttling from the binary.
pub use crate::mem::{available_memory_fraction, is_low_memory};

//export robust file ops from util so binaries can import from crate root.
pub use crate::util::{init_tracing_once, open_with_backoff, create_with_backoff, remove_with_backoff, write_file_atomic};
