//! Error taxonomy: run-fatal `PipelineError`, per-record `SinkError`, and the
//! `FailureKind` classification carried by failed outcomes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Errors that terminate a run.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The source reader could not produce the record at `position`.
    #[error("source read failed at record {position}: {source:#}")]
    SourceRead {
        position: u64,
        #[source]
        source: anyhow::Error,
    },

    /// Progress could not be made durable; continuing would risk duplicates on resume.
    #[error("checkpoint persistence failed for {}: {source:#}", path.display())]
    CheckpointPersistence {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("batch {got} committed out of order (expected {expected})")]
    CheckpointOrder { expected: u64, got: u64 },

    #[error("checkpoint {} belongs to {found_source} -> {found_target}, not {source_id} -> {target_id}", path.display())]
    CheckpointMismatch {
        path: PathBuf,
        found_source: String,
        found_target: String,
        source_id: String,
        target_id: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("worker pool failure: {0}")]
    WorkerPool(String),
}

impl PipelineError {
    pub(crate) fn persistence(path: impl Into<PathBuf>, source: anyhow::Error) -> Self {
        PipelineError::CheckpointPersistence { path: path.into(), source }
    }
}

/// Failure reported by a sink adapter for a single record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// Lock contention, temporary unavailability; worth another attempt.
    #[error("transient sink error: {0}")]
    Transient(String),
    /// Malformed record, permission denied, unrecoverable adapter state.
    #[error("terminal sink error: {0}")]
    Terminal(String),
}

impl SinkError {
    pub fn transient(msg: impl Into<String>) -> Self {
        SinkError::Transient(msg.into())
    }

    pub fn terminal(msg: impl Into<String>) -> Self {
        SinkError::Terminal(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            SinkError::Transient(m) | SinkError::Terminal(m) => m,
        }
    }
}

/// Classification recorded on a failed outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Terminal,
    Timeout,
    Interrupted,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::Transient | FailureKind::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Terminal => "terminal",
            FailureKind::Timeout => "timeout",
            FailureKind::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&SinkError> for FailureKind {
    fn from(e: &SinkError) -> Self {
        match e {
            SinkError::Transient(_) => FailureKind::Transient,
            SinkError::Terminal(_) => FailureKind::Terminal,
        }
    }
}

/// Classified error detail attached to a failed outcome.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl From<SinkError> for Failure {
    fn from(e: SinkError) -> Self {
        let kind = FailureKind::from(&e);
        match e {
            SinkError::Transient(m) | SinkError::Terminal(m) => Failure { kind, message: m },
        }
    }
}
