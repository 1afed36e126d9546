//! Durable record of committed fingerprints and run counters.
//!
//! Mutated only through `commit`, once per fully-completed batch, by the single
//! scheduling thread. Every commit is written with `write_file_atomic`, so a
//! reader always sees the state after some completed batch, never a partial one.

use crate::error::{PipelineError, PipelineResult};
use crate::fingerprint::Fingerprint;
use crate::report::{OutcomeStatus, ProcessingOutcome};
use crate::util::{remove_with_backoff, stale_sidecars, write_file_atomic};
use anyhow::Context;
use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const CHECKPOINT_VERSION: u32 = 1;

pub type FingerprintSet = HashSet<Fingerprint, ahash::RandomState>;

/// Persisted checkpoint document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub source: String,
    pub target: String,
    pub records_seen: u64,
    pub records_committed: u64,
    pub records_failed: u64,
    /// 0 when no batch has completed yet.
    pub last_batch_index: u64,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(serialize_with = "serialize_sorted")]
    pub committed: FingerprintSet,
}

fn serialize_sorted<S: Serializer>(set: &FingerprintSet, serializer: S) -> Result<S::Ok, S::Error> {
    let mut v: Vec<&Fingerprint> = set.iter().collect();
    v.sort_unstable();
    serializer.collect_seq(v)
}

impl Checkpoint {
    pub fn empty(source: &str, target: &str) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            source: source.to_string(),
            target: target.to_string(),
            ..Default::default()
        }
    }

    pub fn totals(&self) -> CheckpointTotals {
        CheckpointTotals {
            records_seen: self.records_seen,
            records_committed: self.records_committed,
            records_failed: self.records_failed,
            last_batch_index: self.last_batch_index,
            fingerprints: self.committed.len() as u64,
        }
    }
}

/// Counter snapshot without the fingerprint set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointTotals {
    pub records_seen: u64,
    pub records_committed: u64,
    pub records_failed: u64,
    pub last_batch_index: u64,
    pub fingerprints: u64,
}

/// File name for the (source, target) pair inside `dir`.
pub fn checkpoint_path(dir: &Path, source_id: &str, target_id: &str) -> PathBuf {
    let mut h = Sha256::new();
    h.update(source_id.as_bytes());
    h.update([0u8]);
    h.update(target_id.as_bytes());
    let key = hex::encode(h.finalize());
    dir.join(format!("{}.checkpoint.json", &key[..16]))
}

pub struct CheckpointStore {
    path: PathBuf,
    state: Checkpoint,
    dirty: bool,
}

impl CheckpointStore {
    /// Open the checkpoint for `(source_id, target_id)` under `dir`, loading any
    /// existing state. Missing checkpoint → empty state.
    pub fn open(dir: &Path, source_id: &str, target_id: &str) -> PipelineResult<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("create checkpoint dir {}", dir.display()))
            .map_err(|e| PipelineError::persistence(dir, e))?;
        let path = checkpoint_path(dir, source_id, target_id);
        let mut store = Self { path, state: Checkpoint::empty(source_id, target_id), dirty: false };
        store.load()?;
        Ok(store)
    }

    /// Re-read the last durable checkpoint from disk.
    pub fn load(&mut self) -> PipelineResult<&Checkpoint> {
        // Leftover from a crash mid-write; the live file is still authoritative.
        for tmp in stale_sidecars(&self.path) {
            tracing::warn!("discarding incomplete checkpoint write {}", tmp.display());
            remove_with_backoff(&tmp, 10, 25).map_err(|e| PipelineError::persistence(&tmp, e))?;
        }

        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("no checkpoint at {}, starting fresh", self.path.display());
                self.state = Checkpoint::empty(&self.state.source, &self.state.target);
                self.dirty = false;
                return Ok(&self.state);
            }
            Err(e) => {
                return Err(PipelineError::persistence(&self.path, anyhow::Error::new(e).context("read checkpoint")));
            }
        };

        let loaded: Checkpoint = serde_json::from_slice(&bytes)
            .context("decode checkpoint")
            .map_err(|e| PipelineError::persistence(&self.path, e))?;

        if loaded.source != self.state.source || loaded.target != self.state.target {
            return Err(PipelineError::CheckpointMismatch {
                path: self.path.clone(),
                found_source: loaded.source,
                found_target: loaded.target,
                source_id: self.state.source.clone(),
                target_id: self.state.target.clone(),
            });
        }

        tracing::info!(
            "resuming from checkpoint {}: {} committed, last batch {}",
            self.path.display(),
            loaded.committed.len(),
            loaded.last_batch_index
        );
        self.state = loaded;
        self.dirty = false;
        Ok(&self.state)
    }

    #[inline]
    pub fn contains(&self, fp: &Fingerprint) -> bool {
        self.state.committed.contains(fp)
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.state
    }

    pub fn totals(&self) -> CheckpointTotals {
        self.state.totals()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn next_batch_index(&self) -> u64 {
        self.state.last_batch_index + 1
    }

    /// Fold one completed batch into the checkpoint and persist it.
    ///
    /// `batch_index` must be exactly `last_batch_index + 1`. On persistence
    /// failure the in-memory state is rolled back so memory never runs ahead of disk.
    pub fn commit(&mut self, batch_index: u64, outcomes: &[ProcessingOutcome]) -> PipelineResult<()> {
        let expected = self.next_batch_index();
        if batch_index != expected {
            return Err(PipelineError::CheckpointOrder { expected, got: batch_index });
        }

        let previous = (
            self.state.records_seen,
            self.state.records_committed,
            self.state.records_failed,
            self.state.last_batch_index,
            self.state.updated_at.clone(),
        );
        let mut added: Vec<Fingerprint> = Vec::with_capacity(outcomes.len());

        for o in outcomes {
            match o.status {
                OutcomeStatus::Committed => {
                    self.state.records_seen += 1;
                    self.state.records_committed += 1;
                    if self.state.committed.insert(o.fingerprint) {
                        added.push(o.fingerprint);
                    }
                }
                OutcomeStatus::Failed => {
                    self.state.records_seen += 1;
                    self.state.records_failed += 1;
                }
                OutcomeStatus::Skipped => {}
            }
        }
        self.state.last_batch_index = batch_index;
        self.state.updated_at = OffsetDateTime::now_utc().format(&Rfc3339).ok();
        self.dirty = true;

        if let Err(e) = self.persist() {
            for fp in &added {
                self.state.committed.remove(fp);
            }
            let (seen, committed, failed, last, updated) = previous;
            self.state.records_seen = seen;
            self.state.records_committed = committed;
            self.state.records_failed = failed;
            self.state.last_batch_index = last;
            self.state.updated_at = updated;
            return Err(e);
        }
        Ok(())
    }

    /// Force any unpersisted state to disk. No-op when clean.
    pub fn flush(&mut self) -> PipelineResult<()> {
        if self.dirty {
            self.persist()?;
        }
        Ok(())
    }

    /// Rewrites the whole document, so the cost grows with the committed set.
    fn persist(&mut self) -> PipelineResult<()> {
        let started = std::time::Instant::now();
        let bytes = serde_json::to_vec(&self.state)
            .context("encode checkpoint")
            .map_err(|e| PipelineError::persistence(&self.path, e))?;
        write_file_atomic(&self.path, &bytes)
            .with_context(|| format!("write {}", self.path.display()))
            .map_err(|e| PipelineError::persistence(&self.path, e))?;
        tracing::debug!("checkpoint rewritten: {} bytes in {:.2?}", bytes.len(), started.elapsed());
        self.dirty = false;
        Ok(())
    }
}
