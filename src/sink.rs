//! Sink adapter contract and a directory-backed reference mail store.

use crate::error::SinkError;
use crate::fingerprint::Fingerprint;
use crate::record::RawRecord;
use crate::util::{is_retriable_io_error, sanitize_file_name, write_file_atomic};
use anyhow::Context;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Durable writer for one parsed email.
///
/// Implementations must tolerate repeated calls for the same record (same
/// `fingerprint`) without corrupting the destination: a retry after a partial or
/// timed-out write has to overwrite or reuse the earlier entry, never duplicate it.
pub trait SinkAdapter: Send + Sync {
    /// Stable identity of the destination (used to key the checkpoint).
    fn identity(&self) -> String;

    fn write(&self, record: &RawRecord, fingerprint: &Fingerprint) -> Result<(), SinkError>;
}

fn classify_io(context: &str, e: io::Error) -> SinkError {
    let msg = format!("{}: {}", context, e);
    if is_retriable_io_error(&e) {
        SinkError::Transient(msg)
    } else {
        SinkError::Terminal(msg)
    }
}

#[derive(Serialize)]
struct StoredAttachment<'a> {
    name: &'a str,
    mime_type: &'a str,
    size: usize,
    file: String,
}

#[derive(Serialize)]
struct StoredMessage<'a> {
    fingerprint: String,
    ordinal: u64,
    subject: &'a str,
    headers: &'a [(String, String)],
    body_plain: Option<&'a str>,
    body_html: Option<&'a str>,
    attachments: Vec<StoredAttachment<'a>>,
}

/// Writes each message as `<root>/<folder>/<fingerprint>.json`, attachments under
/// `<root>/<folder>/<fingerprint>.parts/`. The message document is written last,
/// so its presence marks a complete entry.
pub struct DirectorySink {
    root: PathBuf,
    folder: String,
}

impl DirectorySink {
    /// Create the store root if needed. The root is canonicalised once so the
    /// sink identity stays the same across runs.
    pub fn open(root: impl AsRef<Path>, folder: impl Into<String>) -> anyhow::Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root).with_context(|| format!("create mail store {}", root.display()))?;
        let root = fs::canonicalize(root).with_context(|| format!("resolve {}", root.display()))?;
        Ok(Self { root, folder: folder.into() })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn folder_dir(&self) -> PathBuf {
        self.root.join(sanitize_file_name(&self.folder))
    }

    pub fn message_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.folder_dir().join(format!("{}.json", fingerprint.to_hex()))
    }

    pub fn parts_dir(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.folder_dir().join(format!("{}.parts", fingerprint.to_hex()))
    }
}

impl SinkAdapter for DirectorySink {
    fn identity(&self) -> String {
        format!("dir:{}#{}", self.root.display(), self.folder)
    }

    fn write(&self, record: &RawRecord, fingerprint: &Fingerprint) -> Result<(), SinkError> {
        if record.headers.is_empty() && record.body.is_empty() && record.attachments.is_empty() {
            return Err(SinkError::terminal(format!("record #{} has no headers and no content", record.ordinal)));
        }

        let folder = self.folder_dir();
        fs::create_dir_all(&folder).map_err(|e| classify_io("create folder", e))?;

        let mut attachments = Vec::with_capacity(record.attachments.len());
        if !record.attachments.is_empty() {
            let parts = self.parts_dir(fingerprint);
            fs::create_dir_all(&parts).map_err(|e| classify_io("create parts dir", e))?;
            for (i, att) in record.attachments.iter().enumerate() {
                // Index prefix keeps same-named attachments apart.
                let file = format!("{:03}-{}", i, sanitize_file_name(&att.name));
                write_file_atomic(&parts.join(&file), &att.content).map_err(|e| classify_io("write attachment", e))?;
                attachments.push(StoredAttachment {
                    name: &att.name,
                    mime_type: &att.mime_type,
                    size: att.content.len(),
                    file,
                });
            }
        }

        let doc = StoredMessage {
            fingerprint: fingerprint.to_hex(),
            ordinal: record.ordinal,
            subject: record.subject().map(str::trim).filter(|s| !s.is_empty()).unwrap_or("(No Subject)"),
            headers: &record.headers,
            body_plain: record.body.plain.as_deref(),
            body_html: record.body.html.as_deref(),
            attachments,
        };
        let bytes = serde_json::to_vec_pretty(&doc).map_err(|e| SinkError::terminal(format!("encode message: {}", e)))?;
        write_file_atomic(&self.message_path(fingerprint), &bytes).map_err(|e| classify_io("write message", e))?;
        Ok(())
    }
}
