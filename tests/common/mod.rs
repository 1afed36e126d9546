#![allow(dead_code)]

use mailconv::{
    fingerprint, Fingerprint, MailConverter, RawRecord, RecordIter, RecordSource, SinkAdapter, SinkError,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// `n` distinct, well-formed records with ordinals `0..n`.
pub fn make_records(n: usize) -> Vec<RawRecord> {
    (0..n).map(|i| make_record(i as u64)).collect()
}

pub fn make_record(i: u64) -> RawRecord {
    RawRecord::new(i)
        .with_header("From", format!("Sender {} <sender{}@example.test>", i % 7, i % 7))
        .with_header("To", "archive@example.test")
        .with_header("Subject", format!("Message number {}", i))
        .with_header("Date", "Mon, 01 Jan 2024 10:00:00 +0000")
        .with_header("Message-ID", format!("<{}@example.test>", i))
        .with_plain(format!("Body of message {}\n", i))
}

/// Converter tuned for tests: no progress bar, no memory throttling, tiny backoff.
pub fn test_converter(checkpoint_dir: &Path) -> MailConverter {
    MailConverter::new()
        .checkpoint_dir(checkpoint_dir)
        .batch_size(500)
        .workers(4)
        .progress(false)
        .low_memory_threshold(0.0)
        .backoff(Duration::from_millis(1), Duration::from_millis(5))
}

type Behaviour = Box<dyn Fn(&RawRecord, u32) -> Result<(), SinkError> + Send + Sync>;

/// Sink whose result is decided by a closure of `(record, attempt number)`.
/// Every call is counted per fingerprint; only successful calls count as writes.
pub struct ScriptedSink {
    name: String,
    behaviour: Behaviour,
    attempts: Mutex<HashMap<Fingerprint, u32>>,
    writes: Mutex<HashMap<Fingerprint, u32>>,
    calls: AtomicUsize,
}

impl ScriptedSink {
    pub fn new<F>(name: &str, behaviour: F) -> Self
    where
        F: Fn(&RawRecord, u32) -> Result<(), SinkError> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            behaviour: Box::new(behaviour),
            attempts: Mutex::new(HashMap::new()),
            writes: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Accepts every record on the first attempt.
    pub fn accepting(name: &str) -> Self {
        Self::new(name, |_, _| Ok(()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn attempts_for(&self, fp: &Fingerprint) -> u32 {
        self.attempts.lock().get(fp).copied().unwrap_or(0)
    }

    pub fn successful_writes(&self) -> usize {
        self.writes.lock().values().map(|&n| n as usize).sum()
    }

    pub fn distinct_written(&self) -> usize {
        self.writes.lock().len()
    }

    /// Highest number of successful writes any single fingerprint received.
    pub fn max_writes_per_record(&self) -> u32 {
        self.writes.lock().values().copied().max().unwrap_or(0)
    }
}

impl SinkAdapter for ScriptedSink {
    fn identity(&self) -> String {
        format!("scripted:{}", self.name)
    }

    fn write(&self, record: &RawRecord, fp: &Fingerprint) -> Result<(), SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let attempt = {
            let mut a = self.attempts.lock();
            let n = a.entry(*fp).or_insert(0);
            *n += 1;
            *n
        };
        (self.behaviour)(record, attempt)?;
        *self.writes.lock().entry(*fp).or_insert(0) += 1;
        Ok(())
    }
}

/// Yields `records` in order but fails with a read error once `fail_at`
/// records have been produced. Shares its identity with the healthy source.
pub struct FailingSource {
    identity: String,
    records: Vec<RawRecord>,
    fail_at: usize,
}

impl FailingSource {
    pub fn new(identity: &str, records: Vec<RawRecord>, fail_at: usize) -> Self {
        Self { identity: identity.to_string(), records, fail_at }
    }
}

impl RecordSource for FailingSource {
    fn identity(&self) -> String {
        self.identity.clone()
    }

    fn records(&self) -> anyhow::Result<RecordIter<'_>> {
        let fail_at = self.fail_at;
        let it = self.records.iter().cloned().enumerate().map(move |(i, r)| {
            if i >= fail_at {
                Err(anyhow::anyhow!("simulated read failure at record {}", i))
            } else {
                Ok(r)
            }
        });
        Ok(Box::new(it))
    }
}

pub fn fingerprints_of(records: &[RawRecord]) -> Vec<Fingerprint> {
    records.iter().map(fingerprint).collect()
}

// -------- mbox fixtures --------

pub const PLAIN_MESSAGE: &str = "From: Carol <carol@example.com>\n\
To: team@example.com\n\
Subject: Plain one\n\
Date: Tue, 02 Jan 2024 09:30:00 +0000\n\
Message-ID: <plain-1@example.com>\n\
\n\
Hello team,\n\
>From the top, please.\n\
";

pub const MULTIPART_MESSAGE: &str = "From: Alice <alice@example.com>\n\
To: bob@example.com\n\
Subject: Quarterly\n\
\x20report\n\
Date: Mon, 01 Jan 2024 10:00:00 +0000\n\
Message-ID: <multi-1@example.com>\n\
MIME-Version: 1.0\n\
Content-Type: multipart/mixed; boundary=\"XYZ\"\n\
\n\
This is a multi-part message.\n\
--XYZ\n\
Content-Type: text/plain; charset=utf-8\n\
\n\
See attached.\n\
--XYZ\n\
Content-Type: text/html\n\
\n\
<p>See attached.</p>\n\
--XYZ\n\
Content-Type: application/pdf; name=\"r.pdf\"\n\
Content-Disposition: attachment; filename=\"r.pdf\"\n\
Content-Transfer-Encoding: base64\n\
\n\
SGVsbG8gUERG\n\
--XYZ--\n\
";

pub const NO_SUBJECT_MESSAGE: &str = "From: dave@example.com\n\
To: erin@example.com\n\
Message-ID: <nosubj-1@example.com>\n\
\n\
No subject here.\n\
";

/// Join messages into mbox text, with a `From ` separator before each one.
pub fn mbox_text(messages: &[&str]) -> String {
    let mut out = String::new();
    for (i, m) in messages.iter().enumerate() {
        out.push_str(&format!("From sender{}@example.com Mon Jan  1 10:00:00 2024\n", i));
        out.push_str(m);
        out.push('\n');
    }
    out
}

pub fn write_mbox(path: &Path, messages: &[&str]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, mbox_text(messages)).unwrap();
}

pub fn write_mbox_zst(path: &Path, messages: &[&str]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let f = File::create(path).unwrap();
    let mut enc = zstd::stream::write::Encoder::new(f, 3).unwrap();
    enc.write_all(mbox_text(messages).as_bytes()).unwrap();
    enc.finish().unwrap();
}
