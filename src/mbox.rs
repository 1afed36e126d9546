//! Lazy mbox reader. Plain files and `.zst`-compressed archives are both streamed;
//! only the message being assembled is held in memory.

use crate::mime::parse_message;
use crate::record::RawRecord;
use crate::source::{RecordIter, RecordSource};
use crate::util::open_with_backoff;
use anyhow::{Context, Result};
use regex::bytes::Regex;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use zstd::stream::read::Decoder;

fn separator_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^From \S+").expect("static regex"))
}

fn escaped_from_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^>+From ").expect("static regex"))
}

/// How body lines that look like a separator were quoted when the archive was written.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MboxFlavor {
    /// Every `>*From ` line gained one `>`; one is stripped again on read.
    #[default]
    Mboxrd,
    /// Only `From ` lines were quoted, so a quoted line and a literal `>From `
    /// look the same. Body lines are kept exactly as stored.
    Mboxo,
}

impl std::str::FromStr for MboxFlavor {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mboxrd" => Ok(MboxFlavor::Mboxrd),
            "mboxo" => Ok(MboxFlavor::Mboxo),
            other => anyhow::bail!("unknown mbox flavor {:?} (expected mboxrd or mboxo)", other),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MboxReader {
    path: PathBuf,
    read_buf_bytes: usize,
    flavor: MboxFlavor,
}

impl MboxReader {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf(), read_buf_bytes: 256 * 1024, flavor: MboxFlavor::default() }
    }

    pub fn with_flavor(mut self, flavor: MboxFlavor) -> Self {
        self.flavor = flavor;
        self
    }

    pub fn with_read_buffer(mut self, bytes: usize) -> Self {
        self.read_buf_bytes = bytes.max(8 * 1024);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_zstd(&self) -> bool {
        self.path.extension().and_then(|e| e.to_str()).map_or(false, |e| e.eq_ignore_ascii_case("zst"))
    }

    fn open(&self) -> Result<Box<dyn BufRead + Send>> {
        let file = open_with_backoff(&self.path, 16, 50).with_context(|| format!("open {}", self.path.display()))?;
        if self.is_zstd() {
            let mut decoder = Decoder::new(file).with_context(|| format!("zstd init {}", self.path.display()))?;
            // Large windows show up in big archives; refuse them and the read fails.
            decoder.window_log_max(31)?;
            Ok(Box::new(BufReader::with_capacity(self.read_buf_bytes, decoder)))
        } else {
            Ok(Box::new(BufReader::with_capacity(self.read_buf_bytes, file)))
        }
    }
}

impl RecordSource for MboxReader {
    fn identity(&self) -> String {
        let p = fs::canonicalize(&self.path).unwrap_or_else(|_| self.path.clone());
        format!("mbox:{}", p.display())
    }

    fn records(&self) -> Result<RecordIter<'_>> {
        let reader = self.open()?;
        Ok(Box::new(MboxRecords::new(reader).flavor(self.flavor)))
    }
}

/// Iterator over the messages of one mbox stream.
pub struct MboxRecords<R: BufRead> {
    reader: R,
    line: Vec<u8>,
    message: Vec<u8>,
    in_message: bool,
    ordinal: u64,
    done: bool,
    flavor: MboxFlavor,
}

impl<R: BufRead> MboxRecords<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: Vec::with_capacity(4 * 1024),
            message: Vec::with_capacity(64 * 1024),
            in_message: false,
            ordinal: 0,
            done: false,
            flavor: MboxFlavor::default(),
        }
    }

    pub fn flavor(mut self, flavor: MboxFlavor) -> Self {
        self.flavor = flavor;
        self
    }

    fn emit(&mut self) -> RawRecord {
        let mut raw = std::mem::take(&mut self.message);
        // The blank line before a separator belongs to the separator.
        if raw.ends_with(b"\n") {
            raw.pop();
            if raw.ends_with(b"\r") {
                raw.pop();
            }
        }
        let record = parse_message(self.ordinal, &raw);
        self.ordinal += 1;
        record
    }
}

impl<R: BufRead> Iterator for MboxRecords<R> {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            self.line.clear();
            let n = match self.reader.read_until(b'\n', &mut self.line) {
                Ok(n) => n,
                Err(e) => {
                    self.done = true;
                    return Some(Err(anyhow::Error::new(e).context(format!("read mbox after message {}", self.ordinal))));
                }
            };

            if n == 0 {
                self.done = true;
                if self.in_message {
                    self.in_message = false;
                    return Some(Ok(self.emit()));
                }
                return None;
            }

            if separator_re().is_match(&self.line) {
                if self.in_message {
                    // Next message starts here; the separator line itself is dropped.
                    return Some(Ok(self.emit()));
                }
                self.in_message = true;
                continue;
            }

            if !self.in_message {
                // Junk before the first separator.
                continue;
            }

            if self.flavor == MboxFlavor::Mboxrd && escaped_from_re().is_match(&self.line) {
                self.message.extend_from_slice(&self.line[1..]);
            } else {
                self.message.extend_from_slice(&self.line);
            }
        }
    }
}
