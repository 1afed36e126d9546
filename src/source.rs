//! Source reader contract.

use crate::record::RawRecord;
use anyhow::Result;

pub type RecordIter<'a> = Box<dyn Iterator<Item = Result<RawRecord>> + Send + 'a>;

/// A restartable, finite, lazily-read sequence of records.
///
/// Every call to `records` starts from the beginning and must yield the same
/// records in the same order for the same underlying data; resume relies on it.
pub trait RecordSource {
    /// Stable identity of the underlying data (e.g. canonical path).
    fn identity(&self) -> String;

    fn records(&self) -> Result<RecordIter<'_>>;
}

/// In-memory source, mostly for tests and small imports.
#[derive(Clone, Debug, Default)]
pub struct VecSource {
    identity: String,
    records: Vec<RawRecord>,
}

impl VecSource {
    pub fn new(identity: impl Into<String>, records: Vec<RawRecord>) -> Self {
        Self { identity: identity.into(), records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl RecordSource for VecSource {
    fn identity(&self) -> String {
        self.identity.clone()
    }

    fn records(&self) -> Result<RecordIter<'_>> {
        Ok(Box::new(self.records.iter().cloned().map(Ok)))
    }
}
