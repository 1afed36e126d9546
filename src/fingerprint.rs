//! Stable record identity used for dedup and checkpoint membership.
//!
//! The canonical field set is: sender, To/Cc recipients, subject, date (normalised to
//! a unix timestamp when it parses as RFC 2822), Message-ID, a digest of both body
//! renditions and a digest of every attachment (name, type, bytes). The source
//! ordinal is deliberately excluded so the same email hashes the same wherever it
//! sits in the archive.

use crate::record::RawRecord;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use time::format_description::well_known::Rfc2822;
use time::OffsetDateTime;

pub const FINGERPRINT_LEN: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex chars; enough to eyeball in logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl FromStr for Fingerprint {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; FINGERPRINT_LEN];
        hex::decode_to_slice(s.trim(), &mut out)?;
        Ok(Self(out))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Derive the fingerprint of `record`. Pure and deterministic.
pub fn fingerprint(record: &RawRecord) -> Fingerprint {
    let mut h = Sha256::new();

    field(&mut h, b"from", normalize_addresses(record.headers_named("from")).as_bytes());
    field(&mut h, b"to", normalize_addresses(record.headers_named("to")).as_bytes());
    field(&mut h, b"cc", normalize_addresses(record.headers_named("cc")).as_bytes());
    field(&mut h, b"subject", collapse_ws(record.subject().unwrap_or("")).as_bytes());
    field(&mut h, b"date", canonical_date(record.header("date")).as_bytes());
    field(&mut h, b"message-id", record.header("message-id").map(str::trim).unwrap_or("").as_bytes());

    let mut body = Sha256::new();
    field(&mut body, b"plain", record.body.plain.as_deref().unwrap_or("").as_bytes());
    field(&mut body, b"html", record.body.html.as_deref().unwrap_or("").as_bytes());
    field(&mut h, b"body", &body.finalize());

    field(&mut h, b"attachments", &(record.attachments.len() as u64).to_le_bytes());
    for att in &record.attachments {
        let mut a = Sha256::new();
        field(&mut a, b"name", att.name.as_bytes());
        field(&mut a, b"type", att.mime_type.to_ascii_lowercase().as_bytes());
        field(&mut a, b"content", &att.content);
        field(&mut h, b"attachment", &a.finalize());
    }

    Fingerprint(h.finalize().into())
}

// Length-prefixed so adjacent fields can't bleed into each other.
fn field(h: &mut Sha256, label: &[u8], value: &[u8]) {
    h.update((label.len() as u64).to_le_bytes());
    h.update(label);
    h.update((value.len() as u64).to_le_bytes());
    h.update(value);
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn normalize_addresses<'a>(values: impl Iterator<Item = &'a str>) -> String {
    let joined: Vec<String> = values.map(|v| collapse_ws(v).to_lowercase()).collect();
    joined.join(",")
}

fn canonical_date(raw: Option<&str>) -> String {
    let Some(raw) = raw else { return String::new() };
    // Trailing "(UTC)"-style comments are legal but rejected by the strict parser.
    let trimmed = raw.split('(').next().unwrap_or(raw).trim();
    match OffsetDateTime::parse(trimmed, &Rfc2822) {
        Ok(dt) => dt.unix_timestamp().to_string(),
        Err(_) => collapse_ws(raw),
    }
}
