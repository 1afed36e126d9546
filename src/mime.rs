//! Just enough RFC 5322 / MIME to turn one raw message into a `RawRecord`:
//! unfolded headers, first text/plain and text/html leaves as bodies, every other
//! leaf (or anything with a filename / attachment disposition) as an attachment.
//! Charsets are not converted; text is decoded as lossy UTF-8.

use crate::record::RawRecord;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use regex::Regex;
use std::sync::OnceLock;

const MAX_DEPTH: usize = 8;

/// Parse one message (without its mbox `From ` line).
pub fn parse_message(ordinal: u64, raw: &[u8]) -> RawRecord {
    let (head, body) = split_head_body(raw);
    let mut record = RawRecord::new(ordinal);
    record.headers = parse_headers(head);
    let top = record.headers.clone();
    walk(&top, body, 0, &mut record);
    record
}

/// Split at the first empty line. No empty line → everything is header.
pub fn split_head_body(raw: &[u8]) -> (&[u8], &[u8]) {
    if raw.starts_with(b"\r\n") {
        return (&[], &raw[2..]);
    }
    if raw.starts_with(b"\n") {
        return (&[], &raw[1..]);
    }
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\n' {
            if raw.get(i + 1) == Some(&b'\n') {
                return (&raw[..i], &raw[i + 2..]);
            }
            if raw.get(i + 1) == Some(&b'\r') && raw.get(i + 2) == Some(&b'\n') {
                return (&raw[..i], &raw[i + 3..]);
            }
        }
        i += 1;
    }
    (raw, &[])
}

/// Unfold and split header lines; order and duplicates are preserved.
pub fn parse_headers(head: &[u8]) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(head);
    let mut out: Vec<(String, String)> = Vec::new();
    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, v)) = out.last_mut() {
                let cont = line.trim();
                if !cont.is_empty() {
                    if !v.is_empty() {
                        v.push(' ');
                    }
                    v.push_str(cont);
                }
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            if !name.is_empty() && !name.contains(' ') {
                out.push((name.to_string(), value.trim().to_string()));
            }
        }
    }
    out
}

/// `type/subtype; k=v; ...` → lowercased type plus parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderValue {
    pub value: String,
    pub params: Vec<(String, String)>,
}

impl HeaderValue {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }
}

fn param_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i);\s*([a-z0-9_.*-]+)\s*=\s*(?:"((?:[^"\\]|\\.)*)"|([^;\s]+))"#).expect("static regex")
    })
}

pub fn parse_header_value(raw: &str) -> HeaderValue {
    let value = raw.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    let mut params = Vec::new();
    for cap in param_re().captures_iter(raw) {
        let mut key = cap[1].to_ascii_lowercase();
        let mut val = cap.get(2).or_else(|| cap.get(3)).map(|m| m.as_str().to_string()).unwrap_or_default();
        // RFC 2231: filename*=utf-8''na%20me.pdf
        if let Some(stripped) = key.strip_suffix('*') {
            key = stripped.to_string();
            if let Some((_, encoded)) = val.split_once("''") {
                val = percent_decode(encoded);
            }
        }
        params.push((key, val.replace("\\\"", "\"")));
    }
    HeaderValue { value, params }
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(h), Some(l)) = (bytes.get(i + 1).and_then(hex_val), bytes.get(i + 2).and_then(hex_val)) {
                out.push((h << 4) | l);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: &u8) -> Option<u8> {
    (*b as char).to_digit(16).map(|d| d as u8)
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
}

fn walk(headers: &[(String, String)], body: &[u8], depth: usize, out: &mut RawRecord) {
    let ctype = parse_header_value(header(headers, "content-type").unwrap_or("text/plain"));
    let mime = if ctype.value.is_empty() { "text/plain".to_string() } else { ctype.value.clone() };

    if mime.starts_with("multipart/") && depth < MAX_DEPTH {
        if let Some(boundary) = ctype.param("boundary") {
            for part in split_multipart(body, boundary) {
                let (ph, pb) = split_head_body(part);
                let part_headers = parse_headers(ph);
                walk(&part_headers, pb, depth + 1, out);
            }
            return;
        }
    }

    let cte = header(headers, "content-transfer-encoding").unwrap_or("").trim().to_ascii_lowercase();
    let decoded = decode_transfer(&cte, body);
    let disposition = header(headers, "content-disposition").map(parse_header_value);
    let filename = disposition
        .as_ref()
        .and_then(|d| d.param("filename"))
        .or_else(|| ctype.param("name"))
        .map(str::to_string);
    let is_attachment = disposition.as_ref().map_or(false, |d| d.value == "attachment") || filename.is_some();

    if !is_attachment && mime == "text/html" {
        if out.body.html.is_none() {
            out.body.html = Some(String::from_utf8_lossy(&decoded).into_owned());
        }
        return;
    }
    if !is_attachment && mime.starts_with("text/") {
        if out.body.plain.is_none() {
            out.body.plain = Some(String::from_utf8_lossy(&decoded).into_owned());
        }
        return;
    }

    let name = filename.unwrap_or_else(|| format!("part-{}.bin", out.attachments.len() + 1));
    out.attachments.push(crate::record::Attachment { name, mime_type: mime, content: decoded });
}

/// Body slices between `--boundary` delimiter lines, up to `--boundary--`.
pub fn split_multipart<'a>(body: &'a [u8], boundary: &str) -> Vec<&'a [u8]> {
    let delim = format!("--{}", boundary);
    let delim = delim.as_bytes();
    let mut parts = Vec::new();
    let mut start: Option<usize> = None;
    let mut pos = 0usize;

    while pos < body.len() {
        let line_end = body[pos..].iter().position(|&b| b == b'\n').map_or(body.len(), |i| pos + i);
        let next = if line_end < body.len() { line_end + 1 } else { body.len() };
        let line = trim_cr(&body[pos..line_end]);

        if let Some(rest) = line.strip_prefix(delim) {
            let closing = rest.starts_with(b"--");
            if closing || rest.iter().all(|b| b.is_ascii_whitespace()) {
                if let Some(s) = start {
                    parts.push(strip_line_break(&body[s..pos]));
                }
                if closing {
                    return parts;
                }
                start = Some(next);
            }
        }
        pos = next;
    }
    if let Some(s) = start {
        if s < body.len() {
            parts.push(&body[s..]);
        }
    }
    parts
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

// The line break before a delimiter belongs to the delimiter.
fn strip_line_break(part: &[u8]) -> &[u8] {
    let part = part.strip_suffix(b"\n").unwrap_or(part);
    part.strip_suffix(b"\r").unwrap_or(part)
}

pub fn decode_transfer(encoding: &str, data: &[u8]) -> Vec<u8> {
    match encoding {
        "base64" => {
            let compact: Vec<u8> = data.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
            match STANDARD.decode(&compact).or_else(|_| STANDARD_NO_PAD.decode(&compact)) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::debug!("invalid base64 part kept verbatim: {}", e);
                    data.to_vec()
                }
            }
        }
        "quoted-printable" => decode_quoted_printable(data),
        _ => data.to_vec(),
    }
}

pub fn decode_quoted_printable(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'=' {
            // soft line break
            if data.get(i + 1) == Some(&b'\n') {
                i += 2;
                continue;
            }
            if data.get(i + 1) == Some(&b'\r') && data.get(i + 2) == Some(&b'\n') {
                i += 3;
                continue;
            }
            if let (Some(h), Some(l)) = (data.get(i + 1).and_then(hex_val), data.get(i + 2).and_then(hex_val)) {
                out.push((h << 4) | l);
                i += 3;
                continue;
            }
        }
        out.push(data[i]);
        i += 1;
    }
    out
}
