//! In-memory email record as produced by a source reader.

/// One attachment, held fully in memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub content: Vec<u8>,
}

/// Plain and/or rendered HTML body.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MailBody {
    pub plain: Option<String>,
    pub html: Option<String>,
}

impl MailBody {
    pub fn is_empty(&self) -> bool {
        self.plain.as_deref().map_or(true, str::is_empty) && self.html.as_deref().map_or(true, str::is_empty)
    }
}

/// One unprocessed email. Never mutated after the source hands it out.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawRecord {
    /// Position in the source (0-based).
    pub ordinal: u64,
    /// Raw header fields in source order; duplicates preserved.
    pub headers: Vec<(String, String)>,
    pub body: MailBody,
    pub attachments: Vec<Attachment>,
}

impl RawRecord {
    pub fn new(ordinal: u64) -> Self {
        Self { ordinal, ..Default::default() }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_plain(mut self, text: impl Into<String>) -> Self {
        self.body.plain = Some(text.into());
        self
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.body.html = Some(html.into());
        self
    }

    pub fn with_attachment(mut self, name: impl Into<String>, mime_type: impl Into<String>, content: Vec<u8>) -> Self {
        self.attachments.push(Attachment { name: name.into(), mime_type: mime_type.into(), content });
        self
    }

    /// First header named `name` (ASCII case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    /// Every header named `name`, in source order.
    pub fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn subject(&self) -> Option<&str> {
        self.header("subject")
    }

    /// Bytes held by body and attachments; used for logging only.
    pub fn approx_size(&self) -> usize {
        let body = self.body.plain.as_ref().map_or(0, String::len) + self.body.html.as_ref().map_or(0, String::len);
        let atts: usize = self.attachments.iter().map(|a| a.content.len()).sum();
        let hdrs: usize = self.headers.iter().map(|(k, v)| k.len() + v.len()).sum();
        body + atts + hdrs
    }
}
