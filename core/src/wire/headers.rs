//! Header multimap and status-line parsing.
//!
//! A header block begins with `NATS/1.0` on its own line, optionally
//! followed by a three-digit status code and a description on that same
//! line, then zero or more `key: value` lines, terminated by a blank
//! line. Keys may repeat; order of values within a key and order of keys
//! as first-seen are both preserved, so callers that round-trip headers
//! observe byte-identical output.

use std::fmt;

pub const HEADER_VERSION_LINE: &str = "NATS/1.0";

/// Well-known status codes the stream/core layers branch on.
pub mod status {
    pub const CONTROL: u16 = 100;
    pub const NOT_FOUND: u16 = 404;
    pub const REQUEST_TIMEOUT: u16 = 408;
    pub const NO_RESPONDERS: u16 = 503;
}

/// An ordered multimap of header key to header values, plus the parsed
/// status line (if present).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    status_code: Option<u16>,
    status_description: Option<String>,
    // Insertion-ordered: a Vec of (key, values) rather than a HashMap so
    // that re-encoding a parsed header block is byte-for-byte stable.
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(code: u16, description: impl Into<String>) -> Self {
        Self {
            status_code: Some(code),
            status_description: Some(description.into()),
            entries: Vec::new(),
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    pub fn status_description(&self) -> Option<&str> {
        self.status_description.as_deref()
    }

    pub fn set_status(&mut self, code: u16, description: impl Into<String>) {
        self.status_code = Some(code);
        self.status_description = Some(description.into());
    }

    /// Append a value for `key`, preserving any existing values and
    /// first-seen key order.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        if let Some((_, values)) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            values.push(value.into());
        } else {
            self.entries.push((key, vec![value.into()]));
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_all(key).first().copied()
    }

    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.status_code.is_none() && self.entries.is_empty()
    }

    pub fn is_no_responders(&self) -> bool {
        self.status_code == Some(status::NO_RESPONDERS)
    }

    pub fn is_control(&self) -> bool {
        self.status_code == Some(status::CONTROL)
    }

    /// Encode into the wire representation, *not* including the trailing
    /// blank line that separates headers from the payload (the frame
    /// writer appends that).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(HEADER_VERSION_LINE.as_bytes());
        if let Some(code) = self.status_code {
            out.push(b' ');
            out.extend_from_slice(code.to_string().as_bytes());
            if let Some(desc) = &self.status_description {
                if !desc.is_empty() {
                    out.push(b' ');
                    out.extend_from_slice(desc.as_bytes());
                }
            }
        }
        out.extend_from_slice(b"\r\n");
        for (key, values) in &self.entries {
            for value in values {
                out.extend_from_slice(key.as_bytes());
                out.extend_from_slice(b": ");
                out.extend_from_slice(value.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
        }
        out
    }

    /// Parse a header block (without the trailing blank line).
    pub fn parse(block: &[u8]) -> crate::error::Result<Self> {
        let text = std::str::from_utf8(block)
            .map_err(|_| crate::error::Error::protocol_error("header block is not utf-8"))?;
        let mut lines = text.split("\r\n");
        let status_line = lines
            .next()
            .ok_or_else(|| crate::error::Error::protocol_error("empty header block"))?;
        if !status_line.starts_with(HEADER_VERSION_LINE) {
            return Err(crate::error::Error::protocol_error(format!(
                "header block missing {HEADER_VERSION_LINE} status line: {status_line:?}"
            )));
        }
        let rest = status_line[HEADER_VERSION_LINE.len()..].trim_start();
        let mut map = HeaderMap::new();
        if !rest.is_empty() {
            let (code_str, desc) = match rest.split_once(' ') {
                Some((c, d)) => (c, d.trim()),
                None => (rest, ""),
            };
            let code: u16 = code_str.parse().map_err(|_| {
                crate::error::Error::protocol_error(format!(
                    "invalid status code {code_str:?} in header block"
                ))
            })?;
            map.set_status(code, desc);
        }
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once(':').ok_or_else(|| {
                crate::error::Error::protocol_error(format!("malformed header line: {line:?}"))
            })?;
            map.append(key.trim(), value.trim());
        }
        Ok(map)
    }
}

impl fmt::Display for HeaderMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.encode()))
    }
}
