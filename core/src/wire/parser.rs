//! The wire protocol parser.
//!
//! A single [`Parser`] instance owns a growing buffer and is fed raw
//! bytes as they arrive off the socket; it returns every complete event
//! found so far. State survives across calls so an op that straddles a
//! read boundary parses identically whichever way the bytes were split —
//! we favor a simple "buffer everything, rescan from the front" strategy
//! over a byte-at-a-time state machine with explicit resumption points:
//! it costs an extra copy on the (rare) split-frame path in exchange for
//! a parser that is easy to audit for correctness ahead of raw
//! throughput.

use crate::wire::event::{ServerInfo, ServerOp};
use crate::wire::headers::HeaderMap;
use crate::error::{Error, Result};

const CRLF: &[u8] = b"\r\n";
/// Bytes of context captured in a protocol error.
const EXCERPT_LEN: usize = 64;

#[derive(Debug, Default)]
pub struct Parser {
    buf: Vec<u8>,
}

impl Parser {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed newly-read bytes in and drain every event that can be fully
    /// parsed from the accumulated buffer.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<ServerOp>> {
        self.buf.extend_from_slice(data);
        let mut events = Vec::new();
        loop {
            match self.try_parse_one()? {
                Some((consumed, op)) => {
                    self.buf.drain(..consumed);
                    events.push(op);
                }
                None => break,
            }
        }
        Ok(events)
    }

    fn excerpt(&self, at: usize) -> String {
        let end = (at + EXCERPT_LEN).min(self.buf.len());
        String::from_utf8_lossy(&self.buf[at..end]).into_owned()
    }

    fn try_parse_one(&self) -> Result<Option<(usize, ServerOp)>> {
        let Some(line_end) = find(&self.buf, CRLF, 0) else {
            return Ok(None);
        };
        let line = &self.buf[..line_end];
        let after_line = line_end + CRLF.len();

        let (verb, rest) = split_verb(line);
        let verb_upper = verb.to_ascii_uppercase();

        match verb_upper.as_str() {
            "INFO" => {
                let json = std::str::from_utf8(rest)
                    .map_err(|_| Error::protocol_error(format!(
                        "INFO payload is not utf-8: {:?}",
                        self.excerpt(0)
                    )))?
                    .trim();
                let info: ServerInfo = serde_json::from_str(json).map_err(|e| {
                    Error::protocol_error(format!("malformed INFO json ({e}): {}", self.excerpt(0)))
                })?;
                Ok(Some((after_line, ServerOp::Info(info))))
            }
            "PING" => Ok(Some((after_line, ServerOp::Ping))),
            "PONG" => Ok(Some((after_line, ServerOp::Pong))),
            "+OK" => Ok(Some((after_line, ServerOp::Ok))),
            "-ERR" => {
                let text = std::str::from_utf8(rest).unwrap_or("").trim();
                let text = text.trim_matches('\'').to_string();
                Ok(Some((after_line, ServerOp::Err(text))))
            }
            "MSG" => self.try_parse_msg(rest, after_line),
            "HMSG" => self.try_parse_hmsg(rest, after_line),
            _ => Err(Error::protocol_error(format!(
                "unrecognized protocol verb: {}",
                self.excerpt(0)
            ))),
        }
    }

    fn try_parse_msg(&self, args: &[u8], after_line: usize) -> Result<Option<(usize, ServerOp)>> {
        let tokens = tokenize(args)?;
        let (subject, sid, reply, size) = match tokens.len() {
            3 => (tokens[0], tokens[1], None, tokens[2]),
            4 => (tokens[0], tokens[1], Some(tokens[2]), tokens[3]),
            _ => {
                return Err(Error::protocol_error(format!(
                    "MSG expects 3 or 4 arguments, got {}: {}",
                    tokens.len(),
                    self.excerpt(0)
                )))
            }
        };
        let sid = parse_non_negative(sid, "sid")?;
        let size = parse_non_negative(size, "size")? as usize;

        let total_needed = size + CRLF.len();
        if self.buf.len() < after_line + total_needed {
            return Ok(None);
        }
        let payload = self.buf[after_line..after_line + size].to_vec();
        let trailing = &self.buf[after_line + size..after_line + size + CRLF.len()];
        if trailing != CRLF {
            return Err(Error::protocol_error(format!(
                "MSG payload not followed by CRLF: {}",
                self.excerpt(after_line + size)
            )));
        }
        Ok(Some((
            after_line + total_needed,
            ServerOp::Msg {
                subject: subject.to_string(),
                sid,
                reply: reply.map(str::to_string),
                payload,
            },
        )))
    }

    fn try_parse_hmsg(&self, args: &[u8], after_line: usize) -> Result<Option<(usize, ServerOp)>> {
        let tokens = tokenize(args)?;
        let (subject, sid, reply, hdr_size, total_size) = match tokens.len() {
            4 => (tokens[0], tokens[1], None, tokens[2], tokens[3]),
            5 => (tokens[0], tokens[1], Some(tokens[2]), tokens[3], tokens[4]),
            _ => {
                return Err(Error::protocol_error(format!(
                    "HMSG expects 4 or 5 arguments, got {}: {}",
                    tokens.len(),
                    self.excerpt(0)
                )))
            }
        };
        let sid = parse_non_negative(sid, "sid")?;
        let hdr_size = parse_non_negative(hdr_size, "hdr_size")? as usize;
        let total_size = parse_non_negative(total_size, "total_size")? as usize;
        if hdr_size > total_size {
            return Err(Error::protocol_error(format!(
                "HMSG hdr_size {hdr_size} exceeds total_size {total_size}"
            )));
        }

        let total_needed = total_size + CRLF.len();
        if self.buf.len() < after_line + total_needed {
            return Ok(None);
        }
        let block = &self.buf[after_line..after_line + total_size];
        let header_bytes = &block[..hdr_size];
        let payload = block[hdr_size..].to_vec();
        let trailing = &self.buf[after_line + total_size..after_line + total_size + CRLF.len()];
        if trailing != CRLF {
            return Err(Error::protocol_error(format!(
                "HMSG payload not followed by CRLF: {}",
                self.excerpt(after_line + total_size)
            )));
        }
        let headers = HeaderMap::parse(header_bytes)?;
        Ok(Some((
            after_line + total_needed,
            ServerOp::Hmsg {
                subject: subject.to_string(),
                sid,
                reply: reply.map(str::to_string),
                headers,
                payload,
            },
        )))
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn split_verb(line: &[u8]) -> (&str, &[u8]) {
    let mut idx = 0;
    while idx < line.len() && !line[idx].is_ascii_whitespace() {
        idx += 1;
    }
    let verb = std::str::from_utf8(&line[..idx]).unwrap_or("");
    let rest = if idx < line.len() { &line[idx + 1..] } else { &[] };
    (verb, rest)
}

fn tokenize(args: &[u8]) -> Result<Vec<&str>> {
    let text = std::str::from_utf8(args)
        .map_err(|_| Error::protocol_error("control line arguments are not utf-8"))?;
    Ok(text.split_ascii_whitespace().collect())
}

fn parse_non_negative(token: &str, field: &str) -> Result<u64> {
    token
        .parse::<u64>()
        .map_err(|_| Error::protocol_error(format!("{field} must be a non-negative decimal: {token:?}")))
}
