//! Outbound frame encoding.

use crate::wire::event::ConnectPayload;
use crate::wire::headers::HeaderMap;

pub fn encode_connect(payload: &ConnectPayload) -> Vec<u8> {
    let json = serde_json::to_string(payload).expect("ConnectPayload always serializes");
    let mut out = Vec::with_capacity(json.len() + 16);
    out.extend_from_slice(b"CONNECT ");
    out.extend_from_slice(json.as_bytes());
    out.extend_from_slice(b"\r\n");
    out
}

pub fn encode_pub(subject: &str, reply: Option<&str>, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(subject.len() + payload.len() + 32);
    out.extend_from_slice(b"PUB ");
    out.extend_from_slice(subject.as_bytes());
    if let Some(reply) = reply {
        out.push(b' ');
        out.extend_from_slice(reply.as_bytes());
    }
    out.push(b' ');
    out.extend_from_slice(payload.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\r\n");
    out
}

pub fn encode_hpub(subject: &str, reply: Option<&str>, headers: &HeaderMap, payload: &[u8]) -> Vec<u8> {
    let header_bytes = headers.encode();
    // `hdr_size` counts through the blank line that ends the header
    // block, so we append it here before measuring.
    let mut full_header = header_bytes;
    full_header.extend_from_slice(b"\r\n");
    let hdr_size = full_header.len();
    let total_size = hdr_size + payload.len();

    let mut out = Vec::with_capacity(subject.len() + total_size + 48);
    out.extend_from_slice(b"HPUB ");
    out.extend_from_slice(subject.as_bytes());
    if let Some(reply) = reply {
        out.push(b' ');
        out.extend_from_slice(reply.as_bytes());
    }
    out.push(b' ');
    out.extend_from_slice(hdr_size.to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(total_size.to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&full_header);
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\r\n");
    out
}

pub fn encode_sub(subject: &str, queue_group: Option<&str>, sid: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(subject.len() + 32);
    out.extend_from_slice(b"SUB ");
    out.extend_from_slice(subject.as_bytes());
    if let Some(q) = queue_group {
        out.push(b' ');
        out.extend_from_slice(q.as_bytes());
    }
    out.push(b' ');
    out.extend_from_slice(sid.to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    out
}

pub fn encode_unsub(sid: u64, max: Option<u64>) -> Vec<u8> {
    let mut out = Vec::with_capacity(24);
    out.extend_from_slice(b"UNSUB ");
    out.extend_from_slice(sid.to_string().as_bytes());
    if let Some(max) = max {
        out.push(b' ');
        out.extend_from_slice(max.to_string().as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out
}

pub fn encode_ping() -> &'static [u8] {
    b"PING\r\n"
}

pub fn encode_pong() -> &'static [u8] {
    b"PONG\r\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::parser::Parser;
    use crate::wire::event::ServerOp;

    #[test]
    fn pub_round_trips_through_parser_as_msg_shape() {
        // PUB isn't directly parseable by the (inbound-only) parser, but
        // we can verify the byte layout matches the MSG framing rules it
        // does parse, by wrapping it as a MSG frame with the same sizes.
        let encoded = encode_pub("foo", Some("bar"), b"hello!");
        let expected = b"PUB foo bar 6\r\nhello!\r\n";
        assert_eq!(encoded, expected);
    }

    #[test]
    fn sub_without_queue_group() {
        assert_eq!(encode_sub("foo", None, 42), b"SUB foo 42\r\n");
    }

    #[test]
    fn sub_with_queue_group() {
        assert_eq!(encode_sub("foo", Some("workers"), 42), b"SUB foo workers 42\r\n");
    }

    #[test]
    fn unsub_with_and_without_max() {
        assert_eq!(encode_unsub(7, None), b"UNSUB 7\r\n");
        assert_eq!(encode_unsub(7, Some(3)), b"UNSUB 7 3\r\n");
    }

    #[test]
    fn hpub_hdr_size_matches_parsed_header_block() {
        let mut headers = HeaderMap::new();
        headers.append("X-A", "1");
        let encoded = encode_hpub("foo", None, &headers, b"hi");
        let mut p = Parser::new();
        // Re-frame as HMSG to exercise the same parser path.
        let as_hmsg = {
            let s = String::from_utf8(encoded.clone()).unwrap();
            s.replacen("HPUB", "HMSG", 1)
        };
        let ops = p.feed(as_hmsg.as_bytes()).unwrap();
        match &ops[0] {
            ServerOp::Hmsg { headers, payload, .. } => {
                assert_eq!(headers.get("X-A"), Some("1"));
                assert_eq!(payload, b"hi");
            }
            _ => panic!("expected Hmsg"),
        }
    }
}
