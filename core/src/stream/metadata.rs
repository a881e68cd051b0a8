//! Delivery metadata encoded in a stream consumer's reply subject.

use crate::error::{Error, Result};

pub const ACK_PREFIX: &str = "$JS.ACK.";

/// Metadata carried by a stream delivery's reply subject rather than
/// its payload: which stream/consumer it came from, how many times
/// it's been redelivered, and its position in both the stream and the
/// consumer's own sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsMsgMetadata {
    pub stream: String,
    pub consumer: String,
    pub num_delivered: u64,
    pub stream_seq: u64,
    pub consumer_seq: u64,
    pub timestamp_nanos: i64,
    pub num_pending: u64,
}

impl JsMsgMetadata {
    /// Parse `$JS.ACK.<stream>.<consumer>.<delivered>.<sseq>.<cseq>.<ts>.<pending>`,
    /// tolerating the domain/account-hash-prefixed variant some deployments
    /// emit (extra fields ahead of `<stream>`).
    pub fn parse(reply_subject: &str) -> Result<Self> {
        let rest = reply_subject.strip_prefix(ACK_PREFIX).ok_or_else(|| {
            Error::protocol_error(format!("not a stream ack subject: {reply_subject}"))
        })?;
        let parts: Vec<&str> = rest.split('.').collect();
        if parts.len() < 7 {
            return Err(Error::protocol_error(format!(
                "malformed ack subject (too few fields): {reply_subject}"
            )));
        }
        let n = parts.len();
        let stream = parts[n - 7].to_string();
        let consumer = parts[n - 6].to_string();
        let num_delivered = parse_u64(parts[n - 5], reply_subject)?;
        let stream_seq = parse_u64(parts[n - 4], reply_subject)?;
        let consumer_seq = parse_u64(parts[n - 3], reply_subject)?;
        let timestamp_nanos = parts[n - 2]
            .parse::<i64>()
            .map_err(|_| Error::protocol_error(format!("bad timestamp in {reply_subject}")))?;
        let num_pending = parse_u64(parts[n - 1], reply_subject)?;
        Ok(Self {
            stream,
            consumer,
            num_delivered,
            stream_seq,
            consumer_seq,
            timestamp_nanos,
            num_pending,
        })
    }
}

fn parse_u64(s: &str, ctx: &str) -> Result<u64> {
    s.parse()
        .map_err(|_| Error::protocol_error(format!("bad integer field in ack subject {ctx}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_ack_subject() {
        let subj = "$JS.ACK.ORDERS.dur1.3.1024.7.1700000000000000000.0";
        let md = JsMsgMetadata::parse(subj).unwrap();
        assert_eq!(md.stream, "ORDERS");
        assert_eq!(md.consumer, "dur1");
        assert_eq!(md.num_delivered, 3);
        assert_eq!(md.stream_seq, 1024);
        assert_eq!(md.consumer_seq, 7);
        assert_eq!(md.num_pending, 0);
    }

    #[test]
    fn parses_domain_prefixed_variant() {
        let subj = "$JS.ACK.hub.deadbeef.ORDERS.dur1.1.1.1.1700000000000000000.5";
        let md = JsMsgMetadata::parse(subj).unwrap();
        assert_eq!(md.stream, "ORDERS");
        assert_eq!(md.consumer, "dur1");
        assert_eq!(md.num_pending, 5);
    }

    #[test]
    fn rejects_non_ack_subject() {
        assert!(JsMsgMetadata::parse("foo.bar").is_err());
    }

    #[test]
    fn rejects_too_few_fields() {
        assert!(JsMsgMetadata::parse("$JS.ACK.ORDERS.dur1.1").is_err());
    }
}
