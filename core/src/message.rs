//! The `Message` type.
//!
//! A received message is immutable after construction and cheaply
//! shareable: the stream layer fans one delivery out to multiple
//! internal observers (heartbeat/flow-control interception ahead of the
//! user handler), so the payload and headers live behind an `Arc` rather
//! than being cloned per observer.

use crate::wire::headers::HeaderMap;
use std::sync::Arc;
use std::time::SystemTime;

#[derive(Debug)]
struct Inner {
    subject: String,
    reply: Option<String>,
    payload: Vec<u8>,
    headers: Option<HeaderMap>,
    sid: u64,
    timestamp: SystemTime,
}

/// A received (or about-to-be-published) message.
///
/// Cloning a `Message` is an `Arc` bump, not a payload copy: the
/// *handle* can be shared for read access while the underlying bytes are
/// written exactly once at construction.
#[derive(Debug, Clone)]
pub struct Message {
    inner: Arc<Inner>,
}

impl Message {
    pub fn new(
        subject: impl Into<String>,
        reply: Option<String>,
        payload: impl Into<Vec<u8>>,
        headers: Option<HeaderMap>,
        sid: u64,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                subject: subject.into(),
                reply,
                payload: payload.into(),
                headers,
                sid,
                timestamp: SystemTime::now(),
            }),
        }
    }

    pub fn subject(&self) -> &str {
        &self.inner.subject
    }

    pub fn reply(&self) -> Option<&str> {
        self.inner.reply.as_deref()
    }

    pub fn payload(&self) -> &[u8] {
        &self.inner.payload
    }

    pub fn headers(&self) -> Option<&HeaderMap> {
        self.inner.headers.as_ref()
    }

    pub fn sid(&self) -> u64 {
        self.inner.sid
    }

    pub fn timestamp(&self) -> SystemTime {
        self.inner.timestamp
    }

    /// Size counted against a subscription's `pending_bytes` limit:
    /// payload plus an encoded-headers estimate, so header-heavy stream
    /// deliveries are not free.
    pub fn accounted_size(&self) -> usize {
        self.inner.payload.len()
            + self
                .inner
                .headers
                .as_ref()
                .map(|h| h.encode().len())
                .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_is_cheap_shared_handle() {
        let m = Message::new("foo", None, b"hello!".to_vec(), None, 1);
        let m2 = m.clone();
        assert_eq!(m.payload(), m2.payload());
        assert_eq!(m.payload(), b"hello!");
    }
}
