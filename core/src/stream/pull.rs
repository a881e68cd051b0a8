//! Pull-delivery stream consumer.
//!
//! A pull consumer has no standing delivery subject; the client fetches
//! batches on demand by publishing a request to the consumer's
//! `CONSUMER.MSG.NEXT` subject with a one-shot inbox as the reply, then
//! collects up to `batch` deliveries (or until `max_wait` elapses).

use super::{respond_with_word, ACK_WORD, IN_PROGRESS_WORD, NAK_WORD, TERM_WORD};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::subscription::{MailboxLimits, Subscription};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct PullOptions {
    pub stream: String,
    pub consumer_name: String,
    pub batch: u32,
    pub max_wait: Duration,
    pub no_wait: bool,
    /// When set, [`PullConsumer::next_msg`] issues a fresh pull once the
    /// number of fetched-but-unacked messages it is tracking falls below
    /// this count.
    pub auto_refill_low_water: Option<u32>,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            stream: String::new(),
            consumer_name: String::new(),
            batch: 1,
            max_wait: Duration::from_secs(5),
            no_wait: false,
            auto_refill_low_water: None,
        }
    }
}

#[derive(serde::Serialize)]
struct PullRequest {
    batch: u32,
    #[serde(rename = "expires", skip_serializing_if = "Option::is_none")]
    expires_nanos: Option<i64>,
    #[serde(skip_serializing_if = "is_false")]
    no_wait: bool,
}

fn is_false(b: &bool) -> bool {
    !b
}

/// A bound pull subscription against a single stream consumer.
///
/// Only one fetch may be outstanding at a time — a concurrent pull
/// request is rejected — tracked with `fetch_in_flight`.
pub struct PullConsumer {
    conn: Arc<Connection>,
    opts: PullOptions,
    inbox: Arc<Subscription>,
    fetch_in_flight: AtomicBool,
    unacked: std::sync::atomic::AtomicU32,
}

impl PullConsumer {
    pub fn bind(conn: Arc<Connection>, opts: PullOptions) -> Result<Arc<Self>> {
        if opts.stream.is_empty() || opts.consumer_name.is_empty() {
            return Err(Error::invalid_argument(
                "pull consumer requires both stream and consumer_name",
            ));
        }
        let inbox_subject = format!("_STREAM.PULL.{}", crate::nuid::Nuid::new().next());
        let inbox = conn.subscribe(&inbox_subject, None, None, MailboxLimits::default())?;
        Ok(Arc::new(Self {
            conn,
            opts,
            inbox,
            fetch_in_flight: AtomicBool::new(false),
            unacked: std::sync::atomic::AtomicU32::new(0),
        }))
    }

    fn next_subject(&self) -> String {
        format!(
            "$JS.API.CONSUMER.MSG.NEXT.{}.{}",
            self.opts.stream, self.opts.consumer_name
        )
    }

    /// Fetch up to `batch` messages, waiting no longer than `max_wait`
    /// for the first one. Rejects a second concurrent call with
    /// `illegal_state`.
    pub fn fetch(&self) -> Result<Vec<Message>> {
        if self
            .fetch_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::illegal_state(
                "a pull request is already outstanding on this consumer",
            ));
        }
        let result = self.fetch_inner();
        self.fetch_in_flight.store(false, Ordering::SeqCst);
        result
    }

    fn fetch_inner(&self) -> Result<Vec<Message>> {
        let request = PullRequest {
            batch: self.opts.batch,
            expires_nanos: Some(self.opts.max_wait.as_nanos() as i64),
            no_wait: self.opts.no_wait,
        };
        let payload = serde_json::to_vec(&request)
            .map_err(|e| Error::protocol_error(format!("encoding pull request: {e}")))?;
        self.conn.publish(
            &self.next_subject(),
            Some(self.inbox.subject()),
            &payload,
            None,
        )?;

        let deadline = Instant::now() + self.opts.max_wait;
        let mut batch = Vec::with_capacity(self.opts.batch as usize);
        while (batch.len() as u32) < self.opts.batch {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.inbox.next_msg(remaining) {
                Ok(msg) => {
                    if is_no_messages_status(&msg) {
                        break;
                    }
                    batch.push(msg);
                }
                Err(e) if e.kind() == crate::error::ErrorKind::Timeout => break,
                Err(e) => return Err(e),
            }
        }
        self.unacked
            .fetch_add(batch.len() as u32, Ordering::SeqCst);
        if batch.is_empty() {
            return Err(Error::timeout("pull request returned no messages"));
        }
        Ok(batch)
    }

    /// Blocking single-message read with auto-refill: if
    /// `auto_refill_low_water` is configured and the tracked unacked
    /// count has fallen at or below it, a fresh fetch is issued before
    /// waiting.
    pub fn next_msg(&self, timeout: Duration) -> Result<Message> {
        if let Some(low_water) = self.opts.auto_refill_low_water {
            if self.unacked.load(Ordering::SeqCst) <= low_water
                && !self.fetch_in_flight.load(Ordering::SeqCst)
            {
                let _ = self.fetch();
            }
        }
        self.inbox.next_msg(timeout)
    }

    pub fn ack(&self, msg: &Message) -> Result<()> {
        self.unacked.fetch_sub(1, Ordering::SeqCst);
        respond_with_word(&self.conn, msg, ACK_WORD)
    }

    pub fn nak(&self, msg: &Message) -> Result<()> {
        self.unacked.fetch_sub(1, Ordering::SeqCst);
        respond_with_word(&self.conn, msg, NAK_WORD)
    }

    pub fn in_progress(&self, msg: &Message) -> Result<()> {
        respond_with_word(&self.conn, msg, IN_PROGRESS_WORD)
    }

    pub fn term(&self, msg: &Message) -> Result<()> {
        self.unacked.fetch_sub(1, Ordering::SeqCst);
        respond_with_word(&self.conn, msg, TERM_WORD)
    }
}

/// A 404/408-status control message the broker sends instead of data
/// when a `no_wait` or expired pull request comes up empty.
fn is_no_messages_status(msg: &Message) -> bool {
    msg.headers()
        .and_then(|h| h.status_code())
        .map(|code| code == 404 || code == 408)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_request_omits_no_wait_when_false() {
        let req = PullRequest {
            batch: 10,
            expires_nanos: Some(1_000_000),
            no_wait: false,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("no_wait"));
        assert!(json.contains("\"batch\":10"));
    }

    #[test]
    fn pull_request_includes_no_wait_when_true() {
        let req = PullRequest {
            batch: 1,
            expires_nanos: None,
            no_wait: true,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"no_wait\":true"));
    }
}
