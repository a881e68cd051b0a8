//! Push-delivery stream consumer: ack kinds, heartbeat and
//! flow-control interception, and ordered-consumer resynchronization.

use super::api::{ConsumerConfig, JsApi};
use super::metadata::JsMsgMetadata;
use super::{respond_with_word, ACK_WORD, IN_PROGRESS_WORD, NAK_WORD, TERM_WORD};
use crate::connection::Connection;
use crate::error::{Error, ErrorKind, Result};
use crate::message::Message;
use crate::subscription::{MailboxLimits, Subscription};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Flow-control status description the broker sets on its `100`-status
/// control messages that double as flow-control requests.
const FLOW_CONTROL_DESCRIPTION: &str = "FlowControl Request";

#[derive(Debug, Clone)]
pub struct PushConsumerOptions {
    pub stream: String,
    pub durable_name: Option<String>,
    pub deliver_subject: String,
    pub ack_wait: Duration,
    pub idle_heartbeat: Duration,
    pub flow_control: bool,
    pub ordered: bool,
}

/// A bound push subscription onto a stream consumer's delivery subject.
///
/// Owns the plain [`Subscription`] used to receive deliveries plus the
/// bookkeeping (last-activity clock, expected consumer sequence) needed
/// to detect missed heartbeats and desynchronization without the caller
/// having to know about either.
pub struct PushConsumer {
    conn: Arc<Connection>,
    api: JsApi,
    sub: Arc<Subscription>,
    opts: Mutex<PushConsumerOptions>,
    consumer_name: Mutex<String>,
    last_activity: Mutex<Instant>,
    expected_consumer_seq: AtomicU64,
    last_good_stream_seq: AtomicU64,
    desynced: AtomicBool,
}

impl PushConsumer {
    pub fn create(conn: Arc<Connection>, mut opts: PushConsumerOptions) -> Result<Arc<Self>> {
        if opts.deliver_subject.is_empty() {
            opts.deliver_subject = format!("_STREAM.{}", crate::nuid::Nuid::new().next());
        }
        let api = JsApi::new(conn.clone());
        let config = ConsumerConfig {
            durable_name: opts.durable_name.clone(),
            deliver_subject: Some(opts.deliver_subject.clone()),
            ack_wait: Some(opts.ack_wait.as_nanos() as i64),
            idle_heartbeat: Some(opts.idle_heartbeat.as_nanos() as i64),
            flow_control: opts.flow_control,
            ..ConsumerConfig::default()
        };
        let consumer_name = api.create_consumer(&opts.stream, config)?;
        let sub = conn.subscribe(&opts.deliver_subject, None, None, MailboxLimits::default())?;
        Ok(Arc::new(Self {
            conn,
            api,
            sub,
            opts: Mutex::new(opts),
            consumer_name: Mutex::new(consumer_name),
            last_activity: Mutex::new(Instant::now()),
            expected_consumer_seq: AtomicU64::new(1),
            last_good_stream_seq: AtomicU64::new(0),
            desynced: AtomicBool::new(false),
        }))
    }

    pub fn ack(&self, msg: &Message) -> Result<()> {
        respond_with_word(&self.conn, msg, ACK_WORD)
    }

    pub fn nak(&self, msg: &Message) -> Result<()> {
        respond_with_word(&self.conn, msg, NAK_WORD)
    }

    pub fn in_progress(&self, msg: &Message) -> Result<()> {
        respond_with_word(&self.conn, msg, IN_PROGRESS_WORD)
    }

    pub fn term(&self, msg: &Message) -> Result<()> {
        respond_with_word(&self.conn, msg, TERM_WORD)
    }

    /// Block for the next application message, transparently handling
    /// heartbeats, flow-control requests, and desynchronization
    /// recovery. Returns `missed_heartbeat` if no traffic (real or
    /// heartbeat) arrives within `2 * idle_heartbeat`.
    pub fn next_msg(&self, timeout: Duration) -> Result<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            let idle_heartbeat = self.opts.lock().unwrap().idle_heartbeat;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::timeout("stream next_msg timed out"));
            }
            let poll_timeout = if idle_heartbeat.is_zero() {
                remaining
            } else {
                remaining.min(idle_heartbeat * 2)
            };
            match self.sub.next_msg(poll_timeout) {
                Ok(msg) => {
                    *self.last_activity.lock().unwrap() = Instant::now();
                    if let Some(control) = self.classify_control(&msg) {
                        self.handle_control(control, &msg)?;
                        continue;
                    }
                    if let Ok(md) = JsMsgMetadata::parse(msg.reply().unwrap_or_default()) {
                        if self.check_sequence(&md) {
                            continue; // resynced; caller will see a fresh delivery next loop
                        }
                    }
                    return Ok(msg);
                }
                Err(e) if e.kind() == ErrorKind::Timeout => {
                    if !idle_heartbeat.is_zero() {
                        let elapsed = self.last_activity.lock().unwrap().elapsed();
                        if elapsed >= idle_heartbeat * 2 {
                            return Err(Error::missed_heartbeat(format!(
                                "no traffic for {:?}",
                                elapsed
                            )));
                        }
                    }
                    if Instant::now() >= deadline {
                        return Err(Error::timeout("stream next_msg timed out"));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn classify_control(&self, msg: &Message) -> Option<ControlKind> {
        let headers = msg.headers()?;
        if !headers.is_control() {
            return None;
        }
        if headers.status_description() == Some(FLOW_CONTROL_DESCRIPTION) {
            Some(ControlKind::FlowControl)
        } else {
            Some(ControlKind::Heartbeat)
        }
    }

    fn handle_control(&self, kind: ControlKind, msg: &Message) -> Result<()> {
        match kind {
            ControlKind::Heartbeat => Ok(()),
            ControlKind::FlowControl => {
                if let Some(reply) = msg.reply() {
                    self.conn.publish(reply, None, b"", None)?;
                }
                Ok(())
            }
        }
    }

    /// Returns `true` if a resync was triggered (caller should retry
    /// its read rather than treat the current message as data).
    fn check_sequence(&self, md: &JsMsgMetadata) -> bool {
        let ordered = self.opts.lock().unwrap().ordered;
        if !ordered {
            return false;
        }
        let expected = self.expected_consumer_seq.load(Ordering::SeqCst);
        if md.consumer_seq == expected {
            self.expected_consumer_seq.store(expected + 1, Ordering::SeqCst);
            self.last_good_stream_seq.store(md.stream_seq, Ordering::SeqCst);
            return false;
        }
        if self.desynced.swap(true, Ordering::SeqCst) {
            return true; // recovery already in flight
        }
        let reset_seq = self.last_good_stream_seq.load(Ordering::SeqCst) + 1;
        let _ = self.resync(reset_seq);
        self.desynced.store(false, Ordering::SeqCst);
        true
    }

    /// Delete the current broker-side consumer and recreate it starting
    /// at `reset_seq`.
    fn resync(&self, reset_seq: u64) -> Result<()> {
        let stream = self.opts.lock().unwrap().stream.clone();
        let old_name = self.consumer_name.lock().unwrap().clone();
        let _ = self.api.delete_consumer(&stream, &old_name);

        let deliver_subject = self.opts.lock().unwrap().deliver_subject.clone();
        let config = ConsumerConfig {
            deliver_subject: Some(deliver_subject),
            opt_start_seq: Some(reset_seq),
            ..ConsumerConfig::default()
        };
        let new_name = self.api.create_consumer(&stream, config)?;
        *self.consumer_name.lock().unwrap() = new_name;
        self.expected_consumer_seq.store(1, Ordering::SeqCst);
        Ok(())
    }
}

enum ControlKind {
    Heartbeat,
    FlowControl,
}
