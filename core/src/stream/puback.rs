//! Publish-ack correlator.
//!
//! Async publish acknowledgement for stream publishes: `publish_async`
//! enqueues the PUB immediately and hands back a handle the caller can
//! wait on later, while a single shared inbox subscription correlates
//! incoming ack bodies back to their waiter by `msg_id`. Modeled on the
//! request/reply multiplexer's waiter-per-token shape, with three
//! differences it doesn't need: a bounded in-flight window, a stall
//! callback, and an io-error reconciliation policy for in-flight
//! publishes when the connection drops.

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::message::Message;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// What a successful ack carries, decoded from the broker's JSON body.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PubAck {
    pub stream: String,
    pub seq: u64,
    #[serde(default)]
    pub duplicate: bool,
}

#[derive(Debug, serde::Deserialize)]
struct AckError {
    description: String,
}

#[derive(Debug, serde::Deserialize)]
struct AckBody {
    #[serde(default)]
    stream: Option<String>,
    #[serde(default)]
    seq: Option<u64>,
    #[serde(default)]
    duplicate: bool,
    #[serde(default)]
    error: Option<AckError>,
}

/// What happens to `publish_async` when the in-flight window is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// Block the calling thread until a slot frees up.
    Block,
    /// Return `illegal_state` immediately.
    Fail,
}

/// What happens to waiters still outstanding when the connection drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoErrorPolicy {
    /// Complete every outstanding waiter with an error.
    FailAll,
    /// Re-publish every outstanding entry once the connection recovers.
    Requeue,
}

#[derive(Debug, Clone)]
pub struct PublishAckCorrelatorOptions {
    pub max_in_flight: usize,
    /// Fraction of `max_in_flight` (0.0-1.0) at which `on_stall` fires.
    pub stall_threshold: f64,
    pub backpressure: Backpressure,
    pub io_error_policy: IoErrorPolicy,
}

impl Default for PublishAckCorrelatorOptions {
    fn default() -> Self {
        Self {
            max_in_flight: 512,
            stall_threshold: 0.9,
            backpressure: Backpressure::Block,
            io_error_policy: IoErrorPolicy::FailAll,
        }
    }
}

enum Slot {
    Pending,
    Done(Result<PubAck>),
}

struct Waiter {
    slot: Mutex<Slot>,
    cv: Condvar,
}

struct Pending {
    subject: String,
    payload: Vec<u8>,
    waiter: Arc<Waiter>,
}

/// A handle returned by [`PublishAckCorrelator::publish_async`]; call
/// [`wait`](Self::wait) to block for the broker's ack.
pub struct PubAckHandle {
    msg_id: String,
    waiter: Arc<Waiter>,
}

impl PubAckHandle {
    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    pub fn wait(&self, timeout: Duration) -> Result<PubAck> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.waiter.slot.lock().unwrap();
        loop {
            if let Slot::Done(result) = &*slot {
                return result.clone();
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::timeout("publish ack timed out"));
            }
            let (guard, result) = self.waiter.cv.wait_timeout(slot, deadline - now).unwrap();
            slot = guard;
            if result.timed_out() {
                if let Slot::Pending = *slot {
                    return Err(Error::timeout("publish ack timed out"));
                }
            }
        }
    }
}

// `Result<PubAck>` needs `Clone` for `wait` to hand the stored outcome
// back to more than one caller if ever polled twice; `Error` itself
// isn't `Clone` (it boxes an arbitrary source), so the stored result is
// reconstructed from its kind and message instead.
impl Clone for Slot {
    fn clone(&self) -> Self {
        match self {
            Slot::Pending => Slot::Pending,
            Slot::Done(Ok(ack)) => Slot::Done(Ok(ack.clone())),
            Slot::Done(Err(e)) => Slot::Done(Err(Error::new(e.kind(), e.message().to_string()))),
        }
    }
}

/// Per-connection publish-ack correlator for stream publishes.
pub struct PublishAckCorrelator {
    conn: Arc<Connection>,
    inbox_subject_prefix: String,
    opts: PublishAckCorrelatorOptions,
    pending: DashMap<String, Pending>,
    in_flight: AtomicUsize,
    gate: Mutex<()>,
    gate_cv: Condvar,
    on_stall: Mutex<Option<Arc<dyn Fn(usize, usize) + Send + Sync>>>,
}

impl PublishAckCorrelator {
    /// Create the correlator and register its single wildcard inbox
    /// subscription on `conn`.
    pub fn new(conn: Arc<Connection>, opts: PublishAckCorrelatorOptions) -> Result<Arc<Self>> {
        let inbox_subject_prefix = format!("_STREAM.ACKS.{}", crate::nuid::Nuid::new().next());
        let wildcard = format!("{inbox_subject_prefix}.*");

        let this = Arc::new(Self {
            conn: conn.clone(),
            inbox_subject_prefix,
            opts,
            pending: DashMap::new(),
            in_flight: AtomicUsize::new(0),
            gate: Mutex::new(()),
            gate_cv: Condvar::new(),
            on_stall: Mutex::new(None),
        });

        let handler_target = this.clone();
        let handler: Arc<dyn Fn(Message) + Send + Sync> = Arc::new(move |msg: Message| {
            handler_target.on_inbox_delivery(msg);
        });
        conn.subscribe(&wildcard, None, Some(handler), Default::default())?;
        Ok(this)
    }

    pub fn set_on_stall(&self, cb: Arc<dyn Fn(usize, usize) + Send + Sync>) {
        *self.on_stall.lock().unwrap() = Some(cb);
    }

    fn on_inbox_delivery(&self, msg: Message) {
        let Some(msg_id) = msg.subject().rsplit('.').next() else {
            return;
        };
        let Some((_, pending)) = self.pending.remove(msg_id) else {
            return;
        };
        let result = decode_ack(msg.payload());
        self.complete(pending.waiter, result);
    }

    fn complete(&self, waiter: Arc<Waiter>, result: Result<PubAck>) {
        *waiter.slot.lock().unwrap() = Slot::Done(result);
        waiter.cv.notify_all();
        let prev = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let _ = prev;
        drop(self.gate.lock().unwrap());
        self.gate_cv.notify_all();
    }

    /// Enqueue a publish, returning a handle for the caller to wait on
    /// at their convenience. Blocks (or fails, per policy) if the
    /// in-flight window is full.
    pub fn publish_async(
        &self,
        subject: &str,
        payload: &[u8],
        msg_id: Option<String>,
    ) -> Result<PubAckHandle> {
        self.admit()?;

        let msg_id = msg_id.unwrap_or_else(|| crate::nuid::Nuid::new().next());
        let reply = format!("{}.{}", self.inbox_subject_prefix, msg_id);
        let waiter = Arc::new(Waiter {
            slot: Mutex::new(Slot::Pending),
            cv: Condvar::new(),
        });

        let mut headers = crate::wire::HeaderMap::new();
        headers.append("Nats-Msg-Id", &msg_id);

        self.pending.insert(
            msg_id.clone(),
            Pending {
                subject: subject.to_string(),
                payload: payload.to_vec(),
                waiter: waiter.clone(),
            },
        );

        if let Err(e) = self
            .conn
            .publish(subject, Some(&reply), payload, Some(headers))
        {
            self.pending.remove(&msg_id);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(e);
        }

        self.maybe_notify_stall();
        Ok(PubAckHandle { msg_id, waiter })
    }

    fn admit(&self) -> Result<()> {
        loop {
            let current = self.in_flight.load(Ordering::SeqCst);
            if current < self.opts.max_in_flight {
                if self
                    .in_flight
                    .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return Ok(());
                }
                continue;
            }
            match self.opts.backpressure {
                Backpressure::Fail => {
                    return Err(Error::illegal_state(
                        "publish-ack in-flight window is full",
                    ))
                }
                Backpressure::Block => {
                    let guard = self.gate.lock().unwrap();
                    let _ = self.gate_cv.wait(guard).unwrap();
                }
            }
        }
    }

    fn maybe_notify_stall(&self) {
        let current = self.in_flight.load(Ordering::SeqCst) as f64;
        let max = self.opts.max_in_flight as f64;
        if max > 0.0 && current / max >= self.opts.stall_threshold {
            if let Some(cb) = self.on_stall.lock().unwrap().as_ref() {
                cb(current as usize, self.opts.max_in_flight);
            }
        }
    }

    /// Reconcile outstanding publishes after the connection observes an
    /// I/O error, per the configured [`IoErrorPolicy`].
    pub fn reconcile_after_io_error(&self) {
        match self.opts.io_error_policy {
            IoErrorPolicy::FailAll => {
                for entry in self.pending.iter() {
                    let pending = entry.value();
                    self.complete(
                        pending.waiter.clone(),
                        Err(Error::connection_closed(
                            "connection reset while publish ack was pending",
                        )),
                    );
                }
                self.pending.clear();
            }
            IoErrorPolicy::Requeue => {
                let entries: Vec<(String, String, Vec<u8>)> = self
                    .pending
                    .iter()
                    .map(|e| (e.key().clone(), e.value().subject.clone(), e.value().payload.clone()))
                    .collect();
                for (msg_id, subject, payload) in entries {
                    let reply = format!("{}.{}", self.inbox_subject_prefix, msg_id);
                    let mut headers = crate::wire::HeaderMap::new();
                    headers.append("Nats-Msg-Id", &msg_id);
                    if let Err(e) = self.conn.publish(&subject, Some(&reply), &payload, Some(headers)) {
                        if let Some((_, pending)) = self.pending.remove(&msg_id) {
                            self.complete(pending.waiter, Err(e));
                        }
                    }
                }
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

fn decode_ack(payload: &[u8]) -> Result<PubAck> {
    let body: AckBody = serde_json::from_slice(payload)
        .map_err(|e| Error::protocol_error(format!("decoding publish ack: {e}")))?;
    if let Some(err) = body.error {
        return Err(Error::not_supported_by_server(err.description));
    }
    match (body.stream, body.seq) {
        (Some(stream), Some(seq)) => Ok(PubAck {
            stream,
            seq,
            duplicate: body.duplicate,
        }),
        _ => Err(Error::protocol_error(
            "publish ack body had neither ack fields nor error",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_successful_ack() {
        let body = br#"{"stream":"ORDERS","seq":42,"duplicate":false}"#;
        let ack = decode_ack(body).unwrap();
        assert_eq!(ack.stream, "ORDERS");
        assert_eq!(ack.seq, 42);
        assert!(!ack.duplicate);
    }

    #[test]
    fn decodes_error_ack() {
        let body = br#"{"error":{"code":400,"err_code":10071,"description":"wrong last sequence"}}"#;
        let err = decode_ack(body).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotSupportedByServer);
        assert!(err.message().contains("wrong last sequence"));
    }
}
