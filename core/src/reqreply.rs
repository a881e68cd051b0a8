//! Request/reply multiplexer.
//!
//! One inbox subscription per connection, `<inbox_prefix>.<conn_nuid>.>`.
//! A concurrent map from response token to waiter holds outstanding
//! requests; the multiplexer is created lazily on first use, not at
//! connect time.

use crate::message::Message;
use dashmap::DashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub const DEFAULT_INBOX_PREFIX: &str = "_INBOX";

enum WaiterSlot {
    Pending,
    Done(Message),
    NoResponders,
    Closed,
}

struct Waiter {
    slot: Mutex<WaiterSlot>,
    cv: Condvar,
}

/// Per-connection request/reply correlator.
pub struct ResponseMux {
    inbox_prefix: String,
    conn_nuid: String,
    waiters: DashMap<String, Arc<Waiter>>,
    next_token: std::sync::atomic::AtomicU64,
}

impl ResponseMux {
    pub fn new(inbox_prefix: impl Into<String>, conn_nuid: impl Into<String>) -> Self {
        Self {
            inbox_prefix: inbox_prefix.into(),
            conn_nuid: conn_nuid.into(),
            waiters: DashMap::new(),
            next_token: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// The subject this connection's single inbox subscription should be
    /// registered under, e.g. `_INBOX.<nuid>.*`.
    pub fn subscribe_subject(&self) -> String {
        format!("{}.{}.*", self.inbox_prefix, self.conn_nuid)
    }

    /// Allocate a fresh reply subject for one outstanding request.
    pub fn new_reply_subject(&self) -> (String, String) {
        let token = self
            .next_token
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let token = format!("{token:x}");
        let subject = format!("{}.{}.{}", self.inbox_prefix, self.conn_nuid, token);
        (token, subject)
    }

    pub fn register(&self, token: String) {
        self.waiters.insert(
            token,
            Arc::new(Waiter {
                slot: Mutex::new(WaiterSlot::Pending),
                cv: Condvar::new(),
            }),
        );
    }

    /// Called when an inbox delivery arrives; `token` is the last
    /// component of the reply subject it matched.
    pub fn complete(&self, token: &str, msg: Message) {
        if let Some((_, waiter)) = self.waiters.remove(token) {
            let mut slot = waiter.slot.lock().unwrap();
            *slot = if msg.headers().map(|h| h.is_no_responders()).unwrap_or(false) {
                WaiterSlot::NoResponders
            } else {
                WaiterSlot::Done(msg)
            };
            drop(slot);
            waiter.cv.notify_all();
        }
    }

    /// Block until `token`'s reply arrives or `timeout` elapses.
    pub fn wait(&self, token: &str, timeout: Duration) -> crate::error::Result<Message> {
        let waiter = self
            .waiters
            .get(token)
            .map(|e| e.value().clone())
            .ok_or_else(|| crate::error::Error::illegal_state("request token not registered"))?;
        let deadline = Instant::now() + timeout;
        let mut slot = waiter.slot.lock().unwrap();
        loop {
            match &*slot {
                WaiterSlot::Done(msg) => return Ok(msg.clone()),
                WaiterSlot::NoResponders => {
                    return Err(crate::error::Error::no_responders(
                        "no responders for request",
                    ))
                }
                WaiterSlot::Closed => {
                    return Err(crate::error::Error::connection_closed(
                        "connection closed while request was pending",
                    ))
                }
                WaiterSlot::Pending => {}
            }
            let now = Instant::now();
            if now >= deadline {
                self.waiters.remove(token);
                return Err(crate::error::Error::timeout("request timed out"));
            }
            let (guard, result) = waiter.cv.wait_timeout(slot, deadline - now).unwrap();
            slot = guard;
            if result.timed_out() {
                if let WaiterSlot::Pending = *slot {
                    self.waiters.remove(token);
                    return Err(crate::error::Error::timeout("request timed out"));
                }
            }
        }
    }

    /// Complete every outstanding waiter with `connection_closed` (spec
    /// §4.4 `close()`).
    pub fn close_all(&self) {
        for entry in self.waiters.iter() {
            let waiter = entry.value();
            let mut slot = waiter.slot.lock().unwrap();
            *slot = WaiterSlot::Closed;
            drop(slot);
            waiter.cv.notify_all();
        }
        self.waiters.clear();
    }

    pub fn outstanding(&self) -> usize {
        self.waiters.len()
    }
}
