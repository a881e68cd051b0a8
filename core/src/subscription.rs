//! Subscription registry and mailbox.

use crate::message::Message;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub const DEFAULT_MAX_MSGS: i64 = 65_536;
pub const DEFAULT_MAX_BYTES: i64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct MailboxLimits {
    /// `-1` disables the bound.
    pub max_msgs: i64,
    pub max_bytes: i64,
}

impl Default for MailboxLimits {
    fn default() -> Self {
        Self {
            max_msgs: DEFAULT_MAX_MSGS,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubState {
    Active,
    Draining,
    Closed,
}

struct Mailbox {
    queue: VecDeque<Message>,
    pending_bytes: usize,
    limits: MailboxLimits,
    dropped: u64,
}

impl Mailbox {
    fn would_overflow(&self, incoming_size: usize) -> bool {
        let over_count = self.limits.max_msgs >= 0
            && self.queue.len() as i64 >= self.limits.max_msgs;
        let over_bytes = self.limits.max_bytes >= 0
            && self.pending_bytes as i64 + incoming_size as i64 > self.limits.max_bytes;
        over_count || over_bytes
    }
}

/// A single subscription: subject, mailbox, delivery limits and
/// lifecycle state. Shared between the registry and whichever dispatcher
/// worker currently owns delivery for it via `Arc` keyed lookups rather
/// than back-pointers, so the registry stays a plain arena keyed by sid.
pub struct Subscription {
    sid: u64,
    subject: String,
    queue_group: Option<String>,
    state: Mutex<SubState>,
    mailbox: Mutex<Mailbox>,
    not_empty: Condvar,
    delivered_count: std::sync::atomic::AtomicU64,
    max_msgs: i64,
    auto_unsub_at: std::sync::atomic::AtomicI64,
    drain_deadline: Mutex<Option<Instant>>,
    handler: Mutex<Option<Arc<dyn Fn(Message) + Send + Sync>>>,
    dispatcher_ref: std::sync::atomic::AtomicUsize,
    /// Set while a handler invocation for this subscription is in
    /// flight; unsubscribe/drain wait on this before releasing resources,
    /// rather than yanking the sid out from under a running handler.
    in_handler: std::sync::atomic::AtomicBool,
}

impl Subscription {
    pub fn new(sid: u64, subject: impl Into<String>, queue_group: Option<String>, limits: MailboxLimits) -> Arc<Self> {
        Arc::new(Self {
            sid,
            subject: subject.into(),
            queue_group,
            state: Mutex::new(SubState::Active),
            mailbox: Mutex::new(Mailbox {
                queue: VecDeque::new(),
                pending_bytes: 0,
                limits,
                dropped: 0,
            }),
            not_empty: Condvar::new(),
            delivered_count: std::sync::atomic::AtomicU64::new(0),
            max_msgs: 0,
            auto_unsub_at: std::sync::atomic::AtomicI64::new(-1),
            drain_deadline: Mutex::new(None),
            handler: Mutex::new(None),
            dispatcher_ref: std::sync::atomic::AtomicUsize::new(usize::MAX),
            in_handler: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn set_handler(&self, handler: Arc<dyn Fn(Message) + Send + Sync>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    pub fn handler(&self) -> Option<Arc<dyn Fn(Message) + Send + Sync>> {
        self.handler.lock().unwrap().clone()
    }

    pub fn is_synchronous(&self) -> bool {
        self.handler.lock().unwrap().is_none()
    }

    pub fn set_dispatcher_ref(&self, worker: usize) {
        self.dispatcher_ref.store(worker, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn dispatcher_ref(&self) -> usize {
        self.dispatcher_ref.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn mark_in_handler(&self, value: bool) {
        self.in_handler.store(value, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_in_handler(&self) -> bool {
        self.in_handler.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn sid(&self) -> u64 {
        self.sid
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn queue_group(&self) -> Option<&str> {
        self.queue_group.as_deref()
    }

    pub fn state(&self) -> SubState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: SubState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn delivered_count(&self) -> u64 {
        self.delivered_count.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn dropped_count(&self) -> u64 {
        self.mailbox.lock().unwrap().dropped
    }

    pub fn set_auto_unsub_at(&self, at: i64) {
        self.auto_unsub_at.store(at, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn auto_unsub_at(&self) -> Option<u64> {
        let v = self.auto_unsub_at.load(std::sync::atomic::Ordering::SeqCst);
        if v < 0 {
            None
        } else {
            Some(v as u64)
        }
    }

    pub fn set_drain_deadline(&self, deadline: Instant) {
        *self.drain_deadline.lock().unwrap() = Some(deadline);
    }

    pub fn drain_deadline(&self) -> Option<Instant> {
        *self.drain_deadline.lock().unwrap()
    }

    /// Returns true if the subscription should self-close after this
    /// delivery per `auto_unsub_at` bookkeeping.
    fn should_close_after(&self, delivered: u64) -> bool {
        match self.auto_unsub_at() {
            Some(at) => delivered >= at,
            None => false,
        }
    }

    /// Enqueue a message for delivery. Returns `false` (and increments
    /// `dropped`) if the mailbox is full — the slow-consumer path (spec
    /// §4.4): the connection keeps reading regardless.
    pub fn enqueue(&self, msg: Message) -> bool {
        if self.state() == SubState::Closed {
            return false;
        }
        let size = msg.accounted_size();
        let mut mailbox = self.mailbox.lock().unwrap();
        if mailbox.would_overflow(size) {
            mailbox.dropped += 1;
            return false;
        }
        mailbox.pending_bytes += size;
        mailbox.queue.push_back(msg);
        drop(mailbox);
        self.not_empty.notify_one();
        let delivered = self.delivered_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        if self.should_close_after(delivered) {
            self.set_state(SubState::Closed);
        }
        true
    }

    pub fn pending_msgs(&self) -> usize {
        self.mailbox.lock().unwrap().queue.len()
    }

    pub fn pending_bytes(&self) -> usize {
        self.mailbox.lock().unwrap().pending_bytes
    }

    fn pop_locked(&self, mailbox: &mut Mailbox) -> Option<Message> {
        let msg = mailbox.queue.pop_front();
        if let Some(m) = &msg {
            mailbox.pending_bytes -= m.accounted_size();
        }
        msg
    }

    /// Pop the next message without blocking.
    pub fn try_pop(&self) -> Option<Message> {
        let mut mailbox = self.mailbox.lock().unwrap();
        self.pop_locked(&mut mailbox)
    }

    /// Blocking pop used by synchronous subscriptions' `next_msg`.
    pub fn next_msg(&self, timeout: Duration) -> crate::error::Result<Message> {
        let mut mailbox = self.mailbox.lock().unwrap();
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(msg) = self.pop_locked(&mut mailbox) {
                return Ok(msg);
            }
            if self.state() == SubState::Closed {
                return Err(crate::error::Error::invalid_subscription(
                    "subscription closed",
                ));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(crate::error::Error::timeout("next_msg timed out"));
            }
            let (guard, result) = self
                .not_empty
                .wait_timeout(mailbox, deadline - now)
                .unwrap();
            mailbox = guard;
            if result.timed_out() && mailbox.queue.is_empty() {
                return Err(crate::error::Error::timeout("next_msg timed out"));
            }
        }
    }

    /// Wake every waiter (used by `close()`).
    pub fn wake_all(&self) {
        self.not_empty.notify_all();
    }

    pub fn is_mailbox_empty(&self) -> bool {
        self.mailbox.lock().unwrap().queue.is_empty()
    }

    pub fn drain_and_discard(&self) -> usize {
        let mut mailbox = self.mailbox.lock().unwrap();
        let n = mailbox.queue.len();
        mailbox.queue.clear();
        mailbox.pending_bytes = 0;
        n
    }
}

/// The connection's `sid -> Subscription` registry.
///
/// Invariant: sids are monotonically increasing and never reused, even
/// across reconnects — `next_sid` only ever goes up.
pub struct Registry {
    subs: Mutex<std::collections::BTreeMap<u64, Arc<Subscription>>>,
    next_sid: std::sync::atomic::AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            subs: Mutex::new(std::collections::BTreeMap::new()),
            next_sid: std::sync::atomic::AtomicU64::new(1),
        }
    }

    pub fn alloc_sid(&self) -> u64 {
        self.next_sid.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }

    pub fn insert(&self, sub: Arc<Subscription>) {
        self.subs.lock().unwrap().insert(sub.sid(), sub);
    }

    pub fn get(&self, sid: u64) -> Option<Arc<Subscription>> {
        self.subs.lock().unwrap().get(&sid).cloned()
    }

    pub fn remove(&self, sid: u64) -> Option<Arc<Subscription>> {
        self.subs.lock().unwrap().remove(&sid)
    }

    /// Remove the subscription if `delivered_count >= auto_unsub_at`.
    pub fn reap_if_exhausted(&self, sid: u64) {
        let mut subs = self.subs.lock().unwrap();
        if let Some(sub) = subs.get(&sid) {
            if let Some(at) = sub.auto_unsub_at() {
                if sub.delivered_count() >= at {
                    subs.remove(&sid);
                }
            }
        }
    }

    /// All active subscriptions in ascending sid order, for reconnect
    /// replay: resubscriptions must reach the broker in the same order
    /// the original SUBs were issued.
    pub fn active_in_sid_order(&self) -> Vec<Arc<Subscription>> {
        self.subs
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.state() != SubState::Closed)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<Subscription>> {
        self.subs.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.subs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_unsubscribe_closes_after_n_messages() {
        let sub = Subscription::new(1, "foo", None, MailboxLimits::default());
        sub.set_auto_unsub_at(3);
        for i in 0..3 {
            assert!(sub.enqueue(Message::new("foo", None, vec![i], None, 1)));
        }
        assert_eq!(sub.state(), SubState::Closed);
    }

    #[test]
    fn slow_consumer_drops_beyond_mailbox_limit() {
        let sub = Subscription::new(
            1,
            "foo",
            None,
            MailboxLimits {
                max_msgs: 2,
                max_bytes: -1,
            },
        );
        assert!(sub.enqueue(Message::new("foo", None, vec![1], None, 1)));
        assert!(sub.enqueue(Message::new("foo", None, vec![2], None, 1)));
        assert!(!sub.enqueue(Message::new("foo", None, vec![3], None, 1)));
        assert_eq!(sub.dropped_count(), 1);
        assert_eq!(sub.pending_msgs(), 2);
    }

    #[test]
    fn fifo_order_preserved() {
        let sub = Subscription::new(1, "foo", None, MailboxLimits::default());
        for i in 0..10u8 {
            sub.enqueue(Message::new("foo", None, vec![i], None, 1));
        }
        let mut seen = Vec::new();
        while let Some(m) = sub.try_pop() {
            seen.push(m.payload()[0]);
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn registry_never_reuses_sids() {
        let reg = Registry::new();
        let a = reg.alloc_sid();
        reg.insert(Subscription::new(a, "foo", None, MailboxLimits::default()));
        reg.remove(a);
        let b = reg.alloc_sid();
        assert_ne!(a, b);
    }

    #[test]
    fn active_in_sid_order_is_sorted() {
        let reg = Registry::new();
        let ids: Vec<u64> = (0..5).map(|_| reg.alloc_sid()).collect();
        for &id in ids.iter().rev() {
            reg.insert(Subscription::new(id, "foo", None, MailboxLimits::default()));
        }
        let ordered: Vec<u64> = reg.active_in_sid_order().iter().map(|s| s.sid()).collect();
        let mut expected = ids.clone();
        expected.sort_unstable();
        assert_eq!(ordered, expected);
    }
}
