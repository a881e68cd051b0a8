//! Fixed-size dispatcher pool.
//!
//! Each subscription is pinned at creation time to exactly one worker
//! (round-robin). A worker's queue carries both "a message arrived for
//! subscription S" signals and control items (fences used to wait for a
//! subscription's pending deliveries to drain) in a single FIFO, so
//! control can never reorder relative to data for a given subscription:
//! at most one dispatcher thread ever runs a given subscription's
//! handler, and a handler in flight is never overtaken by work queued
//! after it.

use crate::subscription::Subscription;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

pub enum WorkItem {
    /// A message is available in `sub`'s mailbox; pop and deliver it.
    Deliver(Arc<Subscription>),
    /// An arbitrary control action (e.g. "run this subscription's close
    /// callback") that must not be reordered relative to pending
    /// deliveries for the same subscription.
    Control(Box<dyn FnOnce() + Send>),
    Shutdown,
}

struct Worker {
    sender: Sender<WorkItem>,
    handle: Option<JoinHandle<()>>,
}

pub struct DispatcherPool {
    workers: Vec<Worker>,
    next: std::sync::atomic::AtomicUsize,
}

impl DispatcherPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let mut workers = Vec::with_capacity(size);
        for idx in 0..size {
            let (tx, rx): (Sender<WorkItem>, Receiver<WorkItem>) = mpsc::channel();
            let handle = std::thread::Builder::new()
                .name(format!("dispatcher-{idx}"))
                .spawn(move || run_worker(rx))
                .expect("spawn dispatcher worker");
            workers.push(Worker {
                sender: tx,
                handle: Some(handle),
            });
        }
        Self {
            workers,
            next: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Pin a newly-created subscription to a worker round-robin and
    /// return the chosen worker index.
    pub fn pin(&self) -> usize {
        self.next.fetch_add(1, std::sync::atomic::Ordering::SeqCst) % self.workers.len()
    }

    pub fn notify(&self, worker: usize, sub: Arc<Subscription>) {
        let _ = self.workers[worker].sender.send(WorkItem::Deliver(sub));
    }

    /// Enqueue a control action behind a worker's pending deliveries. Used
    /// as a fence: once the action has run, every delivery queued ahead of
    /// it for that worker has already completed.
    pub fn run_control(&self, worker: usize, action: Box<dyn FnOnce() + Send>) {
        let _ = self.workers[worker].sender.send(WorkItem::Control(action));
    }

    /// Drain every worker's FIFO of control messages, then join. Called
    /// from `Connection::close()`.
    pub fn shutdown(&mut self) {
        for worker in &self.workers {
            let _ = worker.sender.send(WorkItem::Shutdown);
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for DispatcherPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(rx: Receiver<WorkItem>) {
    while let Ok(item) = rx.recv() {
        match item {
            WorkItem::Deliver(sub) => {
                if let Some(msg) = sub.try_pop() {
                    if let Some(handler) = sub.handler() {
                        sub.mark_in_handler(true);
                        handler(msg);
                        sub.mark_in_handler(false);
                    }
                }
            }
            WorkItem::Control(action) => action(),
            WorkItem::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::subscription::MailboxLimits;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn messages_delivered_in_arrival_order() {
        let pool = DispatcherPool::new(2);
        let worker = pool.pin();
        let sub = Subscription::new(1, "foo", None, MailboxLimits::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        sub.set_handler(Arc::new(move |m: Message| {
            seen2.lock().unwrap().push(m.payload()[0]);
        }));

        for i in 0..20u8 {
            sub.enqueue(Message::new("foo", None, vec![i], None, 1));
            pool.notify(worker, sub.clone());
        }

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn same_subscription_never_runs_concurrently() {
        let pool = DispatcherPool::new(4);
        let worker = pool.pin();
        let sub = Subscription::new(1, "foo", None, MailboxLimits::default());
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let c2 = concurrent.clone();
        let m2 = max_seen.clone();
        sub.set_handler(Arc::new(move |_m: Message| {
            let cur = c2.fetch_add(1, Ordering::SeqCst) + 1;
            m2.fetch_max(cur, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(2));
            c2.fetch_sub(1, Ordering::SeqCst);
        }));

        for i in 0..50u8 {
            sub.enqueue(Message::new("foo", None, vec![i], None, 1));
            pool.notify(worker, sub.clone());
        }
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pin_round_robins_across_workers() {
        let pool = DispatcherPool::new(3);
        let assignments: Vec<usize> = (0..6).map(|_| pool.pin()).collect();
        assert_eq!(assignments, vec![0, 1, 2, 0, 1, 2]);
    }
}
