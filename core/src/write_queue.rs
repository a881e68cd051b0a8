//! The outgoing write queue.
//!
//! A bounded ring of buffer-referenced entries. While connected, the
//! writer thread drains it straight to the socket; while disconnected or
//! reconnecting, publishes and subscription registrations accumulate
//! here (up to the same bounds) and are flushed on reconnect in enqueue
//! order.

use std::collections::VecDeque;

pub type CompletionCallback = Box<dyn FnOnce() + Send>;

pub struct Entry {
    pub bytes: Vec<u8>,
    pub on_complete: Option<CompletionCallback>,
}

impl Entry {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            on_complete: None,
        }
    }

    pub fn with_completion(bytes: Vec<u8>, on_complete: CompletionCallback) -> Self {
        Self {
            bytes,
            on_complete: Some(on_complete),
        }
    }
}

/// Bounds on the write queue, independently disableable by setting to
/// `None` (unlimited).
#[derive(Debug, Clone, Copy)]
pub struct WriteQueueLimits {
    pub max_count: Option<usize>,
    pub max_bytes: Option<usize>,
}

impl Default for WriteQueueLimits {
    fn default() -> Self {
        // Default byte bound; count is effectively unbounded by default
        // since the broker's own flow control is the real backstop.
        Self {
            max_count: None,
            max_bytes: Some(8 * 1024 * 1024),
        }
    }
}

pub struct WriteQueue {
    entries: VecDeque<Entry>,
    limits: WriteQueueLimits,
    total_bytes: usize,
}

impl WriteQueue {
    pub fn new(limits: WriteQueueLimits) -> Self {
        Self {
            entries: VecDeque::new(),
            limits,
            total_bytes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Enqueue an entry, failing with `insufficient_buffer` if either
    /// bound would be exceeded.
    pub fn enqueue(&mut self, entry: Entry) -> crate::error::Result<()> {
        if let Some(max_count) = self.limits.max_count {
            if self.entries.len() >= max_count {
                return Err(crate::error::Error::insufficient_buffer(
                    "write queue entry count limit reached",
                ));
            }
        }
        if let Some(max_bytes) = self.limits.max_bytes {
            if self.total_bytes + entry.bytes.len() > max_bytes {
                return Err(crate::error::Error::insufficient_buffer(
                    "write queue byte limit reached",
                ));
            }
        }
        self.total_bytes += entry.bytes.len();
        self.entries.push_back(entry);
        Ok(())
    }

    /// Remove and return up to `max_entries` pending entries for a single
    /// write batch (coalesced write), preserving enqueue order.
    pub fn drain_batch(&mut self, max_entries: usize) -> Vec<Entry> {
        let n = self.entries.len().min(max_entries);
        let batch: Vec<Entry> = self.entries.drain(..n).collect();
        for e in &batch {
            self.total_bytes -= e.bytes.len();
        }
        batch
    }

    pub fn drain_all(&mut self) -> Vec<Entry> {
        self.drain_batch(self.entries.len())
    }

    /// Push a batch of entries ahead of whatever is already queued,
    /// preserving the batch's own order. Used for reconnect replay, which
    /// must reach the wire before any write queued while disconnected —
    /// bypasses the count/byte bounds since it replaces state the broker
    /// already lost, not new caller-supplied traffic.
    pub fn prepend_batch(&mut self, batch: Vec<Entry>) {
        for entry in batch.into_iter().rev() {
            self.total_bytes += entry.bytes.len();
            self.entries.push_front(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn enforces_byte_bound() {
        let mut q = WriteQueue::new(WriteQueueLimits {
            max_count: None,
            max_bytes: Some(10),
        });
        q.enqueue(Entry::new(vec![0u8; 6])).unwrap();
        let err = q.enqueue(Entry::new(vec![0u8; 6])).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InsufficientBuffer);
    }

    #[test]
    fn enforces_count_bound() {
        let mut q = WriteQueue::new(WriteQueueLimits {
            max_count: Some(1),
            max_bytes: None,
        });
        q.enqueue(Entry::new(vec![1])).unwrap();
        let err = q.enqueue(Entry::new(vec![1])).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InsufficientBuffer);
    }

    #[test]
    fn drain_preserves_enqueue_order() {
        let mut q = WriteQueue::new(WriteQueueLimits::default());
        for i in 0..5u8 {
            q.enqueue(Entry::new(vec![i])).unwrap();
        }
        let batch = q.drain_all();
        let order: Vec<u8> = batch.iter().map(|e| e.bytes[0]).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert!(q.is_empty());
        assert_eq!(q.total_bytes(), 0);
    }

    #[test]
    fn completion_callback_runs_after_drain() {
        let flag = Arc::new(AtomicBool::new(false));
        let flag2 = flag.clone();
        let mut q = WriteQueue::new(WriteQueueLimits::default());
        q.enqueue(Entry::with_completion(
            vec![1, 2, 3],
            Box::new(move || flag2.store(true, Ordering::SeqCst)),
        ))
        .unwrap();
        let batch = q.drain_all();
        assert!(!flag.load(Ordering::SeqCst));
        for e in batch {
            if let Some(cb) = e.on_complete {
                cb();
            }
        }
        assert!(flag.load(Ordering::SeqCst));
    }
}
