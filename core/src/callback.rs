//! Async-callback worker.
//!
//! Asynchronous errors (slow consumer, permissions violation, reconnect
//! and disconnect events, auth expiry) run here, off the reader/writer
//! threads, so user code can safely call back into the library from a
//! callback without deadlocking on the very locks the reader/writer
//! threads hold. Explicit `start`/`shutdown` lifecycle — no process-wide
//! singleton to manage.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send>;

pub struct CallbackWorker {
    // `mpsc::Sender` is `Send` but not `Sync`, and this worker is shared
    // (via `Arc<Connection>`) across the reader, writer and ping
    // threads, all of which call `post`. The mutex makes sharing sound;
    // contention is irrelevant since `send` itself is a cheap enqueue.
    sender: Mutex<Option<Sender<Job>>>,
    handle: Option<JoinHandle<()>>,
}

impl CallbackWorker {
    pub fn start() -> Self {
        let (tx, rx): (Sender<Job>, Receiver<Job>) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("async-callback".into())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            })
            .expect("spawn async-callback worker");
        Self {
            sender: Mutex::new(Some(tx)),
            handle: Some(handle),
        }
    }

    /// Queue a callback invocation. Silently dropped if the worker has
    /// already been shut down (mirrors `close()`'s "best effort,
    /// idempotent" semantics).
    pub fn post(&self, job: Job) {
        if let Some(sender) = self.sender.lock().unwrap().as_ref() {
            let _ = sender.send(job);
        }
    }

    /// Stop accepting new jobs and join the thread, having drained
    /// whatever was already queued. Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.sender.lock().unwrap().take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CallbackWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
