//! The connection state machine: connect -> handshake -> connected ->
//! draining -> reconnecting -> closed.
//!
//! Threaded model: each `Connection` owns a manager thread
//! (dial/handshake/reconnect loop), and, while connected, a reader
//! thread and a writer thread for the active socket. A monotonic
//! `generation` counter lets a socket's reader/writer notice they have
//! been superseded by a reconnect and exit quietly rather than racing
//! the new session.

use crate::callback::CallbackWorker;
use crate::dispatcher::DispatcherPool;
use crate::endpoint::{EndpointPool, ReconnectPolicy};
use crate::error::{Error, ErrorKind, Result};
use crate::message::Message;
use crate::nuid::Nuid;
use crate::options::ConnectOptions;
use crate::reqreply::ResponseMux;
use crate::socket::{Dialer, Socket};
use crate::stats::{Stats, StatsSnapshot};
use crate::subscription::{MailboxLimits, Registry, SubState, Subscription};
use crate::wire::event::{ConnectPayload, ServerInfo, ServerOp};
use crate::wire::headers::HeaderMap;
use crate::wire::{writer as wire_writer, Parser};
use crate::write_queue::{Entry, WriteQueue, WriteQueueLimits};

use parking_lot::Mutex as PlMutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// The process-wide dispatcher pool used by every `Connection` created
/// with `ConnectOptions::use_global_dispatcher`. Sized by whichever
/// connection initializes it first; later connections opting into the
/// shared pool reuse that size rather than each getting their own.
fn global_dispatcher_pool(size: usize) -> Arc<PlMutex<DispatcherPool>> {
    static GLOBAL: OnceLock<Arc<PlMutex<DispatcherPool>>> = OnceLock::new();
    GLOBAL
        .get_or_init(|| Arc::new(PlMutex::new(DispatcherPool::new(size))))
        .clone()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    DrainingSubs,
    DrainingPubs,
    Closed,
}

struct PongWaiter {
    done: Mutex<Option<Result<()>>>,
    cv: Condvar,
}

/// User callback hooks for async-error delivery and connection lifecycle
/// events. All optional; invoked from the [`CallbackWorker`], never
/// from the reader/writer/manager threads.
#[derive(Default)]
pub struct Callbacks {
    pub disconnected: Option<Arc<dyn Fn() + Send + Sync>>,
    pub reconnected: Option<Arc<dyn Fn() + Send + Sync>>,
    pub closed: Option<Arc<dyn Fn() + Send + Sync>>,
    pub error: Option<Arc<dyn Fn(&Error) + Send + Sync>>,
    pub slow_consumer: Option<Arc<dyn Fn(u64, &str) + Send + Sync>>,
}

pub struct Connection {
    options: ConnectOptions,
    dialer: Arc<dyn Dialer>,
    pool: Mutex<EndpointPool>,
    state: Mutex<ConnState>,
    state_cv: Condvar,
    write_queue: PlMutex<WriteQueue>,
    write_cv: Condvar,
    write_mutex_for_cv: Mutex<()>,
    registry: Registry,
    dispatcher: Arc<PlMutex<DispatcherPool>>,
    resp_mux: Mutex<Option<Arc<ResponseMux>>>,
    pending_pongs: Mutex<VecDeque<Arc<PongWaiter>>>,
    server_info: Mutex<Option<ServerInfo>>,
    stats: Stats,
    nuid: Nuid,
    conn_nuid: String,
    callback: CallbackWorker,
    callbacks: Callbacks,
    ping_out_count: AtomicU32,
    generation: AtomicU64,
    max_payload: AtomicU64,
    threads: Mutex<Vec<JoinHandle<()>>>,
    closing: AtomicBool,
    max_reconnect_reached: AtomicBool,
    active_socket: Mutex<Option<Box<dyn Socket>>>,
    read_socket: Mutex<Option<Box<dyn Socket>>>,
}

/// How often the reader's blocking `read` wakes up to recheck the
/// closing/generation flags. Independent of `connect_timeout`, which only
/// bounds the handshake.
const READER_POLL_TIMEOUT: Duration = Duration::from_millis(250);

const DEFAULT_MAX_PAYLOAD: u64 = 1024 * 1024;
const MAX_PINGS_THRESHOLD_MULTIPLIER: u32 = 1;

impl Connection {
    /// Establish the initial connection.
    pub fn connect(options: ConnectOptions, dialer: Arc<dyn Dialer>) -> Result<Arc<Self>> {
        options.validate()?;
        let pool = EndpointPool::new(options.url.clone(), options.servers.clone(), options.no_randomize);
        let conn_nuid = {
            let n = Nuid::new();
            n.next()
        };
        let dispatcher = if options.use_global_dispatcher {
            global_dispatcher_pool(options.dispatcher_pool_size)
        } else {
            Arc::new(PlMutex::new(DispatcherPool::new(options.dispatcher_pool_size)))
        };
        let conn = Arc::new(Self {
            dialer,
            pool: Mutex::new(pool),
            state: Mutex::new(ConnState::Disconnected),
            state_cv: Condvar::new(),
            write_queue: PlMutex::new(WriteQueue::new(WriteQueueLimits {
                max_count: None,
                max_bytes: Some(options.reconnect_buf_size),
            })),
            write_cv: Condvar::new(),
            write_mutex_for_cv: Mutex::new(()),
            registry: Registry::new(),
            dispatcher,
            resp_mux: Mutex::new(None),
            pending_pongs: Mutex::new(VecDeque::new()),
            server_info: Mutex::new(None),
            stats: Stats::default(),
            nuid: Nuid::new(),
            conn_nuid,
            callback: CallbackWorker::start(),
            callbacks: Callbacks::default(),
            ping_out_count: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            max_payload: AtomicU64::new(DEFAULT_MAX_PAYLOAD),
            threads: Mutex::new(Vec::new()),
            closing: AtomicBool::new(false),
            max_reconnect_reached: AtomicBool::new(false),
            active_socket: Mutex::new(None),
            read_socket: Mutex::new(None),
            options,
        });

        conn.dial_and_handshake_once()?;
        conn.start_session_threads();
        conn.start_manager_and_ping_threads();
        Ok(conn)
    }

    // ---- state -----------------------------------------------------

    pub fn state(&self) -> ConnState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, s: ConnState) {
        let mut guard = self.state.lock().unwrap();
        *guard = s;
        self.state_cv.notify_all();
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn max_payload(&self) -> u64 {
        self.max_payload.load(Ordering::SeqCst)
    }

    // ---- dial / handshake -------------------------------------------

    /// INFO -> CONNECT -> PING -> PONG, against whichever endpoint is
    /// currently at the head of the pool. On success, stores the
    /// connected socket for the writer and transitions to `Connected`.
    fn dial_and_handshake_once(&self) -> Result<()> {
        self.set_state(ConnState::Connecting);
        let policy = ReconnectPolicy {
            max_reconnect: self.options.max_reconnect,
        };

        let mut last_err: Option<Error> = None;
        let mut round = 0u32;
        loop {
            let attempts = {
                let pool = self.pool.lock().unwrap();
                pool.len().max(1)
            };
            for _ in 0..attempts {
                let url = {
                    let pool = self.pool.lock().unwrap();
                    pool.current().url.clone()
                };
                match self.try_handshake(&url) {
                    Ok(socket) => {
                        self.install_socket(socket);
                        self.set_state(ConnState::Connected);
                        return Ok(());
                    }
                    Err(e) => {
                        self.note_dial_failure(&url, &e);
                        last_err = Some(e);
                        let mut pool = self.pool.lock().unwrap();
                        if pool.next(policy).is_none() {
                            break;
                        }
                    }
                }
            }
            // `retry_on_failed_connect`: keep retrying the whole pool,
            // round after round, instead of failing `connect()` after the
            // first exhausted pass.
            round += 1;
            let keep_retrying = self.options.retry_on_failed_connect
                && self.options.max_reconnect.map(|max| round < max).unwrap_or(true)
                && !self.pool.lock().unwrap().is_empty();
            if !keep_retrying {
                break;
            }
            std::thread::sleep(self.options.reconnect_wait + jitter(self.options.reconnect_jitter));
        }
        self.set_state(ConnState::Closed);
        Err(last_err.unwrap_or_else(|| Error::no_server("endpoint pool exhausted")))
    }

    fn note_dial_failure(&self, _url: &str, err: &Error) {
        if matches!(err.kind(), ErrorKind::AuthViolation | ErrorKind::AuthExpired) {
            let mut pool = self.pool.lock().unwrap();
            let code = err.message().to_string();
            let ep = pool.current_mut();
            // DESIGN.md open-question resolution: two consecutive
            // identical auth-error codes with no intervening successful
            // connect marks the endpoint unusable for this loop.
            if ep.last_auth_err_code.as_deref() == Some(code.as_str()) {
                ep.reconnects = u32::MAX;
            }
            ep.last_auth_err_code = Some(code);
        }
    }

    fn try_handshake(&self, url: &str) -> Result<Box<dyn Socket>> {
        let mut socket = self
            .dialer
            .dial(url, self.options.connect_timeout)
            .map_err(Error::from_io)?;
        socket
            .set_read_timeout(Some(self.options.connect_timeout))
            .map_err(Error::from_io)?;

        let mut parser = Parser::new();
        let mut buf = [0u8; 4096];
        let info = loop {
            let n = socket.read(&mut buf).map_err(Error::from_io)?;
            if n == 0 {
                return Err(Error::no_server("connection closed during handshake"));
            }
            let ops = parser.feed(&buf[..n])?;
            if let Some(ServerOp::Info(info)) = ops.into_iter().next() {
                break info;
            }
        };
        *self.server_info.lock().unwrap() = Some(info.clone());
        let effective_max_payload = self
            .options
            .max_payload_override
            .map(|v| v as u64)
            .unwrap_or(info.max_payload.max(0) as u64);
        self.max_payload.store(effective_max_payload, Ordering::SeqCst);

        let connect_payload = self.build_connect_payload(&info);
        socket
            .write_all(&wire_writer::encode_connect(&connect_payload))
            .map_err(Error::from_io)?;
        socket
            .write_all(wire_writer::encode_ping())
            .map_err(Error::from_io)?;

        loop {
            let n = socket.read(&mut buf).map_err(Error::from_io)?;
            if n == 0 {
                return Err(Error::no_server("connection closed during handshake"));
            }
            for op in parser.feed(&buf[..n])? {
                match op {
                    ServerOp::Pong => return Ok(socket),
                    ServerOp::Err(text) => return Err(classify_err_text(&text)),
                    ServerOp::Ok | ServerOp::Info(_) => {}
                    _ => {}
                }
            }
        }
    }

    fn build_connect_payload(&self, info: &ServerInfo) -> ConnectPayload {
        ConnectPayload {
            verbose: self.options.verbose,
            pedantic: self.options.pedantic,
            tls_required: info.tls_required,
            name: self.options.name.clone().unwrap_or_default(),
            lang: "rust",
            version: env!("CARGO_PKG_VERSION"),
            protocol: 1,
            echo: !self.options.no_echo,
            headers: true,
            no_responders: !self.options.disable_no_responders,
            user: self.options.user.clone(),
            pass: self.options.pass.clone(),
            auth_token: self.options.auth_token.clone(),
            jwt: self.options.jwt.clone(),
            sig: None,
            nkey: self.options.nkey.clone(),
        }
    }

    fn install_socket(&self, mut socket: Box<dyn Socket>) {
        if let Err(e) = socket.set_write_timeout(Some(self.options.write_deadline)) {
            tracing::warn!(error = %e, "failed to set write deadline on socket");
        }
        // The reader gets its own handle via `try_clone` so a blocking
        // read never makes the writer wait behind the same mutex. Its
        // read timeout is reset off the handshake's `connect_timeout` to
        // a short poll interval instead of inheriting a multi-second wait.
        match socket.try_clone() {
            Ok(mut reader) => {
                if let Err(e) = reader.set_read_timeout(Some(READER_POLL_TIMEOUT)) {
                    tracing::warn!(error = %e, "failed to set read timeout on reader socket");
                }
                *self.read_socket.lock().unwrap() = Some(reader);
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to clone socket for reader, falling back to shared handle");
                if let Err(e) = socket.set_read_timeout(Some(READER_POLL_TIMEOUT)) {
                    tracing::warn!(error = %e, "failed to set read timeout on socket");
                }
                *self.read_socket.lock().unwrap() = None;
            }
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.active_socket.lock().unwrap() = Some(socket);
    }

    // ---- background threads -----------------------------------------

    fn start_session_threads(self: &Arc<Self>) {
        let gen = self.generation.load(Ordering::SeqCst);
        let conn = self.clone();
        let reader = std::thread::Builder::new()
            .name("petrel-reader".into())
            .spawn(move || conn.reader_loop(gen))
            .expect("spawn reader thread");
        let conn = self.clone();
        let writer = std::thread::Builder::new()
            .name("petrel-writer".into())
            .spawn(move || conn.writer_loop(gen))
            .expect("spawn writer thread");
        self.threads.lock().unwrap().extend([reader, writer]);
    }

    fn start_manager_and_ping_threads(self: &Arc<Self>) {
        let conn = self.clone();
        let ping = std::thread::Builder::new()
            .name("petrel-ping".into())
            .spawn(move || conn.ping_timer_loop())
            .expect("spawn ping thread");
        self.threads.lock().unwrap().push(ping);
    }

    fn reader_loop(self: Arc<Self>, generation: u64) {
        let mut parser = Parser::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            if self.closing.load(Ordering::SeqCst) {
                return;
            }
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            let read_result = {
                let mut guard = self.read_socket.lock().unwrap();
                match guard.as_mut() {
                    Some(s) => s.read(&mut buf),
                    // try_clone failed at install time; fall back to the
                    // writer's handle rather than never reading at all.
                    None => {
                        let mut guard = self.active_socket.lock().unwrap();
                        match guard.as_mut() {
                            Some(s) => s.read(&mut buf),
                            None => return,
                        }
                    }
                }
            };
            match read_result {
                Ok(0) => {
                    self.on_io_error(generation, Error::stale_connection("socket EOF"));
                    return;
                }
                Ok(n) => match parser.feed(&buf[..n]) {
                    Ok(ops) => {
                        for op in ops {
                            self.handle_server_op(op);
                        }
                    }
                    Err(e) => {
                        self.on_io_error(generation, e);
                        return;
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                    continue;
                }
                Err(e) => {
                    self.on_io_error(generation, Error::from_io(e));
                    return;
                }
            }
        }
    }

    fn writer_loop(self: Arc<Self>, generation: u64) {
        loop {
            if self.closing.load(Ordering::SeqCst) {
                return;
            }
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            let batch = {
                let guard = self.write_mutex_for_cv.lock().unwrap();
                let mut wq = self.write_queue.lock();
                if wq.is_empty() {
                    drop(wq);
                    let (_guard, _timeout) = self
                        .write_cv
                        .wait_timeout(guard, Duration::from_millis(100))
                        .unwrap();
                    continue;
                }
                wq.drain_batch(256)
            };
            if batch.is_empty() {
                continue;
            }
            let mut joined = Vec::new();
            for e in &batch {
                joined.extend_from_slice(&e.bytes);
            }
            let write_result = {
                let mut guard = self.active_socket.lock().unwrap();
                match guard.as_mut() {
                    Some(s) => s.write_all(&joined),
                    None => return,
                }
            };
            match write_result {
                Ok(()) => {
                    self.stats.record_out(joined.len());
                    for e in batch {
                        if let Some(cb) = e.on_complete {
                            cb();
                        }
                    }
                }
                Err(e) => {
                    self.on_io_error(generation, Error::from_io(e));
                    return;
                }
            }
        }
    }

    fn ping_timer_loop(self: Arc<Self>) {
        loop {
            std::thread::sleep(self.options.ping_interval);
            if self.closing.load(Ordering::SeqCst) {
                return;
            }
            if self.state() != ConnState::Connected {
                continue;
            }
            let out = self.ping_out_count.fetch_add(1, Ordering::SeqCst) + 1;
            let threshold = self.options.max_pings_out * MAX_PINGS_THRESHOLD_MULTIPLIER;
            if out > threshold {
                self.on_io_error(
                    self.generation.load(Ordering::SeqCst),
                    Error::stale_connection("too many outstanding pings"),
                );
                continue;
            }
            let _ = self.enqueue_bytes(wire_writer::encode_ping().to_vec(), None);
        }
    }

    fn handle_server_op(&self, op: ServerOp) {
        match op {
            ServerOp::Ping => {
                let _ = self.enqueue_bytes(wire_writer::encode_pong().to_vec(), None);
            }
            ServerOp::Pong => {
                self.ping_out_count.fetch_sub(1, Ordering::SeqCst);
                if let Some(waiter) = self.pending_pongs.lock().unwrap().pop_front() {
                    *waiter.done.lock().unwrap() = Some(Ok(()));
                    waiter.cv.notify_all();
                }
            }
            ServerOp::Info(info) => {
                let urls = info.connect_urls.clone();
                *self.server_info.lock().unwrap() = Some(info);
                if !self.options.ignore_discovered_servers {
                    self.pool.lock().unwrap().merge_advertised(&urls);
                }
            }
            ServerOp::Ok => {}
            ServerOp::Err(text) => {
                let err = classify_err_text(&text);
                self.deliver_async_error(err);
            }
            ServerOp::Msg { subject, sid, reply, payload } => {
                self.stats.record_in(payload.len());
                self.dispatch_message(subject, sid, reply, None, payload);
            }
            ServerOp::Hmsg { subject, sid, reply, headers, payload } => {
                self.stats.record_in(payload.len());
                self.dispatch_message(subject, sid, reply, Some(headers), payload);
            }
        }
    }

    fn dispatch_message(
        &self,
        subject: String,
        sid: u64,
        reply: Option<String>,
        headers: Option<HeaderMap>,
        payload: Vec<u8>,
    ) {
        let Some(sub) = self.registry.get(sid) else {
            return;
        };
        let msg = Message::new(subject, reply.clone(), payload, headers, sid);

        // Inbox deliveries resolve through the inbox subscription's own
        // handler (see `request()`), which calls `ResponseMux::complete`
        // directly — no special-casing needed here.
        let was_enqueued = sub.enqueue(msg);
        if !was_enqueued {
            self.deliver_async_error(Error::slow_consumer(format!(
                "dropped message for sid {sid}"
            )));
            if let Some(cb) = &self.callbacks.slow_consumer {
                let cb = cb.clone();
                let subject = sub.subject().to_string();
                self.callback.post(Box::new(move || cb(sid, &subject)));
            }
            return;
        }
        self.registry.reap_if_exhausted(sid);
        if !sub.is_synchronous() {
            let worker = sub.dispatcher_ref();
            self.dispatcher.lock().notify(worker, sub);
        }
    }

    fn deliver_async_error(&self, err: Error) {
        if let Some(cb) = &self.callbacks.error {
            let cb = cb.clone();
            self.callback.post(Box::new(move || cb(&err)));
        } else {
            tracing::warn!(kind = %err.kind(), message = err.message(), "async error");
        }
    }

    fn on_io_error(self: &Arc<Self>, generation: u64, err: Error) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return; // superseded by a later reconnect already
        }
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        tracing::warn!(kind = %err.kind(), "connection io error, entering reconnect");
        if let Some(cb) = &self.callbacks.disconnected {
            let cb = cb.clone();
            self.callback.post(Box::new(move || cb()));
        }
        if !self.options.allow_reconnect {
            self.transition_to_closed();
            return;
        }
        self.set_state(ConnState::Reconnecting);
        *self.active_socket.lock().unwrap() = None;
        *self.read_socket.lock().unwrap() = None;
        self.stats.record_reconnect();

        let policy = ReconnectPolicy {
            max_reconnect: self.options.max_reconnect,
        };
        let attempts = {
            let pool = self.pool.lock().unwrap();
            pool.len().max(1)
        };
        for _ in 0..attempts {
            std::thread::sleep(self.options.reconnect_wait + jitter(self.options.reconnect_jitter));
            let url = {
                let pool = self.pool.lock().unwrap();
                pool.current().url.clone()
            };
            match self.try_handshake(&url) {
                Ok(socket) => {
                    self.install_socket(socket);
                    self.replay_after_reconnect();
                    self.set_state(ConnState::Connected);
                    self.start_session_threads();
                    if let Some(cb) = &self.callbacks.reconnected {
                        let cb = cb.clone();
                        self.callback.post(Box::new(move || cb()));
                    }
                    return;
                }
                Err(e) => {
                    self.note_dial_failure(&url, &e);
                    let mut pool = self.pool.lock().unwrap();
                    if pool.next(policy).is_none() {
                        break;
                    }
                }
            }
        }
        self.max_reconnect_reached.store(true, Ordering::SeqCst);
        self.transition_to_closed();
    }

    /// Replay every active subscription in ascending sid order, then
    /// whatever was left in the write queue when the connection dropped.
    fn replay_after_reconnect(&self) {
        let batch: Vec<Entry> = self
            .registry
            .active_in_sid_order()
            .into_iter()
            .map(|sub| Entry::new(wire_writer::encode_sub(sub.subject(), sub.queue_group(), sub.sid())))
            .collect();
        self.write_queue.lock().prepend_batch(batch);
        self.write_cv.notify_all();
    }

    fn transition_to_closed(self: &Arc<Self>) {
        self.set_state(ConnState::Closed);
        self.closing.store(true, Ordering::SeqCst);
        for sub in self.registry.all() {
            sub.wake_all();
        }
        if let Some(mux) = self.resp_mux.lock().unwrap().as_ref() {
            mux.close_all();
        }
        self.complete_all_pongs_with_err(Error::connection_closed("connection closed"));
        if let Some(cb) = &self.callbacks.closed {
            let cb = cb.clone();
            self.callback.post(Box::new(move || cb()));
        }
    }

    fn complete_all_pongs_with_err(&self, err: Error) {
        let mut pending = self.pending_pongs.lock().unwrap();
        while let Some(w) = pending.pop_front() {
            *w.done.lock().unwrap() = Some(Err(Error::new(err.kind(), err.message().to_string())));
            w.cv.notify_all();
        }
    }

    // ---- public API ---------------------------------------------------

    pub fn publish(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: &[u8],
        headers: Option<HeaderMap>,
    ) -> Result<()> {
        validate_subject(subject)?;
        if payload.len() as u64 > self.max_payload() {
            return Err(Error::max_payload_exceeded(format!(
                "payload of {} bytes exceeds max_payload {}",
                payload.len(),
                self.max_payload()
            )));
        }
        if self.state() == ConnState::Closed {
            return Err(Error::connection_closed("connection is closed"));
        }
        if matches!(self.state(), ConnState::DrainingSubs | ConnState::DrainingPubs) {
            return Err(Error::draining("cannot publish while draining"));
        }
        let bytes = match &headers {
            Some(h) => wire_writer::encode_hpub(subject, reply, h, payload),
            None => wire_writer::encode_pub(subject, reply, payload),
        };
        self.enqueue_bytes(bytes, None)
    }

    /// Block until every delivery already queued for `sub`'s dispatcher
    /// worker has finished running. Stronger than polling `is_in_handler`,
    /// which can't see a delivery still sitting in the worker's channel
    /// that hasn't started running yet.
    fn fence_dispatcher(&self, sub: &Subscription) {
        let worker = sub.dispatcher_ref();
        if worker == usize::MAX {
            return;
        }
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        self.dispatcher.lock().run_control(worker, Box::new(move || {
            let _ = tx.send(());
        }));
        let _ = rx.recv();
    }

    fn enqueue_bytes(&self, bytes: Vec<u8>, on_complete: Option<Box<dyn FnOnce() + Send>>) -> Result<()> {
        {
            let mut wq = self.write_queue.lock();
            let entry = match on_complete {
                Some(cb) => Entry::with_completion(bytes, cb),
                None => Entry::new(bytes),
            };
            wq.enqueue(entry)?;
        }
        self.write_cv.notify_all();
        Ok(())
    }

    pub fn subscribe(
        self: &Arc<Self>,
        subject: &str,
        queue_group: Option<&str>,
        handler: Option<Arc<dyn Fn(Message) + Send + Sync>>,
        limits: MailboxLimits,
    ) -> Result<Arc<Subscription>> {
        validate_subject(subject)?;
        if matches!(self.state(), ConnState::DrainingSubs | ConnState::DrainingPubs) {
            return Err(Error::draining("cannot subscribe while draining"));
        }
        let sid = self.registry.alloc_sid();
        let sub = Subscription::new(sid, subject, queue_group.map(String::from), limits);
        if let Some(h) = handler {
            sub.set_handler(h);
            let worker = self.dispatcher.lock().pin();
            sub.set_dispatcher_ref(worker);
        }
        self.registry.insert(sub.clone());
        self.enqueue_bytes(wire_writer::encode_sub(subject, queue_group, sid), None)?;
        Ok(sub)
    }

    pub fn unsubscribe(&self, sub: &Subscription, max: Option<u64>) -> Result<()> {
        match max {
            None | Some(0) => {
                sub.set_state(SubState::Closed);
                self.enqueue_bytes(wire_writer::encode_unsub(sub.sid(), None), None)?;
                self.fence_dispatcher(sub);
                self.registry.remove(sub.sid());
            }
            Some(max) => {
                let at = sub.delivered_count() + max;
                sub.set_auto_unsub_at(at as i64);
                self.enqueue_bytes(wire_writer::encode_unsub(sub.sid(), Some(max)), None)?;
                self.registry.reap_if_exhausted(sub.sid());
            }
        }
        Ok(())
    }

    fn ensure_resp_mux(&self) -> Arc<ResponseMux> {
        let mut guard = self.resp_mux.lock().unwrap();
        if let Some(mux) = guard.as_ref() {
            return mux.clone();
        }
        let mux = Arc::new(ResponseMux::new(self.options.inbox_prefix.clone(), self.conn_nuid.clone()));
        *guard = Some(mux.clone());
        mux
    }

    pub fn request(self: &Arc<Self>, subject: &str, payload: &[u8], timeout: Duration) -> Result<Message> {
        let mux = self.ensure_resp_mux();
        // Lazily create the inbox subscription the first time a request
        // is made on this connection.
        if self.registry.all().iter().all(|s| s.subject() != mux.subscribe_subject()) {
            let mux2 = mux.clone();
            let handler: Arc<dyn Fn(Message) + Send + Sync> = Arc::new(move |msg: Message| {
                if let Some(token) = msg.subject().rsplit('.').next() {
                    mux2.complete(token, msg.clone());
                }
            });
            self.subscribe(&mux.subscribe_subject(), None, Some(handler), MailboxLimits::default())?;
        }
        let (token, reply_subject) = mux.new_reply_subject();
        mux.register(token.clone());
        self.publish(subject, Some(&reply_subject), payload, None)?;
        mux.wait(&token, timeout)
    }

    pub fn flush(&self, timeout: Duration) -> Result<()> {
        let waiter = Arc::new(PongWaiter {
            done: Mutex::new(None),
            cv: Condvar::new(),
        });
        self.pending_pongs.lock().unwrap().push_back(waiter.clone());
        self.enqueue_bytes(wire_writer::encode_ping().to_vec(), None)?;

        let deadline = Instant::now() + timeout;
        let mut guard = waiter.done.lock().unwrap();
        loop {
            if let Some(result) = guard.take() {
                return result;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::timeout("flush timed out waiting for PONG"));
            }
            let (g, timeout_result) = waiter.cv.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
            if timeout_result.timed_out() && guard.is_none() {
                return Err(Error::timeout("flush timed out waiting for PONG"));
            }
        }
    }

    pub fn drain(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        self.set_state(ConnState::DrainingSubs);
        let deadline = Instant::now() + timeout;
        let subs = self.registry.all();
        for sub in &subs {
            sub.set_state(SubState::Draining);
            sub.set_drain_deadline(deadline);
            let _ = self.enqueue_bytes(wire_writer::encode_unsub(sub.sid(), None), None);
        }
        for sub in &subs {
            loop {
                if sub.is_mailbox_empty() && !sub.is_in_handler() {
                    break;
                }
                if Instant::now() >= deadline {
                    sub.drain_and_discard();
                    break;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            sub.set_state(SubState::Closed);
            self.registry.remove(sub.sid());
        }
        self.set_state(ConnState::DrainingPubs);
        self.flush(deadline.saturating_duration_since(Instant::now()).max(Duration::from_millis(1)))?;
        self.close();
        Ok(())
    }

    pub fn close(self: &Arc<Self>) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(ConnState::Closed);
        for sub in self.registry.all() {
            sub.wake_all();
        }
        if let Some(mux) = self.resp_mux.lock().unwrap().as_ref() {
            mux.close_all();
        }
        self.complete_all_pongs_with_err(Error::connection_closed("connection closed"));
        let mut guard = self.active_socket.lock().unwrap();
        if let Some(s) = guard.as_mut() {
            let _ = s.shutdown();
        }
        *guard = None;
        drop(guard);
        *self.read_socket.lock().unwrap() = None;
        if let Some(cb) = &self.callbacks.closed {
            let cb = cb.clone();
            self.callback.post(Box::new(move || cb()));
        }
        let mut threads = self.threads.lock().unwrap();
        for t in threads.drain(..) {
            let _ = t.join();
        }
    }
}

fn validate_subject(subject: &str) -> Result<()> {
    if subject.is_empty() || subject.contains(' ') || subject.starts_with('.') || subject.ends_with('.') {
        return Err(Error::invalid_subject(format!("invalid subject: {subject:?}")));
    }
    Ok(())
}

fn classify_err_text(text: &str) -> Error {
    let lower = text.to_ascii_lowercase();
    if lower.contains("authorization violation") {
        Error::auth_violation(text.to_string())
    } else if lower.contains("user authentication expired") {
        Error::auth_expired(text.to_string())
    } else if lower.contains("permissions violation") {
        Error::permissions_violation(text.to_string())
    } else if lower.contains("stale connection") {
        Error::stale_connection(text.to_string())
    } else if lower.contains("slow consumer") {
        Error::slow_consumer(text.to_string())
    } else if lower.contains("maximum payload") {
        Error::max_payload_exceeded(text.to_string())
    } else {
        Error::protocol_error(text.to_string())
    }
}

fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let millis = rand::Rng::gen_range(&mut rand::thread_rng(), 0..=max.as_millis() as u64);
    Duration::from_millis(millis)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_subject_rejects_spaces_and_empty() {
        assert!(validate_subject("").is_err());
        assert!(validate_subject("foo bar").is_err());
        assert!(validate_subject("foo.bar").is_ok());
    }

    #[test]
    fn classify_err_text_maps_known_phrases() {
        assert_eq!(classify_err_text("Authorization Violation").kind(), ErrorKind::AuthViolation);
        assert_eq!(classify_err_text("Stale Connection").kind(), ErrorKind::StaleConnection);
        assert_eq!(classify_err_text("something else").kind(), ErrorKind::ProtocolError);
    }
}
