//! A tiny single-connection broker stand-in for integration tests.
//!
//! Speaks just enough of the wire protocol to get a real
//! `petrel_core::Connection` through its handshake and to let a test
//! script assert on what the client sent and script what the "server"
//! sends back: INFO on accept, PONG for any PING, SUB/UNSUB bookkeeping,
//! and PUB/HPUB loopback to any subject-matching subscriber on the same
//! connection.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A frame the broker observed from the client, loosely parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Connect(String),
    Pub { subject: String, reply: Option<String>, payload: Vec<u8> },
    Sub { subject: String, queue: Option<String>, sid: u64 },
    Unsub { sid: u64, max: Option<u64> },
    Ping,
    Other(String),
}

struct Sub {
    sid: u64,
    subject: String,
}

pub struct MockBroker {
    addr: std::net::SocketAddr,
    observed: mpsc::Receiver<ClientFrame>,
    inject_tx: mpsc::Sender<Vec<u8>>,
    handle: Option<JoinHandle<()>>,
}

impl MockBroker {
    /// Binds an ephemeral port and spawns the accept/serve thread. The
    /// `info_line` is written verbatim (including `\r\n`) right after
    /// accept, before anything else.
    pub fn start(info_line: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock broker");
        let addr = listener.local_addr().expect("local_addr");
        let (obs_tx, obs_rx) = mpsc::channel();
        let (inj_tx, inj_rx) = mpsc::channel();
        let info_line = info_line.to_string();

        let handle = thread::Builder::new()
            .name("mock-broker".into())
            .spawn(move || serve(listener, info_line, obs_tx, inj_rx))
            .expect("spawn mock broker thread");

        Self {
            addr,
            observed: obs_rx,
            inject_tx: inj_tx,
            handle: Some(handle),
        }
    }

    pub fn url(&self) -> String {
        format!("nats://{}", self.addr)
    }

    /// Blocks until the broker has observed a frame, or panics after
    /// `timeout` with nothing seen.
    pub fn recv_frame(&self, timeout: Duration) -> ClientFrame {
        self.observed
            .recv_timeout(timeout)
            .expect("expected a client frame before timeout")
    }

    /// Writes raw bytes to the client unconditionally (e.g. to push a
    /// second INFO with new `connect_urls`, or an out-of-band -ERR).
    pub fn inject(&self, bytes: Vec<u8>) {
        self.inject_tx.send(bytes).expect("broker thread gone");
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        // Dropping inject_tx/observed lets the serve loop's reads fail
        // and the thread exit; we don't force-kill the socket.
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn serve(
    listener: TcpListener,
    info_line: String,
    observed: mpsc::Sender<ClientFrame>,
    inject: mpsc::Receiver<Vec<u8>>,
) {
    let Ok((stream, _)) = listener.accept() else { return };
    stream.set_read_timeout(Some(Duration::from_millis(50))).ok();
    let mut writer = stream.try_clone().expect("clone stream for writer");
    if writer.write_all(info_line.as_bytes()).is_err() {
        return;
    }

    let subs: Arc<Mutex<Vec<Sub>>> = Arc::new(Mutex::new(Vec::new()));
    let mut buf = Vec::new();
    let mut reader = stream;

    loop {
        // Flush anything a test injected before blocking on a read.
        while let Ok(bytes) = inject.try_recv() {
            if writer.write_all(&bytes).is_err() {
                return;
            }
        }

        let mut chunk = [0u8; 4096];
        match reader.read(&mut chunk) {
            Ok(0) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                continue;
            }
            Err(_) => return,
        }

        while let Some((consumed, frame)) = try_parse_client_frame(&buf) {
            buf.drain(..consumed);
            handle_frame(&frame, &subs, &mut writer);
            let _ = observed.send(frame);
        }
    }
}

fn handle_frame(frame: &ClientFrame, subs: &Arc<Mutex<Vec<Sub>>>, writer: &mut TcpStream) {
    match frame {
        ClientFrame::Ping => {
            let _ = writer.write_all(b"PONG\r\n");
        }
        ClientFrame::Sub { subject, sid, .. } => {
            subs.lock().unwrap().push(Sub { sid: *sid, subject: subject.clone() });
        }
        ClientFrame::Unsub { sid, max: None } => {
            subs.lock().unwrap().retain(|s| s.sid != *sid);
        }
        ClientFrame::Pub { subject, reply, payload } => {
            let matching: Vec<u64> = subs
                .lock()
                .unwrap()
                .iter()
                .filter(|s| subject_matches(&s.subject, subject))
                .map(|s| s.sid)
                .collect();
            for sid in matching {
                let mut line = match reply {
                    Some(r) => format!("MSG {subject} {sid} {r} {}\r\n", payload.len()),
                    None => format!("MSG {subject} {sid} {}\r\n", payload.len()),
                };
                line.push_str(&String::from_utf8_lossy(payload));
                line.push_str("\r\n");
                let _ = writer.write_all(line.as_bytes());
            }
        }
        _ => {}
    }
}

/// Exact-subject matching only; wildcards aren't needed by the
/// scenarios this broker stands in for.
fn subject_matches(sub_subject: &str, pub_subject: &str) -> bool {
    sub_subject == pub_subject
}

fn try_parse_client_frame(buf: &[u8]) -> Option<(usize, ClientFrame)> {
    let line_end = find(buf, b"\r\n", 0)?;
    let line = &buf[..line_end];
    let after_line = line_end + 2;
    let line_str = String::from_utf8_lossy(line).to_string();
    let mut parts = line_str.splitn(2, char::is_whitespace);
    let verb = parts.next().unwrap_or("").to_ascii_uppercase();
    let rest = parts.next().unwrap_or("").trim();

    match verb.as_str() {
        "PING" => Some((after_line, ClientFrame::Ping)),
        "CONNECT" => Some((after_line, ClientFrame::Connect(rest.to_string()))),
        "SUB" => {
            let fields: Vec<&str> = rest.split_whitespace().collect();
            match fields.as_slice() {
                [subject, sid] => Some((after_line, ClientFrame::Sub { subject: subject.to_string(), queue: None, sid: sid.parse().ok()? })),
                [subject, queue, sid] => Some((after_line, ClientFrame::Sub { subject: subject.to_string(), queue: Some(queue.to_string()), sid: sid.parse().ok()? })),
                _ => Some((after_line, ClientFrame::Other(line_str))),
            }
        }
        "UNSUB" => {
            let fields: Vec<&str> = rest.split_whitespace().collect();
            match fields.as_slice() {
                [sid] => Some((after_line, ClientFrame::Unsub { sid: sid.parse().ok()?, max: None })),
                [sid, max] => Some((after_line, ClientFrame::Unsub { sid: sid.parse().ok()?, max: max.parse().ok() })),
                _ => Some((after_line, ClientFrame::Other(line_str))),
            }
        }
        "PUB" => {
            let fields: Vec<&str> = rest.split_whitespace().collect();
            let (subject, reply, len): (&str, Option<String>, usize) = match fields.as_slice() {
                [subject, len] => (subject, None, len.parse().ok()?),
                [subject, reply, len] => (subject, Some(reply.to_string()), len.parse().ok()?),
                _ => return Some((after_line, ClientFrame::Other(line_str))),
            };
            if buf.len() < after_line + len + 2 {
                return None;
            }
            let payload = buf[after_line..after_line + len].to_vec();
            Some((after_line + len + 2, ClientFrame::Pub { subject: subject.to_string(), reply, payload }))
        }
        _ => Some((after_line, ClientFrame::Other(line_str))),
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}
