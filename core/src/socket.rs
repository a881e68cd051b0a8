//! The transport seam.
//!
//! `petrel-core` never names `TcpStream` directly; it depends on this
//! minimal blocking `Socket` trait so a concrete binding crate
//! (`petrel-transport-tcp`) — or, out of scope here, a TLS adapter — can
//! be swapped in without touching the connection state machine. The
//! connection uses a thread-per-connection scheduling model, so the
//! seam's methods are blocking rather than `Future`-returning.
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

pub trait Socket: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
    fn shutdown(&mut self) -> io::Result<()>;
    fn peer_addr(&self) -> io::Result<SocketAddr>;
    fn set_read_timeout(&mut self, dur: Option<Duration>) -> io::Result<()>;
    /// Bounds a single `write_all` call. The writer thread sets this once
    /// per connection generation from `ConnectOptions::write_deadline`; a
    /// timeout here is treated the same as any other I/O error (closes the
    /// generation and lets reconnect take over).
    fn set_write_timeout(&mut self, dur: Option<Duration>) -> io::Result<()>;
    /// A cheap clone suitable for splitting into a dedicated reader
    /// handle; writers keep the original.
    fn try_clone(&self) -> io::Result<Box<dyn Socket>>;
}

/// Dials a concrete socket implementation. Implemented by the transport
/// adapter crate(s); the core only calls through this trait.
pub trait Dialer: Send + Sync {
    fn dial(&self, addr: &str, timeout: Duration) -> io::Result<Box<dyn Socket>>;
}
