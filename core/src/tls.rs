//! TLS adapter seam. A concrete TLS implementation is out of scope for
//! this crate; the seam it plugs into is not.
//!
//! A concrete adapter crate wraps a TLS implementation (e.g. `rustls`)
//! behind [`SecureTransport`] and hands the resulting stream to a
//! [`crate::socket::Dialer`] the same way `petrel-transport-tcp` hands
//! over a plain `TcpStream`. Nothing in `petrel-core` names a TLS crate
//! directly.

use crate::socket::Socket;
use std::io;

/// Upgrades an already-connected plaintext socket to an encrypted one,
/// performing the TLS handshake against `server_name`.
///
/// Implemented out-of-tree; this crate only depends on the trait so the
/// connection state machine can request an upgrade without knowing
/// which TLS stack performs it.
pub trait SecureTransport: Send + Sync {
    fn upgrade(&self, socket: Box<dyn Socket>, server_name: &str) -> io::Result<Box<dyn Socket>>;
}
