//! Blocking `std::net::TcpStream` binding for `petrel-core`'s
//! [`Socket`]/[`Dialer`](petrel_core::socket::Dialer) seam.
//!
//! Kept deliberately small: one address family, one transport. A TLS
//! adapter would live in a sibling crate implementing
//! `petrel_core::tls::SecureTransport` over a [`TcpSocket`](socket::TcpSocket)
//! rather than extending this one.

mod config;
mod dialer;
mod socket;

pub use config::TcpSocketConfig;
pub use dialer::TcpDialer;
pub use socket::TcpSocket;
