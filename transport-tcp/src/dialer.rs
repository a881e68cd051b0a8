use crate::config::TcpSocketConfig;
use crate::socket::TcpSocket;
use petrel_core::{Dialer, Socket};
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::debug;

/// Dials `host:port` endpoints over plain TCP, applying [`TcpSocketConfig`]
/// to every connection it opens.
pub struct TcpDialer {
    config: TcpSocketConfig,
}

impl TcpDialer {
    pub fn new(config: TcpSocketConfig) -> Self {
        Self { config }
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(TcpSocketConfig::default())
    }
}

impl Dialer for TcpDialer {
    fn dial(&self, addr: &str, timeout: Duration) -> io::Result<Box<dyn Socket>> {
        let deadline = Instant::now() + timeout;
        let candidates: Vec<_> = addr.to_socket_addrs()?.collect();
        if candidates.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{addr} resolved to no addresses"),
            ));
        }

        let mut last_err = None;
        for candidate in candidates {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match TcpStream::connect_timeout(&candidate, remaining) {
                Ok(stream) => {
                    self.config.apply(&stream)?;
                    debug!(%candidate, "tcp dial succeeded");
                    return Ok(Box::new(TcpSocket::new(stream)));
                }
                Err(e) => {
                    debug!(%candidate, error = %e, "tcp dial attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "dial timed out")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn dials_a_listening_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = thread::spawn(move || listener.accept().unwrap());

        let dialer = TcpDialer::default();
        let socket = dialer.dial(&addr.to_string(), Duration::from_secs(1));
        assert!(socket.is_ok());
        accept.join().unwrap();
    }

    #[test]
    fn rejects_unresolvable_host() {
        let dialer = TcpDialer::default();
        let err = dialer.dial("not a valid host:9999", Duration::from_millis(200));
        assert!(err.is_err());
    }
}
