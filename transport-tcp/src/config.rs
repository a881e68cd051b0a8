use socket2::SockRef;
use std::io;
use std::net::TcpStream;
use std::time::Duration;

/// Socket-level options applied to every connection a [`TcpDialer`](crate::TcpDialer)
/// opens.
#[derive(Clone, Copy, Debug)]
pub struct TcpSocketConfig {
    nodelay: bool,
    linger: Option<Duration>,
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        // Broker round-trip latency dominates Nagle's batching benefit,
        // so nodelay defaults on the way most pub/sub clients set it.
        Self {
            nodelay: true,
            linger: None,
        }
    }
}

impl TcpSocketConfig {
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub(crate) fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        SockRef::from(stream).set_linger(self.linger)?;
        Ok(())
    }
}
