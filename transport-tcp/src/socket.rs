use petrel_core::Socket;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

/// A [`Socket`] backed by a single connected `std::net::TcpStream`.
pub struct TcpSocket {
    stream: TcpStream,
}

impl TcpSocket {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl Socket for TcpSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        std::io::Read::read(&mut self.stream, buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        std::io::Write::write_all(&mut self.stream, buf)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown(std::net::Shutdown::Both)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    fn set_read_timeout(&mut self, dur: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(dur)
    }

    fn set_write_timeout(&mut self, dur: Option<Duration>) -> io::Result<()> {
        self.stream.set_write_timeout(dur)
    }

    fn try_clone(&self) -> io::Result<Box<dyn Socket>> {
        Ok(Box::new(TcpSocket::new(self.stream.try_clone()?)))
    }
}
