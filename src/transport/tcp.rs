//! Blocking TCP connection

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info};

use super::{IoFailure, RawConnection};

/// Pause between attempts to finish a partially written buffer
const PARTIAL_WRITE_BACKOFF: Duration = Duration::from_micros(50);

/// A `RawConnection` over a connected `TcpStream`
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    peer: Option<SocketAddr>,
}

impl TcpConnection {
    /// Wrap an established stream
    pub fn new(stream: TcpStream) -> Self {
        // Small frames dominate the stream
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        let peer = stream.peer_addr().ok();
        Self { stream, peer }
    }

    /// Connect to a server, giving up after `timeout`
    pub fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        info!("Connected to {}", addr);
        Ok(Self::new(stream))
    }

    /// Bind a listening socket
    pub fn listen(addr: SocketAddr) -> io::Result<TcpListener> {
        let listener = TcpListener::bind(addr)?;
        info!("Listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept the next incoming connection
    pub fn accept(listener: &TcpListener) -> io::Result<Self> {
        let (stream, addr) = listener.accept()?;
        info!("Accepted connection from {}", addr);
        Ok(Self::new(stream))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }
}

impl RawConnection for TcpConnection {
    fn send(&self, buf: &[u8]) -> Result<usize, IoFailure> {
        let mut written = 0;
        while written < buf.len() {
            match (&self.stream).write(&buf[written..]) {
                Ok(0) => return Err(IoFailure::Disconnected),
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if written == 0 {
                        return Err(IoFailure::Retry);
                    }
                    // A started frame must be finished
                    std::thread::sleep(PARTIAL_WRITE_BACKOFF);
                }
                Err(e) => {
                    debug!("TCP send failed: {}", e);
                    return Err(IoFailure::Disconnected);
                }
            }
        }
        Ok(written)
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize, IoFailure> {
        match (&self.stream).read(buf) {
            Ok(0) => Err(IoFailure::Disconnected),
            Ok(n) => Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                Err(IoFailure::Retry)
            }
            Err(e) => {
                debug!("TCP recv failed: {}", e);
                Err(IoFailure::Disconnected)
            }
        }
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.stream.set_nonblocking(nonblocking)
    }

    fn close(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("TCP shutdown: {}", e);
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// Resolve a hostname to a socket address
pub fn resolve_host(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}

#[cfg(test)]
pub(crate) fn loopback_pair() -> (TcpConnection, TcpConnection) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpConnection::connect(addr, Duration::from_secs(1)).unwrap();
    let server = TcpConnection::accept(&listener).unwrap();
    (client, server)
}
