//! Transport module - Raw connection I/O and the shared frame socket
//!
//! Provides:
//! - The `RawConnection` primitive the protocol engine runs over
//! - A blocking TCP implementation of it
//! - `FrameSocket`, the per-connection object shared by senders and the receive loop

mod socket;
mod tcp;

pub use socket::*;
pub use tcp::*;

use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Failure of a raw send/recv call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoFailure {
    /// Nothing was transferred; the call may be repeated
    Retry,
    /// The connection is gone
    Disconnected,
}

/// Byte-oriented connection primitive
///
/// Implementations must allow one sender and one receiver to call
/// concurrently from different threads.
pub trait RawConnection: Send + Sync {
    /// Write all of `buf`; returns `buf.len()` on success
    fn send(&self, buf: &[u8]) -> Result<usize, IoFailure>;

    /// Read at most `buf.len()` bytes; never returns `Ok(0)`
    fn recv(&self, buf: &mut [u8]) -> Result<usize, IoFailure>;

    /// Switch the connection between blocking and non-blocking mode
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;

    /// Close the connection, unblocking any pending `recv`
    fn close(&self);

    /// Remote address, if the transport has one
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Frame socket errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketError {
    #[error("Socket closed")]
    Closed,

    #[error("Peer disconnected")]
    Disconnected,
}

pub type SocketResult<T> = Result<T, SocketError>;

/// Destination for complete wire frames
pub trait FrameSink {
    /// Stamp and write `frames` back-to-back; returns the total bytes written
    fn send_frames(&self, frames: &mut [BytesMut]) -> SocketResult<usize>;
}
