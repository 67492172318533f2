//! Frame socket shared by the send path and the receive loop

use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{FrameSink, IoFailure, RawConnection, SocketError, SocketResult};
use crate::protocol::SendSequencer;

/// Invoked once when the peer goes away
pub type DisconnectNotice = Arc<dyn Fn() + Send + Sync>;

/// State of a frame socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SocketStatus {
    /// Connection usable
    Connected = 0,
    /// Peer went away or a permanent I/O failure occurred
    Disconnected = 1,
    /// Closed locally
    Closed = 2,
}

impl SocketStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SocketStatus::Connected,
            1 => SocketStatus::Disconnected,
            _ => SocketStatus::Closed,
        }
    }
}

/// One connection, stamped and serialised
///
/// Senders are serialised by the sequencer lock, so all frames of one call to
/// `send_frames` carry contiguous sequence numbers. Receivers are serialised
/// by a separate lock and never block senders.
pub struct FrameSocket {
    conn: Arc<dyn RawConnection>,
    status: AtomicU8,
    sequencer: Mutex<SendSequencer>,
    recv_lock: Mutex<()>,
    integrity: bool,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    frames_sent: AtomicU64,
    notice: Mutex<Option<DisconnectNotice>>,
}

impl FrameSocket {
    pub fn new(conn: Arc<dyn RawConnection>, integrity: bool) -> Self {
        Self {
            conn,
            status: AtomicU8::new(SocketStatus::Connected as u8),
            sequencer: Mutex::new(SendSequencer::new()),
            recv_lock: Mutex::new(()),
            integrity,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            notice: Mutex::new(None),
        }
    }

    pub fn status(&self) -> SocketStatus {
        SocketStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.status() == SocketStatus::Connected
    }

    pub fn integrity(&self) -> bool {
        self.integrity
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Install the callback fired when the peer disconnects
    pub fn set_disconnect_notice(&self, notice: DisconnectNotice) {
        *self.notice.lock() = Some(notice);
    }

    /// Read exactly `buf.len()` bytes
    pub fn recv_exact(&self, buf: &mut [u8]) -> SocketResult<()> {
        let _guard = self.recv_lock.lock();
        let mut read = 0;
        while read < buf.len() {
            self.check_open()?;
            match self.conn.recv(&mut buf[read..]) {
                Ok(n) => {
                    read += n;
                    self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                }
                Err(IoFailure::Retry) => std::thread::yield_now(),
                Err(IoFailure::Disconnected) => return Err(self.fail()),
            }
        }
        Ok(())
    }

    /// Close the connection; no disconnect notice fires afterwards
    pub fn close(&self) {
        let previous = self.status.swap(SocketStatus::Closed as u8, Ordering::SeqCst);
        self.notice.lock().take();
        if previous != SocketStatus::Closed as u8 {
            debug!("Closing frame socket");
            self.conn.close();
        }
    }

    fn check_open(&self) -> SocketResult<()> {
        match self.status() {
            SocketStatus::Connected => Ok(()),
            SocketStatus::Disconnected => Err(SocketError::Disconnected),
            SocketStatus::Closed => Err(SocketError::Closed),
        }
    }

    /// Record a permanent I/O failure and fire the notice once
    fn fail(&self) -> SocketError {
        let transitioned = self
            .status
            .compare_exchange(
                SocketStatus::Connected as u8,
                SocketStatus::Disconnected as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();

        if !transitioned {
            // Closed locally, or already reported
            return match self.status() {
                SocketStatus::Closed => SocketError::Closed,
                _ => SocketError::Disconnected,
            };
        }

        warn!("Peer disconnected");
        let notice = self.notice.lock().clone();
        if let Some(notice) = notice {
            notice();
        }
        SocketError::Disconnected
    }
}

impl FrameSink for FrameSocket {
    fn send_frames(&self, frames: &mut [BytesMut]) -> SocketResult<usize> {
        self.check_open()?;

        let mut total = 0;
        let result = {
            let mut sequencer = self.sequencer.lock();
            let mut result = Ok(());
            'frames: for frame in frames.iter_mut() {
                sequencer.stamp(frame, self.integrity);
                loop {
                    match self.conn.send(frame) {
                        Ok(n) => {
                            total += n;
                            break;
                        }
                        Err(IoFailure::Retry) => {
                            if let Err(e) = self.check_open() {
                                result = Err(e);
                                break 'frames;
                            }
                            std::thread::yield_now();
                        }
                        Err(IoFailure::Disconnected) => {
                            result = Err(SocketError::Disconnected);
                            break 'frames;
                        }
                    }
                }
            }
            result
        };

        self.bytes_sent.fetch_add(total as u64, Ordering::Relaxed);
        match result {
            Ok(()) => {
                self.frames_sent
                    .fetch_add(frames.len() as u64, Ordering::Relaxed);
                Ok(total)
            }
            Err(SocketError::Closed) => Err(SocketError::Closed),
            // Notice fires outside the sequencer lock
            Err(SocketError::Disconnected) => Err(self.fail()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_frame, FragmentFlag, FrameValidator, MessageType, HEADER_SIZE};
    use crate::transport::loopback_pair;
    use std::sync::atomic::AtomicUsize;

    fn socket_pair(integrity: bool) -> (FrameSocket, FrameSocket) {
        let (a, b) = loopback_pair();
        (
            FrameSocket::new(Arc::new(a), integrity),
            FrameSocket::new(Arc::new(b), integrity),
        )
    }

    #[test]
    fn test_frames_are_stamped_in_order() {
        let (tx, rx) = socket_pair(true);
        let mut frames = vec![
            build_frame(MessageType::Gl, FragmentFlag::First, b"abc"),
            build_frame(MessageType::Gl, FragmentFlag::End, b"de"),
        ];
        let written = tx.send_frames(&mut frames).unwrap();
        assert_eq!(written, 2 * HEADER_SIZE + 5);
        assert_eq!(tx.bytes_sent(), written as u64);

        let mut validator = FrameValidator::new(true);
        for (expected_seq, len) in [(1u32, 3usize), (2, 2)] {
            let mut buf = vec![0u8; HEADER_SIZE + len];
            rx.recv_exact(&mut buf).unwrap();
            assert_eq!(validator.validate(&buf), Ok(expected_seq));
        }
        assert_eq!(rx.bytes_received(), written as u64);
    }

    #[test]
    fn test_disconnect_notice_fires_once() {
        let (tx, rx) = socket_pair(false);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        rx.set_disconnect_notice(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        tx.close();
        let mut buf = [0u8; HEADER_SIZE];
        assert_eq!(rx.recv_exact(&mut buf), Err(SocketError::Disconnected));
        assert_eq!(rx.recv_exact(&mut buf), Err(SocketError::Disconnected));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(rx.status(), SocketStatus::Disconnected);
    }

    #[test]
    fn test_closed_socket_is_silent() {
        let (tx, _rx) = socket_pair(false);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        tx.set_disconnect_notice(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        tx.close();
        tx.close();
        let mut frames = vec![build_frame(MessageType::Gl, FragmentFlag::Single, b"x")];
        assert_eq!(tx.send_frames(&mut frames), Err(SocketError::Closed));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
