//! Background receive loop

use bytes::BytesMut;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error, info};

use super::breaker::{BreakNotifier, BreakReason};
use super::dispatch::StreamParser;
use crate::events::EngineEvent;
use crate::protocol::{payload_length, HEADER_SIZE};
use crate::transport::{FrameSocket, SocketError};

/// Handle to a running receive thread
pub struct ReceiveLoop {
    handle: JoinHandle<()>,
}

impl ReceiveLoop {
    /// Spawn the receive thread for `socket`
    ///
    /// `capacity` bounds the payload of a single wire frame.
    pub fn spawn(
        socket: Arc<FrameSocket>,
        parser: StreamParser,
        capacity: usize,
        breaker: Arc<BreakNotifier>,
    ) -> io::Result<Self> {
        let handle = thread::Builder::new()
            .name("frame-recv".to_string())
            .spawn(move || run(socket, parser, capacity, breaker))?;
        Ok(Self { handle })
    }

    pub fn thread_id(&self) -> ThreadId {
        self.handle.thread().id()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the thread to exit; the socket must be closed first
    pub fn join(self) {
        if self.handle.join().is_err() {
            error!("Receive thread panicked");
        }
    }
}

fn run(socket: Arc<FrameSocket>, mut parser: StreamParser, capacity: usize, breaker: Arc<BreakNotifier>) {
    info!("Receive thread started");
    let mut header = [0u8; HEADER_SIZE];

    let reason = loop {
        if let Err(e) = socket.recv_exact(&mut header) {
            break exit_reason(e);
        }

        let len = match payload_length(&header) {
            Ok(len) => len,
            Err(e) => {
                error!("Bad frame header: {}", e);
                (breaker.events())(&EngineEvent::PacketBroken);
                break Some(BreakReason::ProtocolDesync);
            }
        };
        if len > capacity {
            error!("Frame payload {} bytes exceeds capacity {}", len, capacity);
            (breaker.events())(&EngineEvent::PacketBroken);
            break Some(BreakReason::ProtocolDesync);
        }

        let mut frame = BytesMut::zeroed(HEADER_SIZE + len);
        frame[..HEADER_SIZE].copy_from_slice(&header);
        if let Err(e) = socket.recv_exact(&mut frame[HEADER_SIZE..]) {
            break exit_reason(e);
        }

        if let Err(e) = parser.parse(frame.freeze()) {
            error!("Stream desynchronized after sequence {}: {}", parser.last_sequence(), e);
            // Socket stays open; the owner closes it from `stop`
            break Some(BreakReason::ProtocolDesync);
        }
    };

    if let Some(reason) = reason {
        breaker.notify(reason);
    }
    info!(
        "Receive thread exited after {} dispatched frames",
        parser.dispatched()
    );
}

/// Break reason for a socket failure, if it still needs reporting
fn exit_reason(e: SocketError) -> Option<BreakReason> {
    match e {
        SocketError::Closed => {
            debug!("Socket closed, receive thread stopping");
            None
        }
        // Reported through the socket's disconnect notice
        SocketError::Disconnected => None,
    }
}
