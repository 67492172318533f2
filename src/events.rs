//! Engine-wide events
//!
//! Conditions the embedding application may want to alert on. Delivered
//! through an `EventSink` handed to the session and the handshake; the
//! default sink only logs.

use std::fmt;
use std::sync::Arc;
use tracing::{error, warn};

/// Event raised by the transport layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Connection broken and no break callback was registered
    SocketDisconnected,
    /// A frame header failed validation
    PacketBroken,
    /// The peer never answered the version handshake
    VersionTimeout,
    /// Peer runs a different engine build
    VersionMismatch { local: String, remote: String },
    /// Peer runs a different engine subsystem
    EngineMismatch { local: String, remote: String },
    /// Peer reported the versions incompatible
    VersionRejected,
    /// Average round-trip latency above the configured limit
    BadLatency { average_us: i64 },
}

impl fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineEvent::SocketDisconnected => write!(f, "socket disconnected"),
            EngineEvent::PacketBroken => write!(f, "packet broken"),
            EngineEvent::VersionTimeout => write!(f, "version check timed out"),
            EngineEvent::VersionMismatch { local, remote } => {
                write!(f, "version mismatch (local {}, remote {})", local, remote)
            }
            EngineEvent::EngineMismatch { local, remote } => {
                write!(f, "engine mismatch (local {}, remote {})", local, remote)
            }
            EngineEvent::VersionRejected => write!(f, "version rejected by peer"),
            EngineEvent::BadLatency { average_us } => {
                write!(f, "bad latency (average {} us)", average_us)
            }
        }
    }
}

/// Receiver of engine events
pub type EventSink = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

/// Sink that writes every event to the log
pub fn log_sink() -> EventSink {
    Arc::new(|event: &EngineEvent| match event {
        EngineEvent::BadLatency { .. } => warn!("Engine event: {}", event),
        _ => error!("Engine event: {}", event),
    })
}

#[cfg(test)]
pub(crate) fn recording_sink() -> (EventSink, Arc<parking_lot::Mutex<Vec<EngineEvent>>>) {
    let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let recorded = events.clone();
    let sink: EventSink = Arc::new(move |event: &EngineEvent| recorded.lock().push(event.clone()));
    (sink, events)
}
