//! The single "connection broken" notification

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

use crate::events::{EngineEvent, EventSink};

/// Why a session broke
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakReason {
    /// The peer closed the connection or a permanent I/O failure occurred
    SocketDisconnected,
    /// The liveness monitor saw no answer for a full window
    HeartbeatTimeout,
    /// A frame failed validation, sequencing or reassembly
    ProtocolDesync,
}

impl fmt::Display for BreakReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakReason::SocketDisconnected => write!(f, "socket disconnected"),
            BreakReason::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            BreakReason::ProtocolDesync => write!(f, "protocol desync"),
        }
    }
}

/// User callback invoked once per socket lifetime
pub type BreakCallback = Arc<dyn Fn(BreakReason) + Send + Sync>;

/// Fires the break notification at most once between two `arm` calls
pub struct BreakNotifier {
    broken: AtomicBool,
    callback: Mutex<Option<BreakCallback>>,
    events: EventSink,
}

impl BreakNotifier {
    /// Create a notifier in the broken state; `arm` enables it
    pub fn new(events: EventSink) -> Self {
        Self {
            broken: AtomicBool::new(true),
            callback: Mutex::new(None),
            events,
        }
    }

    pub fn set_callback(&self, callback: Option<BreakCallback>) {
        *self.callback.lock() = callback;
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Allow the next break to be reported
    pub fn arm(&self) {
        self.broken.store(false, Ordering::SeqCst);
    }

    /// Mark as broken without notifying; returns the previous state
    pub fn suppress(&self) -> bool {
        self.broken.swap(true, Ordering::SeqCst)
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// Report a break; only the first report after `arm` notifies
    ///
    /// The callback runs on the calling thread, with no lock held.
    pub fn notify(&self, reason: BreakReason) -> bool {
        if self.broken.swap(true, Ordering::SeqCst) {
            return false;
        }

        error!("Connection broken: {}", reason);
        let callback = self.callback.lock().clone();
        match callback {
            Some(callback) => callback(reason),
            None => {
                info!("No break callback registered, raising engine event");
                (self.events)(&EngineEvent::SocketDisconnected);
            }
        }
        true
    }
}
