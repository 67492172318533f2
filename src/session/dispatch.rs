//! Type-keyed dispatch of validated frames

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::fragment::{Reassembler, ReassemblyError};
use crate::protocol::{FrameError, FrameValidator, MessageType, WireFrame};

/// Interval between summaries of dropped frames
const UNHANDLED_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Handler errors; all of them desynchronize the stream
#[derive(Error, Debug)]
pub enum HandleError {
    #[error("Reassembly failed: {0}")]
    Reassembly(#[from] ReassemblyError),

    #[error("Malformed payload: {0}")]
    Malformed(String),
}

/// Consumer of the validated frames of one message type
pub trait PacketHandler: Send + Sync {
    /// Take ownership of one frame, in connection order
    fn handle(&self, frame: WireFrame) -> Result<(), HandleError>;

    /// Drop any buffered partial state
    fn clear(&self) {}
}

/// Application callback for complete logical messages; non-zero means rejected
pub type MessageHook = Arc<dyn Fn(&[u8]) -> u32 + Send + Sync>;

/// Reassembles frames and hands complete messages to a hook
pub struct HookHandler {
    reassembler: Mutex<Reassembler>,
    hook: MessageHook,
}

impl HookHandler {
    pub fn new(reassembler: Reassembler, hook: MessageHook) -> Self {
        Self {
            reassembler: Mutex::new(reassembler),
            hook,
        }
    }
}

impl PacketHandler for HookHandler {
    fn handle(&self, frame: WireFrame) -> Result<(), HandleError> {
        let message_type = frame.message_type();
        let message = self.reassembler.lock().reassemble(frame)?;
        if let Some(message) = message {
            let status = (self.hook)(&message);
            if status != 0 {
                warn!(
                    "Hook for {} rejected a {} byte message: status {}",
                    message_type,
                    message.len(),
                    status
                );
            }
        }
        Ok(())
    }

    fn clear(&self) {
        self.reassembler.lock().clear();
    }
}

type Slots = [Option<Arc<dyn PacketHandler>>; MessageType::COUNT];

/// At most one handler per message type
#[derive(Clone)]
pub struct HandlerTable {
    slots: Arc<RwLock<Slots>>,
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerTable {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(RwLock::new(std::array::from_fn(|_| None))),
        }
    }

    /// Install `handler`, returning the one it replaces
    pub fn register(
        &self,
        message_type: MessageType,
        handler: Arc<dyn PacketHandler>,
    ) -> Option<Arc<dyn PacketHandler>> {
        self.slots.write()[message_type.index()].replace(handler)
    }

    pub fn unregister(&self, message_type: MessageType) -> Option<Arc<dyn PacketHandler>> {
        self.slots.write()[message_type.index()].take()
    }

    pub fn get(&self, message_type: MessageType) -> Option<Arc<dyn PacketHandler>> {
        self.slots.read()[message_type.index()].clone()
    }

    pub fn is_registered(&self, message_type: MessageType) -> bool {
        self.slots.read()[message_type.index()].is_some()
    }

    pub fn registered(&self) -> Vec<MessageType> {
        MessageType::ALL
            .iter()
            .copied()
            .filter(|ty| self.is_registered(*ty))
            .collect()
    }

    /// Drop the buffered state of every handler; registrations stay
    pub fn clear_all(&self) {
        let handlers: Vec<_> = self.slots.read().iter().flatten().cloned().collect();
        for handler in handlers {
            handler.clear();
        }
    }
}

/// Errors that end the receive loop
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Frame rejected: {0}")]
    Frame(#[from] FrameError),

    #[error("Handler for {message_type} failed: {source}")]
    Handler {
        message_type: MessageType,
        #[source]
        source: HandleError,
    },
}

/// Validates frames in arrival order and routes them to the handler table
pub struct StreamParser {
    validator: FrameValidator,
    handlers: HandlerTable,
    unhandled: [u64; MessageType::COUNT],
    window_start: Instant,
    dispatched: u64,
}

impl StreamParser {
    pub fn new(handlers: HandlerTable, verify_hash: bool) -> Self {
        Self {
            validator: FrameValidator::new(verify_hash),
            handlers,
            unhandled: [0; MessageType::COUNT],
            window_start: Instant::now(),
            dispatched: 0,
        }
    }

    /// Frames handed to a handler so far
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    pub fn last_sequence(&self) -> u32 {
        self.validator.last_accepted()
    }

    /// Validate one complete frame and dispatch it
    pub fn parse(&mut self, bytes: Bytes) -> Result<(), ParseError> {
        let frame = WireFrame::parse(bytes)?;
        self.validator.validate(frame.as_bytes())?;

        let message_type = frame.message_type();
        // The table lock is released before the handler runs
        let handler = self.handlers.get(message_type);
        match handler {
            Some(handler) => {
                handler
                    .handle(frame)
                    .map_err(|source| ParseError::Handler {
                        message_type,
                        source,
                    })?;
                self.dispatched += 1;
            }
            None => self.count_unhandled(message_type),
        }
        Ok(())
    }

    fn count_unhandled(&mut self, message_type: MessageType) {
        self.unhandled[message_type.index()] += 1;
        debug!("No handler for {}, frame dropped", message_type);

        if self.window_start.elapsed() < UNHANDLED_REPORT_INTERVAL {
            return;
        }
        let summary: Vec<String> = MessageType::ALL
            .iter()
            .filter(|ty| self.unhandled[ty.index()] > 0)
            .map(|ty| format!("{}: {}", ty, self.unhandled[ty.index()]))
            .collect();
        warn!("Dropped frames without handler: {}", summary.join(", "));
        self.unhandled = [0; MessageType::COUNT];
        self.window_start = Instant::now();
    }
}
