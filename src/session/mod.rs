//! Session module - The per-connection protocol engine
//!
//! A `NetComm` owns one connection: the send path with its per-type
//! fragmenters, the background receive loop, the handler table, the optional
//! liveness monitor and the one-shot break notification.
//!
//! Lifecycle:
//! ```text
//! Unstarted --start--> Running --stop--> Stopped
//!     |                                     ^
//!     +---------------- stop (no-op) -------+ (stays Unstarted)
//! ```

mod breaker;
mod dispatch;
mod receiver;

pub use breaker::*;
pub use dispatch::*;
pub use receiver::*;

use parking_lot::Mutex;
use serde::Serialize;
use std::io;
use std::sync::Arc;
use std::thread;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Config, HeartbeatConfig, TransportConfig};
use crate::events::{log_sink, EventSink};
use crate::fragment::{FragmentError, Fragmenter, Reassembler};
use crate::heartbeat::{Heartbeat, LivenessMonitor, MonitorLink};
use crate::protocol::MessageType;
use crate::transport::{FrameSocket, RawConnection};

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No socket attached")]
    NoSocket,

    #[error("Session not started")]
    NotStarted,

    #[error("Session already started")]
    AlreadyStarted,

    #[error("Session stopped")]
    Stopped,

    #[error("Connection broken")]
    Broken,

    #[error("Failed to spawn receive thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("Liveness monitor failed to start")]
    MonitorStart,

    #[error("Send failed: {0}")]
    Fragment(#[from] FragmentError),

    #[error("Short send: {sent} of {expected} bytes")]
    ShortSend { sent: usize, expected: usize },
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Lifecycle {
    Unstarted,
    Running,
    Stopped,
}

/// Snapshot of the session counters
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub id: Uuid,
    pub state: Lifecycle,
    pub broken: bool,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_sent: u64,
    /// Rolling round-trip latency in microseconds, 0 if unknown
    pub latency_us: i64,
    pub handlers: Vec<MessageType>,
}

struct SessionState {
    lifecycle: Lifecycle,
    socket: Option<Arc<FrameSocket>>,
    fragmenters: [Fragmenter; MessageType::COUNT],
    receiver: Option<ReceiveLoop>,
    monitor: Option<Arc<dyn LivenessMonitor>>,
}

/// Protocol engine for one connection
pub struct NetComm {
    id: Uuid,
    transport: TransportConfig,
    heartbeat: HeartbeatConfig,
    state: Mutex<SessionState>,
    handlers: HandlerTable,
    breaker: Arc<BreakNotifier>,
    events: EventSink,
}

impl NetComm {
    pub fn new(transport: TransportConfig, heartbeat: HeartbeatConfig) -> Self {
        let events = log_sink();
        let fragmenter = Fragmenter::new(transport.frame_capacity(), transport.max_message_size);
        Self {
            id: Uuid::new_v4(),
            state: Mutex::new(SessionState {
                lifecycle: Lifecycle::Unstarted,
                socket: None,
                fragmenters: [fragmenter; MessageType::COUNT],
                receiver: None,
                monitor: None,
            }),
            handlers: HandlerTable::new(),
            breaker: Arc::new(BreakNotifier::new(events.clone())),
            events,
            transport,
            heartbeat,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.transport.clone(), config.heartbeat.clone())
    }

    /// Route engine events to `events` instead of the log
    pub fn with_event_sink(mut self, events: EventSink) -> Self {
        self.breaker = Arc::new(BreakNotifier::new(events.clone()));
        self.events = events;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    pub fn is_broken(&self) -> bool {
        self.breaker.is_broken()
    }

    /// Attach the connection; only allowed before `start`
    pub fn set_socket<C: RawConnection + 'static>(&self, conn: C) -> SessionResult<()> {
        let mut state = self.state.lock();
        match state.lifecycle {
            Lifecycle::Unstarted => {}
            Lifecycle::Running => return Err(SessionError::AlreadyStarted),
            Lifecycle::Stopped => return Err(SessionError::Stopped),
        }
        if let Some(addr) = conn.peer_addr() {
            debug!("Session {} attached to {}", self.id, addr);
        }
        state.socket = Some(Arc::new(FrameSocket::new(
            Arc::new(conn),
            self.transport.integrity_hash,
        )));
        Ok(())
    }

    /// Install `handler` for `message_type`, replacing any previous one
    pub fn register_handler(&self, message_type: MessageType, handler: Arc<dyn PacketHandler>) {
        if message_type == MessageType::Heartbeat && self.heartbeat.enabled {
            warn!("Handler for Heartbeat is replaced by the liveness monitor on start");
        }
        if self.handlers.register(message_type, handler).is_some() {
            debug!("Replaced handler for {}", message_type);
        }
    }

    /// Deliver complete messages of `message_type` to `hook`
    ///
    /// With `single_frame` set, messages of this type are never fragmented in
    /// either direction.
    pub fn register_hook<F>(&self, message_type: MessageType, hook: F, single_frame: bool)
    where
        F: Fn(&[u8]) -> u32 + Send + Sync + 'static,
    {
        let capacity = self.transport.frame_capacity();
        let max = self.transport.max_message_size;

        self.state.lock().fragmenters[message_type.index()] =
            Fragmenter::new(capacity, max).single_frame(single_frame);

        let reassembler =
            Reassembler::with_limits(message_type, capacity, max).single_frame(single_frame);
        self.register_handler(
            message_type,
            Arc::new(HookHandler::new(reassembler, Arc::new(hook))),
        );
    }

    pub fn unregister(&self, message_type: MessageType) -> bool {
        self.handlers.unregister(message_type).is_some()
    }

    /// Callback fired once when the connection breaks
    ///
    /// It runs on the thread that detected the break and may call `stop`.
    pub fn set_break_callback<F>(&self, callback: F)
    where
        F: Fn(BreakReason) + Send + Sync + 'static,
    {
        self.breaker.set_callback(Some(Arc::new(callback)));
    }

    /// Spawn the receive loop and the liveness monitor
    ///
    /// On failure the session ends up stopped.
    pub fn start(&self) -> SessionResult<()> {
        let mut state = self.state.lock();
        match state.lifecycle {
            Lifecycle::Unstarted => {}
            Lifecycle::Running => return Err(SessionError::AlreadyStarted),
            Lifecycle::Stopped => return Err(SessionError::Stopped),
        }
        let socket = state.socket.clone().ok_or(SessionError::NoSocket)?;

        let breaker = self.breaker.clone();
        socket.set_disconnect_notice(Arc::new(move || {
            breaker.notify(BreakReason::SocketDisconnected);
        }));

        let monitor = if self.heartbeat.enabled {
            let heartbeat = Arc::new(Heartbeat::new(self.heartbeat.clone()));
            self.handlers.register(MessageType::Heartbeat, heartbeat.clone());
            state.fragmenters[MessageType::Heartbeat.index()] =
                state.fragmenters[MessageType::Heartbeat.index()].single_frame(true);
            Some(heartbeat as Arc<dyn LivenessMonitor>)
        } else {
            None
        };

        state.lifecycle = Lifecycle::Running;
        self.breaker.arm();

        let parser = StreamParser::new(self.handlers.clone(), self.transport.integrity_hash);
        let spawned = ReceiveLoop::spawn(
            socket.clone(),
            parser,
            self.transport.frame_capacity(),
            self.breaker.clone(),
        );
        let result = match spawned {
            Ok(receiver) => {
                state.receiver = Some(receiver);
                Ok(())
            }
            Err(e) => Err(SessionError::Spawn(e)),
        };

        let result = result.and_then(|()| {
            let Some(monitor) = monitor else {
                return Ok(());
            };
            let breaker = self.breaker.clone();
            let link = MonitorLink {
                socket,
                on_timeout: Arc::new(move || {
                    breaker.notify(BreakReason::HeartbeatTimeout);
                }),
                events: self.events.clone(),
            };
            state.monitor = Some(monitor.clone());
            if monitor.start(link) {
                Ok(())
            } else {
                Err(SessionError::MonitorStart)
            }
        });

        drop(state);
        match result {
            Ok(()) => {
                info!("Session {} started", self.id);
                Ok(())
            }
            Err(e) => {
                error!("Session {} failed to start: {}", self.id, e);
                self.stop();
                Err(e)
            }
        }
    }

    /// Tear the session down; idempotent and safe from any thread
    ///
    /// Suppresses the break notification, closes the socket, stops the
    /// liveness monitor and the receive loop, then drops all partially
    /// reassembled messages. Handler registrations stay.
    pub fn stop(&self) {
        self.breaker.suppress();

        let (socket, receiver, monitor) = {
            let mut state = self.state.lock();
            if state.lifecycle != Lifecycle::Running {
                return;
            }
            state.lifecycle = Lifecycle::Stopped;
            (
                state.socket.clone(),
                state.receiver.take(),
                state.monitor.take(),
            )
        };

        if let Some(socket) = socket {
            socket.close();
        }
        if let Some(monitor) = monitor {
            monitor.force_stop();
            self.handlers.unregister(MessageType::Heartbeat);
        }
        if let Some(receiver) = receiver {
            if receiver.thread_id() == thread::current().id() {
                debug!("Session stopped from its receive thread");
            } else {
                receiver.join();
            }
        }
        self.handlers.clear_all();
        info!("Session {} stopped", self.id);
    }

    /// Send one logical message, fragmenting it as needed
    ///
    /// Frames of one message are written back-to-back; concurrent senders
    /// never interleave within a message.
    pub fn send(&self, message_type: MessageType, payload: &[u8]) -> SessionResult<()> {
        if payload.is_empty() {
            return Err(FragmentError::EmptyPayload.into());
        }
        if payload.len() > self.transport.max_message_size {
            return Err(FragmentError::MessageTooLarge {
                size: payload.len(),
                max: self.transport.max_message_size,
            }
            .into());
        }

        let (socket, fragmenter) = {
            let state = self.state.lock();
            match state.lifecycle {
                Lifecycle::Unstarted => return Err(SessionError::NotStarted),
                Lifecycle::Stopped => return Err(SessionError::Broken),
                Lifecycle::Running => {}
            }
            let socket = state.socket.clone().ok_or(SessionError::NoSocket)?;
            (socket, state.fragmenters[message_type.index()])
        };
        if self.breaker.is_broken() {
            return Err(SessionError::Broken);
        }

        let sent = fragmenter.send(message_type, payload, &*socket)?;
        if sent != payload.len() {
            return Err(SessionError::ShortSend {
                sent,
                expected: payload.len(),
            });
        }
        Ok(())
    }

    /// Rolling round-trip latency in microseconds, 0 if unknown
    pub fn lag(&self) -> i64 {
        self.state
            .lock()
            .monitor
            .as_ref()
            .map(|m| m.average_latency_us())
            .unwrap_or(0)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.with_socket(|s| s.bytes_sent())
    }

    pub fn bytes_received(&self) -> u64 {
        self.with_socket(|s| s.bytes_received())
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            id: self.id,
            state: self.state(),
            broken: self.is_broken(),
            bytes_sent: self.bytes_sent(),
            bytes_received: self.bytes_received(),
            frames_sent: self.with_socket(|s| s.frames_sent()),
            latency_us: self.lag(),
            handlers: self.handlers.registered(),
        }
    }

    fn with_socket(&self, f: impl Fn(&FrameSocket) -> u64) -> u64 {
        self.state.lock().socket.as_deref().map(f).unwrap_or(0)
    }
}

impl Drop for NetComm {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{recording_sink, EngineEvent};
    use crate::protocol::{build_frame, FragmentFlag, SendSequencer, WireFrame};
    use crate::transport::{loopback_pair, TcpConnection};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Weak};
    use std::time::{Duration, Instant};

    fn wait_until(timeout: Duration, f: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        f()
    }

    fn session(heartbeat: HeartbeatConfig) -> NetComm {
        NetComm::new(TransportConfig::default(), heartbeat)
    }

    fn connected_pair(heartbeat: HeartbeatConfig) -> (NetComm, NetComm) {
        let (a, b) = loopback_pair();
        let client = session(heartbeat.clone());
        let server = session(heartbeat);
        client.set_socket(a).unwrap();
        server.set_socket(b).unwrap();
        (client, server)
    }

    fn fast_heartbeat() -> HeartbeatConfig {
        HeartbeatConfig {
            interval_ms: 10,
            check_duration: 5,
            ..Default::default()
        }
    }

    fn reason_channel(session: &NetComm) -> mpsc::Receiver<BreakReason> {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        session.set_break_callback(move |reason| {
            let _ = tx.lock().send(reason);
        });
        rx
    }

    #[test]
    fn test_round_trip_with_fragmentation() {
        let (client, server) = connected_pair(HeartbeatConfig::disabled());
        let received = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
        let sink = received.clone();
        server.register_hook(
            MessageType::Gl,
            move |data| {
                sink.lock().push(data.to_vec());
                0
            },
            false,
        );
        client.start().unwrap();
        server.start().unwrap();

        let large: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        client.send(MessageType::Gl, b"hello").unwrap();
        client.send(MessageType::Gl, &large).unwrap();

        assert!(wait_until(Duration::from_secs(2), || received.lock().len() == 2));
        let received = received.lock();
        assert_eq!(received[0], b"hello");
        assert_eq!(received[1], large);
        assert!(client.bytes_sent() > large.len() as u64);
        assert_eq!(server.bytes_received(), client.bytes_sent());
    }

    #[test]
    fn test_parameter_errors() {
        let (client, _server) = connected_pair(HeartbeatConfig::disabled());
        assert!(matches!(
            client.send(MessageType::Gl, b"x"),
            Err(SessionError::NotStarted)
        ));
        client.start().unwrap();
        assert!(matches!(
            client.send(MessageType::Gl, &[]),
            Err(SessionError::Fragment(FragmentError::EmptyPayload))
        ));

        client.register_hook(MessageType::Sensor, |_| 0, true);
        let oversized = vec![0u8; TransportConfig::default().frame_capacity() + 1];
        assert!(matches!(
            client.send(MessageType::Sensor, &oversized),
            Err(SessionError::Fragment(FragmentError::ExceedsFrame { .. }))
        ));
        assert!(!client.is_broken());
    }

    #[test]
    fn test_start_requires_socket() {
        let comm = session(HeartbeatConfig::disabled());
        assert!(matches!(comm.start(), Err(SessionError::NoSocket)));
        assert_eq!(comm.state(), Lifecycle::Unstarted);
    }

    #[test]
    fn test_stop_before_start_is_noop() {
        let (client, _server) = connected_pair(HeartbeatConfig::disabled());
        client.stop();
        assert_eq!(client.state(), Lifecycle::Unstarted);
        client.start().unwrap();
        assert_eq!(client.state(), Lifecycle::Running);
    }

    #[test]
    fn test_stop_is_idempotent_and_silent() {
        let (client, server) = connected_pair(HeartbeatConfig::disabled());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        client.set_break_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        client.start().unwrap();
        server.start().unwrap();

        client.stop();
        client.stop();
        assert_eq!(client.state(), Lifecycle::Stopped);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(client.start(), Err(SessionError::Stopped)));
        assert!(matches!(
            client.send(MessageType::Gl, b"late"),
            Err(SessionError::Broken)
        ));
    }

    #[test]
    fn test_peer_stop_breaks_once() {
        let (client, server) = connected_pair(HeartbeatConfig::disabled());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        client.set_break_callback(move |reason| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.lock().send(reason);
        });
        client.start().unwrap();
        server.start().unwrap();

        server.stop();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)),
            Ok(BreakReason::SocketDisconnected)
        );
        assert!(client.is_broken());
        assert!(matches!(
            client.send(MessageType::Gl, b"after"),
            Err(SessionError::Broken)
        ));

        client.stop();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_from_break_callback() {
        let (client, server) = connected_pair(HeartbeatConfig::disabled());
        let client = Arc::new(client);
        let weak: Weak<NetComm> = Arc::downgrade(&client);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        client.set_break_callback(move |_| {
            if let Some(comm) = weak.upgrade() {
                comm.stop();
            }
            let _ = tx.lock().send(());
        });
        client.start().unwrap();
        server.start().unwrap();

        drop(server);
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        assert!(wait_until(Duration::from_secs(1), || client.state() == Lifecycle::Stopped));
    }

    #[test]
    fn test_corrupted_header_desyncs() {
        let (a, peer) = loopback_pair();
        let (sink, events) = recording_sink();
        let client = session(HeartbeatConfig::disabled()).with_event_sink(sink);
        client.set_socket(a).unwrap();
        let breaks = reason_channel(&client);
        client.start().unwrap();

        peer.send(&[0xFFu8; 16]).unwrap();
        assert_eq!(
            breaks.recv_timeout(Duration::from_secs(2)),
            Ok(BreakReason::ProtocolDesync)
        );
        assert!(events.lock().contains(&EngineEvent::PacketBroken));
        client.stop();
    }

    #[test]
    fn test_heartbeat_measures_latency() {
        let heartbeat = HeartbeatConfig {
            interval_ms: 10,
            ..Default::default()
        };
        let (client, server) = connected_pair(heartbeat);
        client.start().unwrap();
        server.start().unwrap();

        assert!(wait_until(Duration::from_secs(3), || client.lag() > 0 && server.lag() > 0));
        assert!(!client.is_broken());
        assert!(client.stats().handlers.contains(&MessageType::Heartbeat));

        client.stop();
        assert_eq!(client.lag(), 0);
    }

    #[test]
    fn test_heartbeat_timeout_against_silent_peer() {
        let (a, _silent): (TcpConnection, TcpConnection) = loopback_pair();
        let client = session(fast_heartbeat());
        client.set_socket(a).unwrap();
        let breaks = reason_channel(&client);
        client.start().unwrap();

        assert_eq!(
            breaks.recv_timeout(Duration::from_secs(3)),
            Ok(BreakReason::HeartbeatTimeout)
        );
        client.stop();
        assert_eq!(client.state(), Lifecycle::Stopped);
    }

    #[test]
    fn test_heartbeat_timeout_stop_from_callback() {
        let (a, _silent): (TcpConnection, TcpConnection) = loopback_pair();
        let client = Arc::new(session(fast_heartbeat()));
        client.set_socket(a).unwrap();
        let weak: Weak<NetComm> = Arc::downgrade(&client);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        client.set_break_callback(move |reason| {
            if let Some(comm) = weak.upgrade() {
                comm.stop();
            }
            let _ = tx.lock().send(reason);
        });
        client.start().unwrap();

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(3)),
            Ok(BreakReason::HeartbeatTimeout)
        );
        assert!(wait_until(Duration::from_secs(1), || client.state() == Lifecycle::Stopped));
        assert_eq!(client.lag(), 0);
    }

    /// Handler exposing its reassembly bucket
    struct Bucket {
        reassembler: Mutex<Reassembler>,
    }

    impl PacketHandler for Bucket {
        fn handle(&self, frame: WireFrame) -> Result<(), HandleError> {
            self.reassembler.lock().reassemble(frame)?;
            Ok(())
        }

        fn clear(&self) {
            self.reassembler.lock().clear();
        }
    }

    #[test]
    fn test_stop_clears_partial_messages() {
        let (a, peer): (TcpConnection, TcpConnection) = loopback_pair();
        let client = session(HeartbeatConfig::disabled());
        client.set_socket(a).unwrap();
        let bucket = Arc::new(Bucket {
            reassembler: Mutex::new(Reassembler::new(MessageType::Gl)),
        });
        client.register_handler(MessageType::Gl, bucket.clone());
        client.start().unwrap();

        let mut sequencer = SendSequencer::new();
        let mut frame = build_frame(MessageType::Gl, FragmentFlag::First, b"partial");
        sequencer.stamp(&mut frame, true);
        peer.send(&frame).unwrap();
        assert!(wait_until(Duration::from_secs(2), || bucket.reassembler.lock().in_progress()));

        client.stop();
        assert!(!bucket.reassembler.lock().in_progress());
        assert_eq!(bucket.reassembler.lock().buffered_len(), 0);
        assert_eq!(client.stats().handlers, vec![MessageType::Gl]);
    }
}
