//! Heartbeat module - Liveness monitoring and latency estimation
//!
//! Each endpoint sends a request every interval and echoes the requests of
//! its peer. Answered requests fill a fixed-size latency window; a window
//! that fills up without a single answer means the connection is dead.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::HeartbeatConfig;
use crate::events::{EngineEvent, EventSink};
use crate::protocol::{build_frame, FragmentFlag, MessageType, WireFrame};
use crate::session::{HandleError, PacketHandler};
use crate::transport::{FrameSink, FrameSocket};

/// Encoded size of a heartbeat message
pub const HEARTBEAT_MESSAGE_SIZE: usize = 24;

/// Valid range for the average latency alarm, in seconds
const MAX_LATENCY_RANGE: std::ops::RangeInclusive<u32> = 1..=10;

const KIND_REQUEST: u8 = 0;
const KIND_RESPONSE: u8 = 1;

/// Heartbeat payload, encoded with bincode (fixed-width little-endian)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    /// Send time on the requester's monotonic clock
    pub send_micros: u64,
    /// Requester's probe number
    pub seq: u64,
    /// 0 = request, 1 = response
    pub kind: u8,
    pub pad: [u8; 7],
}

impl HeartbeatMessage {
    pub fn request(send_micros: u64, seq: u64) -> Self {
        Self {
            send_micros,
            seq,
            kind: KIND_REQUEST,
            pad: [0; 7],
        }
    }

    pub fn is_request(&self) -> bool {
        self.kind == KIND_REQUEST
    }

    pub fn is_response(&self) -> bool {
        self.kind == KIND_RESPONSE
    }

    /// The echo of a request
    pub fn into_response(mut self) -> Self {
        self.kind = KIND_RESPONSE;
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, bincode::Error> {
        if data.len() != HEARTBEAT_MESSAGE_SIZE {
            return Err(Box::new(bincode::ErrorKind::Custom(format!(
                "heartbeat message is {} bytes, expected {}",
                data.len(),
                HEARTBEAT_MESSAGE_SIZE
            ))));
        }
        bincode::deserialize(data)
    }
}

/// Capabilities the session needs from a liveness monitor
pub trait LivenessMonitor: PacketHandler {
    /// Start probing over `link`; false if the monitor could not start
    fn start(&self, link: MonitorLink) -> bool;

    /// Stop probing and wait for the monitor thread, unless called from it
    fn force_stop(&self);

    /// Rolling average round-trip latency in microseconds, 0 if unknown
    fn average_latency_us(&self) -> i64;
}

/// What a started monitor is bound to
#[derive(Clone)]
pub struct MonitorLink {
    pub socket: Arc<FrameSocket>,
    /// Invoked once when the peer stops answering
    pub on_timeout: Arc<dyn Fn() + Send + Sync>,
    pub events: EventSink,
}

struct Probe {
    seq: u64,
    send_micros: u64,
    latency_us: Option<u64>,
}

/// Fixed-size window of outstanding and answered probes
pub struct LatencyWindow {
    probes: VecDeque<Probe>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            probes: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a sent probe, evicting the oldest once full
    pub fn push(&mut self, seq: u64, send_micros: u64) {
        if self.probes.len() >= self.capacity {
            self.probes.pop_front();
        }
        self.probes.push_back(Probe {
            seq,
            send_micros,
            latency_us: None,
        });
    }

    /// Record an answer; returns the latency if the probe is still tracked
    pub fn record(&mut self, seq: u64, send_micros: u64, now_micros: u64) -> Option<u64> {
        let probe = self
            .probes
            .iter_mut()
            .rev()
            .find(|p| p.seq == seq && p.send_micros == send_micros)?;
        let latency = now_micros.saturating_sub(send_micros);
        probe.latency_us = Some(latency);
        Some(latency)
    }

    /// Average latency of the answered probes among the newest `count`
    pub fn average(&self, count: usize) -> Option<i64> {
        let answered: Vec<u64> = self
            .probes
            .iter()
            .rev()
            .take(count)
            .filter_map(|p| p.latency_us)
            .collect();
        if answered.is_empty() {
            return None;
        }
        let sum: u64 = answered.iter().sum();
        Some((sum / answered.len() as u64) as i64)
    }

    /// Maximum latency among the newest `count` probes
    pub fn max(&self, count: usize) -> u64 {
        self.probes
            .iter()
            .rev()
            .take(count)
            .filter_map(|p| p.latency_us)
            .max()
            .unwrap_or(0)
    }

    /// Full window with not a single answer
    pub fn is_silent(&self) -> bool {
        self.probes.len() >= self.capacity && self.probes.iter().all(|p| p.latency_us.is_none())
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }
}

enum Command {
    Packet(Bytes),
    Stop,
}

struct Worker {
    handle: JoinHandle<()>,
    commands: mpsc::Sender<Command>,
}

/// Heartbeat liveness monitor
pub struct Heartbeat {
    config: HeartbeatConfig,
    average_us: Arc<AtomicI64>,
    worker: Mutex<Option<Worker>>,
}

impl Heartbeat {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            average_us: Arc::new(AtomicI64::new(0)),
            worker: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map(|w| !w.handle.is_finished())
            .unwrap_or(false)
    }

    fn max_average_latency_us(&self) -> i64 {
        let mut secs = self.config.max_average_latency_secs;
        if !MAX_LATENCY_RANGE.contains(&secs) {
            warn!(
                "Max average latency {}s outside {:?}, using 1s",
                secs, MAX_LATENCY_RANGE
            );
            secs = 1;
        }
        i64::from(secs) * 1_000_000
    }
}

impl PacketHandler for Heartbeat {
    fn handle(&self, frame: WireFrame) -> Result<(), HandleError> {
        if frame.flag() != FragmentFlag::Single {
            return Err(HandleError::Malformed(format!(
                "fragmented heartbeat ({:?})",
                frame.flag()
            )));
        }
        if let Some(worker) = self.worker.lock().as_ref() {
            // A send error means the worker already exited
            let _ = worker.commands.send(Command::Packet(frame.payload()));
        }
        Ok(())
    }
}

impl LivenessMonitor for Heartbeat {
    fn start(&self, link: MonitorLink) -> bool {
        self.force_stop();

        let (commands, rx) = mpsc::channel();
        let mut monitor = Monitor {
            interval: Duration::from_millis(self.config.interval_ms.max(1)),
            average_window: self.config.average_window.max(1),
            bad_latency_us: self.max_average_latency_us(),
            window: LatencyWindow::new(self.config.check_duration),
            link,
            base: Instant::now(),
            sent: 0,
            last_response: 0,
            average_us: self.average_us.clone(),
        };

        let spawned = thread::Builder::new()
            .name("heartbeat".to_string())
            .spawn(move || monitor.run(rx));
        match spawned {
            Ok(handle) => {
                *self.worker.lock() = Some(Worker { handle, commands });
                info!(
                    "Heartbeat started: interval {}ms, window {}",
                    self.config.interval_ms, self.config.check_duration
                );
                true
            }
            Err(e) => {
                error!("Failed to spawn heartbeat thread: {}", e);
                false
            }
        }
    }

    fn force_stop(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.commands.send(Command::Stop);
            if worker.handle.thread().id() == thread::current().id() {
                debug!("Heartbeat stopped from its own thread");
            } else if worker.handle.join().is_err() {
                error!("Heartbeat thread panicked");
            }
            info!("Heartbeat stopped");
        }
        self.average_us.store(0, Ordering::SeqCst);
    }

    fn average_latency_us(&self) -> i64 {
        self.average_us.load(Ordering::SeqCst)
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.force_stop();
    }
}

struct Monitor {
    interval: Duration,
    average_window: usize,
    bad_latency_us: i64,
    window: LatencyWindow,
    link: MonitorLink,
    base: Instant,
    sent: u64,
    last_response: u64,
    average_us: Arc<AtomicI64>,
}

impl Monitor {
    fn run(&mut self, commands: mpsc::Receiver<Command>) {
        debug!("Heartbeat thread entering");
        let mut next_send = Instant::now();

        loop {
            let now = Instant::now();
            if now >= next_send {
                if self.window.is_silent() {
                    error!(
                        "No heartbeat answered in the last {} probes, network interrupted",
                        self.window.len()
                    );
                    (self.link.on_timeout)();
                    break;
                }
                self.send_request();
                next_send += self.interval;
                if next_send < now {
                    next_send = now + self.interval;
                }
            }

            let wait = next_send.saturating_duration_since(Instant::now());
            match commands.recv_timeout(wait) {
                Ok(Command::Packet(payload)) => self.on_packet(&payload),
                Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
        debug!("Heartbeat thread exited");
    }

    fn now_micros(&self) -> u64 {
        self.base.elapsed().as_micros() as u64
    }

    fn send_request(&mut self) {
        self.sent += 1;
        let request = HeartbeatMessage::request(self.now_micros(), self.sent);
        self.window.push(request.seq, request.send_micros);
        self.send(&request);
    }

    fn send(&self, message: &HeartbeatMessage) {
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode heartbeat: {}", e);
                return;
            }
        };
        let mut frames = [build_frame(MessageType::Heartbeat, FragmentFlag::Single, &payload)];
        if let Err(e) = self.link.socket.send_frames(&mut frames) {
            debug!("Failed to send heartbeat {}: {}", message.seq, e);
        }
    }

    fn on_packet(&mut self, payload: &[u8]) {
        let message = match HeartbeatMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                error!("Invalid heartbeat message: {}", e);
                return;
            }
        };

        if message.is_request() {
            self.send(&message.into_response());
        } else if message.is_response() {
            self.on_response(message);
        } else {
            error!("Unknown heartbeat kind {}", message.kind);
        }
    }

    fn on_response(&mut self, message: HeartbeatMessage) {
        if message.seq != self.last_response + 1 {
            warn!(
                "Heartbeat response {} out of order, expected {}",
                message.seq,
                self.last_response + 1
            );
        }
        self.last_response = message.seq;

        let now = self.now_micros();
        if let Some(latency) = self.window.record(message.seq, message.send_micros, now) {
            debug!("Heartbeat {}: latency {} us", message.seq, latency);
        }

        let Some(average) = self.window.average(self.average_window) else {
            return;
        };
        // 0 is reserved for "unknown"
        self.average_us.store(average.max(1), Ordering::SeqCst);
        debug!(
            "Latency average {} us, max {} us",
            average,
            self.window.max(self.average_window)
        );

        if average > self.bad_latency_us {
            error!(
                "Average latency {} us above limit {} us",
                average, self.bad_latency_us
            );
            (self.link.events)(&EngineEvent::BadLatency { average_us: average });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_is_24_bytes() {
        let message = HeartbeatMessage::request(0x0102_0304_0506_0708, 5);
        let encoded = message.encode().unwrap();
        assert_eq!(encoded.len(), HEARTBEAT_MESSAGE_SIZE);
        assert_eq!(&encoded[..8], &0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(&encoded[8..16], &5u64.to_le_bytes());
        assert_eq!(encoded[16], KIND_REQUEST);

        let decoded = HeartbeatMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, message);
        assert!(decoded.into_response().is_response());
    }

    #[test]
    fn test_decode_rejects_wrong_size() {
        assert!(HeartbeatMessage::decode(&[0u8; 23]).is_err());
        assert!(HeartbeatMessage::decode(&[0u8; 25]).is_err());
    }

    #[test]
    fn test_window_average_of_answered() {
        let mut window = LatencyWindow::new(30);
        for seq in 1..=4u64 {
            window.push(seq, seq * 1000);
        }
        assert_eq!(window.average(10), None);

        assert_eq!(window.record(2, 2000, 2300), Some(300));
        assert_eq!(window.record(4, 4000, 4100), Some(100));
        assert_eq!(window.average(10), Some(200));
        assert_eq!(window.max(10), 300);
        // Only the newest probe considered
        assert_eq!(window.average(1), Some(100));
    }

    #[test]
    fn test_window_unknown_probe_ignored() {
        let mut window = LatencyWindow::new(2);
        window.push(1, 100);
        window.push(2, 200);
        window.push(3, 300);
        assert_eq!(window.len(), 2);
        assert_eq!(window.record(1, 100, 500), None);
        assert_eq!(window.record(3, 999, 1500), None);
    }

    #[test]
    fn test_window_silence() {
        let mut window = LatencyWindow::new(3);
        window.push(1, 0);
        window.push(2, 0);
        assert!(!window.is_silent());
        window.push(3, 0);
        assert!(window.is_silent());

        window.record(3, 0, 10);
        assert!(!window.is_silent());
    }

    #[test]
    fn test_stopped_monitor_reports_unknown() {
        let heartbeat = Heartbeat::new(HeartbeatConfig::default());
        assert_eq!(heartbeat.average_latency_us(), 0);
        heartbeat.force_stop();
        assert!(!heartbeat.is_running());
    }
}
