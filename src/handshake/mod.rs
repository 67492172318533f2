//! Version handshake
//!
//! Runs once on a fresh connection, before any data frame crosses it. The
//! server announces its build and engine subsystem and waits for the client's
//! verdict; the client compares the announcement against its own and answers
//! with a 4-byte result. No application data may be sent on a connection that
//! failed the check.
//!
//! Wire format, both directions:
//! - 4 bytes magic, the ASCII bytes `ver.`
//! - 4 bytes payload size (u32, little-endian)
//! - payload: `"<version>\n<engine>"` from the server, `u32` LE result from the client

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::events::{log_sink, EngineEvent, EventSink};
use crate::transport::{IoFailure, RawConnection};

/// Build identifier announced by this crate
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Magic bytes opening every handshake message
pub const VERSION_MAGIC: [u8; 4] = *b"ver.";

/// Size of the handshake message header
pub const VERSION_HEADER_SIZE: usize = 8;

/// Largest accepted handshake payload
pub const MAX_VERSION_PAYLOAD: usize = 100 * 1024;

/// Result value meaning "compatible"
const MATCH_SUCCESS: u32 = 1;

/// Wait between attempts when no data is available yet
const RETRY_INTERVAL: Duration = Duration::from_micros(500);

/// Handshake errors
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Version check timed out")]
    Timeout,

    #[error("Engine mismatch: local={local}, remote={remote}")]
    EngineMismatch { local: String, remote: String },

    #[error("Version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: String, remote: String },

    #[error("Peer rejected our version")]
    Rejected,

    #[error("Malformed handshake message: {0}")]
    Malformed(String),

    #[error("Connection lost during handshake")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type HandshakeResult<T> = Result<T, HandshakeError>;

/// Engine subsystem a build belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineType {
    VideoEngine,
    InstructionEngine,
}

impl EngineType {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineType::VideoEngine => "VideoEngine",
            EngineType::InstructionEngine => "InstructionEngine",
        }
    }
}

impl Default for EngineType {
    fn default() -> Self {
        EngineType::VideoEngine
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "VideoEngine" | "video" => Ok(EngineType::VideoEngine),
            "InstructionEngine" | "instruction" => Ok(EngineType::InstructionEngine),
            _ => Err(format!("unknown engine type: {}", s)),
        }
    }
}

/// Progress of one handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    SentGreeting,
    AwaitingPeer,
    Matched,
    Mismatched,
    TimedOut,
    Done,
}

/// Which side of the check is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Server,
    Client,
}

/// Holds a connection in non-blocking mode for its lifetime
struct NonBlockingGuard<'a> {
    conn: &'a dyn RawConnection,
}

impl<'a> NonBlockingGuard<'a> {
    fn new(conn: &'a dyn RawConnection) -> std::io::Result<Self> {
        conn.set_nonblocking(true)?;
        Ok(Self { conn })
    }
}

impl Drop for NonBlockingGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.conn.set_nonblocking(false) {
            error!("Failed to restore blocking mode: {}", e);
        }
    }
}

/// One-shot version check over a raw connection
pub struct VersionCheck<'a> {
    conn: &'a dyn RawConnection,
    version: String,
    engine: EngineType,
    events: EventSink,
    state: HandshakeState,
}

impl<'a> VersionCheck<'a> {
    pub fn new(conn: &'a dyn RawConnection, engine: EngineType) -> Self {
        Self {
            conn,
            version: ENGINE_VERSION.to_string(),
            engine,
            events: log_sink(),
            state: HandshakeState::Init,
        }
    }

    /// Override the announced build identifier
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_event_sink(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Announce this build and wait up to `timeout` for the client's verdict
    ///
    /// A zero timeout waits indefinitely.
    pub fn check_server(&mut self, timeout: Duration) -> HandshakeResult<()> {
        let deadline = deadline(timeout);
        let result = self.run_server(deadline);
        self.finish(Role::Server, result)
    }

    /// Receive the server's announcement, compare it, and answer
    ///
    /// A zero timeout waits indefinitely.
    pub fn check_client(&mut self, timeout: Duration) -> HandshakeResult<()> {
        let deadline = deadline(timeout);
        let result = self.run_client(deadline);
        self.finish(Role::Client, result)
    }

    fn run_server(&mut self, deadline: Option<Instant>) -> HandshakeResult<()> {
        let _guard = NonBlockingGuard::new(self.conn)?;

        let greeting = format!("{}\n{}", self.version, self.engine);
        self.send_message(greeting.as_bytes(), deadline)?;
        self.transition(HandshakeState::SentGreeting);

        self.transition(HandshakeState::AwaitingPeer);
        let reply = self.recv_message(deadline)?;
        if reply.len() != 4 {
            return Err(HandshakeError::Malformed(format!(
                "match result is {} bytes, expected 4",
                reply.len()
            )));
        }

        let result = u32::from_le_bytes([reply[0], reply[1], reply[2], reply[3]]);
        if result != MATCH_SUCCESS {
            self.transition(HandshakeState::Mismatched);
            return Err(HandshakeError::Rejected);
        }

        self.transition(HandshakeState::Matched);
        info!("Version match success: {} {}", self.version, self.engine);
        Ok(())
    }

    fn run_client(&mut self, deadline: Option<Instant>) -> HandshakeResult<()> {
        let _guard = NonBlockingGuard::new(self.conn)?;

        self.transition(HandshakeState::AwaitingPeer);
        let greeting = self.recv_message(deadline)?;
        let (remote_version, remote_engine) = parse_greeting(&greeting)?;

        let local_engine = self.engine.as_str();
        let matched = remote_engine == local_engine && remote_version == self.version;
        self.transition(if matched {
            HandshakeState::Matched
        } else {
            HandshakeState::Mismatched
        });

        let answer = if matched { MATCH_SUCCESS } else { 0 };
        if let Err(e) = self.send_message(&answer.to_le_bytes(), deadline) {
            // The server drops the connection without a verdict
            warn!("Failed to send match result: {}", e);
            return Err(HandshakeError::Timeout);
        }

        if matched {
            info!("Version match success: {} {}", self.version, self.engine);
            return Ok(());
        }

        if remote_version != self.version {
            Err(HandshakeError::VersionMismatch {
                local: self.version.clone(),
                remote: remote_version,
            })
        } else {
            Err(HandshakeError::EngineMismatch {
                local: local_engine.to_string(),
                remote: remote_engine,
            })
        }
    }

    fn send_message(&self, payload: &[u8], deadline: Option<Instant>) -> HandshakeResult<()> {
        let mut buf = BytesMut::with_capacity(VERSION_HEADER_SIZE + payload.len());
        buf.put_slice(&VERSION_MAGIC);
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(payload);

        loop {
            match self.conn.send(&buf) {
                Ok(_) => return Ok(()),
                Err(IoFailure::Retry) => wait_or_timeout(deadline)?,
                Err(IoFailure::Disconnected) => return Err(HandshakeError::Disconnected),
            }
        }
    }

    fn recv_message(&self, deadline: Option<Instant>) -> HandshakeResult<Vec<u8>> {
        let mut header = [0u8; VERSION_HEADER_SIZE];
        self.recv_full(&mut header, deadline)?;

        if header[..4] != VERSION_MAGIC {
            return Err(HandshakeError::Malformed(format!(
                "bad magic {:02x?}",
                &header[..4]
            )));
        }

        let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if size == 0 || size > MAX_VERSION_PAYLOAD {
            return Err(HandshakeError::Malformed(format!(
                "payload size {} out of range",
                size
            )));
        }

        let mut payload = vec![0u8; size];
        self.recv_full(&mut payload, deadline)?;
        Ok(payload)
    }

    fn recv_full(&self, buf: &mut [u8], deadline: Option<Instant>) -> HandshakeResult<()> {
        let mut read = 0;
        while read < buf.len() {
            match self.conn.recv(&mut buf[read..]) {
                Ok(n) => read += n,
                Err(IoFailure::Retry) => wait_or_timeout(deadline)?,
                Err(IoFailure::Disconnected) => return Err(HandshakeError::Disconnected),
            }
        }
        Ok(())
    }

    fn transition(&mut self, state: HandshakeState) {
        debug!("Handshake state: {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    fn finish(&mut self, role: Role, result: HandshakeResult<()>) -> HandshakeResult<()> {
        if let Err(e) = &result {
            error!("Version check failed: {}", e);
            let event = match e {
                HandshakeError::Timeout => {
                    self.transition(HandshakeState::TimedOut);
                    Some(EngineEvent::VersionTimeout)
                }
                HandshakeError::VersionMismatch { local, remote } => Some(EngineEvent::VersionMismatch {
                    local: local.clone(),
                    remote: remote.clone(),
                }),
                HandshakeError::EngineMismatch { local, remote } => Some(EngineEvent::EngineMismatch {
                    local: local.clone(),
                    remote: remote.clone(),
                }),
                HandshakeError::Rejected => Some(EngineEvent::VersionRejected),
                // A client that never got a usable greeting reports it as a timeout
                HandshakeError::Disconnected | HandshakeError::Malformed(_) | HandshakeError::Io(_)
                    if role == Role::Client =>
                {
                    Some(EngineEvent::VersionTimeout)
                }
                _ => None,
            };
            if let Some(event) = event {
                (self.events)(&event);
            }
        }
        self.transition(HandshakeState::Done);
        result
    }
}

fn deadline(timeout: Duration) -> Option<Instant> {
    if timeout.is_zero() {
        None
    } else {
        Some(Instant::now() + timeout)
    }
}

fn wait_or_timeout(deadline: Option<Instant>) -> HandshakeResult<()> {
    if let Some(deadline) = deadline {
        if Instant::now() >= deadline {
            return Err(HandshakeError::Timeout);
        }
    }
    std::thread::sleep(RETRY_INTERVAL);
    Ok(())
}

/// Split a greeting into (version, engine); trailing NULs are ignored
fn parse_greeting(payload: &[u8]) -> HandshakeResult<(String, String)> {
    let end = payload
        .iter()
        .rposition(|&b| b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);
    let text = std::str::from_utf8(&payload[..end])
        .map_err(|e| HandshakeError::Malformed(format!("greeting is not UTF-8: {}", e)))?;
    let (version, engine) = text
        .split_once('\n')
        .ok_or_else(|| HandshakeError::Malformed(format!("no separator in {:?}", text)))?;
    Ok((version.to_string(), engine.to_string()))
}
