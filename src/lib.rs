//! EngineLink - Transport and session layer for cloud-device streaming engines
//!
//! Carries typed, length-bounded logical messages between an engine running
//! on a cloud host and its peer agent over one reliable byte stream:
//!
//! - `protocol`: the 16-byte frame header, message types, sequencing and hashing
//! - `fragment`: splitting messages into frames and reassembling them
//! - `handshake`: the one-shot version check run before framing starts
//! - `session`: `NetComm`, the per-connection engine with its receive loop
//! - `heartbeat`: the optional liveness monitor plugged into a session
//! - `transport`: the raw connection primitive and its TCP implementation

pub mod config;
pub mod events;
pub mod fragment;
pub mod handshake;
pub mod heartbeat;
pub mod protocol;
pub mod session;
pub mod transport;

pub use config::Config;
pub use events::{EngineEvent, EventSink};
pub use handshake::{EngineType, VersionCheck};
pub use protocol::MessageType;
pub use session::{BreakReason, NetComm, SessionError};
