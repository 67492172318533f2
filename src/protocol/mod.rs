//! Protocol module - Defines the wire protocol for EngineLink communication
//!
//! Every wire frame starts with a fixed 16-byte header (little-endian):
//! - 2 bytes magic word (`0x5A5A`)
//! - 1 byte flag (fragment position in the low 2 bits)
//! - 1 byte message type
//! - 4 bytes payload length
//! - 4 bytes connection-wide sequence number
//! - 4 bytes MurmurHash2 of the whole frame (hash field zeroed)
//! - Variable length payload

mod frame;
mod hash;
mod message;
mod sequence;

pub use frame::*;
pub use hash::murmur_hash2;
pub use message::*;
pub use sequence::*;

/// Default port for EngineLink communication
pub const DEFAULT_PORT: u16 = 24900;

/// Magic word opening every data frame header
pub const FRAME_MAGIC: u16 = 0x5A5A;

/// Size of the data frame header in bytes
pub const HEADER_SIZE: usize = 16;

/// Maximum size of one wire frame, header included
pub const FRAGMENT_SIZE_FULL: usize = 1420;

/// Payload capacity of one wire frame
pub const FRAGMENT_SIZE: usize = FRAGMENT_SIZE_FULL - HEADER_SIZE;

/// Maximum size of one logical message (32 MB)
pub const MAX_MSG_SIZE: usize = 32 * 1024 * 1024;
