//! Message type definitions
//!
//! Defines the closed message-type space shared by both engine endpoints and
//! the fragment position flag carried in every frame header.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Routing key of a logical message
///
/// Raw value `0` is the reserved invalid sentinel and [`MessageType::END`] the
/// exclusive upper bound; neither is a constructible variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Heartbeat = 1,
    Gl = 2,
    Audio = 3,
    TouchInput = 4,
    NavbarInput = 5,
    /// Video stream for remote render (from the agent)
    VideoRr = 6,
    Sensor = 7,
    Mic = 8,
    /// Video stream for remote render (to the video agent)
    VideoRr2 = 16,
}

impl MessageType {
    /// Raw value of the invalid sentinel
    pub const INVALID: u8 = 0;

    /// Raw value of the end sentinel
    pub const END: u8 = 17;

    /// Number of slots needed for a table indexed by raw type value
    pub const COUNT: usize = Self::END as usize;

    /// Every valid message type, in raw value order
    pub const ALL: [MessageType; 9] = [
        MessageType::Heartbeat,
        MessageType::Gl,
        MessageType::Audio,
        MessageType::TouchInput,
        MessageType::NavbarInput,
        MessageType::VideoRr,
        MessageType::Sensor,
        MessageType::Mic,
        MessageType::VideoRr2,
    ];

    /// Get the wire value
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Table slot for this type
    pub fn index(self) -> usize {
        self as usize
    }

    /// Parse a wire value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageType::Heartbeat),
            2 => Some(MessageType::Gl),
            3 => Some(MessageType::Audio),
            4 => Some(MessageType::TouchInput),
            5 => Some(MessageType::NavbarInput),
            6 => Some(MessageType::VideoRr),
            7 => Some(MessageType::Sensor),
            8 => Some(MessageType::Mic),
            16 => Some(MessageType::VideoRr2),
            _ => None,
        }
    }

    /// Short lowercase name used in logs and on the command line
    pub fn name(self) -> &'static str {
        match self {
            MessageType::Heartbeat => "heartbeat",
            MessageType::Gl => "gl",
            MessageType::Audio => "audio",
            MessageType::TouchInput => "touch-input",
            MessageType::NavbarInput => "navbar-input",
            MessageType::VideoRr => "video-rr",
            MessageType::Sensor => "sensor",
            MessageType::Mic => "mic",
            MessageType::VideoRr2 => "video-rr2",
        }
    }

    /// Check if this type carries application traffic
    pub fn is_application(self) -> bool {
        self != MessageType::Heartbeat
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.as_u8())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .iter()
            .copied()
            .find(|ty| ty.name() == s)
            .ok_or_else(|| format!("unknown message type: {}", s))
    }
}

/// Position of a wire frame within its logical message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FragmentFlag {
    /// Complete message, no fragmentation
    Single = 0,
    First = 1,
    Middle = 2,
    End = 3,
}

impl FragmentFlag {
    /// Bits of the header flag byte that hold the fragment position
    pub const MASK: u8 = 0x03;

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(FragmentFlag::Single),
            1 => Some(FragmentFlag::First),
            2 => Some(FragmentFlag::Middle),
            3 => Some(FragmentFlag::End),
            _ => None,
        }
    }
}
