//! Frame header encoding/decoding
//!
//! Handles the fixed 16-byte data frame header and the validated frame
//! handed from the receive loop to dispatch.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{FragmentFlag, MessageType, FRAME_MAGIC, HEADER_SIZE};

/// Byte offset of the sequence number field
pub const SEQUENCE_OFFSET: usize = 8;

/// Byte offset of the integrity hash field
pub const HASH_OFFSET: usize = 12;

/// Frame errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too short: {0} bytes (header is 16)")]
    TooShort(usize),

    #[error("Invalid magic word: {0:#06x}")]
    InvalidMagic(u16),

    #[error("Unknown message type: {0}")]
    UnknownType(u8),

    #[error("Invalid fragment flag: {0:#04x}")]
    InvalidFlag(u8),

    #[error("Empty payload")]
    EmptyPayload,

    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Frame length mismatch: header declares {declared} bytes, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Integrity hash mismatch: frame carries {received:#010x}, computed {computed:#010x}")]
    HashMismatch { received: u32, computed: u32 },

    #[error("Sequence error: expected {expected}, got {received}")]
    OutOfSequence { expected: u32, received: u32 },
}

pub type FrameResult<T> = Result<T, FrameError>;

/// Decoded data frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Position of this frame in its logical message
    pub flag: FragmentFlag,
    /// Routing key
    pub message_type: MessageType,
    /// Number of payload bytes following the header
    pub payload_length: u32,
    /// Connection-wide sequence number
    pub sequence: u32,
    /// Integrity hash (0 when the feature is disabled)
    pub hash: u32,
}

impl FrameHeader {
    /// Create a header; sequence and hash are stamped by the socket on send
    pub fn new(message_type: MessageType, flag: FragmentFlag, payload_length: u32) -> Self {
        Self {
            flag,
            message_type,
            payload_length,
            sequence: 0,
            hash: 0,
        }
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u16_le(FRAME_MAGIC);
        dst.put_u8(self.flag.as_u8());
        dst.put_u8(self.message_type.as_u8());
        dst.put_u32_le(self.payload_length);
        dst.put_u32_le(self.sequence);
        dst.put_u32_le(self.hash);
    }

    /// Decode and validate a header from the start of `src`
    ///
    /// The magic word and type are checked before the payload length is
    /// trusted; a zero payload length is rejected.
    pub fn decode(src: &[u8]) -> FrameResult<Self> {
        if src.len() < HEADER_SIZE {
            return Err(FrameError::TooShort(src.len()));
        }

        let magic = u16::from_le_bytes([src[0], src[1]]);
        if magic != FRAME_MAGIC {
            return Err(FrameError::InvalidMagic(magic));
        }

        let message_type = MessageType::from_u8(src[3]).ok_or(FrameError::UnknownType(src[3]))?;
        if src[2] & !FragmentFlag::MASK != 0 {
            return Err(FrameError::InvalidFlag(src[2]));
        }
        let flag = FragmentFlag::from_bits(src[2] & FragmentFlag::MASK)
            .ok_or(FrameError::InvalidFlag(src[2]))?;

        let payload_length = read_u32(src, 4);
        if payload_length == 0 {
            return Err(FrameError::EmptyPayload);
        }

        Ok(Self {
            flag,
            message_type,
            payload_length,
            sequence: read_u32(src, SEQUENCE_OFFSET),
            hash: read_u32(src, HASH_OFFSET),
        })
    }
}

/// Validate the header at the start of `src` and return its payload length
pub fn payload_length(src: &[u8]) -> FrameResult<usize> {
    FrameHeader::decode(src).map(|header| header.payload_length as usize)
}

pub(crate) fn read_u32(src: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([src[offset], src[offset + 1], src[offset + 2], src[offset + 3]])
}

/// A complete wire frame: decoded header plus the raw header+payload bytes
#[derive(Debug, Clone)]
pub struct WireFrame {
    header: FrameHeader,
    bytes: Bytes,
}

impl WireFrame {
    /// Wrap raw frame bytes, checking the header and the declared length
    pub fn parse(bytes: Bytes) -> FrameResult<Self> {
        let header = FrameHeader::decode(&bytes)?;
        let declared = HEADER_SIZE + header.payload_length as usize;
        if declared != bytes.len() {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: bytes.len(),
            });
        }
        Ok(Self { header, bytes })
    }

    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    pub fn flag(&self) -> FragmentFlag {
        self.header.flag
    }

    /// Payload bytes, sharing the frame's allocation
    pub fn payload(&self) -> Bytes {
        self.bytes.slice(HEADER_SIZE..)
    }

    pub fn payload_len(&self) -> usize {
        self.bytes.len() - HEADER_SIZE
    }

    /// Full header+payload bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Build an unstamped frame from a header and its payload
pub fn build_frame(message_type: MessageType, flag: FragmentFlag, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    FrameHeader::new(message_type, flag, payload.len() as u32).encode(&mut buf);
    buf.extend_from_slice(payload);
    buf
}
