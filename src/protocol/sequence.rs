//! Connection-wide sequencing and integrity checking
//!
//! One counter covers every frame on a connection, regardless of message
//! type, so a single comparison on the receive side detects any lost,
//! duplicated or reordered frame, including individual fragments.

use super::frame::{read_u32, FrameError, FrameResult, HASH_OFFSET, SEQUENCE_OFFSET};
use super::{murmur_hash2, HEADER_SIZE};

/// Compute the integrity hash of a complete frame, treating its hash field as zero
pub fn frame_hash(frame: &[u8]) -> u32 {
    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(&frame[..HEADER_SIZE]);
    header[HASH_OFFSET..HEADER_SIZE].fill(0);

    let mut scratch = Vec::with_capacity(frame.len());
    scratch.extend_from_slice(&header);
    scratch.extend_from_slice(&frame[HEADER_SIZE..]);
    murmur_hash2(&scratch)
}

/// Send-side stamping of outgoing frames
#[derive(Debug, Default)]
pub struct SendSequencer {
    sequence: u32,
}

impl SendSequencer {
    pub fn new() -> Self {
        Self { sequence: 0 }
    }

    /// Stamp the next sequence number (and the hash, if enabled) into `frame`
    ///
    /// `frame` must hold a complete header followed by its payload.
    pub fn stamp(&mut self, frame: &mut [u8], integrity: bool) -> u32 {
        self.sequence = self.sequence.wrapping_add(1);
        frame[SEQUENCE_OFFSET..SEQUENCE_OFFSET + 4].copy_from_slice(&self.sequence.to_le_bytes());
        frame[HASH_OFFSET..HEADER_SIZE].fill(0);
        if integrity {
            let hash = frame_hash(frame);
            frame[HASH_OFFSET..HEADER_SIZE].copy_from_slice(&hash.to_le_bytes());
        }
        self.sequence
    }
}

/// Receive-side order and integrity verification
#[derive(Debug)]
pub struct FrameValidator {
    last_accepted: u32,
    verify_hash: bool,
}

impl FrameValidator {
    pub fn new(verify_hash: bool) -> Self {
        Self {
            last_accepted: 0,
            verify_hash,
        }
    }

    /// Sequence number of the last accepted frame
    pub fn last_accepted(&self) -> u32 {
        self.last_accepted
    }

    /// Forget the accepted history; the next frame must carry sequence 1
    pub fn reset(&mut self) {
        self.last_accepted = 0;
    }

    /// Check a complete frame: hash first, then `sequence == last + 1`
    ///
    /// On success the frame's sequence number becomes the last accepted one.
    /// On failure nothing changes and the stream must be abandoned.
    pub fn validate(&mut self, frame: &[u8]) -> FrameResult<u32> {
        if frame.len() < HEADER_SIZE {
            return Err(FrameError::TooShort(frame.len()));
        }

        if self.verify_hash {
            let received = read_u32(frame, HASH_OFFSET);
            let computed = frame_hash(frame);
            if received != computed {
                return Err(FrameError::HashMismatch { received, computed });
            }
        }

        let received = read_u32(frame, SEQUENCE_OFFSET);
        let expected = self.last_accepted.wrapping_add(1);
        if received != expected {
            return Err(FrameError::OutOfSequence { expected, received });
        }

        self.last_accepted = received;
        Ok(received)
    }
}
