//! Receive-side reassembly

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use super::ReassemblyError;
use crate::protocol::{
    FragmentFlag, MessageType, WireFrame, FRAGMENT_SIZE, HEADER_SIZE, MAX_MSG_SIZE,
};

/// Accumulator for the in-flight logical message of one message type
#[derive(Debug)]
pub struct Reassembler {
    message_type: MessageType,
    capacity: usize,
    max_message_size: usize,
    single_frame: bool,
    buffer: BytesMut,
    fragments: usize,
    in_progress: bool,
}

impl Reassembler {
    pub fn new(message_type: MessageType) -> Self {
        Self::with_limits(message_type, FRAGMENT_SIZE, MAX_MSG_SIZE)
    }

    pub fn with_limits(message_type: MessageType, capacity: usize, max_message_size: usize) -> Self {
        Self {
            message_type,
            capacity,
            max_message_size,
            single_frame: false,
            buffer: BytesMut::new(),
            fragments: 0,
            in_progress: false,
        }
    }

    /// Mark this bucket as single-frame: every frame is a complete message
    pub fn single_frame(mut self, single_frame: bool) -> Self {
        self.single_frame = single_frame;
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Check if a partial message is buffered
    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    /// Bytes of the partial message received so far
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Feed one validated frame; returns the logical message once complete
    ///
    /// Size errors discard the partial message. Every error means the stream
    /// is desynchronized.
    pub fn reassemble(&mut self, frame: WireFrame) -> Result<Option<Bytes>, ReassemblyError> {
        if frame.message_type() != self.message_type {
            return Err(ReassemblyError::TypeMismatch {
                expected: self.message_type,
                received: frame.message_type(),
            });
        }

        let size = frame.payload_len();
        if size > self.capacity {
            self.clear();
            return Err(ReassemblyError::OverCapacity {
                size,
                capacity: self.capacity,
            });
        }

        let flag = frame.flag();
        if self.single_frame {
            if flag != FragmentFlag::Single {
                return Err(ReassemblyError::NotSingleFrame {
                    message_type: self.message_type,
                    flag,
                });
            }
            return Ok(Some(frame.payload()));
        }

        match flag {
            FragmentFlag::Single => {
                self.discard_stale();
                Ok(Some(frame.payload()))
            }
            FragmentFlag::First => {
                self.discard_stale();
                self.in_progress = true;
                self.append(&frame)?;
                Ok(None)
            }
            FragmentFlag::Middle | FragmentFlag::End => {
                if !self.in_progress {
                    return Err(ReassemblyError::Orphan {
                        message_type: self.message_type,
                        flag,
                    });
                }
                self.append(&frame)?;
                if flag == FragmentFlag::Middle {
                    return Ok(None);
                }

                let message = self.buffer.split().freeze();
                debug!(
                    "Reassembled {} message: {} bytes from {} fragments",
                    self.message_type,
                    message.len(),
                    self.fragments
                );
                self.clear();
                Ok(Some(message))
            }
        }
    }

    /// Drop any partial message
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.fragments = 0;
        self.in_progress = false;
    }

    fn append(&mut self, frame: &WireFrame) -> Result<(), ReassemblyError> {
        let size = self.buffer.len() + frame.payload_len();
        if size > self.max_message_size {
            self.clear();
            return Err(ReassemblyError::Overflow {
                message_type: self.message_type,
                size,
                max: self.max_message_size,
            });
        }
        self.buffer.extend_from_slice(&frame.as_bytes()[HEADER_SIZE..]);
        self.fragments += 1;
        Ok(())
    }

    fn discard_stale(&mut self) {
        if self.in_progress {
            warn!(
                "Discarding partial {} message ({} bytes, {} fragments)",
                self.message_type,
                self.buffer.len(),
                self.fragments
            );
            self.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::Fragmenter;
    use crate::protocol::build_frame;

    fn wire(frame: BytesMut) -> WireFrame {
        WireFrame::parse(frame.freeze()).unwrap()
    }

    fn roundtrip(fragmenter: &Fragmenter, reassembler: &mut Reassembler, payload: &[u8]) -> Bytes {
        let frames = fragmenter.frames(reassembler.message_type(), payload).unwrap();
        let count = frames.len();
        let mut result = None;
        for (i, frame) in frames.into_iter().enumerate() {
            let out = reassembler.reassemble(wire(frame)).unwrap();
            if i + 1 < count {
                assert!(out.is_none(), "message completed early at fragment {}", i);
            } else {
                result = out;
            }
        }
        result.expect("message was not completed")
    }

    #[test]
    fn test_roundtrip_across_sizes() {
        let fragmenter = Fragmenter::default();
        let mut reassembler = Reassembler::new(MessageType::VideoRr);

        let sizes = [
            1,
            100,
            FRAGMENT_SIZE - 1,
            FRAGMENT_SIZE,
            FRAGMENT_SIZE + 1,
            3 * FRAGMENT_SIZE,
            200_000,
        ];
        for size in sizes {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let out = roundtrip(&fragmenter, &mut reassembler, &payload);
            assert_eq!(&out[..], &payload[..], "size {}", size);
            assert!(!reassembler.in_progress());
        }
    }

    #[test]
    fn test_single_frame_bypasses_buffer() {
        let mut reassembler = Reassembler::new(MessageType::Heartbeat).single_frame(true);
        let frame = wire(build_frame(MessageType::Heartbeat, FragmentFlag::Single, &[9u8; 24]));
        let out = reassembler.reassemble(frame).unwrap().unwrap();
        assert_eq!(out.len(), 24);
        assert_eq!(reassembler.buffer.capacity(), 0);
    }

    #[test]
    fn test_single_frame_rejects_fragments() {
        let mut reassembler = Reassembler::new(MessageType::Heartbeat).single_frame(true);
        let frame = wire(build_frame(MessageType::Heartbeat, FragmentFlag::First, b"x"));
        assert!(matches!(
            reassembler.reassemble(frame),
            Err(ReassemblyError::NotSingleFrame { .. })
        ));
    }

    #[test]
    fn test_orphan_fragment() {
        let mut reassembler = Reassembler::new(MessageType::Gl);
        let frame = wire(build_frame(MessageType::Gl, FragmentFlag::End, b"tail"));
        assert_eq!(
            reassembler.reassemble(frame),
            Err(ReassemblyError::Orphan {
                message_type: MessageType::Gl,
                flag: FragmentFlag::End
            })
        );
    }

    #[test]
    fn test_overflow_discards_bucket() {
        let mut reassembler = Reassembler::with_limits(MessageType::Gl, 10, 25);
        let first = wire(build_frame(MessageType::Gl, FragmentFlag::First, &[0u8; 10]));
        let middle = wire(build_frame(MessageType::Gl, FragmentFlag::Middle, &[0u8; 10]));
        let end = wire(build_frame(MessageType::Gl, FragmentFlag::End, &[0u8; 10]));

        assert_eq!(reassembler.reassemble(first), Ok(None));
        assert_eq!(reassembler.reassemble(middle), Ok(None));
        assert!(matches!(
            reassembler.reassemble(end),
            Err(ReassemblyError::Overflow { size: 30, max: 25, .. })
        ));
        assert!(!reassembler.in_progress());
        assert_eq!(reassembler.buffered_len(), 0);
    }

    #[test]
    fn test_over_capacity_frame() {
        let mut reassembler = Reassembler::with_limits(MessageType::Gl, 4, 100);
        let frame = wire(build_frame(MessageType::Gl, FragmentFlag::Single, &[0u8; 5]));
        assert!(matches!(
            reassembler.reassemble(frame),
            Err(ReassemblyError::OverCapacity { size: 5, capacity: 4 })
        ));
    }

    #[test]
    fn test_type_mismatch() {
        let mut reassembler = Reassembler::new(MessageType::Gl);
        let frame = wire(build_frame(MessageType::Audio, FragmentFlag::Single, b"x"));
        assert!(matches!(
            reassembler.reassemble(frame),
            Err(ReassemblyError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_clear_drops_partial() {
        let mut reassembler = Reassembler::with_limits(MessageType::Gl, 4, 100);
        let first = wire(build_frame(MessageType::Gl, FragmentFlag::First, b"abcd"));
        reassembler.reassemble(first).unwrap();
        assert!(reassembler.in_progress());

        reassembler.clear();
        let end = wire(build_frame(MessageType::Gl, FragmentFlag::End, b"ef"));
        assert!(matches!(
            reassembler.reassemble(end),
            Err(ReassemblyError::Orphan { .. })
        ));
    }

    #[test]
    fn test_new_first_replaces_stale_partial() {
        let mut reassembler = Reassembler::with_limits(MessageType::Gl, 4, 100);
        reassembler
            .reassemble(wire(build_frame(MessageType::Gl, FragmentFlag::First, b"old!")))
            .unwrap();
        reassembler
            .reassemble(wire(build_frame(MessageType::Gl, FragmentFlag::First, b"new!")))
            .unwrap();
        let out = reassembler
            .reassemble(wire(build_frame(MessageType::Gl, FragmentFlag::End, b"ok")))
            .unwrap()
            .unwrap();
        assert_eq!(&out[..], b"new!ok");
    }
}
