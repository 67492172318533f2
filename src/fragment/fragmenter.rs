//! Send-side fragmentation

use bytes::BytesMut;
use tracing::trace;

use super::{FragmentError, FragmentResult};
use crate::protocol::{
    build_frame, FragmentFlag, MessageType, FRAGMENT_SIZE, HEADER_SIZE, MAX_MSG_SIZE,
};
use crate::transport::FrameSink;

/// Splits logical messages of one registration into wire frames
#[derive(Debug, Clone, Copy)]
pub struct Fragmenter {
    capacity: usize,
    max_message_size: usize,
    single_frame: bool,
}

impl Default for Fragmenter {
    fn default() -> Self {
        Self::new(FRAGMENT_SIZE, MAX_MSG_SIZE)
    }
}

impl Fragmenter {
    /// Create a fragmenter with a per-frame payload capacity and a message bound
    pub fn new(capacity: usize, max_message_size: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            max_message_size,
            single_frame: false,
        }
    }

    /// Configure the fragmenter for a type that never fragments
    pub fn single_frame(mut self, single_frame: bool) -> Self {
        self.single_frame = single_frame;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of wire frames a payload of `len` bytes occupies
    pub fn frame_count(&self, len: usize) -> usize {
        if len <= self.capacity {
            1
        } else {
            (len + self.capacity - 1) / self.capacity
        }
    }

    /// Split `payload` into unstamped wire frames, in send order
    pub fn frames(&self, message_type: MessageType, payload: &[u8]) -> FragmentResult<Vec<BytesMut>> {
        self.check(payload.len())?;

        if payload.len() <= self.capacity {
            return Ok(vec![build_frame(message_type, FragmentFlag::Single, payload)]);
        }

        let chunks = payload.chunks(self.capacity);
        let last = chunks.len() - 1;
        let frames = chunks
            .enumerate()
            .map(|(i, chunk)| {
                let flag = match i {
                    0 => FragmentFlag::First,
                    i if i == last => FragmentFlag::End,
                    _ => FragmentFlag::Middle,
                };
                build_frame(message_type, flag, chunk)
            })
            .collect();
        Ok(frames)
    }

    /// Fragment `payload` and write every frame through `sink` back-to-back
    ///
    /// Returns the number of logical payload bytes handed to the sink.
    pub fn send(
        &self,
        message_type: MessageType,
        payload: &[u8],
        sink: &dyn FrameSink,
    ) -> FragmentResult<usize> {
        let mut frames = self.frames(message_type, payload)?;
        let count = frames.len();

        let written = sink.send_frames(&mut frames)?;
        let payload_bytes = written.saturating_sub(count * HEADER_SIZE);
        trace!(
            "Sent {} message: {} bytes in {} frame(s)",
            message_type,
            payload_bytes,
            count
        );
        Ok(payload_bytes)
    }

    fn check(&self, len: usize) -> FragmentResult<()> {
        if len == 0 {
            return Err(FragmentError::EmptyPayload);
        }
        if self.single_frame && len > self.capacity {
            return Err(FragmentError::ExceedsFrame {
                size: len,
                capacity: self.capacity,
            });
        }
        if len > self.max_message_size {
            return Err(FragmentError::MessageTooLarge {
                size: len,
                max: self.max_message_size,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameHeader;
    use crate::transport::{SocketError, SocketResult};
    use std::cell::RefCell;

    #[derive(Default)]
    struct CollectSink {
        frames: RefCell<Vec<Vec<u8>>>,
    }

    impl FrameSink for CollectSink {
        fn send_frames(&self, frames: &mut [BytesMut]) -> SocketResult<usize> {
            let mut total = 0;
            for frame in frames.iter() {
                total += frame.len();
                self.frames.borrow_mut().push(frame.to_vec());
            }
            Ok(total)
        }
    }

    struct BrokenSink;

    impl FrameSink for BrokenSink {
        fn send_frames(&self, _frames: &mut [BytesMut]) -> SocketResult<usize> {
            Err(SocketError::Disconnected)
        }
    }

    fn flags(frames: &[BytesMut]) -> Vec<FragmentFlag> {
        frames
            .iter()
            .map(|f| FrameHeader::decode(f).unwrap().flag)
            .collect()
    }

    #[test]
    fn test_exact_capacity_is_one_frame() {
        let fragmenter = Fragmenter::default();
        let frames = fragmenter
            .frames(MessageType::VideoRr, &vec![7u8; FRAGMENT_SIZE])
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(flags(&frames), vec![FragmentFlag::Single]);
        assert_eq!(frames[0].len(), HEADER_SIZE + FRAGMENT_SIZE);
    }

    #[test]
    fn test_capacity_plus_one_is_two_frames() {
        let fragmenter = Fragmenter::default();
        let frames = fragmenter
            .frames(MessageType::VideoRr, &vec![7u8; FRAGMENT_SIZE + 1])
            .unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(flags(&frames), vec![FragmentFlag::First, FragmentFlag::End]);
        assert_eq!(frames[0].len() - HEADER_SIZE, FRAGMENT_SIZE);
        assert_eq!(frames[1].len() - HEADER_SIZE, 1);
    }

    #[test]
    fn test_middle_fragments() {
        let fragmenter = Fragmenter::new(10, 1000);
        let frames = fragmenter.frames(MessageType::Gl, &[1u8; 35]).unwrap();
        assert_eq!(fragmenter.frame_count(35), 4);
        assert_eq!(
            flags(&frames),
            vec![
                FragmentFlag::First,
                FragmentFlag::Middle,
                FragmentFlag::Middle,
                FragmentFlag::End
            ]
        );
        assert_eq!(frames[3].len() - HEADER_SIZE, 5);
    }

    #[test]
    fn test_parameter_errors() {
        let fragmenter = Fragmenter::new(10, 100);
        assert!(matches!(
            fragmenter.frames(MessageType::Gl, &[]),
            Err(FragmentError::EmptyPayload)
        ));
        assert!(matches!(
            fragmenter.frames(MessageType::Gl, &[0u8; 101]),
            Err(FragmentError::MessageTooLarge { size: 101, max: 100 })
        ));
    }

    #[test]
    fn test_single_frame_rejects_oversize() {
        let fragmenter = Fragmenter::new(10, 100).single_frame(true);
        assert_eq!(fragmenter.frames(MessageType::Heartbeat, &[0u8; 10]).unwrap().len(), 1);
        assert!(matches!(
            fragmenter.frames(MessageType::Heartbeat, &[0u8; 11]),
            Err(FragmentError::ExceedsFrame { size: 11, capacity: 10 })
        ));
    }

    #[test]
    fn test_send_reports_logical_bytes() {
        let sink = CollectSink::default();
        let fragmenter = Fragmenter::new(100, 10_000);
        let sent = fragmenter
            .send(MessageType::Audio, &[3u8; 250], &sink)
            .unwrap();
        assert_eq!(sent, 250);
        assert_eq!(sink.frames.borrow().len(), 3);
    }

    #[test]
    fn test_send_propagates_socket_error() {
        let fragmenter = Fragmenter::default();
        assert!(matches!(
            fragmenter.send(MessageType::Audio, b"abc", &BrokenSink),
            Err(FragmentError::Socket(SocketError::Disconnected))
        ));
    }
}
