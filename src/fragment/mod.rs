//! Fragmentation module - Splits logical messages into wire frames and back
//!
//! Provides:
//! - `Fragmenter` for the send side (one per message type)
//! - `Reassembler` for the receive side (one bucket per message type)

mod fragmenter;
mod reassembler;

pub use fragmenter::*;
pub use reassembler::*;

use thiserror::Error;

use crate::protocol::{FragmentFlag, MessageType};
use crate::transport::SocketError;

/// Send-side errors
#[derive(Error, Debug)]
pub enum FragmentError {
    #[error("Empty payload")]
    EmptyPayload,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Single-frame message too large: {size} bytes (frame capacity: {capacity})")]
    ExceedsFrame { size: usize, capacity: usize },

    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),
}

pub type FragmentResult<T> = Result<T, FragmentError>;

/// Receive-side errors; every variant means the stream is desynchronized
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("Frame of type {received} fed to the {expected} bucket")]
    TypeMismatch {
        expected: MessageType,
        received: MessageType,
    },

    #[error("{flag:?} fragment received for single-frame type {message_type}")]
    NotSingleFrame {
        message_type: MessageType,
        flag: FragmentFlag,
    },

    #[error("Fragment payload {size} bytes exceeds frame capacity {capacity}")]
    OverCapacity { size: usize, capacity: usize },

    #[error("{flag:?} fragment for {message_type} without a preceding First")]
    Orphan {
        message_type: MessageType,
        flag: FragmentFlag,
    },

    #[error("Reassembled {message_type} message would reach {size} bytes (max: {max})")]
    Overflow {
        message_type: MessageType,
        size: usize,
        max: usize,
    },
}
