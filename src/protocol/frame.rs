//! Frame struct with typed accessors.
//!
//! Represents a complete protocol frame with header and payload.
//! Uses `bytes::Bytes` for zero-copy payload sharing between the receive
//! pump and stream buffers.

use bytes::Bytes;

use super::wire_format::{Command, Header, HEADER_SIZE};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame command.
    pub cmd: Command,
    /// Stream identifier (0 for session-scoped frames).
    pub stream_id: u32,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame with an empty payload (SYN, RST, NOP).
    pub fn empty(cmd: Command, stream_id: u32) -> Self {
        Self {
            cmd,
            stream_id,
            payload: Bytes::new(),
        }
    }

    /// Create a frame carrying a payload (PSH, KXR, KXS).
    pub fn with_payload(cmd: Command, stream_id: u32, payload: Bytes) -> Self {
        debug_assert!(payload.len() <= super::MAX_PAYLOAD_SIZE);
        Self {
            cmd,
            stream_id,
            payload,
        }
    }

    /// Encode this frame's header.
    pub fn header(&self) -> Header {
        Header::new(self.cmd, self.stream_id, self.payload.len() as u16)
    }

    /// Total wire size of this frame (header + payload).
    #[inline]
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}
