//! Wire format encoding and decoding.
//!
//! Implements the 8-byte header format:
//! ```text
//! ┌─────────┬─────────┬───────────┬───────────┐
//! │ Version │ Command │ Length    │ Stream ID │
//! │ 1 byte  │ 1 byte  │ 2 bytes   │ 4 bytes   │
//! │         │         │ uint16 LE │ uint32 LE │
//! └─────────┴─────────┴───────────┴───────────┘
//! ```
//!
//! All multi-byte integers are Little Endian.

use crate::error::{KeymuxError, Result};

/// Header size in bytes (fixed, exactly 8).
pub const HEADER_SIZE: usize = 8;

/// Protocol version byte. A mismatch is a hard protocol error.
pub const VERSION: u8 = 1;

/// Maximum payload length representable by the 16-bit length field.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Protocol commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Open stream `stream_id`; empty payload.
    Syn = 0,
    /// Data for `stream_id`; payload is the (possibly encrypted) bytes.
    Psh = 1,
    /// Abort stream `stream_id`; empty payload.
    Rst = 2,
    /// Keepalive ping; `stream_id = 0`, empty payload.
    Nop = 3,
    /// Key-exchange request (client to server); payload is a sealed secret.
    Kxr = 4,
    /// Key-exchange acknowledgement; payload echoes the sealed secret.
    Kxs = 5,
}

impl Command {
    /// Decode a command byte. Unknown bytes are a protocol error.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Command::Syn),
            1 => Ok(Command::Psh),
            2 => Ok(Command::Rst),
            3 => Ok(Command::Nop),
            4 => Ok(Command::Kxr),
            5 => Ok(Command::Kxs),
            _ => Err(KeymuxError::InvalidProtocol),
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version (always [`VERSION`] for accepted frames).
    pub version: u8,
    /// Frame command.
    pub cmd: Command,
    /// Payload length in bytes.
    pub length: u16,
    /// Stream identifier (0 for session-scoped frames).
    pub stream_id: u32,
}

impl Header {
    /// Create a header for an outbound frame.
    pub fn new(cmd: Command, stream_id: u32, length: u16) -> Self {
        Self {
            version: VERSION,
            cmd,
            length,
            stream_id,
        }
    }

    /// Encode the header to its 8-byte wire form.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.version;
        buf[1] = self.cmd as u8;
        buf[2..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.stream_id.to_le_bytes());
        buf
    }

    /// Decode a header from 8 wire bytes.
    ///
    /// Rejects version mismatches and unknown commands with
    /// [`KeymuxError::InvalidProtocol`].
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        if buf[0] != VERSION {
            return Err(KeymuxError::InvalidProtocol);
        }
        Ok(Self {
            version: buf[0],
            cmd: Command::from_byte(buf[1])?,
            length: u16::from_le_bytes([buf[2], buf[3]]),
            stream_id: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = Header::new(Command::Psh, 42, 100);
        let encoded = original.encode();
        let decoded = Header::decode(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_little_endian_byte_order() {
        let header = Header::new(Command::Psh, 0x0403_0201, 0x0201);
        let bytes = header.encode();

        assert_eq!(bytes[0], VERSION);
        assert_eq!(bytes[1], Command::Psh as u8);

        // Length: 0x0201 in LE
        assert_eq!(bytes[2], 0x01);
        assert_eq!(bytes[3], 0x02);

        // Stream ID: 0x04030201 in LE
        assert_eq!(bytes[4], 0x01);
        assert_eq!(bytes[5], 0x02);
        assert_eq!(bytes[6], 0x03);
        assert_eq!(bytes[7], 0x04);
    }

    #[test]
    fn test_header_size_is_exactly_8() {
        assert_eq!(HEADER_SIZE, 8);
        assert_eq!(Header::new(Command::Nop, 0, 0).encode().len(), 8);
    }

    #[test]
    fn test_decode_rejects_wrong_version() {
        let mut bytes = Header::new(Command::Nop, 0, 0).encode();
        bytes[0] = VERSION.wrapping_add(1);
        assert!(matches!(
            Header::decode(&bytes),
            Err(KeymuxError::InvalidProtocol)
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_command() {
        let mut bytes = Header::new(Command::Nop, 0, 0).encode();
        bytes[1] = 0xFF;
        assert!(matches!(
            Header::decode(&bytes),
            Err(KeymuxError::InvalidProtocol)
        ));
    }

    #[test]
    fn test_command_byte_assignment_is_stable() {
        // Peer implementations depend on these exact values.
        assert_eq!(Command::Syn as u8, 0);
        assert_eq!(Command::Psh as u8, 1);
        assert_eq!(Command::Rst as u8, 2);
        assert_eq!(Command::Nop as u8, 3);
        assert_eq!(Command::Kxr as u8, 4);
        assert_eq!(Command::Kxs as u8, 5);
    }

    #[test]
    fn test_command_roundtrip() {
        for cmd in [
            Command::Syn,
            Command::Psh,
            Command::Rst,
            Command::Nop,
            Command::Kxr,
            Command::Kxs,
        ] {
            assert_eq!(Command::from_byte(cmd as u8).unwrap(), cmd);
        }
    }
}
