//! Binary protocol implementation.
//!
//! The smallest on-wire unit is a [`Frame`]: an 8-byte header followed by an
//! optional payload. See [`wire_format`] for the exact byte layout.

mod frame;
pub mod wire_format;

pub use frame::Frame;
pub use wire_format::{Command, Header, HEADER_SIZE, MAX_PAYLOAD_SIZE, VERSION};
