//! Per-session configuration.
//!
//! A [`Config`] is handed to [`Session::client`](crate::Session::client) or
//! [`Session::server`](crate::Session::server). Encryption is enabled by
//! supplying the role-appropriate key: clients set `server_public_key`,
//! servers set `server_private_key`. With neither set, the session runs in
//! plaintext.

use std::time::Duration;

use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{KeymuxError, Result};
use crate::protocol::MAX_PAYLOAD_SIZE;

/// Default maximum PSH payload per frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4096;

/// Default session-wide receive buffer budget (4 MiB).
pub const DEFAULT_MAX_RECEIVE_BUFFER: usize = 4 * 1024 * 1024;

/// Default backlog of remotely-initiated streams awaiting accept.
pub const DEFAULT_ACCEPT_BACKLOG: usize = 1024;

/// Session configuration.
///
/// # Example
///
/// ```
/// use keymux::Config;
///
/// let config = Config::default();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone)]
pub struct Config {
    /// Maximum PSH payload per frame. Must be in `1..=65535`.
    pub max_frame_size: usize,
    /// Initial token-bucket size in bytes (shared across all streams).
    pub max_receive_buffer: usize,
    /// Interval between keepalive NOP frames.
    pub keep_alive_interval: Duration,
    /// Close the session if no frame arrives for this long.
    pub keep_alive_timeout: Duration,
    /// How long `open_stream`/`accept_stream` wait for the key handshake,
    /// measured from session creation.
    pub key_handshake_timeout: Duration,
    /// Capacity of the accept queue.
    pub accept_backlog: usize,
    /// Server's long-term public key. Set on clients to enable encryption.
    pub server_public_key: Option<PublicKey>,
    /// Server's long-term private key. Set on servers to enable encryption.
    pub server_private_key: Option<StaticSecret>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_receive_buffer: DEFAULT_MAX_RECEIVE_BUFFER,
            keep_alive_interval: Duration::from_secs(10),
            keep_alive_timeout: Duration::from_secs(30),
            key_handshake_timeout: Duration::from_secs(10),
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
            server_public_key: None,
            server_private_key: None,
        }
    }
}

impl Config {
    /// Check the configuration for values the protocol cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size == 0 || self.max_frame_size > MAX_PAYLOAD_SIZE {
            return Err(KeymuxError::Config(format!(
                "max_frame_size must be in 1..={}, got {}",
                MAX_PAYLOAD_SIZE, self.max_frame_size
            )));
        }
        if self.max_receive_buffer == 0 {
            return Err(KeymuxError::Config(
                "max_receive_buffer must be non-zero".to_string(),
            ));
        }
        if self.max_receive_buffer > i32::MAX as usize {
            return Err(KeymuxError::Config(
                "max_receive_buffer must fit a signed 32-bit counter".to_string(),
            ));
        }
        if self.accept_backlog == 0 {
            return Err(KeymuxError::Config(
                "accept_backlog must be non-zero".to_string(),
            ));
        }
        if self.keep_alive_interval.is_zero() || self.keep_alive_timeout.is_zero() {
            return Err(KeymuxError::Config(
                "keepalive intervals must be non-zero".to_string(),
            ));
        }
        if self.keep_alive_interval >= self.keep_alive_timeout {
            return Err(KeymuxError::Config(
                "keep_alive_interval must be shorter than keep_alive_timeout".to_string(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("Config")
            .field("max_frame_size", &self.max_frame_size)
            .field("max_receive_buffer", &self.max_receive_buffer)
            .field("keep_alive_interval", &self.keep_alive_interval)
            .field("keep_alive_timeout", &self.keep_alive_timeout)
            .field("key_handshake_timeout", &self.key_handshake_timeout)
            .field("accept_backlog", &self.accept_backlog)
            .field("server_public_key", &self.server_public_key.is_some())
            .field("server_private_key", &self.server_private_key.is_some())
            .finish()
    }
}
