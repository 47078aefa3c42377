//! Error types for keymux.

use thiserror::Error;

/// Main error type for all session and stream operations.
#[derive(Debug, Error)]
pub enum KeymuxError {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The session is already dead, or the operation targets a closed stream.
    #[error("broken pipe")]
    BrokenPipe,

    /// The key handshake did not complete within `key_handshake_timeout`.
    #[error("encryption not ready yet")]
    EncryptionNotReady,

    /// A PSH frame needed the cipher before any key was installed.
    #[error("no encryption key")]
    NoEncryptionKey,

    /// The sealed secret was malformed or used an invalid public key.
    #[error("malformed key exchange")]
    BadKeyExchange,

    /// Authentication of the sealed secret failed.
    #[error("cannot decrypt the message")]
    BadKey,

    /// Version mismatch or unknown command byte.
    #[error("invalid protocol version")]
    InvalidProtocol,

    /// The peer aborted the stream with RST.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// A read, write, or accept deadline expired.
    #[error("timeout")]
    Timeout,

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Config(String),
}

/// Result type alias using KeymuxError.
pub type Result<T> = std::result::Result<T, KeymuxError>;
