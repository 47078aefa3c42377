//! # keymux
//!
//! Stream multiplexer with transparent authenticated transport encryption.
//!
//! keymux takes a single reliable, ordered, bidirectional byte stream (a TCP
//! connection, a Unix socket, an in-memory duplex) and turns it into many
//! independently flow-controlled logical streams. When a server keypair is
//! configured, the two endpoints negotiate a session key over a two-frame
//! handshake and every data frame on the link is encrypted.
//!
//! ## Architecture
//!
//! - **Frame codec** ([`protocol`]): fixed 8-byte header + payload.
//! - **Crypto**: X25519 key agreement, a sealed session secret, and
//!   per-direction AES-OFB frame ciphers.
//! - **Session** ([`Session`]): owns the transport, demultiplexes inbound
//!   frames, serializes outbound frames through a dedicated sender task,
//!   enforces the shared receive budget, and keeps the link alive with NOPs.
//! - **Stream** ([`Stream`]): per-stream read buffer, fragmentation on write,
//!   RST handling, deadlines.
//!
//! ## Example
//!
//! ```no_run
//! use keymux::{Config, Session};
//!
//! #[tokio::main]
//! async fn main() -> keymux::Result<()> {
//!     let tcp = tokio::net::TcpStream::connect("127.0.0.1:4000").await?;
//!     let session = Session::client(tcp, Config::default())?;
//!
//!     let stream = session.open_stream().await?;
//!     stream.write(b"hello").await?;
//!
//!     let mut buf = [0u8; 64];
//!     let n = stream.read(&mut buf).await?;
//!     println!("peer answered {} bytes", n);
//!
//!     stream.close().await?;
//!     session.close()?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod protocol;

mod bucket;
mod crypto;
mod session;
mod stream;
mod writer;

pub use config::Config;
pub use error::{KeymuxError, Result};
pub use session::Session;
pub use stream::Stream;

// Re-exported so callers can build configs without naming the dalek crate.
pub use x25519_dalek::{PublicKey, StaticSecret};
