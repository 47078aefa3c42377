//! Crypto subsystem: key agreement, sealed session secret, frame cipher.
//!
//! The session consumes this module through a small surface: generate an
//! ephemeral keypair, run one ECDH against the peer's long-term public key,
//! expand the session and seal keys from that shared secret, seal/open the
//! secret carried by KXR/KXS frames, and drive the per-direction
//! [`CipherState`] over PSH payloads.

mod cipher;
mod handshake;

pub use cipher::{CipherState, FrameCipher};
pub use handshake::{
    derive_seal_key, derive_session_key, derive_shared_secret, generate_keypair,
    open_sealed_secret, seal_secret, SealKey, SessionKey, PUBLIC_KEY_SIZE, SEALED_SECRET_SIZE,
    SESSION_KEY_SIZE,
};
