//! Per-frame stream cipher.
//!
//! PSH payloads are XORed against an AES-256-OFB keystream. OFB is additive,
//! so encrypt and decrypt are the same operation; correctness depends on both
//! endpoints advancing the keystream over the same payload bytes in the same
//! order. Each direction therefore gets its own [`CipherState`], keyed from
//! the same 32-byte session key with a zero IV: the outbound instance advances
//! with every PSH admitted to the send channel, the inbound instance with
//! every PSH the receive pump decrypts. The key is unique per session, which
//! is what makes the zero IV sound.

use aes::Aes256;
use ofb::cipher::{KeyIvInit, StreamCipher};
use ofb::Ofb;

use crate::error::{KeymuxError, Result};

use super::handshake::SESSION_KEY_SIZE;

type Aes256Ofb = Ofb<Aes256>;

/// One direction of the session keystream.
pub struct FrameCipher {
    inner: Aes256Ofb,
}

impl FrameCipher {
    /// Initialize a keystream from a session key. IV is all zeros.
    pub fn new(key: &[u8; SESSION_KEY_SIZE]) -> Self {
        let iv = [0u8; 16];
        Self {
            inner: Aes256Ofb::new(key.into(), (&iv).into()),
        }
    }

    /// XOR `buf` in place against the next `buf.len()` keystream bytes.
    pub fn apply(&mut self, buf: &mut [u8]) {
        self.inner.apply_keystream(buf);
    }
}

impl std::fmt::Debug for FrameCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FrameCipher")
    }
}

/// Lifecycle of one direction's cipher.
///
/// The state is monotonic: `Pending` becomes `Installed` exactly once and
/// never reverts. Plaintext sessions stay `NotRequired` for their lifetime.
#[derive(Debug)]
pub enum CipherState {
    /// Session runs in plaintext; applying the cipher is a protocol error.
    NotRequired,
    /// Encryption enabled, key not yet negotiated.
    Pending,
    /// Key installed, keystream live.
    Installed(FrameCipher),
}

impl CipherState {
    /// Install the session key. Only `Pending` transitions; an already
    /// installed cipher is left untouched.
    pub fn install(&mut self, key: &[u8; SESSION_KEY_SIZE]) {
        if matches!(self, CipherState::Pending) {
            *self = CipherState::Installed(FrameCipher::new(key));
        }
    }

    /// Apply the keystream to `buf` in place.
    ///
    /// Fails with [`KeymuxError::NoEncryptionKey`] unless a key is installed.
    pub fn apply(&mut self, buf: &mut [u8]) -> Result<()> {
        match self {
            CipherState::Installed(cipher) => {
                cipher.apply(buf);
                Ok(())
            }
            _ => Err(KeymuxError::NoEncryptionKey),
        }
    }

    /// Whether a key has been installed.
    pub fn is_installed(&self) -> bool {
        matches!(self, CipherState::Installed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x42; 32];

    #[test]
    fn test_encrypt_decrypt_with_independent_instances() {
        let mut tx = FrameCipher::new(&KEY);
        let mut rx = FrameCipher::new(&KEY);

        let mut data = *b"the quick brown fox";
        tx.apply(&mut data);
        assert_ne!(&data, b"the quick brown fox");

        rx.apply(&mut data);
        assert_eq!(&data, b"the quick brown fox");
    }

    #[test]
    fn test_keystream_continuity_across_frames() {
        let mut tx = FrameCipher::new(&KEY);
        let mut rx = FrameCipher::new(&KEY);

        // Uneven fragment sizes must not desynchronize the directions as long
        // as the byte order matches.
        let frames: [&[u8]; 3] = [b"alpha", b"bravo-charlie", b"d"];
        for frame in frames {
            let mut buf = frame.to_vec();
            tx.apply(&mut buf);
            rx.apply(&mut buf);
            assert_eq!(buf, frame);
        }
    }

    #[test]
    fn test_different_keys_do_not_interoperate() {
        let mut tx = FrameCipher::new(&KEY);
        let mut rx = FrameCipher::new(&[0x43; 32]);

        let mut data = *b"payload";
        tx.apply(&mut data);
        rx.apply(&mut data);
        assert_ne!(&data, b"payload");
    }

    #[test]
    fn test_pending_state_refuses_traffic() {
        let mut state = CipherState::Pending;
        let mut buf = [0u8; 4];
        assert!(matches!(
            state.apply(&mut buf),
            Err(KeymuxError::NoEncryptionKey)
        ));
    }

    #[test]
    fn test_install_is_monotonic() {
        let mut state = CipherState::Pending;
        state.install(&KEY);
        assert!(state.is_installed());

        // A second install with a different key must not reset the keystream.
        let mut probe = [0u8; 8];
        state.apply(&mut probe).unwrap();
        state.install(&[0x43; 32]);

        let mut reference = FrameCipher::new(&KEY);
        let mut expected = [0u8; 16];
        reference.apply(&mut expected);

        let mut second = [0u8; 8];
        state.apply(&mut second).unwrap();
        assert_eq!(&second, &expected[8..16]);
    }

    #[test]
    fn test_not_required_refuses_traffic() {
        let mut state = CipherState::NotRequired;
        let mut buf = [0u8; 4];
        assert!(state.apply(&mut buf).is_err());
        state.install(&KEY);
        assert!(!state.is_installed());
    }
}
