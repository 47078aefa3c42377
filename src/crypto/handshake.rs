//! Ephemeral key agreement and the sealed session secret.
//!
//! The client generates an ephemeral X25519 keypair and performs a single
//! ECDH against the server's long-term public key. Both working keys come
//! out of that one shared secret: the session key feeding the frame ciphers
//! and the seal key protecting the key exchange itself. The KXR frame then
//! carries a sealed secret: the ephemeral public key followed by the session
//! key under ChaCha20-Poly1305. Only the holder of the server's private key
//! can recompute the shared secret, so opening the seal both recovers the
//! session key and authenticates the exchange.
//!
//! Wire layout of the sealed secret (80 bytes):
//! ```text
//! ┌──────────────────────┬──────────────────────────────────┐
//! │ ephemeral public key │ ciphertext(session key) || tag   │
//! │ 32 bytes             │ 32 + 16 bytes                    │
//! └──────────────────────┴──────────────────────────────────┘
//! ```

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::Zeroizing;

use crate::error::{KeymuxError, Result};

/// Size of the session key installed into the frame ciphers.
pub const SESSION_KEY_SIZE: usize = 32;

/// Size of an X25519 public key on the wire.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Poly1305 authentication tag size.
const TAG_SIZE: usize = 16;

/// Total size of a sealed secret.
pub const SEALED_SECRET_SIZE: usize = PUBLIC_KEY_SIZE + SESSION_KEY_SIZE + TAG_SIZE;

/// A 32-byte session key, cleared from memory on drop.
pub type SessionKey = Zeroizing<[u8; SESSION_KEY_SIZE]>;

/// The key sealing the session key inside KXR/KXS, cleared on drop.
pub type SealKey = Zeroizing<[u8; 32]>;

const SESSION_KEY_INFO: &[u8] = b"keymux v1 session key";
const SEAL_KEY_INFO: &[u8] = b"keymux v1 seal key";

/// Generate an ephemeral X25519 keypair.
pub fn generate_keypair() -> (StaticSecret, PublicKey) {
    let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let public = PublicKey::from(&secret);
    (secret, public)
}

/// Perform the ECDH between our private key and the peer's public key.
///
/// This is the single scalar multiplication of a handshake; both working
/// keys are expanded from its output. Rejects low-order peer points
/// (all-zero shared secret) with [`KeymuxError::BadKeyExchange`].
pub fn derive_shared_secret(secret: &StaticSecret, peer: &PublicKey) -> Result<SharedSecret> {
    let shared = secret.diffie_hellman(peer);
    if shared.as_bytes() == &[0u8; 32] {
        return Err(KeymuxError::BadKeyExchange);
    }
    Ok(shared)
}

/// Derive the 32-byte session key from a shared secret.
pub fn derive_session_key(shared: &SharedSecret) -> SessionKey {
    expand(shared, SESSION_KEY_INFO)
}

/// Derive the 32-byte seal key from the same shared secret.
pub fn derive_seal_key(shared: &SharedSecret) -> SealKey {
    expand(shared, SEAL_KEY_INFO)
}

/// Seal the session key under the seal key for transport in a KXR frame.
///
/// Both keys come from [`derive_session_key`] and [`derive_seal_key`] over
/// one shared secret; no key agreement happens here. The seal key binds the
/// blob to the server's identity, since only the server's private key can
/// re-derive it from the embedded ephemeral public key.
pub fn seal_secret(
    session_key: &SessionKey,
    ephemeral_public: &PublicKey,
    seal_key: &SealKey,
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(seal_key.as_slice()));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&[0u8; 12]), session_key.as_slice())
        .map_err(|_| KeymuxError::BadKeyExchange)?;

    let mut sealed = Vec::with_capacity(SEALED_SECRET_SIZE);
    sealed.extend_from_slice(ephemeral_public.as_bytes());
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open a sealed secret with the server's long-term private key.
///
/// Returns [`KeymuxError::BadKeyExchange`] for malformed input and
/// [`KeymuxError::BadKey`] when authentication fails.
pub fn open_sealed_secret(server_private: &StaticSecret, sealed: &[u8]) -> Result<SessionKey> {
    if sealed.len() != SEALED_SECRET_SIZE {
        return Err(KeymuxError::BadKeyExchange);
    }

    let mut ephemeral = [0u8; PUBLIC_KEY_SIZE];
    ephemeral.copy_from_slice(&sealed[..PUBLIC_KEY_SIZE]);
    let ephemeral_public = PublicKey::from(ephemeral);

    let shared = derive_shared_secret(server_private, &ephemeral_public)?;
    let seal_key = derive_seal_key(&shared);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(seal_key.as_slice()));
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(&[0u8; 12]), &sealed[PUBLIC_KEY_SIZE..])
            .map_err(|_| KeymuxError::BadKey)?,
    );

    if plaintext.len() != SESSION_KEY_SIZE {
        return Err(KeymuxError::BadKeyExchange);
    }
    let mut key = Zeroizing::new([0u8; SESSION_KEY_SIZE]);
    key.copy_from_slice(&plaintext);
    Ok(key)
}

fn expand(shared: &SharedSecret, info: &[u8]) -> Zeroizing<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(info, okm.as_mut())
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The client side of the exchange, as the session drives it.
    fn client_seal(server_public: &PublicKey) -> (SessionKey, PublicKey, Vec<u8>) {
        let (ephemeral, ephemeral_public) = generate_keypair();
        let shared = derive_shared_secret(&ephemeral, server_public).unwrap();
        let session_key = derive_session_key(&shared);
        let seal_key = derive_seal_key(&shared);
        let sealed = seal_secret(&session_key, &ephemeral_public, &seal_key).unwrap();
        (session_key, ephemeral_public, sealed)
    }

    /// X25519 against the RFC 7748 §6.1 canonical test vectors, so the key
    /// agreement underneath the seal is known-good.
    #[test]
    fn test_x25519_rfc7748_vectors() {
        let alice_private: [u8; 32] =
            hex::decode("77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a")
                .unwrap()
                .try_into()
                .unwrap();
        let bob_public: [u8; 32] =
            hex::decode("de9edb7d7b7dc1b4d35b61c2ece435373f8343c85b78674dadfc7e146f882b4f")
                .unwrap()
                .try_into()
                .unwrap();

        let alice = StaticSecret::from(alice_private);
        let shared = derive_shared_secret(&alice, &PublicKey::from(bob_public)).unwrap();
        assert_eq!(
            hex::encode(shared.as_bytes()),
            "4a5d9d5ba4ce2de1728e3bf480350f25e07e21c947d19e3376f09b3c1e161742"
        );
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let (server_private, server_public) = generate_keypair();
        let (session_key, _, sealed) = client_seal(&server_public);
        assert_eq!(sealed.len(), SEALED_SECRET_SIZE);

        let opened = open_sealed_secret(&server_private, &sealed).unwrap();
        assert_eq!(opened.as_slice(), session_key.as_slice());
    }

    #[test]
    fn test_session_keys_differ_per_exchange() {
        let (_, server_public) = generate_keypair();
        let (key_a, _, _) = client_seal(&server_public);
        let (key_b, _, _) = client_seal(&server_public);
        assert_ne!(key_a.as_slice(), key_b.as_slice());
    }

    #[test]
    fn test_session_and_seal_keys_are_distinct() {
        let (ephemeral, _) = generate_keypair();
        let (_, server_public) = generate_keypair();
        let shared = derive_shared_secret(&ephemeral, &server_public).unwrap();

        let session_key = derive_session_key(&shared);
        let seal_key = derive_seal_key(&shared);
        assert_ne!(session_key.as_slice(), seal_key.as_slice());

        // Derivation is deterministic over the same shared secret.
        assert_eq!(
            derive_session_key(&shared).as_slice(),
            session_key.as_slice()
        );
    }

    #[test]
    fn test_open_rejects_truncated_seal() {
        let (server_private, _) = generate_keypair();
        let result = open_sealed_secret(&server_private, &[0u8; 10]);
        assert!(matches!(result, Err(KeymuxError::BadKeyExchange)));
    }

    #[test]
    fn test_open_rejects_tampered_seal() {
        let (server_private, server_public) = generate_keypair();
        let (_, _, mut sealed) = client_seal(&server_public);
        sealed[SEALED_SECRET_SIZE - 1] ^= 0x01;

        let result = open_sealed_secret(&server_private, &sealed);
        assert!(matches!(result, Err(KeymuxError::BadKey)));
    }

    #[test]
    fn test_open_with_wrong_server_key_fails() {
        let (_, server_public) = generate_keypair();
        let (other_private, _) = generate_keypair();
        let (_, _, sealed) = client_seal(&server_public);

        let result = open_sealed_secret(&other_private, &sealed);
        assert!(matches!(result, Err(KeymuxError::BadKey)));
    }

    #[test]
    fn test_rejects_low_order_peer_point() {
        let (secret, _) = generate_keypair();
        let zero_point = PublicKey::from([0u8; 32]);
        assert!(matches!(
            derive_shared_secret(&secret, &zero_point),
            Err(KeymuxError::BadKeyExchange)
        ));
    }

    #[test]
    fn test_sealed_blob_does_not_leak_session_key() {
        let (server_private, server_public) = generate_keypair();
        let (session_key, _, sealed) = client_seal(&server_public);

        let ct = &sealed[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + SESSION_KEY_SIZE];
        assert_ne!(ct, session_key.as_slice());

        let opened = open_sealed_secret(&server_private, &sealed).unwrap();
        assert_eq!(opened.as_slice(), session_key.as_slice());
    }
}
