//! Symmetric cipher handles for tunnel payloads.
//!
//! Every peer carries a [`Crypt`] handle that encrypts payloads before they
//! are dressed up as TCP segments and decrypts them on the way back out.
//! Two modes are supported:
//!
//! - **Plain**: payloads pass through unchanged (useful when the upper
//!   layer already encrypts, or for debugging a capture).
//! - **ChaCha20-Poly1305**: each packet is sealed independently with a
//!   random 96-bit nonce carried in front of the ciphertext, so packets
//!   survive loss, reordering, and reconnects without nonce coordination.

use std::sync::Arc;

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// Size of symmetric keys in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the per-packet nonce in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// A symmetric key, zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Key([u8; KEY_SIZE]);

impl Key {
    /// Create a key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Derive a key from a passphrase with HKDF-SHA256.
    ///
    /// Both tunnel endpoints must use the same passphrase.
    pub fn from_passphrase(passphrase: &str) -> Self {
        let hk = Hkdf::<Sha256>::new(Some(b"camoflow-key-v1"), passphrase.as_bytes());
        let mut okm = [0u8; KEY_SIZE];
        hk.expand(b"packet", &mut okm)
            .expect("HKDF output length is valid");
        Self(okm)
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    ///
    /// Handle with care - this is secret key material.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

/// A per-peer cipher handle.
///
/// Cloning is cheap; clones share the underlying cipher state.
#[derive(Clone)]
pub enum Crypt {
    /// Payloads pass through unchanged
    Plain,
    /// ChaCha20-Poly1305 with a random nonce prefixed to each packet
    ChaCha20Poly1305(Arc<ChaCha20Poly1305>),
}

impl Crypt {
    /// Create a passthrough handle.
    pub fn plain() -> Self {
        Crypt::Plain
    }

    /// Create a ChaCha20-Poly1305 handle from a key.
    pub fn chacha20_poly1305(key: &Key) -> Self {
        Crypt::ChaCha20Poly1305(Arc::new(ChaCha20Poly1305::new(key.as_bytes().into())))
    }

    /// Encrypt a payload.
    ///
    /// For the AEAD mode the output is `nonce || ciphertext || tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        match self {
            Crypt::Plain => Ok(plaintext.to_vec()),
            Crypt::ChaCha20Poly1305(cipher) => {
                let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
                let sealed = cipher
                    .encrypt(&nonce, plaintext)
                    .map_err(|_| Error::crypto("encryption failed"))?;
                let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&sealed);
                Ok(out)
            }
        }
    }

    /// Decrypt a payload produced by [`Crypt::encrypt`].
    ///
    /// # Errors
    ///
    /// Returns an error if the packet is too short to carry a nonce and
    /// tag, or if authentication fails (wrong key, tampered data).
    pub fn decrypt(&self, packet: &[u8]) -> Result<Vec<u8>> {
        match self {
            Crypt::Plain => Ok(packet.to_vec()),
            Crypt::ChaCha20Poly1305(cipher) => {
                if packet.len() < NONCE_SIZE + TAG_SIZE {
                    return Err(Error::Buffer {
                        expected: NONCE_SIZE + TAG_SIZE,
                        actual: packet.len(),
                    });
                }
                let (nonce, sealed) = packet.split_at(NONCE_SIZE);
                cipher
                    .decrypt(chacha20poly1305::Nonce::from_slice(nonce), sealed)
                    .map_err(|_| Error::crypto("decryption/authentication failed"))
            }
        }
    }

    /// Bytes this cipher adds to every packet.
    pub fn overhead(&self) -> usize {
        match self {
            Crypt::Plain => 0,
            Crypt::ChaCha20Poly1305(_) => NONCE_SIZE + TAG_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> Key {
        Key::from_bytes([0x42u8; KEY_SIZE])
    }

    #[test]
    fn test_plain_is_identity() {
        let crypt = Crypt::plain();
        let data = b"hello tunnel";
        assert_eq!(crypt.encrypt(data).unwrap(), data);
        assert_eq!(crypt.decrypt(data).unwrap(), data);
        assert_eq!(crypt.overhead(), 0);
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let crypt = Crypt::chacha20_poly1305(&test_key());
        let plaintext = b"the quick brown fox";

        let packet = crypt.encrypt(plaintext).unwrap();
        assert_eq!(packet.len(), plaintext.len() + crypt.overhead());

        let decrypted = crypt.decrypt(&packet).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_each_packet_unique() {
        let crypt = Crypt::chacha20_poly1305(&test_key());
        let a = crypt.encrypt(b"same payload").unwrap();
        let b = crypt.encrypt(b"same payload").unwrap();
        assert_ne!(a, b, "random nonces must make ciphertexts differ");
    }

    #[test]
    fn test_wrong_key_fails() {
        let crypt1 = Crypt::chacha20_poly1305(&test_key());
        let crypt2 = Crypt::chacha20_poly1305(&Key::from_bytes([0x17u8; KEY_SIZE]));

        let packet = crypt1.encrypt(b"secret").unwrap();
        assert!(crypt2.decrypt(&packet).is_err());
    }

    #[test]
    fn test_tampered_packet_fails() {
        let crypt = Crypt::chacha20_poly1305(&test_key());
        let mut packet = crypt.encrypt(b"secret").unwrap();
        let last = packet.len() - 1;
        packet[last] ^= 0x01;
        assert!(crypt.decrypt(&packet).is_err());
    }

    #[test]
    fn test_short_packet_rejected() {
        let crypt = Crypt::chacha20_poly1305(&test_key());
        let result = crypt.decrypt(&[0u8; NONCE_SIZE]);
        assert!(matches!(result, Err(Error::Buffer { .. })));
    }

    #[test]
    fn test_passphrase_derivation_deterministic() {
        let k1 = Key::from_passphrase("correct horse battery staple");
        let k2 = Key::from_passphrase("correct horse battery staple");
        let k3 = Key::from_passphrase("different");
        assert_eq!(k1.as_bytes(), k2.as_bytes());
        assert_ne!(k1.as_bytes(), k3.as_bytes());
    }
}
