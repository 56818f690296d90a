//! Symmetric crypto primitives: AES-256-GCM sealing and HKDF derivation.
//!
//! Used in two places: the queue seals event payloads before they reach the
//! storage layer, and the credential store's fallback file is encrypted under
//! a machine-bound key. Key material is zeroized on drop.
//!
//! Wire format for sealed blobs: `nonce (12 bytes) || ciphertext+tag`.
//! A fresh random nonce is drawn per seal.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// GCM authentication tag length in bytes.
const TAG_LEN: usize = 16;

/// A 256-bit symmetric key, zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    /// Generate a fresh random key from the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wrap existing key bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Derive a purpose-bound key from input key material.
///
/// HKDF-SHA256 with a fixed per-purpose `context` string as the info input.
/// The same `(ikm, context)` pair always yields the same key.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if expansion fails (only possible
/// with an absurd output length, but surfaced rather than swallowed).
pub fn derive_key(ikm: &[u8], context: &str) -> Result<EncryptionKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(b"gym-bridge-v1"), ikm);
    let mut okm = [0u8; 32];
    hk.expand(context.as_bytes(), &mut okm)
        .map_err(|e| CryptoError::KeyDerivation {
            context: context.to_owned(),
            reason: e.to_string(),
        })?;
    Ok(EncryptionKey::from_bytes(okm))
}

/// Seal plaintext under the given key.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if AES-GCM fails.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher =
        Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|e| CryptoError::Encryption {
            reason: e.to_string(),
        })?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CryptoError::Encryption {
            reason: e.to_string(),
        })?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a blob sealed by [`encrypt`].
///
/// # Errors
///
/// - [`CryptoError::CiphertextTooShort`] if the blob cannot hold a nonce + tag.
/// - [`CryptoError::Decryption`] on wrong key, corruption, or a tampered tag.
pub fn decrypt(key: &EncryptionKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::CiphertextTooShort {
            expected: NONCE_LEN + TAG_LEN,
            actual: sealed.len(),
        });
    }

    let cipher =
        Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|e| CryptoError::Decryption {
            reason: e.to_string(),
        })?;

    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| CryptoError::Decryption {
            reason: e.to_string(),
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let key = EncryptionKey::generate();
        let sealed = encrypt(&key, b"card 4421 at door 2").unwrap();
        let opened = decrypt(&key, &sealed).unwrap();
        assert_eq!(opened, b"card 4421 at door 2");
    }

    #[test]
    fn fresh_nonce_per_seal() {
        let key = EncryptionKey::generate();
        let a = encrypt(&key, b"same plaintext").unwrap();
        let b = encrypt(&key, b"same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let sealed = encrypt(&EncryptionKey::generate(), b"secret").unwrap();
        let result = decrypt(&EncryptionKey::generate(), &sealed);
        assert!(matches!(result, Err(CryptoError::Decryption { .. })));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let key = EncryptionKey::generate();
        let mut sealed = encrypt(&key, b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(
            decrypt(&key, &sealed),
            Err(CryptoError::Decryption { .. })
        ));
    }

    #[test]
    fn short_blob_is_rejected_before_decryption() {
        let key = EncryptionKey::generate();
        assert!(matches!(
            decrypt(&key, b"tiny"),
            Err(CryptoError::CiphertextTooShort { .. })
        ));
    }

    #[test]
    fn derivation_is_deterministic_and_context_bound() {
        let a = derive_key(b"device-key-bytes", "payload-at-rest").unwrap();
        let b = derive_key(b"device-key-bytes", "payload-at-rest").unwrap();
        let c = derive_key(b"device-key-bytes", "identity-file").unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }
}
