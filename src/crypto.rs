//! Symmetric primitives for envelope encryption
//!
//! This module provides the AES-256-GCM half of the hybrid scheme: a
//! zeroizing session key type and a cipher wrapper that keeps the
//! authentication tag detached from the ciphertext, as the envelope
//! format carries them in separate fields.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ReplicatorError, Result};

/// AES-256 key size in bytes (256 bits)
pub const AES_256_KEY_SIZE: usize = 32;

/// AES-GCM nonce size in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// A secure key wrapper that zeroizes memory on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecureKey {
    bytes: Vec<u8>,
}

impl SecureKey {
    /// Create a new SecureKey from raw bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Generate a new random AES-256 session key
    pub fn generate() -> Self {
        Self {
            bytes: generate_random_bytes(AES_256_KEY_SIZE),
        }
    }

    /// Get the key bytes (use with caution)
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Get the key length
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if the key is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for SecureKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecureKey([REDACTED])")
    }
}

/// Output of an AES-GCM seal with the tag split off the ciphertext
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedData {
    /// Fresh random nonce used for this seal
    pub iv: [u8; NONCE_SIZE],
    /// Ciphertext without the tag (same length as the plaintext)
    pub ciphertext: Vec<u8>,
    /// GCM authentication tag
    pub tag: [u8; TAG_SIZE],
}

/// AES-256-GCM cipher wrapper
pub struct AesGcmCipher;

impl AesGcmCipher {
    /// Encrypt plaintext under `key` with a freshly generated nonce.
    pub fn seal(key: &SecureKey, plaintext: &[u8]) -> Result<SealedData> {
        let cipher = Self::cipher(key).map_err(ReplicatorError::Crypto)?;

        let mut iv = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut iv);

        let mut combined = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|e| ReplicatorError::Crypto(format!("Encryption error: {}", e)))?;

        // aes-gcm appends the tag to the ciphertext
        let split_at = combined.len() - TAG_SIZE;
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&combined[split_at..]);
        combined.truncate(split_at);

        Ok(SealedData {
            iv,
            ciphertext: combined,
            tag,
        })
    }

    /// Decrypt and authenticate sealed data.
    ///
    /// Any mismatch (wrong key, flipped bit in ciphertext, tag or nonce)
    /// surfaces as `ReplicatorError::Decryption`.
    pub fn open(key: &SecureKey, sealed: &SealedData) -> Result<Vec<u8>> {
        let cipher = Self::cipher(key).map_err(ReplicatorError::Decryption)?;

        let mut combined = Vec::with_capacity(sealed.ciphertext.len() + TAG_SIZE);
        combined.extend_from_slice(&sealed.ciphertext);
        combined.extend_from_slice(&sealed.tag);

        cipher
            .decrypt(Nonce::from_slice(&sealed.iv), combined.as_slice())
            .map_err(|_| ReplicatorError::Decryption("authentication tag mismatch".into()))
    }

    fn cipher(key: &SecureKey) -> std::result::Result<Aes256Gcm, String> {
        if key.len() != AES_256_KEY_SIZE {
            return Err(format!(
                "Invalid key size: expected {}, got {}",
                AES_256_KEY_SIZE,
                key.len()
            ));
        }
        Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|e| format!("Cipher init error: {}", e))
    }
}

/// Generate cryptographically secure random bytes
pub fn generate_random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let key = SecureKey::generate();
        let plaintext = b"Hello, Envelope Encryption!";

        let sealed = AesGcmCipher::seal(&key, plaintext).unwrap();
        assert_eq!(sealed.ciphertext.len(), plaintext.len());

        let opened = AesGcmCipher::open(&key, &sealed).unwrap();
        assert_eq!(plaintext.to_vec(), opened);
    }

    #[test]
    fn test_fresh_nonce_per_seal() {
        let key = SecureKey::generate();
        let a = AesGcmCipher::seal(&key, b"same").unwrap();
        let b = AesGcmCipher::seal(&key, b"same").unwrap();

        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_tampered_tag_rejected() {
        let key = SecureKey::generate();
        let mut sealed = AesGcmCipher::seal(&key, b"Secret data").unwrap();
        sealed.tag[0] ^= 0x01;

        let result = AesGcmCipher::open(&key, &sealed);
        assert!(matches!(result, Err(ReplicatorError::Decryption(_))));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let sealed = AesGcmCipher::seal(&SecureKey::generate(), b"Secret data").unwrap();
        let result = AesGcmCipher::open(&SecureKey::generate(), &sealed);
        assert!(result.is_err());
    }

    #[test]
    fn test_short_key_rejected() {
        let key = SecureKey::new(vec![0u8; 16]);
        assert!(matches!(AesGcmCipher::seal(&key, b"x"), Err(ReplicatorError::Crypto(_))));
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = SecureKey::generate();
        assert_eq!(format!("{:?}", key), "SecureKey([REDACTED])");
    }
}
