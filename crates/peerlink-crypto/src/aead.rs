//! Authenticated Encryption with Associated Data (AEAD)
//!
//! The classic suite seals with ChaCha20-Poly1305, the hybrid suite with
//! AES-256-GCM. Sealed output is `nonce || ciphertext` with a random
//! 96-bit nonce, so the receiver needs no nonce bookkeeping.

use aes_gcm::{
    aead::{Aead as AeadTrait, KeyInit, Payload},
    Aes256Gcm,
};
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, Result};
use crate::MAX_MESSAGE_SIZE;

/// Nonce size for both algorithms (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size (128 bits)
pub const TAG_SIZE: usize = 16;

/// Key size for both algorithms (256 bits)
pub const KEY_SIZE: usize = 32;

/// AEAD key with automatic zeroization
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey(pub [u8; KEY_SIZE]);

impl AeadKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl AsRef<[u8]> for AeadKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// AEAD algorithm selection, fixed per cipher suite
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AeadAlgorithm {
    /// ChaCha20-Poly1305 (classic suite)
    ChaCha20Poly1305,
    /// AES-256-GCM (hybrid suite)
    Aes256Gcm,
}

/// AEAD cipher bound to one algorithm
pub struct Aead {
    algorithm: AeadAlgorithm,
}

impl Aead {
    /// Create a cipher for the given algorithm
    pub fn new(algorithm: AeadAlgorithm) -> Self {
        Self { algorithm }
    }

    /// Seal plaintext with associated data.
    ///
    /// Returns `nonce || ciphertext`.
    pub fn seal(&self, key: &AeadKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if plaintext.len() > MAX_MESSAGE_SIZE {
            return Err(CryptoError::MessageTooLarge {
                size: plaintext.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = match self.algorithm {
            AeadAlgorithm::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
                cipher
                    .encrypt((&nonce).into(), Payload { msg: plaintext, aad })
                    .map_err(|_| {
                        CryptoError::EncryptionFailed("ChaCha20-Poly1305 failed".to_string())
                    })?
            }
            AeadAlgorithm::Aes256Gcm => {
                let cipher = Aes256Gcm::new(key.as_bytes().into());
                cipher
                    .encrypt((&nonce).into(), Payload { msg: plaintext, aad })
                    .map_err(|_| {
                        CryptoError::EncryptionFailed("AES-256-GCM failed".to_string())
                    })?
            }
        };

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open `nonce || ciphertext` with associated data.
    ///
    /// A tag mismatch is an authentication failure and must be treated as
    /// channel-fatal by the caller.
    pub fn open(&self, key: &AeadKey, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::DecryptionFailed(format!(
                "sealed payload too short: {} bytes",
                sealed.len()
            )));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);

        match self.algorithm {
            AeadAlgorithm::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
                cipher
                    .decrypt(nonce.into(), Payload { msg: ciphertext, aad })
                    .map_err(|_| CryptoError::AuthenticationFailed)
            }
            AeadAlgorithm::Aes256Gcm => {
                let cipher = Aes256Gcm::new(key.as_bytes().into());
                cipher
                    .decrypt(nonce.into(), Payload { msg: ciphertext, aad })
                    .map_err(|_| CryptoError::AuthenticationFailed)
            }
        }
    }
}
