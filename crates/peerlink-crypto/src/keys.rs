//! Key types for the PeerLink handshake
//!
//! - Ephemeral X25519 keypairs for key exchange
//! - Ed25519 signing keypairs for transcript authentication
//! - Shared secrets (variable length: hybrid suites concatenate two secrets)

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, Result};

/// Size of X25519 public keys in bytes
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// Size of Ed25519 public keys in bytes
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Size of Ed25519 signatures in bytes
pub const ED25519_SIGNATURE_SIZE: usize = 64;

/// An X25519 key pair for Diffie-Hellman key exchange
#[derive(ZeroizeOnDrop)]
pub struct EphemeralKeyPair {
    #[zeroize(skip)]
    secret: X25519StaticSecret,
    public: X25519PublicKey,
}

impl EphemeralKeyPair {
    /// Generate a new random ephemeral key pair
    pub fn generate() -> Self {
        let secret = X25519StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Create from existing secret bytes (must come from a secure source)
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = X25519StaticSecret::from(bytes);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Get the public key bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Perform X25519 Diffie-Hellman with peer public key bytes
    pub fn diffie_hellman(&self, their_public: &[u8]) -> Result<SharedSecret> {
        let bytes: [u8; 32] = their_public
            .try_into()
            .map_err(|_| CryptoError::InvalidPeerKey("X25519 key must be 32 bytes".to_string()))?;
        let their_key = X25519PublicKey::from(bytes);
        let shared = self.secret.diffie_hellman(&their_key);
        Ok(SharedSecret::from_bytes(shared.as_bytes()))
    }
}

impl Clone for EphemeralKeyPair {
    fn clone(&self) -> Self {
        Self::from_secret_bytes(self.secret.to_bytes())
    }
}

/// A shared secret produced by key exchange
///
/// Classic suites yield 32 bytes; hybrid suites concatenate the DH output
/// and the KEM shared secret.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(Vec<u8>);

impl SharedSecret {
    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// Concatenate two secrets (classical part first)
    pub fn concat(classical: &SharedSecret, post_quantum: &[u8]) -> Self {
        let mut out = Vec::with_capacity(classical.0.len() + post_quantum.len());
        out.extend_from_slice(&classical.0);
        out.extend_from_slice(post_quantum);
        Self(out)
    }

    /// Get the secret bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// An Ed25519 key pair for signing handshake transcripts
pub struct SigningKeyPair {
    signing: SigningKey,
}

impl SigningKeyPair {
    /// Generate a new random signing key pair
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Create from existing secret bytes
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&bytes),
        }
    }

    /// Get the verifying (public) key bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Sign data, returning a 64-byte Ed25519 signature
    pub fn sign(&self, data: &[u8]) -> [u8; ED25519_SIGNATURE_SIZE] {
        self.signing.sign(data).to_bytes()
    }
}

/// Generate a random 32-byte handshake nonce
pub fn generate_nonce() -> [u8; 32] {
    use rand::RngCore;
    let mut nonce = [0u8; 32];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Verify an Ed25519 signature against a declared public key
pub fn verify_signature(public_key: &[u8], data: &[u8], signature: &[u8]) -> Result<()> {
    let key_bytes: [u8; 32] = public_key
        .try_into()
        .map_err(|_| CryptoError::InvalidPeerKey("Ed25519 key must be 32 bytes".to_string()))?;
    let verifying = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|_| CryptoError::InvalidPeerKey("Not a valid Ed25519 point".to_string()))?;

    let sig_bytes: [u8; ED25519_SIGNATURE_SIZE] = signature
        .try_into()
        .map_err(|_| CryptoError::InvalidSignature)?;
    let signature = Signature::from_bytes(&sig_bytes);

    verifying
        .verify(data, &signature)
        .map_err(|_| CryptoError::InvalidSignature)
}
