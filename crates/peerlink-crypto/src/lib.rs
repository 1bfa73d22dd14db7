//! # PeerLink Cryptographic Library
//!
//! This crate provides the cryptographic primitives for the PeerLink
//! device-to-device session protocol.
//!
//! ## Core Components
//!
//! - [`suite`]: cipher suite registry, policy, and negotiation
//! - [`kex`]: key exchange (X25519 and hybrid X25519 + Kyber768)
//! - [`keys`]: ephemeral and signing key types
//! - [`kdf`]: HKDF session key schedule and keyed MACs
//! - [`aead`]: authenticated encryption (ChaCha20-Poly1305, AES-256-GCM)
//!
//! All key material is zeroized on drop, and all verification paths use
//! constant-time comparison where the underlying primitive allows it.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod aead;
pub mod error;
pub mod kdf;
pub mod kex;
pub mod keys;
pub mod suite;

pub use error::{CryptoError, Result};

/// Protocol version carried in every handshake message
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum plaintext size accepted by the AEAD layer (8 MiB)
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::aead::{Aead, AeadAlgorithm, AeadKey};
    pub use crate::error::{CryptoError, Result};
    pub use crate::kdf::{derive_session_keys, FinishedKeys, SessionKeys};
    pub use crate::kex::{initiate, respond, KexInitiation};
    pub use crate::keys::{EphemeralKeyPair, SharedSecret, SigningKeyPair};
    pub use crate::suite::{CipherSuite, SuiteClass, SuitePolicy};
}
