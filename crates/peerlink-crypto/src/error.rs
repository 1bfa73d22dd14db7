//! Error types for PeerLink crypto

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Cryptographic error types
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Suite id is not in the registry
    #[error("Unsupported cipher suite: {0:#06x}")]
    UnsupportedSuite(u16),

    /// No suite is supported by both peers
    #[error("No common cipher suite with peer")]
    NoCommonSuite,

    /// Peer public key material could not be parsed
    #[error("Invalid peer key: {0}")]
    InvalidPeerKey(String),

    /// Signature verification failed
    #[error("Invalid signature")]
    InvalidSignature,

    /// Key derivation failed
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// AEAD authentication tag or MAC mismatch
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Message exceeds the AEAD size bound
    #[error("Message too large: {size} bytes exceeds maximum {max}")]
    MessageTooLarge {
        /// Actual size in bytes
        size: usize,
        /// Maximum allowed size
        max: usize,
    },
}
