//! Error types for PeerLink core

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(#[from] peerlink_crypto::CryptoError),

    /// Declared frame length exceeds the bound
    #[error("Frame too large: {size} bytes exceeds maximum {max}")]
    FrameTooLarge {
        /// Declared length in bytes
        size: usize,
        /// Maximum allowed length
        max: usize,
    },

    /// Frame or padding envelope could not be parsed
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Handshake or transfer message could not be decoded
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Protocol version mismatch
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch {
        /// Version this build speaks
        expected: u8,
        /// Version the peer sent
        actual: u8,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
