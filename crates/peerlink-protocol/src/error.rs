//! Error types for the PeerLink protocol layer
//!
//! Two tiers: [`ProtocolError`] covers session-fatal failures (handshake,
//! framing, transport); [`TransferError`] covers failures scoped to one
//! file transfer, which leave the session usable.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Session-level error types
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Framing or wire decode error
    #[error("Core error: {0}")]
    Core(#[from] peerlink_core::Error),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(#[from] peerlink_crypto::CryptoError),

    /// Handshake failed; terminal for the driver
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The session has been torn down
    #[error("Session closed")]
    SessionClosed,

    /// No session with the given id
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Underlying byte stream failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Signaling collaborator failed
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Per-transfer failure
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Heartbeat attempted before the minimum interval elapsed
    #[error("Rate limited: retry in {retry_in_ms} ms")]
    RateLimited {
        /// Milliseconds until the next heartbeat is allowed
        retry_in_ms: u64,
    },

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Errors scoped to a single file transfer
#[derive(Debug, Error)]
pub enum TransferError {
    /// No transfer state for the given id
    #[error("Unknown transfer: {0}")]
    UnknownTransfer(String),

    /// Chunk bytes do not match their declared hash
    #[error("Chunk {index} hash mismatch")]
    ChunkHashMismatch {
        /// Index of the corrupt chunk
        index: u32,
    },

    /// Computed Merkle root differs from the declared one
    #[error("Merkle root mismatch")]
    MerkleMismatch,

    /// Keyed MAC over the Merkle root failed verification
    #[error("Merkle root signature mismatch")]
    RootSignatureMismatch,

    /// Whole-file hash differs from the declared one
    #[error("File hash mismatch")]
    FileHashMismatch,

    /// Completion requested or watchdog fired while chunks are missing
    #[error("Transfer incomplete: {missing} chunks missing")]
    Incomplete {
        /// Number of chunks not yet received
        missing: usize,
    },

    /// No metadata acknowledgment within the bounded timeout and retries
    #[error("Metadata acknowledgment timed out")]
    MetadataTimeout,

    /// No acknowledgment within the bounded timeout and retries
    #[error("Chunk {index} acknowledgment timed out")]
    AckTimeout {
        /// Index of the unacknowledged chunk
        index: u32,
    },

    /// Transfer cancelled by either side
    #[error("Transfer cancelled")]
    Cancelled,

    /// Peer reported a transfer error
    #[error("Rejected by peer: {0}")]
    Rejected(String),

    /// Owning session was torn down mid-transfer
    #[error("Session closed")]
    SessionClosed,

    /// Reading, writing, or renaming the artifact failed
    #[error("Transfer I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        TransferError::Io(err.to_string())
    }
}
