//! Channel payload envelope and the file-transfer wire message
//!
//! Once a session is established, every decrypted application frame is a
//! bincode-encoded [`ChannelPayload`]. File transfer rides the same channel
//! as a versioned [`TransferMessage`]; exactly the fields relevant to its
//! `op` are populated.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::TransferId;

/// Current transfer message version
pub const TRANSFER_MESSAGE_VERSION: u8 = 1;

/// Algorithm label for the Merkle root signature
pub const ROOT_SIGNATURE_ALG: &str = "hmac-sha256";

/// Everything that can travel over an established secure channel
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ChannelPayload {
    /// Opaque application message, delivered to the session owner
    Message(Vec<u8>),
    /// File transfer protocol message
    Transfer(TransferMessage),
    /// Keepalive; updates the peer's last-activity timestamp
    Heartbeat {
        /// Monotonic per-session counter
        seq: u64,
        /// Sender timestamp, milliseconds since Unix epoch
        timestamp_ms: i64,
    },
}

impl ChannelPayload {
    /// Serialize for sealing
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize an opened frame
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// File transfer operation discriminator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferOp {
    /// Announce a transfer: name, size, chunk geometry
    Metadata,
    /// Receiver accepted (or already knows) the transfer
    MetadataAck,
    /// One chunk of file data
    Chunk,
    /// Cumulative receipt acknowledgment, may carry a missing-chunks hint
    ChunkAck,
    /// Sender finished; carries verification material
    Complete,
    /// Receiver verified and persisted the file
    CompleteAck,
    /// Abandon the transfer and discard partial state
    Cancel,
    /// Per-transfer failure report
    Error,
}

/// The versioned file-transfer message
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferMessage {
    /// Message format version
    pub version: u8,
    /// Operation
    pub op: TransferOp,
    /// Transfer this message belongs to
    pub transfer_id: TransferId,
    /// File name (metadata)
    pub file_name: Option<String>,
    /// Total file size in bytes (metadata)
    pub file_size: Option<u64>,
    /// Chunk size in bytes (metadata)
    pub chunk_size: Option<u32>,
    /// Total chunk count (metadata)
    pub total_chunks: Option<u32>,
    /// Chunk index (chunk)
    pub chunk_index: Option<u32>,
    /// Chunk bytes (chunk)
    pub chunk_data: Option<Vec<u8>>,
    /// SHA-256 of the chunk bytes (chunk)
    pub chunk_sha256: Option<[u8; 32]>,
    /// Unpadded size of the chunk bytes (chunk)
    pub raw_size: Option<u32>,
    /// Cumulative bytes the receiver has accounted (chunkAck, metadataAck)
    pub received_bytes: Option<u64>,
    /// Chunk indices still missing (chunkAck hint after premature complete)
    pub missing_chunks: Option<Vec<u32>>,
    /// SHA-256 of the whole file (complete)
    pub file_sha256: Option<[u8; 32]>,
    /// Merkle root over the ordered chunk hashes (complete)
    pub merkle_root: Option<[u8; 32]>,
    /// Keyed MAC over `transferId || root || fileHash` (complete)
    pub merkle_root_signature: Option<Vec<u8>>,
    /// Signature algorithm label (complete)
    pub merkle_root_signature_alg: Option<String>,
    /// Human-readable detail (error)
    pub message: Option<String>,
}

impl TransferMessage {
    /// Create a message with only version, op, and transfer id set
    pub fn new(op: TransferOp, transfer_id: TransferId) -> Self {
        Self {
            version: TRANSFER_MESSAGE_VERSION,
            op,
            transfer_id,
            file_name: None,
            file_size: None,
            chunk_size: None,
            total_chunks: None,
            chunk_index: None,
            chunk_data: None,
            chunk_sha256: None,
            raw_size: None,
            received_bytes: None,
            missing_chunks: None,
            file_sha256: None,
            merkle_root: None,
            merkle_root_signature: None,
            merkle_root_signature_alg: None,
            message: None,
        }
    }

    /// Build a `metadata` announcement
    pub fn metadata(
        transfer_id: TransferId,
        file_name: String,
        file_size: u64,
        chunk_size: u32,
        total_chunks: u32,
    ) -> Self {
        Self {
            file_name: Some(file_name),
            file_size: Some(file_size),
            chunk_size: Some(chunk_size),
            total_chunks: Some(total_chunks),
            ..Self::new(TransferOp::Metadata, transfer_id)
        }
    }

    /// Build a `metadataAck`
    pub fn metadata_ack(transfer_id: TransferId, received_bytes: u64) -> Self {
        Self {
            received_bytes: Some(received_bytes),
            ..Self::new(TransferOp::MetadataAck, transfer_id)
        }
    }

    /// Build a `chunk`
    pub fn chunk(transfer_id: TransferId, index: u32, data: Vec<u8>, sha256: [u8; 32]) -> Self {
        Self {
            chunk_index: Some(index),
            raw_size: Some(data.len() as u32),
            chunk_sha256: Some(sha256),
            chunk_data: Some(data),
            ..Self::new(TransferOp::Chunk, transfer_id)
        }
    }

    /// Build a `chunkAck`
    pub fn chunk_ack(transfer_id: TransferId, index: Option<u32>, received_bytes: u64) -> Self {
        Self {
            chunk_index: index,
            received_bytes: Some(received_bytes),
            ..Self::new(TransferOp::ChunkAck, transfer_id)
        }
    }

    /// Build a `complete` with verification material
    pub fn complete(
        transfer_id: TransferId,
        file_sha256: [u8; 32],
        merkle_root: [u8; 32],
        merkle_root_signature: Vec<u8>,
    ) -> Self {
        Self {
            file_sha256: Some(file_sha256),
            merkle_root: Some(merkle_root),
            merkle_root_signature: Some(merkle_root_signature),
            merkle_root_signature_alg: Some(ROOT_SIGNATURE_ALG.to_string()),
            ..Self::new(TransferOp::Complete, transfer_id)
        }
    }

    /// Build a `completeAck`
    pub fn complete_ack(transfer_id: TransferId, received_bytes: u64) -> Self {
        Self {
            received_bytes: Some(received_bytes),
            ..Self::new(TransferOp::CompleteAck, transfer_id)
        }
    }

    /// Build a `cancel`
    pub fn cancel(transfer_id: TransferId) -> Self {
        Self::new(TransferOp::Cancel, transfer_id)
    }

    /// Build an `error` report
    pub fn error(transfer_id: TransferId, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(TransferOp::Error, transfer_id)
        }
    }
}
