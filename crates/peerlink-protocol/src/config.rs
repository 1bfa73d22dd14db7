//! Protocol configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use peerlink_core::MAX_FRAME_SIZE;
use peerlink_crypto::suite::SuitePolicy;

use crate::error::{ProtocolError, Result};

/// Top-level protocol configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Cipher suite negotiation policy
    pub policy: SuitePolicy,
    /// Wrap frame payloads in the padding envelope
    pub enable_padding: bool,
    /// Maximum frame payload size in bytes
    pub max_frame_size: usize,
    /// Minimum interval between outbound heartbeats in milliseconds
    pub heartbeat_min_interval_ms: u64,
    /// File transfer settings
    pub transfer: TransferConfig,
    /// Signaling retry settings
    pub signaling: SignalingConfig,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            policy: SuitePolicy::default(),
            enable_padding: false,
            max_frame_size: MAX_FRAME_SIZE,
            heartbeat_min_interval_ms: 1_000,
            transfer: TransferConfig::default(),
            signaling: SignalingConfig::default(),
        }
    }
}

impl ProtocolConfig {
    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size == 0 || self.max_frame_size > MAX_FRAME_SIZE {
            return Err(ProtocolError::Config(format!(
                "max_frame_size must be in 1..={MAX_FRAME_SIZE}"
            )));
        }
        self.transfer.validate()?;
        self.signaling.validate()
    }
}

/// File transfer settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Chunk size in bytes
    pub chunk_size: u32,
    /// How long to wait for a chunk acknowledgment, in milliseconds
    pub chunk_ack_timeout_ms: u64,
    /// Resend attempts per chunk before the transfer fails
    pub chunk_retry_limit: u32,
    /// Grace period after a premature `complete`, in milliseconds
    pub completion_watchdog_ms: u64,
    /// Directory receiving completed files (and their partial artifacts)
    pub download_dir: PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16 * 1024,
            chunk_ack_timeout_ms: 5_000,
            chunk_retry_limit: 3,
            completion_watchdog_ms: 10_000,
            download_dir: std::env::temp_dir(),
        }
    }
}

impl TransferConfig {
    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(ProtocolError::Config("chunk_size must be nonzero".to_string()));
        }
        if self.chunk_size as usize > MAX_FRAME_SIZE / 2 {
            return Err(ProtocolError::Config(format!(
                "chunk_size {} leaves no frame headroom",
                self.chunk_size
            )));
        }
        if self.chunk_ack_timeout_ms == 0 || self.completion_watchdog_ms == 0 {
            return Err(ProtocolError::Config(
                "transfer timeouts must be nonzero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Signaling retry settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Bounded join re-announcement attempts while an offer is outstanding
    pub join_announce_attempts: u32,
    /// Spacing between join announcements, in milliseconds
    pub join_announce_interval_ms: u64,
    /// Bounded local-offer resend attempts until the remote answers
    pub offer_resend_attempts: u32,
    /// Spacing between offer resends, in milliseconds
    pub offer_resend_interval_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            join_announce_attempts: 30,
            join_announce_interval_ms: 1_000,
            offer_resend_attempts: 40,
            offer_resend_interval_ms: 1_500,
        }
    }
}

impl SignalingConfig {
    fn validate(&self) -> Result<()> {
        if self.join_announce_attempts == 0 || self.offer_resend_attempts == 0 {
            return Err(ProtocolError::Config(
                "signaling attempt counts must be nonzero".to_string(),
            ));
        }
        Ok(())
    }
}
