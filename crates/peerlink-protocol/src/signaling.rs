//! Signaling envelope contract
//!
//! The JSON shape exchanged with the external signaling transport. The
//! protocol never interprets SDP or ICE content; it only carries it
//! between the lifecycle manager and the remote peer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use peerlink_core::types::PeerId;

use crate::error::Result;

/// Envelope type discriminator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignalKind {
    /// Local session description offer
    Offer,
    /// Remote session description answer
    Answer,
    /// Trickled ICE candidate
    IceCandidate,
    /// Peer announcing presence in a session
    Join,
    /// Peer leaving a session
    Leave,
}

/// Opaque signaling payload; exactly the fields relevant to the kind are set
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    /// Session description (offer/answer)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    /// ICE candidate line
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
    /// ICE candidate media stream id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// ICE candidate media line index
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<i32>,
}

impl SignalPayload {
    /// Payload carrying only an SDP blob
    pub fn sdp(sdp: impl Into<String>) -> Self {
        Self {
            sdp: Some(sdp.into()),
            ..Default::default()
        }
    }
}

/// One signaling message
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingEnvelope {
    /// Session the envelope belongs to
    pub session_id: String,
    /// Sending peer
    pub from: PeerId,
    /// Envelope type
    #[serde(rename = "type")]
    pub kind: SignalKind,
    /// Carried content
    #[serde(default)]
    pub payload: SignalPayload,
}

impl SignalingEnvelope {
    /// Build an envelope
    pub fn new(
        session_id: impl Into<String>,
        from: PeerId,
        kind: SignalKind,
        payload: SignalPayload,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            from,
            kind,
            payload,
        }
    }
}

/// Outbound half of the signaling collaborator.
///
/// Inbound envelopes are pushed into the lifecycle manager by the embedder
/// via [`ConnectionManager::handle_envelope`](crate::manager::ConnectionManager::handle_envelope).
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Deliver an envelope toward the remote peer of its session
    async fn send(&self, envelope: SignalingEnvelope) -> Result<()>;
}
