//! PeerLink protocol layer
//!
//! Ties the crypto and wire layers into running sessions: the handshake
//! state machine, the encrypted application channel, chunked verified
//! file transfer, and the connection lifecycle manager that drives
//! signaling and owns session tasks.
//!
//! Layering, bottom up:
//!
//! - [`transport`]: the ordered byte-stream seam the embedder implements
//! - [`handshake`]: suite negotiation and authenticated key exchange
//! - [`channel`]: AEAD sealing of application payloads
//! - [`transfer`]: chunked, resumable, Merkle-verified file transfer
//! - [`session`]: one task per session multiplexing all of the above
//! - [`manager`]: lifecycle states and signaling retry loops

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod channel;
pub mod config;
pub mod error;
pub mod handshake;
pub mod manager;
pub mod session;
pub mod signaling;
pub mod transfer;
pub mod transport;

pub use channel::SecureChannel;
pub use config::{ProtocolConfig, SignalingConfig, TransferConfig};
pub use error::{ProtocolError, Result, TransferError};
pub use handshake::{HandshakeDriver, HandshakeEvent, HandshakeRole, HandshakeStatus};
pub use manager::{ConnectionManager, ConnectionState, ManagerEvent};
pub use session::{spawn_session, SessionEvent, SessionHandle};
pub use signaling::{SignalKind, SignalPayload, SignalingEnvelope, SignalingTransport};
pub use transfer::{TransferProgress, TransferReceiver, TransferSender};
pub use transport::{duplex_pair, DuplexTransport, Transport};
