//! # PeerLink Core
//!
//! Shared types and wire formats for the PeerLink protocol:
//!
//! - [`types`]: peer/session/transfer identifiers and timestamps
//! - [`framing`]: length-prefixed frame codec with optional padding
//! - [`wire`]: binary handshake message encodings
//! - [`message`]: channel payload envelope and the file-transfer message

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod error;
pub mod framing;
pub mod message;
pub mod types;
pub mod wire;

pub use error::{Error, Result};

/// Maximum size of a single frame payload (8 MiB)
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;
