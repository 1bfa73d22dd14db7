//! Session key schedule for the PeerLink handshake
//!
//! HKDF-SHA256 with domain separation derives the directional channel keys
//! and the Finished-MAC keys from the key-exchange shared secret, salted by
//! the transcript hash so both sides bind to identical handshake contents.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, Result};
use crate::keys::SharedSecret;

/// HKDF using SHA-256
pub type HkdfSha256 = Hkdf<Sha256>;

/// HMAC-SHA256 for finished MACs and transfer root signatures
pub type HmacSha256 = Hmac<Sha256>;

/// Domain separation strings for key derivation contexts
pub mod domain {
    /// Channel key, initiator-to-responder direction
    pub const INITIATOR_KEY: &[u8] = b"PeerLink_v1_InitiatorKey";
    /// Channel key, responder-to-initiator direction
    pub const RESPONDER_KEY: &[u8] = b"PeerLink_v1_ResponderKey";
    /// Finished MAC key, initiator-to-responder direction
    pub const INITIATOR_FINISHED: &[u8] = b"PeerLink_v1_InitiatorFinished";
    /// Finished MAC key, responder-to-initiator direction
    pub const RESPONDER_FINISHED: &[u8] = b"PeerLink_v1_ResponderFinished";
}

/// Directional channel keys plus the negotiated suite id
///
/// Owned by exactly one secure channel; zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    /// Negotiated suite wire id
    #[zeroize(skip)]
    pub suite_id: u16,
    /// Key sealing outbound payloads
    pub send: [u8; 32],
    /// Key opening inbound payloads
    pub recv: [u8; 32],
}

/// Directional Finished-MAC keys, consumed by the handshake driver
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct FinishedKeys {
    /// Key for the MAC we send
    pub send: [u8; 32],
    /// Key for the MAC we expect
    pub recv: [u8; 32],
}

/// Derive the full session key schedule from the shared secret and
/// transcript hash.
///
/// Both sides call this with the same inputs; `is_initiator` only swaps
/// which directional key lands in `send` versus `recv`.
pub fn derive_session_keys(
    suite_id: u16,
    shared: &SharedSecret,
    transcript_hash: &[u8; 32],
    is_initiator: bool,
) -> Result<(SessionKeys, FinishedKeys)> {
    let hkdf = HkdfSha256::new(Some(transcript_hash), shared.as_bytes());

    let expand = |info: &[u8]| -> Result<[u8; 32]> {
        let mut out = [0u8; 32];
        hkdf.expand(info, &mut out)
            .map_err(|_| CryptoError::KeyDerivation("HKDF expansion failed".to_string()))?;
        Ok(out)
    };

    let i2r = expand(domain::INITIATOR_KEY)?;
    let r2i = expand(domain::RESPONDER_KEY)?;
    let fin_i = expand(domain::INITIATOR_FINISHED)?;
    let fin_r = expand(domain::RESPONDER_FINISHED)?;

    let (session, finished) = if is_initiator {
        (
            SessionKeys { suite_id, send: i2r, recv: r2i },
            FinishedKeys { send: fin_i, recv: fin_r },
        )
    } else {
        (
            SessionKeys { suite_id, send: r2i, recv: i2r },
            FinishedKeys { send: fin_r, recv: fin_i },
        )
    };

    Ok((session, finished))
}

/// Compute an HMAC-SHA256 tag over data
pub fn compute_auth_tag(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    let result = mac.finalize();
    let mut output = [0u8; 32];
    output.copy_from_slice(&result.into_bytes());
    output
}

/// Verify an HMAC-SHA256 tag in constant time
pub fn verify_auth_tag(key: &[u8; 32], data: &[u8], tag: &[u8]) -> bool {
    let expected = compute_auth_tag(key, data);
    constant_time_eq(&expected, tag)
}

/// Constant-time comparison to prevent timing attacks
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
