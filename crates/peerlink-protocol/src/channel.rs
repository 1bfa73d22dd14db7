//! Secure channel over an established session
//!
//! Owns the directional session keys. Outbound payloads are sealed with the
//! send key and tagged as application frames; inbound application frames
//! are opened with the receive key. An authentication failure is
//! channel-fatal and must tear the session down.

use peerlink_core::message::ChannelPayload;
use peerlink_core::wire::MSG_APP;
use peerlink_core::Error as CoreError;
use peerlink_crypto::aead::{Aead, AeadKey};
use peerlink_crypto::kdf::SessionKeys;
use peerlink_crypto::suite::suite_by_id;

use crate::error::Result;

/// AEAD associated data binding frames to this protocol and suite
fn channel_aad(suite_id: u16) -> [u8; 14] {
    let mut aad = *b"PeerLinkApp\0\0\0";
    aad[11] = 1; // payload format version
    aad[12..14].copy_from_slice(&suite_id.to_be_bytes());
    aad
}

/// An established secure channel holding the session keys
pub struct SecureChannel {
    keys: SessionKeys,
    cipher: Aead,
    aad: [u8; 14],
}

impl SecureChannel {
    /// Install negotiated session keys into a new channel
    pub fn new(keys: SessionKeys) -> Result<Self> {
        let suite = suite_by_id(keys.suite_id)?;
        let aad = channel_aad(keys.suite_id);
        Ok(Self {
            cipher: Aead::new(suite.aead),
            aad,
            keys,
        })
    }

    /// Negotiated suite wire id
    pub fn suite_id(&self) -> u16 {
        self.keys.suite_id
    }

    /// The key opening inbound payloads; also keys transfer root signatures
    /// on the receive side
    pub fn recv_key(&self) -> [u8; 32] {
        self.keys.recv
    }

    /// The key sealing outbound payloads; also keys transfer root signatures
    /// on the send side
    pub fn send_key(&self) -> [u8; 32] {
        self.keys.send
    }

    /// Seal a payload into an application frame payload
    pub fn seal(&self, payload: &ChannelPayload) -> Result<Vec<u8>> {
        let plaintext = payload.to_bytes()?;
        let key = AeadKey::from_bytes(self.keys.send);
        let sealed = self.cipher.seal(&key, &plaintext, &self.aad)?;

        let mut frame = Vec::with_capacity(1 + sealed.len());
        frame.push(MSG_APP);
        frame.extend_from_slice(&sealed);
        Ok(frame)
    }

    /// Open an application frame payload
    pub fn open(&self, frame_payload: &[u8]) -> Result<ChannelPayload> {
        let body = match frame_payload.split_first() {
            Some((&MSG_APP, body)) => body,
            Some((tag, _)) => {
                return Err(CoreError::MalformedMessage(format!(
                    "expected application frame, got tag {tag:#04x}"
                ))
                .into())
            }
            None => {
                return Err(CoreError::MalformedMessage("empty frame payload".to_string()).into())
            }
        };

        let key = AeadKey::from_bytes(self.keys.recv);
        let plaintext = self.cipher.open(&key, body, &self.aad)?;
        Ok(ChannelPayload::from_bytes(&plaintext)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_crypto::suite::{CLASSIC_X25519, HYBRID_X25519_KYBER768};

    fn channel_pair(suite_id: u16) -> (SecureChannel, SecureChannel) {
        let a = SecureChannel::new(SessionKeys {
            suite_id,
            send: [0x11; 32],
            recv: [0x22; 32],
        })
        .unwrap();
        let b = SecureChannel::new(SessionKeys {
            suite_id,
            send: [0x22; 32],
            recv: [0x11; 32],
        })
        .unwrap();
        (a, b)
    }

    #[test]
    fn test_seal_open_roundtrip_both_suites() {
        for suite in [CLASSIC_X25519, HYBRID_X25519_KYBER768] {
            let (a, b) = channel_pair(suite.id);
            let frame = a.seal(&ChannelPayload::Message(b"over the wire".to_vec())).unwrap();

            match b.open(&frame).unwrap() {
                ChannelPayload::Message(m) => assert_eq!(m, b"over the wire"),
                other => panic!("wrong payload: {other:?}"),
            }
        }
    }

    #[test]
    fn test_bit_flip_fails_open() {
        let (a, b) = channel_pair(CLASSIC_X25519.id);
        let frame = a.seal(&ChannelPayload::Message(vec![7; 64])).unwrap();

        for i in 1..frame.len() {
            let mut tampered = frame.clone();
            tampered[i] ^= 0x01;
            assert!(b.open(&tampered).is_err(), "byte {i}");
        }
    }

    #[test]
    fn test_directional_keys_are_one_way() {
        let (a, _) = channel_pair(CLASSIC_X25519.id);
        let frame = a.seal(&ChannelPayload::Message(b"loop".to_vec())).unwrap();
        // a cannot open its own output: send and recv keys differ
        assert!(a.open(&frame).is_err());
    }

    #[test]
    fn test_non_app_tag_rejected() {
        let (_, b) = channel_pair(CLASSIC_X25519.id);
        assert!(b.open(&[0x01, 0, 0]).is_err());
        assert!(b.open(&[]).is_err());
    }

    #[test]
    fn test_unknown_suite_rejected() {
        let result = SecureChannel::new(SessionKeys {
            suite_id: 0xBEEF,
            send: [0; 32],
            recv: [0; 32],
        });
        assert!(result.is_err());
    }
}
