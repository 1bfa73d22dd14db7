//! Binary handshake wire messages
//!
//! Every frame payload starts with a one-byte message type tag, so the
//! session loop can route handshake and encrypted application traffic
//! sharing one ordered byte stream without guessing from shape. The
//! Finished frame is additionally fixed at exactly 38 bytes.
//!
//! Fixed-field layout, big-endian integers, u16 length prefixes on
//! variable fields.

use bytes::BufMut;

use crate::error::{Error, Result};

/// Tag byte of HandshakeMessageA
pub const MSG_HANDSHAKE_A: u8 = 0x01;

/// Tag byte of HandshakeMessageB
pub const MSG_HANDSHAKE_B: u8 = 0x02;

/// Tag byte of the Finished frame
pub const MSG_FINISHED: u8 = 0x03;

/// Tag byte of an encrypted application frame
pub const MSG_APP: u8 = 0x10;

/// Exact encoded size of a Finished frame
pub const FINISHED_FRAME_LEN: usize = 38;

/// Handshake nonce size in bytes
pub const NONCE_LEN: usize = 32;

/// Finished MAC size in bytes
pub const FINISHED_MAC_LEN: usize = 32;

/// One suite offer in MessageA: the suite id and the matching ephemeral
/// key-exchange public material
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OfferedSuite {
    /// Suite wire id
    pub id: u16,
    /// Ephemeral key-exchange public for this suite
    pub kex_public: Vec<u8>,
}

/// Initiator's opening message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeMessageA {
    /// Protocol version
    pub version: u8,
    /// Initiator nonce, bound into the transcript
    pub nonce: [u8; NONCE_LEN],
    /// Initiator's Ed25519 signing public key
    pub signing_public: [u8; 32],
    /// Offered suites in preference order, each with its kex public
    pub offered: Vec<OfferedSuite>,
}

impl HandshakeMessageA {
    /// Encode to frame payload bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            2 + NONCE_LEN + 32 + 1 + self.offered.iter().map(|o| 4 + o.kex_public.len()).sum::<usize>(),
        );
        out.put_u8(MSG_HANDSHAKE_A);
        out.put_u8(self.version);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.signing_public);
        out.put_u8(self.offered.len() as u8);
        for offer in &self.offered {
            out.put_u16(offer.id);
            out.put_u16(offer.kex_public.len() as u16);
            out.extend_from_slice(&offer.kex_public);
        }
        out
    }

    fn decode_body(mut buf: &[u8]) -> Result<Self> {
        let version = take_u8(&mut buf, "version")?;
        let nonce = take_array::<NONCE_LEN>(&mut buf, "nonce")?;
        let signing_public = take_array::<32>(&mut buf, "signing public key")?;

        let count = take_u8(&mut buf, "suite count")? as usize;
        if count == 0 {
            return Err(Error::MalformedMessage("empty suite offer".to_string()));
        }

        let mut offered = Vec::with_capacity(count);
        for _ in 0..count {
            let id = take_u16(&mut buf, "suite id")?;
            let len = take_u16(&mut buf, "kex public length")? as usize;
            let kex_public = take_slice(&mut buf, len, "kex public")?.to_vec();
            offered.push(OfferedSuite { id, kex_public });
        }

        if !buf.is_empty() {
            return Err(Error::MalformedMessage(format!(
                "{} trailing bytes after MessageA",
                buf.len()
            )));
        }

        Ok(Self { version, nonce, signing_public, offered })
    }
}

/// Responder's reply: chosen suite, key-exchange reply, and a signature
/// binding the transcript
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeMessageB {
    /// Protocol version
    pub version: u8,
    /// Chosen suite wire id
    pub suite_id: u16,
    /// Key-exchange reply material for the chosen suite
    pub kex_reply: Vec<u8>,
    /// Responder's Ed25519 signing public key
    pub signing_public: [u8; 32],
    /// Ed25519 signature over the transcript
    pub signature: [u8; 64],
}

impl HandshakeMessageB {
    /// Encode to frame payload bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + 2 + 2 + self.kex_reply.len() + 32 + 64);
        out.put_u8(MSG_HANDSHAKE_B);
        out.put_u8(self.version);
        out.put_u16(self.suite_id);
        out.put_u16(self.kex_reply.len() as u16);
        out.extend_from_slice(&self.kex_reply);
        out.extend_from_slice(&self.signing_public);
        out.extend_from_slice(&self.signature);
        out
    }

    fn decode_body(mut buf: &[u8]) -> Result<Self> {
        let version = take_u8(&mut buf, "version")?;
        let suite_id = take_u16(&mut buf, "suite id")?;
        let len = take_u16(&mut buf, "kex reply length")? as usize;
        let kex_reply = take_slice(&mut buf, len, "kex reply")?.to_vec();
        let signing_public = take_array::<32>(&mut buf, "signing public key")?;
        let signature = take_array::<64>(&mut buf, "signature")?;

        if !buf.is_empty() {
            return Err(Error::MalformedMessage(format!(
                "{} trailing bytes after MessageB",
                buf.len()
            )));
        }

        Ok(Self { version, suite_id, kex_reply, signing_public, signature })
    }
}

/// Key-confirmation frame, exactly two exchanged per handshake
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeFinished {
    /// Protocol version
    pub version: u8,
    /// Negotiated suite wire id
    pub suite_id: u16,
    /// HMAC-SHA256 over the transcript hash with the directional finished key
    pub mac: [u8; FINISHED_MAC_LEN],
}

impl HandshakeFinished {
    /// Encode to exactly [`FINISHED_FRAME_LEN`] bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FINISHED_FRAME_LEN);
        out.put_u8(MSG_FINISHED);
        out.put_u8(self.version);
        out.put_u16(self.suite_id);
        out.put_u16(FINISHED_MAC_LEN as u16);
        out.extend_from_slice(&self.mac);
        out
    }

    fn decode_body(mut buf: &[u8]) -> Result<Self> {
        let version = take_u8(&mut buf, "version")?;
        let suite_id = take_u16(&mut buf, "suite id")?;
        let mac_len = take_u16(&mut buf, "mac length")? as usize;
        if mac_len != FINISHED_MAC_LEN {
            return Err(Error::MalformedMessage(format!(
                "Finished MAC must be {FINISHED_MAC_LEN} bytes, got {mac_len}"
            )));
        }
        let mac = take_array::<FINISHED_MAC_LEN>(&mut buf, "mac")?;

        if !buf.is_empty() {
            return Err(Error::MalformedMessage(format!(
                "{} trailing bytes after Finished",
                buf.len()
            )));
        }

        Ok(Self { version, suite_id, mac })
    }
}

/// A decoded handshake frame
#[derive(Clone, Debug)]
pub enum HandshakeFrame {
    /// Initiator's opening message
    A(HandshakeMessageA),
    /// Responder's reply
    B(HandshakeMessageB),
    /// Key confirmation
    Finished(HandshakeFinished),
}

/// Peek the leading message type tag of a frame payload
pub fn peek_message_type(payload: &[u8]) -> Option<u8> {
    payload.first().copied()
}

/// Whether a frame payload carries a handshake message
pub fn is_handshake_frame(payload: &[u8]) -> bool {
    matches!(
        peek_message_type(payload),
        Some(MSG_HANDSHAKE_A) | Some(MSG_HANDSHAKE_B) | Some(MSG_FINISHED)
    )
}

impl HandshakeFrame {
    /// Decode a frame payload into a handshake message
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let tag = peek_message_type(payload)
            .ok_or_else(|| Error::MalformedMessage("empty frame payload".to_string()))?;
        let body = &payload[1..];

        match tag {
            MSG_HANDSHAKE_A => Ok(Self::A(HandshakeMessageA::decode_body(body)?)),
            MSG_HANDSHAKE_B => Ok(Self::B(HandshakeMessageB::decode_body(body)?)),
            MSG_FINISHED => {
                if payload.len() != FINISHED_FRAME_LEN {
                    return Err(Error::MalformedMessage(format!(
                        "Finished frame must be {FINISHED_FRAME_LEN} bytes, got {}",
                        payload.len()
                    )));
                }
                Ok(Self::Finished(HandshakeFinished::decode_body(body)?))
            }
            other => Err(Error::MalformedMessage(format!(
                "unknown handshake tag {other:#04x}"
            ))),
        }
    }
}

fn take_u8(buf: &mut &[u8], what: &str) -> Result<u8> {
    let bytes = take_slice(buf, 1, what)?;
    Ok(bytes[0])
}

fn take_u16(buf: &mut &[u8], what: &str) -> Result<u16> {
    let bytes = take_slice(buf, 2, what)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn take_array<const N: usize>(buf: &mut &[u8], what: &str) -> Result<[u8; N]> {
    let bytes = take_slice(buf, N, what)?;
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

fn take_slice<'a>(buf: &mut &'a [u8], n: usize, what: &str) -> Result<&'a [u8]> {
    if buf.len() < n {
        return Err(Error::MalformedMessage(format!(
            "truncated {what}: need {n} bytes, have {}",
            buf.len()
        )));
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}
