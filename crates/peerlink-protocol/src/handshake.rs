//! Authenticated key-exchange state machine
//!
//! The driver consumes raw frame payloads and emits frames to send plus,
//! on completion, the derived session keys. It never retries internally:
//! any verification failure is terminal, and retransmission is the
//! signaling/transport layer's concern.
//!
//! Message flow (two round trips, exactly two Finished frames):
//!
//! ```text
//! initiator                         responder
//!   | -- MessageA (suites, keys) ---> |   idle -> waitingFinished
//!   | <-- MessageB (suite, sig) ----- |
//!   | -- Finished ------------------> |   established, replies
//!   | <-- Finished ------------------ |   established
//! ```

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use peerlink_core::wire::{
    HandshakeFinished, HandshakeFrame, HandshakeMessageA, HandshakeMessageB, OfferedSuite,
};
use peerlink_crypto::kdf::{compute_auth_tag, derive_session_keys, verify_auth_tag, FinishedKeys, SessionKeys};
use peerlink_crypto::kex::{initiate, respond, KexInitiation};
use peerlink_crypto::keys::{generate_nonce, verify_signature, SigningKeyPair};
use peerlink_crypto::suite::{select_suite, suite_by_id, CipherSuite, SuitePolicy};
use peerlink_crypto::PROTOCOL_VERSION;

use crate::error::{ProtocolError, Result};

/// Which side of the handshake this driver plays
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeRole {
    /// Sends MessageA
    Initiator,
    /// Answers with MessageB
    Responder,
}

/// Coarse driver state for inspection
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Nothing sent or received yet
    Idle,
    /// MessageA sent, awaiting MessageB
    Offered,
    /// Keys derived, awaiting the peer's Finished
    WaitingFinished,
    /// Both Finished frames verified
    Established,
    /// Terminal failure
    Failed(String),
}

/// What the caller must do after feeding the driver a frame
pub enum HandshakeEvent {
    /// Frame was not for the current state (tolerated); nothing to do
    Ignored,
    /// Transmit this frame payload
    Send(Vec<u8>),
    /// Handshake complete: install the keys into a secure channel
    Established {
        /// Derived directional session keys
        keys: SessionKeys,
        /// Responder's own Finished frame, sent after verifying the peer's
        reply: Option<Vec<u8>>,
    },
}

enum DriverState {
    Idle,
    Offered {
        nonce: [u8; 32],
        offers: Vec<(CipherSuite, KexInitiation)>,
    },
    WaitingFinished {
        suite: CipherSuite,
        transcript_hash: [u8; 32],
        keys: Option<SessionKeys>,
        finished: FinishedKeys,
        reply_finished: bool,
    },
    Established,
    Failed(String),
}

/// The handshake state machine
pub struct HandshakeDriver {
    role: HandshakeRole,
    policy: SuitePolicy,
    signing: SigningKeyPair,
    state: DriverState,
}

impl HandshakeDriver {
    /// Create a driver with a fresh signing identity
    pub fn new(role: HandshakeRole, policy: SuitePolicy) -> Self {
        Self::with_signing_keys(role, policy, SigningKeyPair::generate())
    }

    /// Create a driver with an existing signing identity
    pub fn with_signing_keys(
        role: HandshakeRole,
        policy: SuitePolicy,
        signing: SigningKeyPair,
    ) -> Self {
        Self {
            role,
            policy,
            signing,
            state: DriverState::Idle,
        }
    }

    /// Current coarse state
    pub fn status(&self) -> HandshakeStatus {
        match &self.state {
            DriverState::Idle => HandshakeStatus::Idle,
            DriverState::Offered { .. } => HandshakeStatus::Offered,
            DriverState::WaitingFinished { .. } => HandshakeStatus::WaitingFinished,
            DriverState::Established => HandshakeStatus::Established,
            DriverState::Failed(reason) => HandshakeStatus::Failed(reason.clone()),
        }
    }

    /// Initiator only: build MessageA and move to `offered`
    pub fn start(&mut self) -> Result<Vec<u8>> {
        if self.role != HandshakeRole::Initiator {
            return Err(ProtocolError::InvalidState(
                "only the initiator starts a handshake".to_string(),
            ));
        }
        if !matches!(self.state, DriverState::Idle) {
            return Err(ProtocolError::InvalidState(
                "handshake already started".to_string(),
            ));
        }

        let suites = self.policy.offered_suites();
        if suites.is_empty() {
            return Err(self.fail("policy permits no cipher suites".to_string()));
        }

        let nonce = generate_nonce();
        let mut offers = Vec::with_capacity(suites.len());
        let mut wire_offers = Vec::with_capacity(suites.len());
        for suite in suites {
            let init = match initiate(&suite) {
                Ok(init) => init,
                Err(err) => return Err(self.fail(format!("key generation failed: {err}"))),
            };
            wire_offers.push(OfferedSuite {
                id: suite.id,
                kex_public: init.public.clone(),
            });
            offers.push((suite, init));
        }

        let message = HandshakeMessageA {
            version: PROTOCOL_VERSION,
            nonce,
            signing_public: self.signing.public_key_bytes(),
            offered: wire_offers,
        };

        debug!(suites = message.offered.len(), "handshake offered");
        self.state = DriverState::Offered { nonce, offers };
        Ok(message.encode())
    }

    /// Feed one inbound frame payload to the driver
    pub fn handle_frame(&mut self, payload: &[u8]) -> Result<HandshakeEvent> {
        match &self.state {
            DriverState::Failed(reason) => {
                return Err(ProtocolError::Handshake(reason.clone()));
            }
            // a straggling duplicate Finished after establishment is harmless
            DriverState::Established => return Ok(HandshakeEvent::Ignored),
            _ => {}
        }

        let frame = match HandshakeFrame::decode(payload) {
            Ok(frame) => frame,
            // before any handshake progress, undecodable frames belong to
            // other traffic multiplexed on the same stream
            Err(_) if matches!(self.state, DriverState::Idle) => {
                return Ok(HandshakeEvent::Ignored);
            }
            Err(err) => return Err(self.fail(format!("undecodable handshake frame: {err}"))),
        };

        match frame {
            HandshakeFrame::A(msg) => self.on_message_a(msg),
            HandshakeFrame::B(msg) => self.on_message_b(msg),
            HandshakeFrame::Finished(msg) => self.on_finished(msg),
        }
    }

    fn on_message_a(&mut self, msg: HandshakeMessageA) -> Result<HandshakeEvent> {
        match (self.role, &self.state) {
            (HandshakeRole::Responder, DriverState::Idle) => {}
            // duplicate or replayed MessageA after progress
            (_, DriverState::Offered { .. }) | (_, DriverState::WaitingFinished { .. }) => {
                debug!("ignoring duplicate MessageA");
                return Ok(HandshakeEvent::Ignored);
            }
            _ => return Err(self.fail("unexpected MessageA".to_string())),
        }

        if msg.version != PROTOCOL_VERSION {
            return Err(self.fail(format!(
                "peer speaks version {}, expected {PROTOCOL_VERSION}",
                msg.version
            )));
        }

        let offered_ids: Vec<u16> = msg.offered.iter().map(|o| o.id).collect();
        let suite = match select_suite(&offered_ids, &self.policy) {
            Ok(suite) => suite,
            Err(err) => return Err(self.fail(format!("suite negotiation failed: {err}"))),
        };
        // select_suite only returns ids present in the offer
        let offer = match msg.offered.iter().find(|o| o.id == suite.id) {
            Some(offer) => offer,
            None => return Err(self.fail("chosen suite missing from offer".to_string())),
        };

        let (shared, kex_reply) = match respond(&suite, &offer.kex_public) {
            Ok(out) => out,
            Err(err) => return Err(self.fail(format!("key exchange failed: {err}"))),
        };

        let signing_public = self.signing.public_key_bytes();
        let transcript = transcript_bytes(
            msg.version,
            suite.id,
            &msg.nonce,
            &msg.signing_public,
            &offer.kex_public,
            &signing_public,
            &kex_reply,
        );
        let signature = self.signing.sign(&transcript);
        let transcript_hash = hash_transcript(&transcript);

        let (keys, finished) =
            match derive_session_keys(suite.id, &shared, &transcript_hash, false) {
                Ok(out) => out,
                Err(err) => return Err(self.fail(format!("key derivation failed: {err}"))),
            };

        let reply = HandshakeMessageB {
            version: PROTOCOL_VERSION,
            suite_id: suite.id,
            kex_reply,
            signing_public,
            signature,
        };

        debug!(suite = format_args!("{:#06x}", suite.id), "suite negotiated");
        self.state = DriverState::WaitingFinished {
            suite,
            transcript_hash,
            keys: Some(keys),
            finished,
            reply_finished: true,
        };
        Ok(HandshakeEvent::Send(reply.encode()))
    }

    fn on_message_b(&mut self, msg: HandshakeMessageB) -> Result<HandshakeEvent> {
        let (nonce, offers) = match (self.role, std::mem::replace(&mut self.state, DriverState::Idle)) {
            (HandshakeRole::Initiator, DriverState::Offered { nonce, offers }) => (nonce, offers),
            (_, previous) => {
                self.state = previous;
                return Err(self.fail("unexpected MessageB".to_string()));
            }
        };

        if msg.version != PROTOCOL_VERSION {
            return Err(self.fail(format!(
                "peer speaks version {}, expected {PROTOCOL_VERSION}",
                msg.version
            )));
        }

        let suite = match suite_by_id(msg.suite_id) {
            Ok(suite) => suite,
            Err(err) => return Err(self.fail(format!("peer chose unknown suite: {err}"))),
        };
        if !self.policy.permits(&suite) {
            return Err(self.fail(format!(
                "peer chose suite {:#06x} below local policy",
                suite.id
            )));
        }

        let (suite, init) = match offers.into_iter().find(|(s, _)| s.id == suite.id) {
            Some(entry) => entry,
            None => return Err(self.fail("peer chose a suite we never offered".to_string())),
        };

        let transcript = transcript_bytes(
            msg.version,
            suite.id,
            &nonce,
            &self.signing.public_key_bytes(),
            &init.public,
            &msg.signing_public,
            &msg.kex_reply,
        );
        if let Err(err) = verify_signature(&msg.signing_public, &transcript, &msg.signature) {
            return Err(self.fail(format!("transcript signature invalid: {err}")));
        }

        let shared = match init.complete(&suite, &msg.kex_reply) {
            Ok(shared) => shared,
            Err(err) => return Err(self.fail(format!("key exchange failed: {err}"))),
        };
        let transcript_hash = hash_transcript(&transcript);

        let (keys, finished) =
            match derive_session_keys(suite.id, &shared, &transcript_hash, true) {
                Ok(out) => out,
                Err(err) => return Err(self.fail(format!("key derivation failed: {err}"))),
            };

        let confirm = HandshakeFinished {
            version: PROTOCOL_VERSION,
            suite_id: suite.id,
            mac: compute_auth_tag(&finished.send, &transcript_hash),
        };

        debug!(suite = format_args!("{:#06x}", suite.id), "MessageB verified");
        self.state = DriverState::WaitingFinished {
            suite,
            transcript_hash,
            keys: Some(keys),
            finished,
            reply_finished: false,
        };
        Ok(HandshakeEvent::Send(confirm.encode()))
    }

    fn on_finished(&mut self, msg: HandshakeFinished) -> Result<HandshakeEvent> {
        let (suite, transcript_hash, keys, finished, reply_finished) =
            match std::mem::replace(&mut self.state, DriverState::Idle) {
                DriverState::WaitingFinished {
                    suite,
                    transcript_hash,
                    keys,
                    finished,
                    reply_finished,
                } => (suite, transcript_hash, keys, finished, reply_finished),
                previous => {
                    self.state = previous;
                    return Err(self.fail("unexpected Finished".to_string()));
                }
            };

        if msg.suite_id != suite.id {
            return Err(self.fail("Finished names a different suite".to_string()));
        }
        if !verify_auth_tag(&finished.recv, &transcript_hash, &msg.mac) {
            warn!("Finished MAC verification failed");
            return Err(self.fail("Finished MAC verification failed".to_string()));
        }

        let keys = match keys {
            Some(keys) => keys,
            None => return Err(self.fail("session keys already taken".to_string())),
        };

        let reply = reply_finished.then(|| {
            HandshakeFinished {
                version: PROTOCOL_VERSION,
                suite_id: suite.id,
                mac: compute_auth_tag(&finished.send, &transcript_hash),
            }
            .encode()
        });

        debug!(suite = format_args!("{:#06x}", suite.id), "handshake established");
        self.state = DriverState::Established;
        Ok(HandshakeEvent::Established { keys, reply })
    }

    fn fail(&mut self, reason: String) -> ProtocolError {
        self.state = DriverState::Failed(reason.clone());
        ProtocolError::Handshake(reason)
    }
}

/// The ordered field concatenation both signature and MAC computations bind
fn transcript_bytes(
    version: u8,
    suite_id: u16,
    nonce: &[u8; 32],
    initiator_signing: &[u8; 32],
    initiator_kex: &[u8],
    responder_signing: &[u8; 32],
    kex_reply: &[u8],
) -> Vec<u8> {
    let mut transcript = Vec::with_capacity(
        22 + 1 + 2 + 32 + 32 + initiator_kex.len() + 32 + kex_reply.len(),
    );
    transcript.extend_from_slice(b"PeerLink_v1_Transcript");
    transcript.push(version);
    transcript.extend_from_slice(&suite_id.to_be_bytes());
    transcript.extend_from_slice(nonce);
    transcript.extend_from_slice(initiator_signing);
    transcript.extend_from_slice(initiator_kex);
    transcript.extend_from_slice(responder_signing);
    transcript.extend_from_slice(kex_reply);
    transcript
}

fn hash_transcript(transcript: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(transcript);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_crypto::suite::{
        SuiteClass, SUITE_CLASSIC_X25519, SUITE_HYBRID_X25519_KYBER768,
    };

    fn run_to_completion(
        initiator_policy: SuitePolicy,
        responder_policy: SuitePolicy,
    ) -> (SessionKeys, SessionKeys) {
        let mut initiator = HandshakeDriver::new(HandshakeRole::Initiator, initiator_policy);
        let mut responder = HandshakeDriver::new(HandshakeRole::Responder, responder_policy);

        let msg_a = initiator.start().unwrap();

        let msg_b = match responder.handle_frame(&msg_a).unwrap() {
            HandshakeEvent::Send(frame) => frame,
            _ => panic!("responder should reply with MessageB"),
        };

        let finished_i = match initiator.handle_frame(&msg_b).unwrap() {
            HandshakeEvent::Send(frame) => frame,
            _ => panic!("initiator should reply with Finished"),
        };
        assert_eq!(initiator.status(), HandshakeStatus::WaitingFinished);

        let (responder_keys, finished_r) = match responder.handle_frame(&finished_i).unwrap() {
            HandshakeEvent::Established { keys, reply: Some(frame) } => (keys, frame),
            _ => panic!("responder should establish and reply with Finished"),
        };
        assert_eq!(responder.status(), HandshakeStatus::Established);

        let initiator_keys = match initiator.handle_frame(&finished_r).unwrap() {
            HandshakeEvent::Established { keys, reply: None } => keys,
            _ => panic!("initiator should establish without a further reply"),
        };
        assert_eq!(initiator.status(), HandshakeStatus::Established);

        (initiator_keys, responder_keys)
    }

    #[test]
    fn test_full_handshake_default_policies() {
        let (i, r) = run_to_completion(SuitePolicy::default(), SuitePolicy::default());

        // hybrid preferred when both sides allow it
        assert_eq!(i.suite_id, SUITE_HYBRID_X25519_KYBER768);
        assert_eq!(i.suite_id, r.suite_id);
        assert_eq!(i.send, r.recv);
        assert_eq!(i.recv, r.send);
        assert_ne!(i.send, i.recv);
    }

    #[test]
    fn test_pqc_only_responder_selects_hybrid() {
        // initiator offers [hybrid, classic]; responder only accepts PQC
        let responder_policy = SuitePolicy {
            require_pqc: true,
            allow_classic_fallback: false,
            minimum_tier: SuiteClass::Hybrid,
        };
        let (i, _) = run_to_completion(SuitePolicy::default(), responder_policy);
        assert_eq!(i.suite_id, SUITE_HYBRID_X25519_KYBER768);
    }

    #[test]
    fn test_classic_only_initiator_negotiates_classic() {
        let initiator_policy = SuitePolicy {
            require_pqc: false,
            allow_classic_fallback: true,
            minimum_tier: SuiteClass::Classic,
        };
        // restrict the offer by building MessageA from a driver whose policy
        // excludes hybrid is not possible via public policy knobs alone, so
        // check the mirror case: both defaults already cover hybrid; here we
        // verify the responder accepts a classic-only offer
        let mut initiator =
            HandshakeDriver::new(HandshakeRole::Initiator, initiator_policy);
        let mut responder =
            HandshakeDriver::new(HandshakeRole::Responder, SuitePolicy::default());

        let mut msg_a = initiator.start().unwrap();
        // the offer contains hybrid first; drop it to simulate a
        // classic-only initiator build
        let decoded = match HandshakeFrame::decode(&msg_a).unwrap() {
            HandshakeFrame::A(m) => m,
            _ => unreachable!(),
        };
        let classic_only = HandshakeMessageA {
            offered: decoded
                .offered
                .iter()
                .filter(|o| o.id == SUITE_CLASSIC_X25519)
                .cloned()
                .collect(),
            ..decoded
        };
        msg_a = classic_only.encode();

        match responder.handle_frame(&msg_a).unwrap() {
            HandshakeEvent::Send(frame) => {
                let msg_b = match HandshakeFrame::decode(&frame).unwrap() {
                    HandshakeFrame::B(m) => m,
                    _ => panic!("expected MessageB"),
                };
                assert_eq!(msg_b.suite_id, SUITE_CLASSIC_X25519);
            }
            _ => panic!("responder should reply"),
        }
    }

    #[test]
    fn test_pqc_required_responder_rejects_classic_only_offer() {
        let mut initiator =
            HandshakeDriver::new(HandshakeRole::Initiator, SuitePolicy::default());
        let mut responder = HandshakeDriver::new(
            HandshakeRole::Responder,
            SuitePolicy {
                require_pqc: true,
                allow_classic_fallback: false,
                minimum_tier: SuiteClass::Hybrid,
            },
        );

        let msg_a = initiator.start().unwrap();
        let decoded = match HandshakeFrame::decode(&msg_a).unwrap() {
            HandshakeFrame::A(m) => m,
            _ => unreachable!(),
        };
        let classic_only = HandshakeMessageA {
            offered: decoded
                .offered
                .iter()
                .filter(|o| o.id == SUITE_CLASSIC_X25519)
                .cloned()
                .collect(),
            ..decoded
        };

        assert!(responder.handle_frame(&classic_only.encode()).is_err());
        assert!(matches!(responder.status(), HandshakeStatus::Failed(_)));
    }

    #[test]
    fn test_initiator_rejects_policy_violating_suite_choice() {
        let mut initiator = HandshakeDriver::new(
            HandshakeRole::Initiator,
            SuitePolicy {
                require_pqc: true,
                allow_classic_fallback: false,
                minimum_tier: SuiteClass::Hybrid,
            },
        );
        let mut responder =
            HandshakeDriver::new(HandshakeRole::Responder, SuitePolicy::default());

        let msg_a = initiator.start().unwrap();
        let msg_b = match responder.handle_frame(&msg_a).unwrap() {
            HandshakeEvent::Send(frame) => frame,
            _ => panic!("expected MessageB"),
        };

        // forge a MessageB that picks classic despite the initiator's policy
        let decoded = match HandshakeFrame::decode(&msg_b).unwrap() {
            HandshakeFrame::B(m) => m,
            _ => unreachable!(),
        };
        let forged = HandshakeMessageB {
            suite_id: SUITE_CLASSIC_X25519,
            kex_reply: vec![0u8; 32],
            ..decoded
        };

        assert!(initiator.handle_frame(&forged.encode()).is_err());
        assert!(matches!(initiator.status(), HandshakeStatus::Failed(_)));
    }

    #[test]
    fn test_tampered_signature_fails() {
        let mut initiator =
            HandshakeDriver::new(HandshakeRole::Initiator, SuitePolicy::default());
        let mut responder =
            HandshakeDriver::new(HandshakeRole::Responder, SuitePolicy::default());

        let msg_a = initiator.start().unwrap();
        let msg_b = match responder.handle_frame(&msg_a).unwrap() {
            HandshakeEvent::Send(frame) => frame,
            _ => panic!("expected MessageB"),
        };

        let mut decoded = match HandshakeFrame::decode(&msg_b).unwrap() {
            HandshakeFrame::B(m) => m,
            _ => unreachable!(),
        };
        decoded.signature[0] ^= 0x01;

        assert!(initiator.handle_frame(&decoded.encode()).is_err());
        assert!(matches!(initiator.status(), HandshakeStatus::Failed(_)));
    }

    #[test]
    fn test_tampered_finished_mac_fails() {
        let mut initiator =
            HandshakeDriver::new(HandshakeRole::Initiator, SuitePolicy::default());
        let mut responder =
            HandshakeDriver::new(HandshakeRole::Responder, SuitePolicy::default());

        let msg_a = initiator.start().unwrap();
        let msg_b = match responder.handle_frame(&msg_a).unwrap() {
            HandshakeEvent::Send(frame) => frame,
            _ => panic!("expected MessageB"),
        };
        let finished_i = match initiator.handle_frame(&msg_b).unwrap() {
            HandshakeEvent::Send(frame) => frame,
            _ => panic!("expected Finished"),
        };

        let mut decoded = match HandshakeFrame::decode(&finished_i).unwrap() {
            HandshakeFrame::Finished(m) => m,
            _ => unreachable!(),
        };
        decoded.mac[0] ^= 0x01;

        assert!(responder.handle_frame(&decoded.encode()).is_err());
        assert!(matches!(responder.status(), HandshakeStatus::Failed(_)));
    }

    #[test]
    fn test_garbage_in_idle_is_ignored() {
        let mut responder =
            HandshakeDriver::new(HandshakeRole::Responder, SuitePolicy::default());

        match responder.handle_frame(&[0x99, 0x42, 0x13]).unwrap() {
            HandshakeEvent::Ignored => {}
            _ => panic!("garbage in idle must be ignored"),
        }
        assert_eq!(responder.status(), HandshakeStatus::Idle);
    }

    #[test]
    fn test_garbage_after_progress_is_fatal() {
        let mut initiator =
            HandshakeDriver::new(HandshakeRole::Initiator, SuitePolicy::default());
        initiator.start().unwrap();

        assert!(initiator.handle_frame(&[0x01, 0x02]).is_err());
        assert!(matches!(initiator.status(), HandshakeStatus::Failed(_)));
    }

    #[test]
    fn test_duplicate_message_a_ignored() {
        let mut initiator =
            HandshakeDriver::new(HandshakeRole::Initiator, SuitePolicy::default());
        let mut responder =
            HandshakeDriver::new(HandshakeRole::Responder, SuitePolicy::default());

        let msg_a = initiator.start().unwrap();
        let first = responder.handle_frame(&msg_a).unwrap();
        assert!(matches!(first, HandshakeEvent::Send(_)));

        // replayed MessageA must not disturb the driver
        match responder.handle_frame(&msg_a).unwrap() {
            HandshakeEvent::Ignored => {}
            _ => panic!("duplicate MessageA must be ignored"),
        }
        assert_eq!(responder.status(), HandshakeStatus::WaitingFinished);
    }

    #[test]
    fn test_failure_is_terminal() {
        let mut initiator =
            HandshakeDriver::new(HandshakeRole::Initiator, SuitePolicy::default());
        initiator.start().unwrap();
        assert!(initiator.handle_frame(&[0x02]).is_err());

        // anything after failure keeps failing, never restarts
        assert!(initiator.handle_frame(&[0x01]).is_err());
        assert!(matches!(initiator.status(), HandshakeStatus::Failed(_)));
    }
}
