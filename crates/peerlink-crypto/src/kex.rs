//! Key exchange providers
//!
//! One initiate/respond/complete flow covers both plain Diffie-Hellman and
//! KEM-style hybrid exchanges:
//!
//! - the initiator calls [`initiate`] and sends the public material,
//! - the responder calls [`respond`] with it, obtaining the shared secret
//!   and the reply to send back,
//! - the initiator calls [`KexInitiation::complete`] with the reply.
//!
//! The hybrid suite concatenates the X25519 DH output with the Kyber768
//! shared secret before key derivation.

use pqcrypto_kyber::kyber768;
use pqcrypto_traits::kem::{Ciphertext as _, PublicKey as _, SharedSecret as _};

use crate::error::{CryptoError, Result};
use crate::keys::{EphemeralKeyPair, SharedSecret};
use crate::suite::{CipherSuite, SuiteClass, X25519_PUBLIC_LEN};

enum InitiatorState {
    Classic {
        dh: EphemeralKeyPair,
    },
    Hybrid {
        dh: EphemeralKeyPair,
        kem_secret: kyber768::SecretKey,
    },
}

/// In-progress key exchange held by the initiator between MessageA and MessageB
pub struct KexInitiation {
    /// Public material to place in MessageA
    pub public: Vec<u8>,
    state: InitiatorState,
}

/// Begin a key exchange for the given suite
pub fn initiate(suite: &CipherSuite) -> Result<KexInitiation> {
    let dh = EphemeralKeyPair::generate();
    match suite.class {
        SuiteClass::Classic => Ok(KexInitiation {
            public: dh.public_key_bytes().to_vec(),
            state: InitiatorState::Classic { dh },
        }),
        SuiteClass::Hybrid => {
            let (kem_public, kem_secret) = kyber768::keypair();
            let mut public = Vec::with_capacity(suite.kex_public_len);
            public.extend_from_slice(&dh.public_key_bytes());
            public.extend_from_slice(kem_public.as_bytes());
            Ok(KexInitiation {
                public,
                state: InitiatorState::Hybrid { dh, kem_secret },
            })
        }
    }
}

/// Responder side: consume the initiator's public material, produce the
/// shared secret and the reply for MessageB
pub fn respond(suite: &CipherSuite, initiator_public: &[u8]) -> Result<(SharedSecret, Vec<u8>)> {
    if initiator_public.len() != suite.kex_public_len {
        return Err(CryptoError::InvalidPeerKey(format!(
            "kex public must be {} bytes, got {}",
            suite.kex_public_len,
            initiator_public.len()
        )));
    }

    let dh = EphemeralKeyPair::generate();
    let dh_secret = dh.diffie_hellman(&initiator_public[..X25519_PUBLIC_LEN])?;

    match suite.class {
        SuiteClass::Classic => Ok((dh_secret, dh.public_key_bytes().to_vec())),
        SuiteClass::Hybrid => {
            let kem_public = kyber768::PublicKey::from_bytes(&initiator_public[X25519_PUBLIC_LEN..])
                .map_err(|_| {
                    CryptoError::InvalidPeerKey("Malformed Kyber768 public key".to_string())
                })?;
            let (kem_shared, kem_ciphertext) = kyber768::encapsulate(&kem_public);

            let mut reply = Vec::with_capacity(suite.kex_reply_len);
            reply.extend_from_slice(&dh.public_key_bytes());
            reply.extend_from_slice(kem_ciphertext.as_bytes());

            Ok((SharedSecret::concat(&dh_secret, kem_shared.as_bytes()), reply))
        }
    }
}

impl KexInitiation {
    /// Initiator side: consume the responder's reply, produce the shared secret
    pub fn complete(self, suite: &CipherSuite, reply: &[u8]) -> Result<SharedSecret> {
        if reply.len() != suite.kex_reply_len {
            return Err(CryptoError::InvalidPeerKey(format!(
                "kex reply must be {} bytes, got {}",
                suite.kex_reply_len,
                reply.len()
            )));
        }

        match self.state {
            InitiatorState::Classic { dh } => dh.diffie_hellman(reply),
            InitiatorState::Hybrid { dh, kem_secret } => {
                let dh_secret = dh.diffie_hellman(&reply[..X25519_PUBLIC_LEN])?;
                let ciphertext = kyber768::Ciphertext::from_bytes(&reply[X25519_PUBLIC_LEN..])
                    .map_err(|_| {
                        CryptoError::InvalidPeerKey("Malformed Kyber768 ciphertext".to_string())
                    })?;
                let kem_shared = kyber768::decapsulate(&ciphertext, &kem_secret);
                Ok(SharedSecret::concat(&dh_secret, kem_shared.as_bytes()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::{CLASSIC_X25519, HYBRID_X25519_KYBER768};

    #[test]
    fn test_classic_exchange_agrees() {
        let init = initiate(&CLASSIC_X25519).unwrap();
        assert_eq!(init.public.len(), CLASSIC_X25519.kex_public_len);

        let (responder_secret, reply) = respond(&CLASSIC_X25519, &init.public).unwrap();
        assert_eq!(reply.len(), CLASSIC_X25519.kex_reply_len);

        let initiator_secret = init.complete(&CLASSIC_X25519, &reply).unwrap();
        assert_eq!(initiator_secret.as_bytes(), responder_secret.as_bytes());
        assert_eq!(initiator_secret.as_bytes().len(), 32);
    }

    #[test]
    fn test_hybrid_exchange_agrees() {
        let init = initiate(&HYBRID_X25519_KYBER768).unwrap();
        assert_eq!(init.public.len(), HYBRID_X25519_KYBER768.kex_public_len);

        let (responder_secret, reply) = respond(&HYBRID_X25519_KYBER768, &init.public).unwrap();
        assert_eq!(reply.len(), HYBRID_X25519_KYBER768.kex_reply_len);

        let initiator_secret = init.complete(&HYBRID_X25519_KYBER768, &reply).unwrap();
        assert_eq!(initiator_secret.as_bytes(), responder_secret.as_bytes());
        // 32 bytes DH output + 32 bytes KEM shared secret
        assert_eq!(initiator_secret.as_bytes().len(), 64);
    }

    #[test]
    fn test_respond_rejects_wrong_length() {
        assert!(respond(&HYBRID_X25519_KYBER768, &[0u8; 32]).is_err());
        assert!(respond(&CLASSIC_X25519, &[0u8; 31]).is_err());
    }

    #[test]
    fn test_complete_rejects_wrong_length() {
        let init = initiate(&CLASSIC_X25519).unwrap();
        assert!(init.complete(&CLASSIC_X25519, &[0u8; 64]).is_err());
    }
}
