//! Cipher suite registry, policy, and negotiation
//!
//! Suites are compile-time constants with stable numeric wire ids. The
//! registry is ordered: post-quantum hybrid suites come before classic ones,
//! so a first-match negotiation naturally prefers them.

use serde::{Deserialize, Serialize};

use crate::aead::AeadAlgorithm;
use crate::error::{CryptoError, Result};

/// Wire id of the classic X25519 / Ed25519 / ChaCha20-Poly1305 suite
pub const SUITE_CLASSIC_X25519: u16 = 0x0001;

/// Wire id of the hybrid X25519+Kyber768 / Ed25519 / AES-256-GCM suite
pub const SUITE_HYBRID_X25519_KYBER768: u16 = 0x0101;

/// X25519 public key length in bytes
pub const X25519_PUBLIC_LEN: usize = 32;

/// Kyber768 encapsulation public key length in bytes
pub const KYBER768_PUBLIC_LEN: usize = 1184;

/// Kyber768 ciphertext length in bytes
pub const KYBER768_CIPHERTEXT_LEN: usize = 1088;

/// Suite classification, ordered by cryptographic tier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SuiteClass {
    /// Classical primitives only
    Classic,
    /// Classical combined with a post-quantum primitive
    Hybrid,
}

impl SuiteClass {
    /// Whether this class counts as post-quantum for negotiation preference
    pub fn is_post_quantum(&self) -> bool {
        matches!(self, SuiteClass::Hybrid)
    }
}

/// An immutable cipher suite definition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CipherSuite {
    /// Stable numeric wire id
    pub id: u16,
    /// Classification used by negotiation policy
    pub class: SuiteClass,
    /// AEAD algorithm for the secure channel
    pub aead: AeadAlgorithm,
    /// Length of the initiator's key-exchange public material
    pub kex_public_len: usize,
    /// Length of the responder's key-exchange reply material
    pub kex_reply_len: usize,
}

/// Classic suite: X25519 key exchange, ChaCha20-Poly1305 channel
pub const CLASSIC_X25519: CipherSuite = CipherSuite {
    id: SUITE_CLASSIC_X25519,
    class: SuiteClass::Classic,
    aead: AeadAlgorithm::ChaCha20Poly1305,
    kex_public_len: X25519_PUBLIC_LEN,
    kex_reply_len: X25519_PUBLIC_LEN,
};

/// Hybrid suite: X25519 + Kyber768 KEM, AES-256-GCM channel
pub const HYBRID_X25519_KYBER768: CipherSuite = CipherSuite {
    id: SUITE_HYBRID_X25519_KYBER768,
    class: SuiteClass::Hybrid,
    aead: AeadAlgorithm::Aes256Gcm,
    kex_public_len: X25519_PUBLIC_LEN + KYBER768_PUBLIC_LEN,
    kex_reply_len: X25519_PUBLIC_LEN + KYBER768_CIPHERTEXT_LEN,
};

/// All suites this build supports, in preference order (hybrid first)
pub fn supported_suites() -> &'static [CipherSuite] {
    &[HYBRID_X25519_KYBER768, CLASSIC_X25519]
}

/// Look up a suite by wire id
pub fn suite_by_id(id: u16) -> Result<CipherSuite> {
    supported_suites()
        .iter()
        .find(|s| s.id == id)
        .copied()
        .ok_or(CryptoError::UnsupportedSuite(id))
}

/// Local negotiation policy
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SuitePolicy {
    /// Refuse to establish a session without a post-quantum suite
    pub require_pqc: bool,
    /// Offer classic suites when post-quantum is not required
    pub allow_classic_fallback: bool,
    /// Lowest acceptable suite class
    pub minimum_tier: SuiteClass,
}

impl Default for SuitePolicy {
    fn default() -> Self {
        Self {
            require_pqc: false,
            allow_classic_fallback: true,
            minimum_tier: SuiteClass::Classic,
        }
    }
}

impl SuitePolicy {
    /// Whether a suite is acceptable under this policy
    pub fn permits(&self, suite: &CipherSuite) -> bool {
        if suite.class < self.minimum_tier {
            return false;
        }
        if suite.class.is_post_quantum() {
            return true;
        }
        !self.require_pqc && self.allow_classic_fallback
    }

    /// The ordered suite list an initiator offers under this policy
    pub fn offered_suites(&self) -> Vec<CipherSuite> {
        supported_suites()
            .iter()
            .filter(|s| self.permits(s))
            .copied()
            .collect()
    }
}

/// Responder-side suite selection.
///
/// Picks the first offered suite the local registry supports, preferring
/// post-quantum-classified suites when any are mutually supported.
pub fn select_suite(offered: &[u16], policy: &SuitePolicy) -> Result<CipherSuite> {
    let acceptable = |id: &u16| {
        suite_by_id(*id)
            .ok()
            .filter(|s| policy.permits(s))
    };

    if let Some(suite) = offered
        .iter()
        .filter_map(acceptable)
        .find(|s| s.class.is_post_quantum())
    {
        return Ok(suite);
    }

    offered
        .iter()
        .filter_map(acceptable)
        .next()
        .ok_or(CryptoError::NoCommonSuite)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_registry_prefers_hybrid() {
        let suites = supported_suites();
        assert_eq!(suites[0].id, SUITE_HYBRID_X25519_KYBER768);
        assert!(suites[0].class.is_post_quantum());
    }

    #[test]
    fn test_lookup_unknown_id() {
        assert!(matches!(
            suite_by_id(0xdead),
            Err(CryptoError::UnsupportedSuite(0xdead))
        ));
    }

    #[test]
    fn test_select_prefers_pqc_even_when_offered_later() {
        let policy = SuitePolicy::default();
        let offered = vec![SUITE_CLASSIC_X25519, SUITE_HYBRID_X25519_KYBER768];
        let chosen = select_suite(&offered, &policy).unwrap();
        assert_eq!(chosen.id, SUITE_HYBRID_X25519_KYBER768);
    }

    #[test]
    fn test_select_classic_when_only_classic_offered() {
        let policy = SuitePolicy::default();
        let chosen = select_suite(&[SUITE_CLASSIC_X25519], &policy).unwrap();
        assert_eq!(chosen.id, SUITE_CLASSIC_X25519);
    }

    #[test]
    fn test_select_fails_without_common_suite() {
        let policy = SuitePolicy::default();
        assert!(matches!(
            select_suite(&[0x7777, 0x8888], &policy),
            Err(CryptoError::NoCommonSuite)
        ));
    }

    #[test]
    fn test_require_pqc_rejects_classic_only_offer() {
        let policy = SuitePolicy {
            require_pqc: true,
            allow_classic_fallback: false,
            minimum_tier: SuiteClass::Hybrid,
        };
        assert!(select_suite(&[SUITE_CLASSIC_X25519], &policy).is_err());
        assert!(!policy.permits(&CLASSIC_X25519));
        assert_eq!(policy.offered_suites(), vec![HYBRID_X25519_KYBER768]);
    }

    #[test]
    fn test_policy_default_offers_everything() {
        let policy = SuitePolicy::default();
        assert_eq!(policy.offered_suites().len(), supported_suites().len());
    }

    fn arbitrary_suite_id() -> impl Strategy<Value = u16> {
        prop_oneof![
            Just(SUITE_CLASSIC_X25519),
            Just(SUITE_HYBRID_X25519_KYBER768),
            // ids nobody supports
            0x2000u16..0xff00u16,
        ]
    }

    proptest! {
        #[test]
        fn prop_selection_is_first_match_preferring_pqc(
            offered in proptest::collection::vec(arbitrary_suite_id(), 0..8)
        ) {
            let policy = SuitePolicy::default();
            let result = select_suite(&offered, &policy);

            let known: Vec<CipherSuite> =
                offered.iter().filter_map(|id| suite_by_id(*id).ok()).collect();

            match result {
                Ok(chosen) => {
                    // chosen must be the first offered PQC suite if any PQC
                    // suite is mutually supported, else the first offered
                    // supported suite
                    let expected = known
                        .iter()
                        .find(|s| s.class.is_post_quantum())
                        .or_else(|| known.first())
                        .copied()
                        .unwrap();
                    prop_assert_eq!(chosen.id, expected.id);
                }
                Err(_) => prop_assert!(known.is_empty()),
            }
        }
    }
}
