//! CRL store and gossip distribution.
//!
//! The node holds exactly one authoritative CRL; a validly signed CRL
//! with a higher sequence replaces it wholesale, and a lower sequence is
//! always rejected. Distribution is announce/request/push gossip with
//! unsolicited emergency pushes re-flooded by anchors.

use std::path::{Path, PathBuf};

use genesis_mesh_domain::{Crl, TrustChain, TrustError};
use genesis_mesh_transport::Message;
use thiserror::Error;
use tracing::{debug, info, warn};

/// CRL store failures.
#[derive(Debug, Error)]
pub enum CrlError {
    /// Signature did not verify against the Network Authority key
    #[error("crl signature invalid: {0}")]
    InvalidSignature(#[from] TrustError),

    /// Sequence not higher than the held CRL
    #[error("crl sequence {incoming} does not supersede {held}")]
    StaleSequence {
        /// Sequence of the rejected CRL
        incoming: u64,
        /// Currently held sequence
        held: u64,
    },

    /// Persistence failure
    #[error("crl persistence error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted CRL could not be parsed
    #[error("crl parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Result of accepting a new CRL.
#[derive(Debug, Clone, PartialEq)]
pub struct CrlUpdate {
    /// The accepted sequence
    pub sequence: u64,
    /// Subjects revoked by this CRL that were not revoked before
    pub newly_revoked_subjects: Vec<String>,
}

/// Gossip reaction to an inbound CRL message.
#[derive(Debug, Clone, PartialEq)]
pub enum CrlGossipAction {
    /// Reply to the sender with this message
    Reply(Message),
    /// Accepted a pushed CRL; act on the update and re-flood the push
    Accepted(CrlUpdate),
    /// Nothing to do
    Ignore,
}

/// The authoritative CRL snapshot with optional file persistence.
pub struct CrlStore {
    current: Option<Crl>,
    path: Option<PathBuf>,
}

impl CrlStore {
    /// In-memory store.
    pub fn new() -> Self {
        Self {
            current: None,
            path: None,
        }
    }

    /// Store persisted at `path`; loads an existing snapshot if present.
    pub fn with_path(path: &Path) -> Result<Self, CrlError> {
        let current = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Some(serde_json::from_str(&content)?)
        } else {
            None
        };
        Ok(Self {
            current,
            path: Some(path.to_path_buf()),
        })
    }

    /// The held CRL, if any.
    pub fn current(&self) -> Option<&Crl> {
        self.current.as_ref()
    }

    /// The held sequence; 0 when no CRL is loaded.
    pub fn sequence(&self) -> u64 {
        self.current.as_ref().map(|crl| crl.sequence).unwrap_or(0)
    }

    /// Whether a certificate id is revoked by the held CRL.
    pub fn is_revoked_cert(&self, cert_id: &str) -> bool {
        self.current
            .as_ref()
            .map(|crl| crl.is_revoked_cert(cert_id))
            .unwrap_or(false)
    }

    /// Whether a subject key is revoked by the held CRL.
    pub fn is_revoked_subject(&self, subject_public_key: &str) -> bool {
        self.current
            .as_ref()
            .map(|crl| crl.is_revoked_subject(subject_public_key))
            .unwrap_or(false)
    }

    /// Verify and install a CRL. Higher sequence replaces in place;
    /// anything else is rejected.
    pub fn try_replace(&mut self, crl: Crl, trust: &TrustChain) -> Result<CrlUpdate, CrlError> {
        trust.verify_crl(&crl)?;

        let held = self.sequence();
        if crl.sequence <= held && self.current.is_some() {
            debug!(incoming = crl.sequence, held, "rejecting stale crl");
            return Err(CrlError::StaleSequence {
                incoming: crl.sequence,
                held,
            });
        }

        let newly_revoked_subjects = crl
            .revocations
            .iter()
            .filter(|r| !self.is_revoked_subject(&r.subject_public_key))
            .map(|r| r.subject_public_key.clone())
            .collect();

        info!(sequence = crl.sequence, revocations = crl.revocations.len(), "crl updated");
        let update = CrlUpdate {
            sequence: crl.sequence,
            newly_revoked_subjects,
        };
        self.current = Some(crl);
        self.persist()?;
        Ok(update)
    }

    /// The periodic sequence announcement, once a CRL is held.
    pub fn build_announce(&self) -> Option<Message> {
        self.current.as_ref().map(|crl| Message::CrlAnnounce {
            sequence: crl.sequence,
        })
    }

    /// React to a peer's sequence announcement.
    pub fn handle_announce(&self, peer_sequence: u64) -> CrlGossipAction {
        let held = self.sequence();
        if peer_sequence > held {
            // Peer is ahead; ask for the newer CRL.
            CrlGossipAction::Reply(Message::CrlRequest { since: held })
        } else if peer_sequence < held {
            // We are ahead; push ours unprompted.
            match self.current.as_ref() {
                Some(crl) => CrlGossipAction::Reply(Message::CrlPush(Box::new(crl.clone()))),
                None => CrlGossipAction::Ignore,
            }
        } else {
            CrlGossipAction::Ignore
        }
    }

    /// React to a CRL transfer request.
    pub fn handle_request(&self, since: u64) -> CrlGossipAction {
        match self.current.as_ref() {
            Some(crl) if crl.sequence > since => {
                CrlGossipAction::Reply(Message::CrlPush(Box::new(crl.clone())))
            }
            _ => CrlGossipAction::Ignore,
        }
    }

    /// React to a pushed CRL (solicited or emergency).
    ///
    /// On acceptance the caller recomputes per-peer certificate validity,
    /// drops revoked connections, and re-floods the push.
    pub fn handle_push(&mut self, crl: Crl, trust: &TrustChain) -> Result<CrlGossipAction, CrlError> {
        match self.try_replace(crl, trust) {
            Ok(update) => Ok(CrlGossipAction::Accepted(update)),
            Err(CrlError::StaleSequence { incoming, held }) => {
                debug!(incoming, held, "ignored stale crl push");
                Ok(CrlGossipAction::Ignore)
            }
            Err(e) => {
                warn!(error = %e, "rejected crl push");
                Err(e)
            }
        }
    }

    fn persist(&self) -> Result<(), CrlError> {
        let (path, crl) = match (&self.path, &self.current) {
            (Some(path), Some(crl)) => (path, crl),
            _ => return Ok(()),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(crl)?)?;
        Ok(())
    }
}

impl Default for CrlStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genesis_mesh_crypto::{keys, sign_object, KeyPair};
    use genesis_mesh_domain::{
        GenesisBlock, NetworkAuthority, PolicyManifestRef, Revocation,
    };

    struct Fixture {
        trust: TrustChain,
        na: KeyPair,
        na_key_id: String,
    }

    fn fixture() -> Fixture {
        let root = KeyPair::from_seed(&[1u8; 32]);
        let na = KeyPair::from_seed(&[2u8; 32]);
        let na_key_id = keys::key_id_for_b64(&na.public_key_b64()).unwrap();

        let mut genesis = GenesisBlock {
            network_name: "mesh-test".to_string(),
            network_version: "1".to_string(),
            root_public_key: root.public_key_b64(),
            network_authority: NetworkAuthority {
                public_key: na.public_key_b64(),
                valid_from: 0,
                valid_to: 100_000_000,
            },
            allowed_crypto_suites: vec!["ed25519".to_string()],
            allowed_transports: vec!["tcp".to_string()],
            policy_manifest: PolicyManifestRef {
                hash: "blake3:x".to_string(),
                url: None,
            },
            bootstrap_anchors: vec![],
            signatures: vec![],
        };
        let sig = sign_object(&genesis, root.signing_key(), root.key_id()).unwrap();
        genesis.signatures.push(sig);
        let trust = TrustChain::import(genesis, 1_000).unwrap();

        Fixture {
            trust,
            na,
            na_key_id,
        }
    }

    fn signed_crl(fx: &Fixture, sequence: u64, subjects: &[&str]) -> Crl {
        let mut crl = Crl {
            crl_id: format!("crl-{}", sequence),
            sequence,
            issued_at: 1_000,
            next_update: 1_000_000,
            issuer: fx.na_key_id.clone(),
            revocations: subjects
                .iter()
                .map(|subject| Revocation {
                    certificate_id: format!("cert-of-{}", subject),
                    subject_public_key: subject.to_string(),
                    revoked_at: 1_000,
                    reason: "compromised".to_string(),
                    issuer: fx.na_key_id.clone(),
                })
                .collect(),
            signatures: vec![],
        };
        let sig = sign_object(&crl, fx.na.signing_key(), &fx.na_key_id).unwrap();
        crl.signatures.push(sig);
        crl
    }

    #[test]
    fn test_replace_accepts_higher_sequence() {
        let fx = fixture();
        let mut store = CrlStore::new();

        let update = store.try_replace(signed_crl(&fx, 1, &[]), &fx.trust).unwrap();
        assert_eq!(update.sequence, 1);
        assert_eq!(store.sequence(), 1);

        let update = store
            .try_replace(signed_crl(&fx, 3, &["key-x"]), &fx.trust)
            .unwrap();
        assert_eq!(update.sequence, 3);
        assert_eq!(update.newly_revoked_subjects, vec!["key-x".to_string()]);
        assert!(store.is_revoked_subject("key-x"));
        assert!(store.is_revoked_cert("cert-of-key-x"));
    }

    #[test]
    fn test_lower_sequence_always_rejected() {
        let fx = fixture();
        let mut store = CrlStore::new();
        store.try_replace(signed_crl(&fx, 5, &[]), &fx.trust).unwrap();

        let result = store.try_replace(signed_crl(&fx, 4, &[]), &fx.trust);
        assert!(matches!(
            result,
            Err(CrlError::StaleSequence { incoming: 4, held: 5 })
        ));
        let result = store.try_replace(signed_crl(&fx, 5, &[]), &fx.trust);
        assert!(matches!(result, Err(CrlError::StaleSequence { .. })));
        assert_eq!(store.sequence(), 5);
    }

    #[test]
    fn test_unsigned_crl_rejected() {
        let fx = fixture();
        let mut store = CrlStore::new();
        let mut crl = signed_crl(&fx, 1, &[]);
        crl.signatures.clear();

        assert!(matches!(
            store.try_replace(crl, &fx.trust),
            Err(CrlError::InvalidSignature(_))
        ));
        assert_eq!(store.sequence(), 0);
    }

    #[test]
    fn test_tampered_crl_rejected() {
        let fx = fixture();
        let mut store = CrlStore::new();
        let mut crl = signed_crl(&fx, 1, &[]);
        crl.sequence = 9;

        assert!(matches!(
            store.try_replace(crl, &fx.trust),
            Err(CrlError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_newly_revoked_excludes_already_revoked() {
        let fx = fixture();
        let mut store = CrlStore::new();
        store
            .try_replace(signed_crl(&fx, 1, &["key-a"]), &fx.trust)
            .unwrap();

        let update = store
            .try_replace(signed_crl(&fx, 2, &["key-a", "key-b"]), &fx.trust)
            .unwrap();
        assert_eq!(update.newly_revoked_subjects, vec!["key-b".to_string()]);
    }

    #[test]
    fn test_announce_exchange() {
        let fx = fixture();
        let mut store = CrlStore::new();

        // No CRL yet: a peer ahead of us triggers a request from 0.
        assert_eq!(
            store.handle_announce(3),
            CrlGossipAction::Reply(Message::CrlRequest { since: 0 })
        );

        store.try_replace(signed_crl(&fx, 5, &[]), &fx.trust).unwrap();

        // Equal sequence: nothing to do.
        assert_eq!(store.handle_announce(5), CrlGossipAction::Ignore);
        // Peer behind: push ours.
        match store.handle_announce(2) {
            CrlGossipAction::Reply(Message::CrlPush(crl)) => assert_eq!(crl.sequence, 5),
            other => panic!("expected push, got {:?}", other),
        }
        // Peer ahead: request theirs.
        assert_eq!(
            store.handle_announce(9),
            CrlGossipAction::Reply(Message::CrlRequest { since: 5 })
        );
    }

    #[test]
    fn test_request_answered_only_when_ahead() {
        let fx = fixture();
        let mut store = CrlStore::new();
        assert_eq!(store.handle_request(0), CrlGossipAction::Ignore);

        store.try_replace(signed_crl(&fx, 4, &[]), &fx.trust).unwrap();
        match store.handle_request(2) {
            CrlGossipAction::Reply(Message::CrlPush(crl)) => assert_eq!(crl.sequence, 4),
            other => panic!("expected push, got {:?}", other),
        }
        assert_eq!(store.handle_request(4), CrlGossipAction::Ignore);
    }

    #[test]
    fn test_push_accepted_then_stale_ignored() {
        let fx = fixture();
        let mut store = CrlStore::new();

        let action = store.handle_push(signed_crl(&fx, 2, &["key-c"]), &fx.trust).unwrap();
        match action {
            CrlGossipAction::Accepted(update) => {
                assert_eq!(update.sequence, 2);
                assert_eq!(update.newly_revoked_subjects, vec!["key-c".to_string()]);
            }
            other => panic!("expected accepted, got {:?}", other),
        }

        // Replaying the same push is ignored, not an error.
        let action = store.handle_push(signed_crl(&fx, 2, &["key-c"]), &fx.trust).unwrap();
        assert_eq!(action, CrlGossipAction::Ignore);
    }

    #[test]
    fn test_invalid_push_is_error() {
        let fx = fixture();
        let mut store = CrlStore::new();
        let mut crl = signed_crl(&fx, 2, &[]);
        crl.signatures.clear();
        assert!(store.handle_push(crl, &fx.trust).is_err());
    }

    #[test]
    fn test_persistence_roundtrip() {
        let fx = fixture();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("crl.json");

        {
            let mut store = CrlStore::with_path(&path).unwrap();
            store
                .try_replace(signed_crl(&fx, 7, &["key-p"]), &fx.trust)
                .unwrap();
        }

        let store = CrlStore::with_path(&path).unwrap();
        assert_eq!(store.sequence(), 7);
        assert!(store.is_revoked_subject("key-p"));
    }
}
