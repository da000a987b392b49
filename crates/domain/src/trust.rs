//! Trust chain verification anchored in the genesis block.

use genesis_mesh_crypto::{keys, signing, CryptoError};
use thiserror::Error;

use crate::certificate::JoinCertificate;
use crate::genesis::GenesisBlock;
use crate::policy::PolicyManifest;
use crate::revocation::Crl;

/// Trust chain verification failures.
#[derive(Debug, Error)]
pub enum TrustError {
    /// A signature did not verify
    #[error("bad signature: {0}")]
    BadSignature(String),

    /// Certificate outside its validity window
    #[error("certificate {cert_id} expired or not yet valid at {now}")]
    ExpiredCert {
        /// Offending certificate
        cert_id: String,
        /// Evaluation time, unix ms
        now: u64,
    },

    /// Certificate present in the current CRL
    #[error("certificate {cert_id} is revoked")]
    RevokedCert {
        /// Offending certificate
        cert_id: String,
    },

    /// Signer key id not resolvable through the trust chain
    #[error("unknown issuer: {0}")]
    UnknownIssuer(String),

    /// Object bound to a different network
    #[error("network mismatch: expected {expected}, got {actual}")]
    NetworkMismatch {
        /// Our network name
        expected: String,
        /// The object's network name
        actual: String,
    },

    /// Structural invariant violated (no roles, inverted window)
    #[error("malformed certificate: {0}")]
    Malformed(String),

    /// Genesis block itself failed verification
    #[error("genesis rejected: {0}")]
    GenesisRejected(String),
}

impl From<CryptoError> for TrustError {
    fn from(err: CryptoError) -> Self {
        TrustError::BadSignature(err.to_string())
    }
}

/// Verifier for every object in the trust chain.
///
/// Construction verifies the genesis block itself; afterwards the chain
/// can validate join certificates, policy manifests, and CRLs against
/// the Network Authority key embedded in genesis.
#[derive(Debug, Clone)]
pub struct TrustChain {
    genesis: GenesisBlock,
    na_key_id: String,
}

impl TrustChain {
    /// Import and verify a genesis block.
    ///
    /// Requires at least one valid Root Sovereign signature and a Network
    /// Authority validity window that has not already ended. A future
    /// NA-rotation delta is refused here; trust updates are out-of-band.
    pub fn import(genesis: GenesisBlock, now: u64) -> Result<Self, TrustError> {
        if genesis.signatures.is_empty() {
            return Err(TrustError::GenesisRejected(
                "genesis block carries no signatures".to_string(),
            ));
        }

        let mut verified = false;
        for entry in &genesis.signatures {
            if signing::verify_object(&genesis, entry, &genesis.root_public_key).is_ok() {
                verified = true;
                break;
            }
        }
        if !verified {
            return Err(TrustError::GenesisRejected(
                "no valid Root Sovereign signature".to_string(),
            ));
        }

        if genesis.network_authority.valid_to <= now {
            return Err(TrustError::GenesisRejected(format!(
                "network authority validity ended at {}",
                genesis.network_authority.valid_to
            )));
        }

        let na_key_id = keys::key_id_for_b64(&genesis.network_authority.public_key)?;

        Ok(Self { genesis, na_key_id })
    }

    /// The verified genesis block.
    pub fn genesis(&self) -> &GenesisBlock {
        &self.genesis
    }

    /// Key id of the active Network Authority.
    pub fn na_key_id(&self) -> &str {
        &self.na_key_id
    }

    /// Verify that a join certificate is *currently valid*.
    ///
    /// Valid iff signed by the Network Authority from genesis, inside its
    /// validity window at `now`, bound to this network, structurally
    /// well-formed, and absent from the latest CRL.
    pub fn verify_certificate(
        &self,
        cert: &JoinCertificate,
        now: u64,
        crl: Option<&Crl>,
    ) -> Result<(), TrustError> {
        if cert.network_name != self.genesis.network_name {
            return Err(TrustError::NetworkMismatch {
                expected: self.genesis.network_name.clone(),
                actual: cert.network_name.clone(),
            });
        }

        if !cert.is_well_formed() {
            return Err(TrustError::Malformed(format!(
                "certificate {} has no roles or an inverted validity window",
                cert.cert_id
            )));
        }

        if cert.issued_by != self.na_key_id {
            return Err(TrustError::UnknownIssuer(cert.issued_by.clone()));
        }

        self.verify_na_signature(cert, &cert.signatures)?;

        if !cert.is_valid_at(now) {
            return Err(TrustError::ExpiredCert {
                cert_id: cert.cert_id.clone(),
                now,
            });
        }

        if let Some(crl) = crl {
            if crl.is_revoked_cert(&cert.cert_id) || crl.is_revoked_subject(&cert.node_public_key) {
                return Err(TrustError::RevokedCert {
                    cert_id: cert.cert_id.clone(),
                });
            }
        }

        Ok(())
    }

    /// Verify a policy manifest signature against the NA key.
    pub fn verify_policy(&self, policy: &PolicyManifest) -> Result<(), TrustError> {
        self.verify_na_signature(policy, &policy.signatures)
    }

    /// Verify a CRL signature against the NA key.
    pub fn verify_crl(&self, crl: &Crl) -> Result<(), TrustError> {
        self.verify_na_signature(crl, &crl.signatures)
    }

    fn verify_na_signature<T: serde::Serialize>(
        &self,
        object: &T,
        signatures: &[genesis_mesh_crypto::SignatureEntry],
    ) -> Result<(), TrustError> {
        if signatures.is_empty() {
            return Err(TrustError::BadSignature("object carries no signatures".to_string()));
        }

        for entry in signatures {
            if entry.key_id != self.na_key_id {
                continue;
            }
            return signing::verify_object(object, entry, &self.genesis.network_authority.public_key)
                .map_err(TrustError::from);
        }

        Err(TrustError::UnknownIssuer(
            signatures
                .first()
                .map(|s| s.key_id.clone())
                .unwrap_or_default(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genesis::{NetworkAuthority, PolicyManifestRef};
    use crate::revocation::Revocation;
    use genesis_mesh_crypto::{sign_object, KeyPair};

    struct Fixture {
        chain: TrustChain,
        na: KeyPair,
        na_key_id: String,
    }

    fn fixture(now: u64) -> Fixture {
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
                valid_to: now + 1_000_000,
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

        let chain = TrustChain::import(genesis, now).unwrap();
        Fixture {
            chain,
            na,
            na_key_id,
        }
    }

    fn signed_cert(fx: &Fixture, issued_at: u64, expires_at: u64) -> JoinCertificate {
        let mut cert = JoinCertificate {
            cert_id: "cert-1".to_string(),
            node_public_key: "subject-key".to_string(),
            network_name: "mesh-test".to_string(),
            roles: vec!["role:client".to_string()],
            scopes: vec![],
            issued_at,
            expires_at,
            serial: 1,
            issued_by: fx.na_key_id.clone(),
            signatures: vec![],
        };
        let sig = sign_object(&cert, fx.na.signing_key(), &fx.na_key_id).unwrap();
        cert.signatures.push(sig);
        cert
    }

    #[test]
    fn test_genesis_import_verifies_root_signature() {
        let fx = fixture(1_000);
        assert_eq!(fx.chain.genesis().network_name, "mesh-test");
    }

    #[test]
    fn test_unsigned_genesis_rejected() {
        let fx = fixture(1_000);
        let mut genesis = fx.chain.genesis().clone();
        genesis.signatures.clear();
        assert!(matches!(
            TrustChain::import(genesis, 1_000),
            Err(TrustError::GenesisRejected(_))
        ));
    }

    #[test]
    fn test_tampered_genesis_rejected() {
        let fx = fixture(1_000);
        let mut genesis = fx.chain.genesis().clone();
        genesis.network_name = "evil-mesh".to_string();
        assert!(matches!(
            TrustChain::import(genesis, 1_000),
            Err(TrustError::GenesisRejected(_))
        ));
    }

    #[test]
    fn test_expired_na_window_rejected() {
        let fx = fixture(1_000);
        let genesis = fx.chain.genesis().clone();
        let past_end = genesis.network_authority.valid_to + 1;
        assert!(matches!(
            TrustChain::import(genesis, past_end),
            Err(TrustError::GenesisRejected(_))
        ));
    }

    #[test]
    fn test_valid_certificate_accepted() {
        let fx = fixture(1_000);
        let cert = signed_cert(&fx, 500, 5_000);
        assert!(fx.chain.verify_certificate(&cert, 1_000, None).is_ok());
    }

    #[test]
    fn test_certificate_expiry_boundary() {
        let fx = fixture(1_000);
        let cert = signed_cert(&fx, 500, 5_000);
        // Accepted at expires_at, rejected one tick after.
        assert!(fx.chain.verify_certificate(&cert, 5_000, None).is_ok());
        assert!(matches!(
            fx.chain.verify_certificate(&cert, 5_001, None),
            Err(TrustError::ExpiredCert { .. })
        ));
    }

    #[test]
    fn test_revoked_certificate_rejected() {
        let fx = fixture(1_000);
        let cert = signed_cert(&fx, 500, 5_000);

        let mut crl = Crl::empty("crl-1".to_string(), 2, fx.na_key_id.clone(), 900, 100_000);
        crl.revocations.push(Revocation {
            certificate_id: cert.cert_id.clone(),
            subject_public_key: "other".to_string(),
            revoked_at: 900,
            reason: "compromised".to_string(),
            issuer: fx.na_key_id.clone(),
        });

        assert!(matches!(
            fx.chain.verify_certificate(&cert, 1_000, Some(&crl)),
            Err(TrustError::RevokedCert { .. })
        ));
    }

    #[test]
    fn test_revocation_matches_subject_key() {
        let fx = fixture(1_000);
        let cert = signed_cert(&fx, 500, 5_000);

        let mut crl = Crl::empty("crl-1".to_string(), 2, fx.na_key_id.clone(), 900, 100_000);
        crl.revocations.push(Revocation {
            certificate_id: "different-cert".to_string(),
            subject_public_key: cert.node_public_key.clone(),
            revoked_at: 900,
            reason: "subject compromised".to_string(),
            issuer: fx.na_key_id.clone(),
        });

        assert!(matches!(
            fx.chain.verify_certificate(&cert, 1_000, Some(&crl)),
            Err(TrustError::RevokedCert { .. })
        ));
    }

    #[test]
    fn test_certificate_from_unknown_issuer_rejected() {
        let fx = fixture(1_000);
        let rogue = KeyPair::from_seed(&[9u8; 32]);
        let rogue_key_id = keys::key_id_for_b64(&rogue.public_key_b64()).unwrap();

        let mut cert = signed_cert(&fx, 500, 5_000);
        cert.issued_by = rogue_key_id.clone();
        cert.signatures.clear();
        let sig = sign_object(&cert, rogue.signing_key(), &rogue_key_id).unwrap();
        cert.signatures.push(sig);

        assert!(matches!(
            fx.chain.verify_certificate(&cert, 1_000, None),
            Err(TrustError::UnknownIssuer(_))
        ));
    }

    #[test]
    fn test_tampered_certificate_rejected() {
        let fx = fixture(1_000);
        let mut cert = signed_cert(&fx, 500, 5_000);
        cert.roles = vec!["role:admin".to_string()];
        assert!(matches!(
            fx.chain.verify_certificate(&cert, 1_000, None),
            Err(TrustError::BadSignature(_))
        ));
    }

    #[test]
    fn test_network_mismatch_rejected() {
        let fx = fixture(1_000);
        let mut cert = signed_cert(&fx, 500, 5_000);
        cert.network_name = "other-mesh".to_string();
        assert!(matches!(
            fx.chain.verify_certificate(&cert, 1_000, None),
            Err(TrustError::NetworkMismatch { .. })
        ));
    }

    #[test]
    fn test_crl_signature_verification() {
        let fx = fixture(1_000);
        let mut crl = Crl::empty("crl-1".to_string(), 1, fx.na_key_id.clone(), 900, 100_000);
        let sig = sign_object(&crl, fx.na.signing_key(), &fx.na_key_id).unwrap();
        crl.signatures.push(sig);

        assert!(fx.chain.verify_crl(&crl).is_ok());

        crl.sequence = 2;
        assert!(fx.chain.verify_crl(&crl).is_err());
    }

    #[test]
    fn test_policy_signature_verification() {
        let fx = fixture(1_000);
        let mut policy = PolicyManifest {
            policy_id: "p-1".to_string(),
            issued_at: 900,
            issued_by: fx.na_key_id.clone(),
            min_client_version: "0.1.0".to_string(),
            allowed_ports: vec![443],
            allowed_services: vec![],
            routing: Default::default(),
            signatures: vec![],
        };
        let sig = sign_object(&policy, fx.na.signing_key(), &fx.na_key_id).unwrap();
        policy.signatures.push(sig);

        assert!(fx.chain.verify_policy(&policy).is_ok());
    }
}
