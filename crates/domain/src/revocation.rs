//! Certificate revocation list: the authoritative revocation snapshot.

use genesis_mesh_crypto::SignatureEntry;
use serde::{Deserialize, Serialize};

/// A single revoked certificate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revocation {
    /// Revoked certificate id
    pub certificate_id: String,
    /// Subject public key of the revoked certificate (base64)
    pub subject_public_key: String,
    /// Revocation timestamp, unix ms
    pub revoked_at: u64,
    /// Revocation reason
    pub reason: String,
    /// Who issued the revocation
    pub issuer: String,
}

/// Signed, monotonically-sequenced certificate revocation list.
///
/// The CRL is an authoritative snapshot, not a log: a validly signed CRL
/// with a higher `sequence` replaces the previous one wholesale, and a
/// lower sequence is always rejected. Once present, an entry never
/// disappears from subsequent CRLs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Crl {
    /// Unique CRL identifier
    pub crl_id: String,
    /// Monotonically increasing sequence number
    pub sequence: u64,
    /// Issue timestamp, unix ms
    pub issued_at: u64,
    /// When the next CRL is expected, unix ms
    pub next_update: u64,
    /// Issuer key id (the Network Authority)
    pub issuer: String,
    /// Revoked certificates
    #[serde(default)]
    pub revocations: Vec<Revocation>,
    /// Network Authority signature
    #[serde(default)]
    pub signatures: Vec<SignatureEntry>,
}

impl Crl {
    /// An empty CRL at the given sequence.
    pub fn empty(crl_id: String, sequence: u64, issuer: String, now: u64, next_update: u64) -> Self {
        Self {
            crl_id,
            sequence,
            issued_at: now,
            next_update,
            issuer,
            revocations: Vec::new(),
            signatures: Vec::new(),
        }
    }

    /// Whether the certificate id appears in this CRL.
    pub fn is_revoked_cert(&self, cert_id: &str) -> bool {
        self.revocations.iter().any(|r| r.certificate_id == cert_id)
    }

    /// Whether the subject public key appears in this CRL.
    pub fn is_revoked_subject(&self, subject_public_key: &str) -> bool {
        self.revocations
            .iter()
            .any(|r| r.subject_public_key == subject_public_key)
    }

    /// Whether this CRL is past its advertised refresh time.
    pub fn is_stale(&self, now: u64) -> bool {
        now > self.next_update
    }

    /// Produce the successor CRL containing one additional revocation.
    ///
    /// The successor carries `sequence + 1`, retains every existing entry,
    /// and must be re-signed by the authority before distribution.
    pub fn with_revocation(&self, crl_id: String, revocation: Revocation, now: u64) -> Crl {
        let mut revocations = self.revocations.clone();
        revocations.push(revocation);
        Crl {
            crl_id,
            sequence: self.sequence + 1,
            issued_at: now,
            next_update: self.next_update,
            issuer: self.issuer.clone(),
            revocations,
            signatures: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn revocation(cert_id: &str, subject: &str) -> Revocation {
        Revocation {
            certificate_id: cert_id.to_string(),
            subject_public_key: subject.to_string(),
            revoked_at: 500,
            reason: "key compromise".to_string(),
            issuer: "na".to_string(),
        }
    }

    #[test]
    fn test_empty_crl_has_no_revocations() {
        let crl = Crl::empty("crl-1".to_string(), 1, "na".to_string(), 100, 1_000);
        assert!(!crl.is_revoked_cert("anything"));
        assert!(!crl.is_revoked_subject("anyone"));
    }

    #[test]
    fn test_revocation_lookup() {
        let mut crl = Crl::empty("crl-1".to_string(), 1, "na".to_string(), 100, 1_000);
        crl.revocations.push(revocation("cert-9", "key-9"));

        assert!(crl.is_revoked_cert("cert-9"));
        assert!(crl.is_revoked_subject("key-9"));
        assert!(!crl.is_revoked_cert("cert-1"));
        assert!(!crl.is_revoked_subject("key-1"));
    }

    #[test]
    fn test_with_revocation_increments_sequence_and_keeps_entries() {
        let base = Crl::empty("crl-1".to_string(), 3, "na".to_string(), 100, 1_000);
        let next = base.with_revocation("crl-2".to_string(), revocation("cert-a", "key-a"), 200);
        let last = next.with_revocation("crl-3".to_string(), revocation("cert-b", "key-b"), 300);

        assert_eq!(next.sequence, 4);
        assert_eq!(last.sequence, 5);
        // Union property: entries never disappear.
        assert!(last.is_revoked_cert("cert-a"));
        assert!(last.is_revoked_cert("cert-b"));
        // Successor must be re-signed.
        assert!(last.signatures.is_empty());
    }

    #[test]
    fn test_staleness() {
        let crl = Crl::empty("crl-1".to_string(), 1, "na".to_string(), 100, 1_000);
        assert!(!crl.is_stale(1_000));
        assert!(crl.is_stale(1_001));
    }
}
