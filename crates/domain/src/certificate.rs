//! Join certificates: short-lived credentials binding a node key to roles.

use genesis_mesh_crypto::SignatureEntry;
use serde::{Deserialize, Serialize};

/// Permits a node to join the network.
///
/// Issued by the Network Authority, typically valid for 7 days on servers
/// and 24-72 hours on mobile devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinCertificate {
    /// Unique certificate identifier
    pub cert_id: String,
    /// Subject's public key (base64); doubles as the node id
    pub node_public_key: String,
    /// Target network identifier
    pub network_name: String,
    /// Assigned roles (e.g. "role:anchor", "role:client")
    pub roles: Vec<String>,
    /// Authorized scopes (e.g. "mesh:*")
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Issue time, unix ms
    pub issued_at: u64,
    /// Expiration time, unix ms
    pub expires_at: u64,
    /// Monotonic serial assigned by the issuer
    pub serial: u64,
    /// Issuing authority key id
    pub issued_by: String,
    /// Network Authority signature
    #[serde(default)]
    pub signatures: Vec<SignatureEntry>,
}

impl JoinCertificate {
    /// Whether the certificate is within its validity window at `now`.
    ///
    /// Both endpoints are inclusive: a certificate expiring at `t` is
    /// still accepted at `t` and rejected at `t + 1`.
    pub fn is_valid_at(&self, now: u64) -> bool {
        self.issued_at <= now && now <= self.expires_at
    }

    /// Structural invariants independent of the clock and signature.
    pub fn is_well_formed(&self) -> bool {
        self.expires_at > self.issued_at && !self.roles.is_empty()
    }

    /// Whether the certificate carries the given role.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Unix-ms instant at which renewal should begin for the given ratio
    /// of the validity window (0.5 = renew at half lifetime).
    pub fn renewal_due_at(&self, ratio: f64) -> u64 {
        let lifetime = self.expires_at.saturating_sub(self.issued_at) as f64;
        self.issued_at + (lifetime * ratio) as u64
    }
}
