//! Policy manifests: signed network-wide operational parameters.

use genesis_mesh_crypto::SignatureEntry;
use serde::{Deserialize, Serialize};

/// Routing parameters distributed with the policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingPolicy {
    /// Preferred transport protocols in order
    #[serde(default = "default_transports")]
    pub preferred_transports: Vec<String>,
    /// Maximum routing hops; caps the TTL on originated packets
    #[serde(default = "default_max_hops")]
    pub max_hops: u8,
}

fn default_transports() -> Vec<String> {
    vec!["tcp".to_string(), "tls".to_string()]
}

fn default_max_hops() -> u8 {
    6
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            preferred_transports: default_transports(),
            max_hops: default_max_hops(),
        }
    }
}

/// Signed network-wide policies, issued by the Network Authority.
///
/// `policy_id` increases monotonically per network; re-applying the same
/// manifest is idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyManifest {
    /// Unique, monotonically increasing policy identifier
    pub policy_id: String,
    /// Issue time, unix ms
    pub issued_at: u64,
    /// Issuing authority key id
    pub issued_by: String,
    /// Minimum required client version
    pub min_client_version: String,
    /// Allowed network ports
    #[serde(default = "default_ports")]
    pub allowed_ports: Vec<u16>,
    /// Permitted service identifiers
    #[serde(default)]
    pub allowed_services: Vec<String>,
    /// Routing configuration
    #[serde(default)]
    pub routing: RoutingPolicy,
    /// Network Authority signature
    #[serde(default)]
    pub signatures: Vec<SignatureEntry>,
}

fn default_ports() -> Vec<u16> {
    vec![443, 8443]
}

impl PolicyManifest {
    /// Whether `candidate` supersedes this manifest.
    ///
    /// Policy ids compare lexically; an equal id is the same policy and
    /// re-applying it must be a no-op.
    pub fn is_superseded_by(&self, candidate: &PolicyManifest) -> bool {
        candidate.policy_id.as_str() > self.policy_id.as_str()
    }
}
