//! Genesis block: the network constitution.

use genesis_mesh_crypto::SignatureEntry;
use serde::{Deserialize, Serialize};

/// Network Authority key and validity window embedded in genesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkAuthority {
    /// Base64-encoded Ed25519 public key
    pub public_key: String,
    /// Validity start, unix ms
    pub valid_from: u64,
    /// Validity end, unix ms
    pub valid_to: u64,
}

/// Reference to the policy manifest by content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyManifestRef {
    /// Content hash (e.g. "blake3:...")
    pub hash: String,
    /// Optional retrieval URL
    #[serde(default)]
    pub url: Option<String>,
}

/// Well-known bootstrap peer listed in genesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapAnchor {
    /// Anchor identifier
    pub id: String,
    /// Network endpoint (host:port)
    pub endpoint: String,
}

/// The signed network constitution.
///
/// Every node embeds or imports this once at initialization; it anchors
/// the entire trust chain through the Root Sovereign signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenesisBlock {
    /// Unique network identifier
    pub network_name: String,
    /// Network protocol version
    pub network_version: String,
    /// Root Sovereign public key (base64)
    pub root_public_key: String,
    /// Current Network Authority
    pub network_authority: NetworkAuthority,
    /// Permitted cryptographic algorithms
    #[serde(default = "default_crypto_suites")]
    pub allowed_crypto_suites: Vec<String>,
    /// Permitted transport protocols
    #[serde(default = "default_transports")]
    pub allowed_transports: Vec<String>,
    /// Reference to the policy manifest
    pub policy_manifest: PolicyManifestRef,
    /// Initial anchor nodes for network entry
    #[serde(default)]
    pub bootstrap_anchors: Vec<BootstrapAnchor>,
    /// Root Sovereign signatures
    #[serde(default)]
    pub signatures: Vec<SignatureEntry>,
}

fn default_crypto_suites() -> Vec<String> {
    vec!["ed25519".to_string()]
}

fn default_transports() -> Vec<String> {
    vec!["tcp".to_string(), "tls".to_string()]
}

impl GenesisBlock {
    /// Network identity: `(network_name, network_version)`.
    pub fn network_id(&self) -> (String, String) {
        (self.network_name.clone(), self.network_version.clone())
    }
}
