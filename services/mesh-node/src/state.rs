//! Persisted node state: certificate, policy, genesis, and the peer
//! table snapshot under `state/`, keys under `keys/`.

use std::path::Path;

use genesis_mesh_core::{CoreError, CoreResult, NodeConfig};
use genesis_mesh_domain::{GenesisBlock, JoinCertificate, PolicyManifest};
use genesis_mesh_mesh::PeerRecord;
use tracing::info;

/// Create the `keys/` and `state/` directories.
pub fn ensure_layout(config: &NodeConfig) -> CoreResult<()> {
    std::fs::create_dir_all(config.data_dir.join("keys"))?;
    std::fs::create_dir_all(config.data_dir.join("state"))?;
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> CoreResult<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

/// Load the persisted genesis block, if any.
pub fn load_genesis(config: &NodeConfig) -> CoreResult<Option<GenesisBlock>> {
    read_json(&config.data_dir.join("state").join("genesis.json"))
}

/// Persist the genesis block.
pub fn store_genesis(config: &NodeConfig, genesis: &GenesisBlock) -> CoreResult<()> {
    write_json(&config.data_dir.join("state").join("genesis.json"), genesis)
}

/// Load the persisted join certificate, if any.
pub fn load_certificate(config: &NodeConfig) -> CoreResult<Option<JoinCertificate>> {
    read_json(&config.cert_path())
}

/// Persist the join certificate.
pub fn store_certificate(config: &NodeConfig, cert: &JoinCertificate) -> CoreResult<()> {
    write_json(&config.cert_path(), cert)
}

/// Load the persisted peer table snapshot for a warm start.
pub fn load_peer_snapshot(config: &NodeConfig) -> CoreResult<Vec<PeerRecord>> {
    Ok(read_json(&config.peers_path())?.unwrap_or_default())
}

/// Persist the peer table snapshot.
pub fn store_peer_snapshot(config: &NodeConfig, records: &[PeerRecord]) -> CoreResult<()> {
    write_json(&config.peers_path(), &records)
}

/// Policy manifest store with supersession and idempotent re-apply.
pub struct PolicyStore {
    current: Option<PolicyManifest>,
    path: Option<std::path::PathBuf>,
}

impl PolicyStore {
    /// Store persisted at the configured policy path.
    pub fn open(config: &NodeConfig) -> CoreResult<Self> {
        let path = config.policy_path();
        let current = read_json(&path)?;
        Ok(Self {
            current,
            path: Some(path),
        })
    }

    /// In-memory store.
    pub fn in_memory() -> Self {
        Self {
            current: None,
            path: None,
        }
    }

    /// The active policy, if any.
    pub fn current(&self) -> Option<&PolicyManifest> {
        self.current.as_ref()
    }

    /// Apply a manifest. Returns true when policy state changed; an
    /// equal or older policy id leaves the state untouched, so applying
    /// the same update twice is a no-op.
    pub fn apply(&mut self, manifest: PolicyManifest) -> CoreResult<bool> {
        if let Some(current) = &self.current {
            if !current.is_superseded_by(&manifest) {
                return Ok(false);
            }
        }
        info!(policy_id = %manifest.policy_id, "policy applied");
        if let Some(path) = &self.path {
            write_json(path, &manifest)?;
        }
        self.current = Some(manifest);
        Ok(true)
    }

    /// `max_hops` from the active policy, or the given default.
    pub fn max_hops(&self, default: u8) -> u8 {
        self.current
            .as_ref()
            .map(|policy| policy.routing.max_hops)
            .unwrap_or(default)
    }
}

/// Parse a policy manifest out of a control payload.
pub fn policy_from_value(value: serde_json::Value) -> CoreResult<PolicyManifest> {
    serde_json::from_value(value).map_err(CoreError::Parse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use genesis_mesh_domain::RoutingPolicy;
    use std::path::PathBuf;

    fn config(dir: &Path) -> NodeConfig {
        NodeConfig {
            data_dir: PathBuf::from(dir),
            ..NodeConfig::default()
        }
    }

    fn manifest(policy_id: &str, max_hops: u8) -> PolicyManifest {
        PolicyManifest {
            policy_id: policy_id.to_string(),
            issued_at: 1_000,
            issued_by: "na".to_string(),
            min_client_version: "0.1.0".to_string(),
            allowed_ports: vec![443],
            allowed_services: vec![],
            routing: RoutingPolicy {
                preferred_transports: vec!["tcp".to_string()],
                max_hops,
            },
            signatures: vec![],
        }
    }

    #[test]
    fn test_certificate_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        ensure_layout(&config).unwrap();

        assert!(load_certificate(&config).unwrap().is_none());

        let cert = JoinCertificate {
            cert_id: "cert-1".to_string(),
            node_public_key: "pk".to_string(),
            network_name: "mesh-test".to_string(),
            roles: vec!["role:client".to_string()],
            scopes: vec![],
            issued_at: 1,
            expires_at: 2,
            serial: 1,
            issued_by: "na".to_string(),
            signatures: vec![],
        };
        store_certificate(&config, &cert).unwrap();
        assert_eq!(load_certificate(&config).unwrap(), Some(cert));
    }

    #[test]
    fn test_policy_apply_is_idempotent() {
        let mut store = PolicyStore::in_memory();

        assert!(store.apply(manifest("p-001", 4)).unwrap());
        assert_eq!(store.max_hops(6), 4);

        // Same policy id again: no change.
        assert!(!store.apply(manifest("p-001", 9)).unwrap());
        assert_eq!(store.max_hops(6), 4);

        // Older policy id: no change.
        assert!(!store.apply(manifest("p-000", 9)).unwrap());

        // Newer policy id supersedes.
        assert!(store.apply(manifest("p-002", 8)).unwrap());
        assert_eq!(store.max_hops(6), 8);
    }

    #[test]
    fn test_policy_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        ensure_layout(&config).unwrap();

        {
            let mut store = PolicyStore::open(&config).unwrap();
            store.apply(manifest("p-005", 5)).unwrap();
        }

        let store = PolicyStore::open(&config).unwrap();
        assert_eq!(store.current().unwrap().policy_id, "p-005");
        assert_eq!(store.max_hops(6), 5);
    }

    #[test]
    fn test_peer_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        ensure_layout(&config).unwrap();

        assert!(load_peer_snapshot(&config).unwrap().is_empty());

        use genesis_mesh_mesh::{PeerManager, PeerManagerConfig};
        let mut pm = PeerManager::new("local".to_string(), PeerManagerConfig::default());
        pm.observe(&"peer-a".to_string(), "10.0.0.1:7600", 100, 100);

        store_peer_snapshot(&config, &pm.snapshot()).unwrap();
        let restored = load_peer_snapshot(&config).unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].node_id, "peer-a");
    }

    #[test]
    fn test_policy_from_value_rejects_garbage() {
        assert!(policy_from_value(serde_json::json!({"nope": 1})).is_err());
        let value = serde_json::to_value(manifest("p-1", 3)).unwrap();
        assert_eq!(policy_from_value(value).unwrap().policy_id, "p-1");
    }
}
