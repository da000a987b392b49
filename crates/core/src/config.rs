//! Configuration management for Genesis Mesh nodes.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CoreError, CoreResult};

/// Node configuration.
///
/// Loaded from a JSON file, with environment variable overrides for the
/// data directory (`GENESIS_MESH_DATA_DIR`) and the Network Authority
/// endpoint (`GENESIS_MESH_NA_ENDPOINT`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Bootstrap anchor endpoints (host:port), in addition to genesis anchors
    #[serde(default)]
    pub bootstrap_endpoints: Vec<String>,
    /// Address the transport listens on
    #[serde(default = "defaults::listen_address")]
    pub listen_address: String,
    /// Role requested at join time (e.g. "role:client", "role:anchor")
    #[serde(default = "defaults::role")]
    pub role: String,
    /// Network Authority base URL
    #[serde(default = "defaults::na_endpoint")]
    pub na_endpoint: String,
    /// Base directory for keys/ and state/
    #[serde(default = "defaults::data_dir")]
    pub data_dir: PathBuf,
    /// Maximum concurrent connections
    #[serde(default = "defaults::max_connections")]
    pub max_connections: usize,
    /// Interval between full route announcements, seconds
    #[serde(default = "defaults::route_announce_interval_s")]
    pub route_announce_interval_s: u64,
    /// Interval between discovery gossip rounds, seconds
    #[serde(default = "defaults::discovery_interval_s")]
    pub discovery_interval_s: u64,
    /// Interval between CRL sequence announcements, seconds
    #[serde(default = "defaults::crl_announce_interval_s")]
    pub crl_announce_interval_s: u64,
    /// Fraction of certificate lifetime after which renewal starts
    #[serde(default = "defaults::renewal_ratio")]
    pub renewal_ratio: f64,
    /// Handshake deadline, seconds
    #[serde(default = "defaults::handshake_timeout_s")]
    pub handshake_timeout_s: u64,
    /// Idle read deadline, seconds
    #[serde(default = "defaults::idle_timeout_s")]
    pub idle_timeout_s: u64,
    /// Ping cadence on idle connections, seconds
    #[serde(default = "defaults::ping_interval_s")]
    pub ping_interval_s: u64,
    /// Maximum hops for originated packets
    #[serde(default = "defaults::max_hops")]
    pub max_hops: u8,
    /// Maximum peer entries in one gossip response
    #[serde(default = "defaults::peer_gossip_cap")]
    pub peer_gossip_cap: usize,
    /// Unheard peers older than this are evicted, seconds
    #[serde(default = "defaults::stale_peer_timeout_s")]
    pub stale_peer_timeout_s: u64,
    /// Reputation below this blacklists the peer
    #[serde(default = "defaults::reputation_blacklist_threshold")]
    pub reputation_blacklist_threshold: f64,
    /// Routes unrefreshed this long are evicted, seconds
    #[serde(default = "defaults::route_stale_timeout_s")]
    pub route_stale_timeout_s: u64,
    /// Per-connection send queue capacity
    #[serde(default = "defaults::send_queue_capacity")]
    pub send_queue_capacity: usize,
    /// Requested certificate validity at join, hours
    #[serde(default = "defaults::validity_hours")]
    pub validity_hours: u64,
}

mod defaults {
    use std::path::PathBuf;

    pub fn listen_address() -> String {
        "0.0.0.0:7600".to_string()
    }
    pub fn role() -> String {
        "role:client".to_string()
    }
    pub fn na_endpoint() -> String {
        "https://localhost:8443".to_string()
    }
    pub fn data_dir() -> PathBuf {
        PathBuf::from(".")
    }
    pub fn max_connections() -> usize {
        50
    }
    pub fn route_announce_interval_s() -> u64 {
        30
    }
    pub fn discovery_interval_s() -> u64 {
        60
    }
    pub fn crl_announce_interval_s() -> u64 {
        60
    }
    pub fn renewal_ratio() -> f64 {
        0.5
    }
    pub fn handshake_timeout_s() -> u64 {
        10
    }
    pub fn idle_timeout_s() -> u64 {
        30
    }
    pub fn ping_interval_s() -> u64 {
        15
    }
    pub fn max_hops() -> u8 {
        6
    }
    pub fn peer_gossip_cap() -> usize {
        32
    }
    pub fn stale_peer_timeout_s() -> u64 {
        900
    }
    pub fn reputation_blacklist_threshold() -> f64 {
        0.2
    }
    pub fn route_stale_timeout_s() -> u64 {
        90
    }
    pub fn send_queue_capacity() -> usize {
        256
    }
    pub fn validity_hours() -> u64 {
        168
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bootstrap_endpoints: Vec::new(),
            listen_address: defaults::listen_address(),
            role: defaults::role(),
            na_endpoint: defaults::na_endpoint(),
            data_dir: defaults::data_dir(),
            max_connections: defaults::max_connections(),
            route_announce_interval_s: defaults::route_announce_interval_s(),
            discovery_interval_s: defaults::discovery_interval_s(),
            crl_announce_interval_s: defaults::crl_announce_interval_s(),
            renewal_ratio: defaults::renewal_ratio(),
            handshake_timeout_s: defaults::handshake_timeout_s(),
            idle_timeout_s: defaults::idle_timeout_s(),
            ping_interval_s: defaults::ping_interval_s(),
            max_hops: defaults::max_hops(),
            peer_gossip_cap: defaults::peer_gossip_cap(),
            stale_peer_timeout_s: defaults::stale_peer_timeout_s(),
            reputation_blacklist_threshold: defaults::reputation_blacklist_threshold(),
            route_stale_timeout_s: defaults::route_stale_timeout_s(),
            send_queue_capacity: defaults::send_queue_capacity(),
            validity_hours: defaults::validity_hours(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a JSON file, applying environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: NodeConfig = serde_json::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("GENESIS_MESH_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(endpoint) = std::env::var("GENESIS_MESH_NA_ENDPOINT") {
            self.na_endpoint = endpoint;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> CoreResult<()> {
        if self.listen_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(CoreError::Config(format!(
                "listen_address '{}' is not a valid socket address",
                self.listen_address
            )));
        }
        if self.max_connections == 0 {
            return Err(CoreError::Config(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.renewal_ratio) || self.renewal_ratio <= 0.0 {
            return Err(CoreError::Config(format!(
                "renewal_ratio {} must be in (0, 1)",
                self.renewal_ratio
            )));
        }
        if !(0.0..=1.0).contains(&self.reputation_blacklist_threshold) {
            return Err(CoreError::Config(format!(
                "reputation_blacklist_threshold {} must be in [0, 1]",
                self.reputation_blacklist_threshold
            )));
        }
        if self.max_hops == 0 {
            return Err(CoreError::Config("max_hops must be at least 1".to_string()));
        }
        if self.send_queue_capacity == 0 {
            return Err(CoreError::Config(
                "send_queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Path to the private identity key.
    pub fn key_path(&self) -> PathBuf {
        self.data_dir.join("keys").join("node.key")
    }

    /// Path to the public identity key.
    pub fn pub_path(&self) -> PathBuf {
        self.data_dir.join("keys").join("node.pub")
    }

    /// Path to the persisted join certificate.
    pub fn cert_path(&self) -> PathBuf {
        self.data_dir.join("state").join("cert.json")
    }

    /// Path to the persisted CRL.
    pub fn crl_path(&self) -> PathBuf {
        self.data_dir.join("state").join("crl.json")
    }

    /// Path to the persisted policy manifest.
    pub fn policy_path(&self) -> PathBuf {
        self.data_dir.join("state").join("policy.json")
    }

    /// Path to the append-only audit log.
    pub fn audit_path(&self) -> PathBuf {
        self.data_dir.join("state").join("audit.log")
    }

    /// Path to the peer table snapshot.
    pub fn peers_path(&self) -> PathBuf {
        self.data_dir.join("state").join("peers.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.max_connections, 50);
        assert_eq!(config.route_announce_interval_s, 30);
        assert_eq!(config.discovery_interval_s, 60);
        assert_eq!(config.crl_announce_interval_s, 60);
        assert_eq!(config.renewal_ratio, 0.5);
        assert_eq!(config.handshake_timeout_s, 10);
        assert_eq!(config.ping_interval_s, 15);
        assert_eq!(config.max_hops, 6);
        assert_eq!(config.peer_gossip_cap, 32);
        assert_eq!(config.stale_peer_timeout_s, 900);
        assert_eq!(config.reputation_blacklist_threshold, 0.2);
        assert_eq!(config.route_stale_timeout_s, 90);
        assert_eq!(config.send_queue_capacity, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"listen_address": "127.0.0.1:9100", "max_connections": 8}}"#
        )
        .unwrap();

        let config = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.listen_address, "127.0.0.1:9100");
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.max_hops, 6);
    }

    #[test]
    fn test_invalid_listen_address_rejected() {
        let config = NodeConfig {
            listen_address: "not-an-address".to_string(),
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_renewal_ratio_rejected() {
        let config = NodeConfig {
            renewal_ratio: 1.5,
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());

        let config = NodeConfig {
            renewal_ratio: 0.0,
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_state_paths() {
        let config = NodeConfig {
            data_dir: PathBuf::from("/var/lib/mesh"),
            ..NodeConfig::default()
        };
        assert_eq!(config.key_path(), PathBuf::from("/var/lib/mesh/keys/node.key"));
        assert_eq!(config.audit_path(), PathBuf::from("/var/lib/mesh/state/audit.log"));
        assert_eq!(config.peers_path(), PathBuf::from("/var/lib/mesh/state/peers.json"));
    }
}
