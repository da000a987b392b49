//! Peer lifecycle, reputation, and blacklisting.

use std::collections::HashMap;

use genesis_mesh_core::NodeId;
use genesis_mesh_transport::PeerEntry;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Reputation increment for a successful interaction.
const REPUTATION_REWARD: f64 = 0.05;
/// Reputation decrement for misbehavior.
const REPUTATION_PENALTY: f64 = 0.15;

/// Peer manager tuning parameters.
#[derive(Debug, Clone)]
pub struct PeerManagerConfig {
    /// Reputation below this triggers a blacklist
    pub blacklist_threshold: f64,
    /// First blacklist duration, ms; doubles per recurrence
    pub blacklist_base_ms: u64,
    /// Blacklist duration cap, ms
    pub blacklist_cap_ms: u64,
    /// First dial backoff, ms; doubles per consecutive failure
    pub dial_backoff_base_ms: u64,
    /// Dial backoff cap, ms
    pub dial_backoff_cap_ms: u64,
    /// Peers unheard for this long with no connection are evicted, ms
    pub stale_timeout_ms: u64,
    /// Maximum entries shared in one gossip response
    pub gossip_cap: usize,
}

impl Default for PeerManagerConfig {
    fn default() -> Self {
        Self {
            blacklist_threshold: 0.2,
            blacklist_base_ms: 60_000,
            blacklist_cap_ms: 3_600_000,
            dial_backoff_base_ms: 1_000,
            dial_backoff_cap_ms: 300_000,
            stale_timeout_ms: 900_000,
            gossip_cap: 32,
        }
    }
}

/// Lifecycle status of a known peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    /// Learned from gossip, never connected
    Observed,
    /// A dial or handshake is in flight
    Connecting,
    /// Certificate-verified connection active
    Connected,
    /// Previously connected, currently not
    Disconnected,
}

/// Successful interactions that raise reputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoodBehavior {
    /// Completed certificate handshake
    Handshake,
    /// Answered a liveness probe
    Pong,
    /// Sent a valid routing announcement
    ValidRoute,
}

/// Misbehavior that lowers reputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Misbehavior {
    /// A signature from this peer failed verification
    BadSignature,
    /// An announcement violated routing rules
    InvalidRoute,
    /// Repeated TTL-abusive forwarding
    TtlAbuse,
}

impl Misbehavior {
    /// Short label for audit details.
    pub fn as_str(&self) -> &'static str {
        match self {
            Misbehavior::BadSignature => "bad_signature",
            Misbehavior::InvalidRoute => "invalid_route",
            Misbehavior::TtlAbuse => "ttl_abuse",
        }
    }
}

/// Everything the node knows about one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Peer node id
    pub node_id: NodeId,
    /// Last known endpoint (host:port)
    pub endpoint: String,
    /// Roles observed in the peer's certificate
    #[serde(default)]
    pub observed_roles: Vec<String>,
    /// First sighting, unix ms
    pub first_seen: u64,
    /// Last record update, unix ms
    pub last_seen: u64,
    /// Last direct or gossiped evidence of liveness, unix ms
    pub last_heard: u64,
    /// Behavioral quality in [0, 1]
    pub reputation: f64,
    /// Consecutive failed dial attempts
    pub consecutive_failures: u32,
    /// Times this peer has been blacklisted
    pub blacklist_strikes: u32,
    /// Blacklist expiry, unix ms; `None` when not blacklisted
    #[serde(default)]
    pub blacklisted_until: Option<u64>,
    /// Earliest next dial attempt, unix ms
    #[serde(default)]
    pub next_dial_at: u64,
    /// Last observed round-trip time, ms
    #[serde(default)]
    pub latency_ms: Option<u64>,
    /// Lifecycle status
    pub status: PeerStatus,
}

impl PeerRecord {
    fn new(node_id: NodeId, endpoint: String, now: u64) -> Self {
        Self {
            node_id,
            endpoint,
            observed_roles: Vec::new(),
            first_seen: now,
            last_seen: now,
            last_heard: now,
            reputation: 1.0,
            consecutive_failures: 0,
            blacklist_strikes: 0,
            blacklisted_until: None,
            next_dial_at: 0,
            latency_ms: None,
            status: PeerStatus::Observed,
        }
    }

    /// Whether the peer is blacklisted at `now`.
    pub fn is_blacklisted(&self, now: u64) -> bool {
        matches!(self.blacklisted_until, Some(until) if now < until)
    }
}

/// Tracks all known peers and their behavioral reputation.
///
/// Only peers whose certificate verified during the handshake are ever
/// marked `Connected`; that check lives in the node's handshake path,
/// which calls [`PeerManager::on_connected`] afterwards.
#[derive(Debug)]
pub struct PeerManager {
    local_id: NodeId,
    config: PeerManagerConfig,
    peers: HashMap<NodeId, PeerRecord>,
}

impl PeerManager {
    /// Create a peer manager for the local node.
    pub fn new(local_id: NodeId, config: PeerManagerConfig) -> Self {
        Self {
            local_id,
            config,
            peers: HashMap::new(),
        }
    }

    /// Record a sighting of a peer. Creates an `Observed` record for
    /// unknown peers; refreshes `last_heard` if the sighting is newer.
    pub fn observe(&mut self, node_id: &NodeId, endpoint: &str, heard_at: u64, now: u64) {
        if *node_id == self.local_id {
            return;
        }
        match self.peers.get_mut(node_id) {
            Some(record) => {
                if heard_at > record.last_heard {
                    record.last_heard = heard_at;
                }
                if !endpoint.is_empty() {
                    record.endpoint = endpoint.to_string();
                }
                record.last_seen = now;
            }
            None => {
                debug!(peer = %node_id, %endpoint, "observed new peer");
                let mut record = PeerRecord::new(node_id.clone(), endpoint.to_string(), now);
                record.last_heard = heard_at.min(now);
                self.peers.insert(node_id.clone(), record);
            }
        }
    }

    /// Merge a gossiped peer list. Returns the number of new peers.
    ///
    /// The merge keeps the newer `last_heard` per peer, which makes it
    /// commutative and associative across responses.
    pub fn merge_gossip(&mut self, entries: &[PeerEntry], now: u64) -> usize {
        let mut added = 0;
        for entry in entries {
            if entry.node_id == self.local_id {
                continue;
            }
            if !self.peers.contains_key(&entry.node_id) {
                added += 1;
            }
            self.observe(&entry.node_id, &entry.endpoint, entry.last_heard, now);
        }
        added
    }

    /// A dial or inbound handshake for this peer started.
    pub fn on_connecting(&mut self, node_id: &NodeId, endpoint: &str, now: u64) {
        self.observe(node_id, endpoint, now, now);
        if let Some(record) = self.peers.get_mut(node_id) {
            record.status = PeerStatus::Connecting;
        }
    }

    /// The peer's certificate verified and the connection established.
    pub fn on_connected(&mut self, node_id: &NodeId, endpoint: &str, roles: &[String], now: u64) {
        self.observe(node_id, endpoint, now, now);
        if let Some(record) = self.peers.get_mut(node_id) {
            record.status = PeerStatus::Connected;
            record.observed_roles = roles.to_vec();
            record.consecutive_failures = 0;
            record.next_dial_at = 0;
            record.last_heard = now;
        }
        self.record_success(node_id, GoodBehavior::Handshake, now);
    }

    /// The connection to this peer ended.
    pub fn on_disconnected(&mut self, node_id: &NodeId, now: u64) {
        if let Some(record) = self.peers.get_mut(node_id) {
            if record.status == PeerStatus::Connected || record.status == PeerStatus::Connecting {
                record.status = PeerStatus::Disconnected;
            }
            record.last_seen = now;
        }
    }

    /// A dial attempt failed; applies exponential backoff.
    pub fn on_dial_failure(&mut self, node_id: &NodeId, now: u64) {
        if let Some(record) = self.peers.get_mut(node_id) {
            record.consecutive_failures += 1;
            record.status = PeerStatus::Disconnected;
            let exponent = record.consecutive_failures.saturating_sub(1).min(16);
            let delay = self
                .config
                .dial_backoff_base_ms
                .saturating_mul(1u64 << exponent)
                .min(self.config.dial_backoff_cap_ms);
            record.next_dial_at = now + delay;
            record.last_seen = now;
            debug!(peer = %node_id, failures = record.consecutive_failures, delay_ms = delay,
                "dial failed, backing off");
        }
    }

    /// Reward a successful interaction.
    pub fn record_success(&mut self, node_id: &NodeId, _kind: GoodBehavior, now: u64) {
        if let Some(record) = self.peers.get_mut(node_id) {
            Self::clear_expired_blacklist(record, self.config.blacklist_threshold, now);
            record.reputation = (record.reputation + REPUTATION_REWARD).min(1.0);
            record.last_heard = now;
            record.last_seen = now;
        }
    }

    /// Penalize misbehavior. Returns the blacklist expiry if the peer's
    /// reputation crossed the threshold.
    pub fn record_misbehavior(
        &mut self,
        node_id: &NodeId,
        kind: Misbehavior,
        now: u64,
    ) -> Option<u64> {
        let threshold = self.config.blacklist_threshold;
        let base = self.config.blacklist_base_ms;
        let cap = self.config.blacklist_cap_ms;

        let record = self.peers.get_mut(node_id)?;
        Self::clear_expired_blacklist(record, threshold, now);
        record.reputation = (record.reputation - REPUTATION_PENALTY).max(0.0);
        record.last_seen = now;

        if record.reputation < threshold && !record.is_blacklisted(now) {
            let exponent = record.blacklist_strikes.min(16);
            let duration = base.saturating_mul(1u64 << exponent).min(cap);
            record.blacklist_strikes += 1;
            record.blacklisted_until = Some(now + duration);
            warn!(peer = %node_id, reason = kind.as_str(), duration_ms = duration,
                strikes = record.blacklist_strikes, "peer blacklisted");
            return record.blacklisted_until;
        }
        None
    }

    /// Blacklist a peer by decree (revocation or control command),
    /// independent of its reputation.
    pub fn force_blacklist(&mut self, node_id: &NodeId, until: u64, now: u64) {
        let record = self
            .peers
            .entry(node_id.clone())
            .or_insert_with(|| PeerRecord::new(node_id.clone(), String::new(), now));
        record.blacklist_strikes += 1;
        record.blacklisted_until = Some(until);
        record.reputation = 0.0;
        record.last_seen = now;
        warn!(peer = %node_id, until, "peer force-blacklisted");
    }

    /// Record an observed round-trip time.
    pub fn record_latency(&mut self, node_id: &NodeId, latency_ms: u64, now: u64) {
        if let Some(record) = self.peers.get_mut(node_id) {
            record.latency_ms = Some(latency_ms);
            record.last_heard = now;
        }
    }

    /// Whether the peer is currently blacklisted.
    pub fn is_blacklisted(&self, node_id: &NodeId, now: u64) -> bool {
        self.peers
            .get(node_id)
            .map(|record| record.is_blacklisted(now))
            .unwrap_or(false)
    }

    /// Peers eligible for an outbound dial at `now`: known endpoint, not
    /// connected, past their backoff, and not blacklisted.
    pub fn dial_candidates(&self, now: u64) -> Vec<&PeerRecord> {
        self.peers
            .values()
            .filter(|record| {
                record.status != PeerStatus::Connected
                    && record.status != PeerStatus::Connecting
                    && !record.endpoint.is_empty()
                    && record.next_dial_at <= now
                    && !record.is_blacklisted(now)
            })
            .collect()
    }

    /// Sample up to `cap` shareable peers for a gossip response.
    ///
    /// Blacklisted, low-reputation, and endpoint-less peers are never
    /// shared.
    pub fn sample_for_gossip(&self, cap: usize, now: u64) -> Vec<PeerEntry> {
        let mut candidates: Vec<&PeerRecord> = self
            .peers
            .values()
            .filter(|record| {
                !record.is_blacklisted(now)
                    && !record.endpoint.is_empty()
                    && record.reputation >= 0.5
            })
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(cap.min(self.config.gossip_cap));
        candidates
            .into_iter()
            .map(|record| PeerEntry {
                node_id: record.node_id.clone(),
                endpoint: record.endpoint.clone(),
                last_heard: record.last_heard,
            })
            .collect()
    }

    /// Evict peers unheard past the staleness window with no active
    /// connection. Returns the evicted ids.
    pub fn evict_stale(&mut self, now: u64) -> Vec<NodeId> {
        let stale_before = now.saturating_sub(self.config.stale_timeout_ms);
        let stale: Vec<NodeId> = self
            .peers
            .values()
            .filter(|record| {
                record.last_heard < stale_before
                    && record.status != PeerStatus::Connected
                    && record.status != PeerStatus::Connecting
            })
            .map(|record| record.node_id.clone())
            .collect();
        for node_id in &stale {
            info!(peer = %node_id, "evicting stale peer");
            self.peers.remove(node_id);
        }
        stale
    }

    /// Look up one peer.
    pub fn get(&self, node_id: &NodeId) -> Option<&PeerRecord> {
        self.peers.get(node_id)
    }

    /// All currently connected peer ids.
    pub fn connected(&self) -> Vec<NodeId> {
        self.peers
            .values()
            .filter(|record| record.status == PeerStatus::Connected)
            .map(|record| record.node_id.clone())
            .collect()
    }

    /// Counts: (known, connected, blacklisted).
    pub fn counts(&self, now: u64) -> (usize, usize, usize) {
        let connected = self
            .peers
            .values()
            .filter(|r| r.status == PeerStatus::Connected)
            .count();
        let blacklisted = self.peers.values().filter(|r| r.is_blacklisted(now)).count();
        (self.peers.len(), connected, blacklisted)
    }

    /// Snapshot every record for persistence.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers.values().cloned().collect()
    }

    /// Restore records from a persisted snapshot (warm start).
    ///
    /// Restored peers come back as `Observed`/`Disconnected`; live state
    /// is rebuilt by fresh handshakes.
    pub fn restore(&mut self, records: Vec<PeerRecord>) {
        for mut record in records {
            if record.node_id == self.local_id {
                continue;
            }
            if record.status == PeerStatus::Connected || record.status == PeerStatus::Connecting {
                record.status = PeerStatus::Disconnected;
            }
            self.peers.entry(record.node_id.clone()).or_insert(record);
        }
    }

    fn clear_expired_blacklist(record: &mut PeerRecord, threshold: f64, now: u64) {
        if let Some(until) = record.blacklisted_until {
            if now >= until {
                record.blacklisted_until = None;
                // Leave one step of headroom so a single new offense
                // re-triggers the (doubled) blacklist.
                record.reputation = record.reputation.max(threshold);
            }
        }
    }
}
