//! Gossip-based peer discovery.
//!
//! At startup the node dials every bootstrap anchor from genesis; from
//! then on each discovery round asks connected peers for a sample of
//! their active peers and merges the responses.

use genesis_mesh_core::NodeId;
use genesis_mesh_transport::{Message, PeerEntry};
use tracing::info;

use crate::peer::PeerManager;

/// Discovery gossip over the peer manager.
pub struct Discovery {
    bootstrap_endpoints: Vec<String>,
    gossip_cap: usize,
}

impl Discovery {
    /// New discovery engine.
    ///
    /// `bootstrap_endpoints` is the union of the genesis anchors and any
    /// extra endpoints from local configuration, deduplicated in order.
    pub fn new(mut bootstrap_endpoints: Vec<String>, gossip_cap: usize) -> Self {
        let mut seen = std::collections::HashSet::new();
        bootstrap_endpoints.retain(|endpoint| seen.insert(endpoint.clone()));
        Self {
            bootstrap_endpoints,
            gossip_cap,
        }
    }

    /// Endpoints to dial at startup.
    pub fn bootstrap_endpoints(&self) -> &[String] {
        &self.bootstrap_endpoints
    }

    /// The periodic peer-list request.
    pub fn build_request(&self) -> Message {
        Message::PeerListRequest
    }

    /// Answer a peer-list request with a bounded sample of our peers.
    pub fn build_response(&self, peers: &PeerManager, now: u64) -> Message {
        Message::PeerListResponse {
            peers: peers.sample_for_gossip(self.gossip_cap, now),
        }
    }

    /// Merge a peer-list response. Returns how many peers were new.
    pub fn handle_response(
        &self,
        peers: &mut PeerManager,
        from: &NodeId,
        entries: &[PeerEntry],
        now: u64,
    ) -> usize {
        // Responders cap their samples; an oversized list is truncated
        // rather than trusted.
        let bounded = &entries[..entries.len().min(self.gossip_cap)];
        let added = peers.merge_gossip(bounded, now);
        if added > 0 {
            info!(%from, added, "discovered new peers via gossip");
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerManagerConfig;

    fn manager() -> PeerManager {
        PeerManager::new("local".to_string(), PeerManagerConfig::default())
    }

    fn entry(id: &str) -> PeerEntry {
        PeerEntry {
            node_id: id.to_string(),
            endpoint: "10.0.0.9:7600".to_string(),
            last_heard: 100,
        }
    }

    #[test]
    fn test_bootstrap_endpoints_deduplicated() {
        let discovery = Discovery::new(
            vec![
                "a:1".to_string(),
                "b:2".to_string(),
                "a:1".to_string(),
            ],
            32,
        );
        assert_eq!(discovery.bootstrap_endpoints(), &["a:1", "b:2"]);
    }

    #[test]
    fn test_response_bounded_by_cap() {
        let mut peers = manager();
        for i in 0..40 {
            peers.observe(&format!("p{}", i), "e", 100, 100);
        }
        let discovery = Discovery::new(vec![], 8);
        match discovery.build_response(&peers, 200) {
            Message::PeerListResponse { peers } => assert_eq!(peers.len(), 8),
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_handle_response_merges_and_counts() {
        let mut peers = manager();
        let discovery = Discovery::new(vec![], 32);

        let added = discovery.handle_response(
            &mut peers,
            &"responder".to_string(),
            &[entry("p1"), entry("p2")],
            200,
        );
        assert_eq!(added, 2);

        // Second response with one overlap.
        let added = discovery.handle_response(
            &mut peers,
            &"responder".to_string(),
            &[entry("p2"), entry("p3")],
            300,
        );
        assert_eq!(added, 1);
    }

    #[test]
    fn test_oversized_response_truncated() {
        let mut peers = manager();
        let discovery = Discovery::new(vec![], 4);
        let entries: Vec<PeerEntry> = (0..20).map(|i| entry(&format!("p{}", i))).collect();

        let added = discovery.handle_response(&mut peers, &"responder".to_string(), &entries, 200);
        assert_eq!(added, 4);
    }
}
