//! Destination-sequenced distance-vector routing table.
//!
//! Every node originates announcements for itself at metric 0 with an
//! even, monotonically increasing sequence number; odd sequence numbers
//! mark withdrawals. Per destination, the installed sequence is the
//! maximum valid sequence ever observed, which keeps convergence
//! loop-free without global coordination.

use std::collections::{HashMap, HashSet};

use genesis_mesh_core::NodeId;
use genesis_mesh_transport::{RouteAdvert, RouteWithdrawal};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Routing table tuning parameters.
#[derive(Debug, Clone)]
pub struct RoutingTableConfig {
    /// Maximum accepted route metric (hops)
    pub max_hops: u8,
    /// Routes unrefreshed for this long are evicted, ms
    pub stale_timeout_ms: u64,
    /// Invalidated routes linger this long before removal, ms
    pub grace_ms: u64,
}

impl Default for RoutingTableConfig {
    fn default() -> Self {
        Self {
            max_hops: 6,
            stale_timeout_ms: 90_000,
            grace_ms: 30_000,
        }
    }
}

/// Whether a route is usable or awaiting removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteState {
    /// Usable for forwarding
    Active,
    /// Withdrawn or next-hop lost; kept through a grace window
    Invalidated {
        /// When the route was invalidated, unix ms
        since: u64,
    },
}

/// One entry in the routing table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Destination node id
    pub destination: NodeId,
    /// Neighbor to forward through
    pub next_hop: NodeId,
    /// Hop count to the destination
    pub metric: u8,
    /// Destination sequence number (even = announced, odd = withdrawn)
    pub sequence: u64,
    /// Neighbor this route was learned from
    pub learned_from: NodeId,
    /// Last refresh, unix ms
    pub last_updated: u64,
    /// Active or invalidated
    pub state: RouteState,
}

impl RouteEntry {
    /// Whether this entry can carry traffic at `now`.
    pub fn is_usable(&self, stale_timeout_ms: u64, now: u64) -> bool {
        self.state == RouteState::Active
            && now.saturating_sub(self.last_updated) <= stale_timeout_ms
    }
}

/// Outcome of applying one advertised route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// A new destination was installed
    Installed,
    /// An existing entry was replaced by a better one
    Updated,
    /// An existing entry was refreshed in place
    Refreshed,
    /// The advert lost to the selection rule or was invalid
    Rejected,
}

/// DSDV routing table for one node.
#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    config: RoutingTableConfig,
    routes: HashMap<NodeId, RouteEntry>,
    neighbors: HashSet<NodeId>,
    /// Our own destination sequence; always even.
    own_sequence: u64,
}

impl RoutingTable {
    /// Create the table for the local node.
    pub fn new(local_id: NodeId, config: RoutingTableConfig) -> Self {
        Self {
            local_id,
            config,
            routes: HashMap::new(),
            neighbors: HashSet::new(),
            own_sequence: 0,
        }
    }

    /// Apply a new hop cap from policy. Existing longer routes age out
    /// through the staleness sweep.
    pub fn set_max_hops(&mut self, max_hops: u8) {
        self.config.max_hops = max_hops;
    }

    /// Register a direct neighbor (established connection) and install
    /// its one-hop route.
    pub fn add_neighbor(&mut self, peer_id: &NodeId, now: u64) {
        self.neighbors.insert(peer_id.clone());
        let entry = self
            .routes
            .entry(peer_id.clone())
            .or_insert_with(|| RouteEntry {
                destination: peer_id.clone(),
                next_hop: peer_id.clone(),
                metric: 1,
                sequence: 0,
                learned_from: peer_id.clone(),
                last_updated: now,
                state: RouteState::Active,
            });
        // A direct link supersedes any multi-hop path we had.
        entry.next_hop = peer_id.clone();
        entry.metric = 1;
        entry.learned_from = peer_id.clone();
        entry.last_updated = now;
        entry.state = RouteState::Active;
        info!(peer = %peer_id, "neighbor added");
    }

    /// Remove a neighbor: every route through it is invalidated with an
    /// odd sequence and the withdrawals are returned for flooding.
    pub fn remove_neighbor(&mut self, peer_id: &NodeId, now: u64) -> Vec<RouteWithdrawal> {
        self.neighbors.remove(peer_id);

        let mut withdrawals = Vec::new();
        for entry in self.routes.values_mut() {
            if entry.next_hop == *peer_id && entry.state == RouteState::Active {
                // Odd sequence marks the withdrawal and outranks the
                // announcement it supersedes.
                entry.sequence += 1;
                entry.state = RouteState::Invalidated { since: now };
                withdrawals.push(RouteWithdrawal {
                    destination: entry.destination.clone(),
                    sequence: entry.sequence,
                });
            }
        }
        info!(peer = %peer_id, invalidated = withdrawals.len(), "neighbor removed");
        withdrawals
    }

    /// Apply one advertised route from a neighbor.
    ///
    /// Selection rule: accept iff the sequence is newer, or the sequence
    /// is equal and the metric (after the +1 hop to `from`) is strictly
    /// better. Equal-metric ties keep the existing route; the secondary
    /// tie-break prefers the lexically lower next hop.
    pub fn apply_advert(&mut self, from: &NodeId, advert: &RouteAdvert, now: u64) -> UpdateOutcome {
        if advert.destination == self.local_id {
            return UpdateOutcome::Rejected;
        }
        if !self.neighbors.contains(from) {
            debug!(%from, dest = %advert.destination, "advert from non-neighbor rejected");
            return UpdateOutcome::Rejected;
        }

        let metric = advert.metric.saturating_add(1);
        if metric > self.config.max_hops {
            return UpdateOutcome::Rejected;
        }

        match self.routes.get_mut(&advert.destination) {
            None => {
                self.routes.insert(
                    advert.destination.clone(),
                    RouteEntry {
                        destination: advert.destination.clone(),
                        next_hop: from.clone(),
                        metric,
                        sequence: advert.sequence,
                        learned_from: from.clone(),
                        last_updated: now,
                        state: RouteState::Active,
                    },
                );
                debug!(dest = %advert.destination, via = %from, metric, seq = advert.sequence,
                    "route installed");
                UpdateOutcome::Installed
            }
            Some(existing) => {
                let accept = if advert.sequence > existing.sequence {
                    true
                } else if matches!(existing.state, RouteState::Invalidated { .. }) {
                    // A withdrawn entry holds the odd sequence; any
                    // finite route at the underlying even sequence
                    // restores reachability through an alternate path.
                    advert.sequence + 1 >= existing.sequence
                } else if advert.sequence == existing.sequence {
                    if metric < existing.metric {
                        true
                    } else if metric == existing.metric && existing.next_hop != *from {
                        // Stability first; then the lexically lower hop.
                        *from < existing.next_hop
                    } else if existing.next_hop == *from {
                        // Same route re-announced: refresh only.
                        existing.last_updated = now;
                        return UpdateOutcome::Refreshed;
                    } else {
                        false
                    }
                } else {
                    false
                };

                if !accept {
                    return UpdateOutcome::Rejected;
                }

                existing.next_hop = from.clone();
                existing.metric = metric;
                existing.sequence = advert.sequence;
                existing.learned_from = from.clone();
                existing.last_updated = now;
                existing.state = RouteState::Active;
                UpdateOutcome::Updated
            }
        }
    }

    /// Apply a flooded withdrawal. Returns true when it superseded the
    /// local entry (and should be re-flooded).
    ///
    /// Only routes that actually pass through the withdrawing neighbor
    /// are poisoned; a destination reachable on another path keeps its
    /// route, which is what lets the mesh re-converge within one
    /// announcement interval after a link loss.
    pub fn apply_withdrawal(
        &mut self,
        from: &NodeId,
        withdrawal: &RouteWithdrawal,
        now: u64,
    ) -> bool {
        if withdrawal.sequence % 2 == 0 {
            return false;
        }
        if withdrawal.destination == self.local_id {
            // Someone withdrew us; our next own announcement outranks it.
            self.own_sequence = self.own_sequence.max(withdrawal.sequence + 1);
            return false;
        }
        match self.routes.get_mut(&withdrawal.destination) {
            Some(entry) if entry.next_hop == *from && withdrawal.sequence > entry.sequence => {
                debug!(dest = %withdrawal.destination, via = %from, seq = withdrawal.sequence,
                    "route withdrawn");
                entry.sequence = withdrawal.sequence;
                entry.state = RouteState::Invalidated { since: now };
                true
            }
            _ => false,
        }
    }

    /// Advance and return our own (even) announcement sequence.
    pub fn next_own_sequence(&mut self) -> u64 {
        self.own_sequence += 2;
        self.own_sequence
    }

    /// Build the full-table announcement: ourselves at metric 0 with a
    /// fresh sequence, plus every active route.
    pub fn build_announcement(&mut self, now: u64) -> Vec<RouteAdvert> {
        let own_sequence = self.next_own_sequence();
        let mut adverts = vec![RouteAdvert {
            destination: self.local_id.clone(),
            metric: 0,
            sequence: own_sequence,
        }];
        for entry in self.routes.values() {
            if entry.is_usable(self.config.stale_timeout_ms, now) {
                adverts.push(RouteAdvert {
                    destination: entry.destination.clone(),
                    metric: entry.metric,
                    sequence: entry.sequence,
                });
            }
        }
        adverts
    }

    /// Usable next hop toward `destination` at `now`.
    pub fn next_hop(&self, destination: &NodeId, now: u64) -> Option<&NodeId> {
        self.routes.get(destination).and_then(|entry| {
            if entry.is_usable(self.config.stale_timeout_ms, now) {
                Some(&entry.next_hop)
            } else {
                None
            }
        })
    }

    /// Look up an entry regardless of state.
    pub fn get(&self, destination: &NodeId) -> Option<&RouteEntry> {
        self.routes.get(destination)
    }

    /// Whether `peer_id` is a registered neighbor.
    pub fn is_neighbor(&self, peer_id: &NodeId) -> bool {
        self.neighbors.contains(peer_id)
    }

    /// Current neighbors.
    pub fn neighbors(&self) -> Vec<NodeId> {
        self.neighbors.iter().cloned().collect()
    }

    /// Drop stale actives and invalidated entries past their grace
    /// window. Returns the removed destinations.
    pub fn sweep(&mut self, now: u64) -> Vec<NodeId> {
        let stale_timeout = self.config.stale_timeout_ms;
        let grace = self.config.grace_ms;
        let neighbors = self.neighbors.clone();

        let removable: Vec<NodeId> = self
            .routes
            .values()
            .filter(|entry| match entry.state {
                RouteState::Active => {
                    now.saturating_sub(entry.last_updated) > stale_timeout
                        && !neighbors.contains(&entry.destination)
                }
                RouteState::Invalidated { since } => now.saturating_sub(since) > grace,
            })
            .map(|entry| entry.destination.clone())
            .collect();

        for destination in &removable {
            self.routes.remove(destination);
            debug!(dest = %destination, "route evicted");
        }
        removable
    }

    /// Routing statistics: (total entries, active, neighbors).
    pub fn stats(&self, now: u64) -> (usize, usize, usize) {
        let active = self
            .routes
            .values()
            .filter(|entry| entry.is_usable(self.config.stale_timeout_ms, now))
            .count();
        (self.routes.len(), active, self.neighbors.len())
    }
}
