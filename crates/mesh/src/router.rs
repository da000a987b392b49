//! Datagram forwarding with TTL and duplicate suppression.

use std::num::NonZeroUsize;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use genesis_mesh_core::NodeId;
use genesis_mesh_transport::DataPayload;
use lru::LruCache;
use tracing::debug;

use crate::table::RoutingTable;

/// Default capacity of the seen-id cache.
const SEEN_CACHE_CAPACITY: usize = 4096;
/// Default lifetime of a seen-id entry, ms.
const SEEN_TTL_MS: u64 = 60_000;

/// Bounded recent-seen cache for payload ids.
///
/// An id counts as seen while it is both resident in the LRU and within
/// its TTL; eviction by capacity or expiry makes it fresh again.
pub struct SeenCache {
    entries: LruCache<String, u64>,
    ttl_ms: u64,
}

impl SeenCache {
    /// Cache with the given capacity and entry TTL.
    pub fn new(capacity: usize, ttl_ms: u64) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            ttl_ms,
        }
    }

    /// Record `id` at `now`; returns true if it was fresh.
    pub fn insert_if_fresh(&mut self, id: &str, now: u64) -> bool {
        if let Some(&seen_at) = self.entries.peek(id) {
            if now.saturating_sub(seen_at) <= self.ttl_ms {
                return false;
            }
        }
        self.entries.put(id.to_string(), now);
        true
    }

    /// Number of resident entries (including expired ones not yet evicted).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SeenCache {
    fn default() -> Self {
        Self::new(SEEN_CACHE_CAPACITY, SEEN_TTL_MS)
    }
}

/// Why a packet was not forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Time-to-live reached zero
    TtlExpired,
    /// No usable route to the destination
    NoRoute,
    /// The payload id was seen within the guard window
    Duplicate,
}

/// Outcome of routing one packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardDecision {
    /// The packet is addressed to us
    Deliver,
    /// Send to this next hop with the decremented TTL
    Forward {
        /// Neighbor to forward through
        next_hop: NodeId,
    },
    /// Re-flood to every active peer except the ingress
    Flood,
    /// Drop the packet
    Drop(DropReason),
}

/// Forwarding engine for one node.
pub struct Router {
    local_id: NodeId,
    seen: SeenCache,
    max_hops: u8,
    origination_counter: u64,
}

impl Router {
    /// Router for the local node; `max_hops` caps originated TTLs.
    pub fn new(local_id: NodeId, max_hops: u8) -> Self {
        Self {
            local_id,
            seen: SeenCache::default(),
            max_hops,
            origination_counter: 0,
        }
    }

    /// Override the seen-cache parameters.
    pub fn with_seen_cache(mut self, capacity: usize, ttl_ms: u64) -> Self {
        self.seen = SeenCache::new(capacity, ttl_ms);
        self
    }

    /// Apply a new hop cap from policy.
    pub fn set_max_hops(&mut self, max_hops: u8) {
        self.max_hops = max_hops;
    }

    /// Route one inbound packet, mutating its TTL on the forward path.
    ///
    /// The checks run in protocol order: local delivery, TTL, route
    /// lookup, then the duplicate guard. A payload id seen within the
    /// guard window is dropped even if it arrives on a new link.
    pub fn route(
        &mut self,
        table: &RoutingTable,
        payload: &mut DataPayload,
        now: u64,
    ) -> ForwardDecision {
        let destination = match &payload.destination {
            Some(destination) => destination.clone(),
            None => return self.route_broadcast(payload, now),
        };

        if destination == self.local_id {
            return ForwardDecision::Deliver;
        }

        if payload.ttl == 0 {
            debug!(payload_id = %payload.payload_id, "dropping: ttl expired on ingress");
            return ForwardDecision::Drop(DropReason::TtlExpired);
        }
        payload.ttl -= 1;
        if payload.ttl == 0 {
            debug!(payload_id = %payload.payload_id, "dropping: ttl exhausted");
            return ForwardDecision::Drop(DropReason::TtlExpired);
        }

        let next_hop = match table.next_hop(&destination, now) {
            Some(next_hop) => next_hop.clone(),
            None => {
                debug!(dest = %destination, "dropping: no route");
                return ForwardDecision::Drop(DropReason::NoRoute);
            }
        };

        if !self.seen.insert_if_fresh(&payload.payload_id, now) {
            debug!(payload_id = %payload.payload_id, "dropping: duplicate");
            return ForwardDecision::Drop(DropReason::Duplicate);
        }

        ForwardDecision::Forward { next_hop }
    }

    fn route_broadcast(&mut self, payload: &mut DataPayload, now: u64) -> ForwardDecision {
        if !self.seen.insert_if_fresh(&payload.payload_id, now) {
            return ForwardDecision::Drop(DropReason::Duplicate);
        }
        if payload.ttl == 0 {
            return ForwardDecision::Drop(DropReason::TtlExpired);
        }
        payload.ttl -= 1;
        ForwardDecision::Flood
    }

    /// Build an originated packet: TTL capped at `max_hops` and a unique
    /// payload id derived from the source, a counter, and the data.
    pub fn originate(
        &mut self,
        destination: Option<NodeId>,
        data: &[u8],
        now: u64,
    ) -> DataPayload {
        self.origination_counter += 1;
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.local_id.as_bytes());
        hasher.update(&self.origination_counter.to_be_bytes());
        hasher.update(&now.to_be_bytes());
        hasher.update(data);
        let payload_id = hasher.finalize().to_hex()[..32].to_string();

        // Mark our own originations as seen so a routing loop cannot
        // bounce them back through us.
        self.seen.insert_if_fresh(&payload_id, now);

        DataPayload {
            source: self.local_id.clone(),
            destination,
            payload_id,
            ttl: self.max_hops,
            data: BASE64.encode(data),
        }
    }
}
