//! Genesis Mesh - Peer Layer and Routing
//!
//! Tracks every known peer with a behavioral reputation, discovers new
//! peers through gossip exchange, and routes datagrams with a
//! destination-sequenced distance-vector table.
//!
//! # Core Components
//!
//! - **Peer Manager**: peer lifecycle, reputation scoring, blacklisting,
//!   and dial backoff
//! - **Discovery**: periodic peer-list exchange seeded from the genesis
//!   bootstrap anchors
//! - **Routing Table**: DSDV-style table with per-destination sequence
//!   numbers for loop-free convergence
//! - **Router**: TTL-checked forwarding with a seen-id guard against
//!   duplicates and loops

#![warn(missing_docs)]

pub mod announce;
pub mod discovery;
pub mod peer;
pub mod router;
pub mod table;

pub use announce::{AnnounceOutcome, Announcer};
pub use discovery::Discovery;
pub use peer::{
    GoodBehavior, Misbehavior, PeerManager, PeerManagerConfig, PeerRecord, PeerStatus,
};
pub use router::{DropReason, ForwardDecision, Router, SeenCache};
pub use table::{RouteEntry, RouteState, RoutingTable, RoutingTableConfig, UpdateOutcome};
