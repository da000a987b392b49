//! Routing announcement protocol: periodic full-table announcements and
//! withdrawal floods, bridged onto the wire message set.

use genesis_mesh_core::NodeId;
use genesis_mesh_transport::{Message, RouteAdvert, RouteWithdrawal};
use tracing::debug;

use crate::table::{RoutingTable, UpdateOutcome};

/// Result of processing one inbound announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AnnounceOutcome {
    /// Routes newly installed
    pub installed: usize,
    /// Routes replaced or refreshed
    pub updated: usize,
    /// Adverts that lost to the selection rule
    pub rejected: usize,
}

impl AnnounceOutcome {
    /// Whether any advert changed the table.
    pub fn changed(&self) -> bool {
        self.installed > 0 || self.updated > 0
    }
}

/// Builds and consumes routing protocol messages against the table.
pub struct Announcer {
    local_id: NodeId,
}

impl Announcer {
    /// Announcer for the local node.
    pub fn new(local_id: NodeId) -> Self {
        Self { local_id }
    }

    /// Build the periodic full-table announcement.
    pub fn build_announcement(&self, table: &mut RoutingTable, now: u64) -> Message {
        Message::RouteAnnounce {
            routes: table.build_announcement(now),
        }
    }

    /// Build a withdrawal flood for invalidated destinations.
    pub fn build_withdrawal(&self, withdrawals: Vec<RouteWithdrawal>) -> Option<Message> {
        if withdrawals.is_empty() {
            return None;
        }
        Some(Message::RouteWithdraw { withdrawals })
    }

    /// Apply an inbound announcement from `from`.
    pub fn handle_announce(
        &self,
        table: &mut RoutingTable,
        from: &NodeId,
        routes: &[RouteAdvert],
        now: u64,
    ) -> AnnounceOutcome {
        let mut outcome = AnnounceOutcome::default();
        for advert in routes {
            // Routes that would go through us come straight back; skip.
            if advert.destination == self.local_id {
                continue;
            }
            match table.apply_advert(from, advert, now) {
                UpdateOutcome::Installed => outcome.installed += 1,
                UpdateOutcome::Updated | UpdateOutcome::Refreshed => outcome.updated += 1,
                UpdateOutcome::Rejected => outcome.rejected += 1,
            }
        }
        debug!(%from, installed = outcome.installed, updated = outcome.updated,
            rejected = outcome.rejected, "processed route announcement");
        outcome
    }

    /// Apply an inbound withdrawal flood; returns the withdrawals that
    /// superseded local state and should be re-flooded.
    pub fn handle_withdrawals(
        &self,
        table: &mut RoutingTable,
        from: &NodeId,
        withdrawals: &[RouteWithdrawal],
        now: u64,
    ) -> Vec<RouteWithdrawal> {
        withdrawals
            .iter()
            .filter(|withdrawal| table.apply_withdrawal(from, withdrawal, now))
            .cloned()
            .collect()
    }
}
