//! Node metrics: atomic counters and gauges with a snapshot view.
//!
//! Exposition formatting is left to an external scraper; the node keeps
//! programmatic counters, including one per error kind.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use genesis_mesh_core::ErrorKind;
use serde::Serialize;

/// Counter registry shared across the node's tasks.
#[derive(Debug)]
pub struct Metrics {
    /// Established connections, lifetime total
    pub connections_established: AtomicU64,
    /// Failed connections, lifetime total
    pub connections_failed: AtomicU64,
    /// Messages sent
    pub messages_sent: AtomicU64,
    /// Messages received
    pub messages_received: AtomicU64,
    /// Messages forwarded on behalf of other nodes
    pub messages_forwarded: AtomicU64,
    /// Messages dropped (backpressure, TTL, no route, duplicates)
    pub messages_dropped: AtomicU64,
    /// Route entries installed or updated
    pub routes_updated: AtomicU64,
    /// Peers discovered through gossip
    pub peers_discovered: AtomicU64,
    /// Peers blacklisted
    pub peers_blacklisted: AtomicU64,
    /// Certificate renewals succeeded
    pub cert_renewals: AtomicU64,
    /// Certificate renewals failed
    pub cert_renewal_failures: AtomicU64,
    /// Highest CRL sequence accepted
    pub crl_sequence: AtomicU64,
    /// Control messages accepted
    pub control_accepted: AtomicU64,
    /// Control messages rejected
    pub control_rejected: AtomicU64,
    errors: HashMap<ErrorKind, AtomicU64>,
}

impl Metrics {
    /// Registry with every error-kind counter pre-registered.
    pub fn new() -> Self {
        let errors = ErrorKind::all()
            .iter()
            .map(|kind| (*kind, AtomicU64::new(0)))
            .collect();
        Self {
            connections_established: AtomicU64::new(0),
            connections_failed: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_forwarded: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            routes_updated: AtomicU64::new(0),
            peers_discovered: AtomicU64::new(0),
            peers_blacklisted: AtomicU64::new(0),
            cert_renewals: AtomicU64::new(0),
            cert_renewal_failures: AtomicU64::new(0),
            crl_sequence: AtomicU64::new(0),
            control_accepted: AtomicU64::new(0),
            control_rejected: AtomicU64::new(0),
            errors,
        }
    }

    /// Count one occurrence of an error kind.
    pub fn record_error(&self, kind: ErrorKind) {
        if let Some(counter) = self.errors.get(&kind) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record the accepted CRL sequence (monotonic max).
    pub fn record_crl_sequence(&self, sequence: u64) {
        self.crl_sequence.fetch_max(sequence, Ordering::Relaxed);
    }

    /// Point-in-time snapshot of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_established: self.connections_established.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_forwarded: self.messages_forwarded.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            routes_updated: self.routes_updated.load(Ordering::Relaxed),
            peers_discovered: self.peers_discovered.load(Ordering::Relaxed),
            peers_blacklisted: self.peers_blacklisted.load(Ordering::Relaxed),
            cert_renewals: self.cert_renewals.load(Ordering::Relaxed),
            cert_renewal_failures: self.cert_renewal_failures.load(Ordering::Relaxed),
            crl_sequence: self.crl_sequence.load(Ordering::Relaxed),
            control_accepted: self.control_accepted.load(Ordering::Relaxed),
            control_rejected: self.control_rejected.load(Ordering::Relaxed),
            errors: self
                .errors
                .iter()
                .map(|(kind, counter)| (kind.as_str().to_string(), counter.load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Established connections
    pub connections_established: u64,
    /// Failed connections
    pub connections_failed: u64,
    /// Messages sent
    pub messages_sent: u64,
    /// Messages received
    pub messages_received: u64,
    /// Messages forwarded
    pub messages_forwarded: u64,
    /// Messages dropped
    pub messages_dropped: u64,
    /// Routing table updates
    pub routes_updated: u64,
    /// Peers discovered
    pub peers_discovered: u64,
    /// Peers blacklisted
    pub peers_blacklisted: u64,
    /// Certificate renewals
    pub cert_renewals: u64,
    /// Certificate renewal failures
    pub cert_renewal_failures: u64,
    /// Current CRL sequence
    pub crl_sequence: u64,
    /// Control messages accepted
    pub control_accepted: u64,
    /// Control messages rejected
    pub control_rejected: u64,
    /// Per-error-kind counters
    pub errors: HashMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_error_kind_preregistered() {
        let metrics = Metrics::new();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.errors.len(), ErrorKind::all().len());
        assert!(snapshot.errors.values().all(|&v| v == 0));
    }

    #[test]
    fn test_error_counting() {
        let metrics = Metrics::new();
        metrics.record_error(ErrorKind::ReplayDetected);
        metrics.record_error(ErrorKind::ReplayDetected);
        metrics.record_error(ErrorKind::NoRoute);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.errors["replay_detected"], 2);
        assert_eq!(snapshot.errors["no_route"], 1);
        assert_eq!(snapshot.errors["timeout"], 0);
    }

    #[test]
    fn test_crl_sequence_is_monotonic_max() {
        let metrics = Metrics::new();
        metrics.record_crl_sequence(5);
        metrics.record_crl_sequence(3);
        assert_eq!(metrics.snapshot().crl_sequence, 5);
        metrics.record_crl_sequence(9);
        assert_eq!(metrics.snapshot().crl_sequence, 9);
    }
}
