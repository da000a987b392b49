//! Node health: a tri-state summary with a list of current concerns.

use serde::Serialize;

/// Overall node health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// All checks pass
    Healthy,
    /// Operating with concerns
    Degraded,
    /// A critical check failed
    Unhealthy,
}

/// Inputs to the health evaluation, gathered from the subsystems.
#[derive(Debug, Clone)]
pub struct HealthInputs {
    /// Milliseconds until the join certificate expires (0 = expired)
    pub cert_remaining_ms: u64,
    /// Total certificate lifetime, ms
    pub cert_lifetime_ms: u64,
    /// Consecutive renewal failures
    pub renewal_failures: u32,
    /// Connected peers
    pub connected_peers: usize,
    /// Connected anchor peers
    pub connected_anchors: usize,
    /// Usable routing entries
    pub active_routes: usize,
    /// Whether a CRL has been loaded
    pub has_crl: bool,
    /// Whether the loaded CRL is past its advertised refresh time
    pub crl_stale: bool,
}

/// Health summary surfaced to operators.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Tri-state status
    pub status: HealthStatus,
    /// Human-readable concerns, empty when healthy
    pub concerns: Vec<String>,
}

/// Evaluate health from subsystem inputs.
///
/// Unhealthy: certificate expired or no connected peers. Degraded:
/// anything an operator should look at before it becomes unhealthy.
pub fn evaluate(inputs: &HealthInputs) -> HealthReport {
    let mut concerns = Vec::new();
    let mut unhealthy = false;

    if inputs.cert_remaining_ms == 0 {
        unhealthy = true;
        concerns.push("certificate expired".to_string());
    } else if inputs.cert_lifetime_ms > 0 {
        let remaining_pct =
            (inputs.cert_remaining_ms as f64 / inputs.cert_lifetime_ms as f64) * 100.0;
        if remaining_pct < 10.0 {
            concerns.push(format!(
                "certificate expires in {}h",
                inputs.cert_remaining_ms / 3_600_000
            ));
        }
    }

    if inputs.renewal_failures > 0 {
        concerns.push(format!(
            "certificate renewal failing ({} consecutive failures)",
            inputs.renewal_failures
        ));
    }

    if inputs.connected_peers == 0 {
        unhealthy = true;
        concerns.push("no connected peers".to_string());
    } else {
        if inputs.connected_anchors == 0 {
            concerns.push("no anchor connections".to_string());
        }
        if inputs.connected_peers < 3 {
            concerns.push(format!("low peer count ({})", inputs.connected_peers));
        }
    }

    if inputs.active_routes == 0 && inputs.connected_peers > 0 {
        concerns.push("routing table empty".to_string());
    }

    if !inputs.has_crl {
        concerns.push("no CRL loaded".to_string());
    } else if inputs.crl_stale {
        concerns.push("CRL past its refresh time".to_string());
    }

    let status = if unhealthy {
        HealthStatus::Unhealthy
    } else if concerns.is_empty() {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    };

    HealthReport { status, concerns }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn good_inputs() -> HealthInputs {
        HealthInputs {
            cert_remaining_ms: 500_000_000,
            cert_lifetime_ms: 604_800_000,
            renewal_failures: 0,
            connected_peers: 5,
            connected_anchors: 2,
            active_routes: 4,
            has_crl: true,
            crl_stale: false,
        }
    }

    #[test]
    fn test_healthy_with_no_concerns() {
        let report = evaluate(&good_inputs());
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.concerns.is_empty());
    }

    #[test]
    fn test_expired_cert_is_unhealthy() {
        let report = evaluate(&HealthInputs {
            cert_remaining_ms: 0,
            ..good_inputs()
        });
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(report.concerns.iter().any(|c| c.contains("expired")));
    }

    #[test]
    fn test_no_peers_is_unhealthy() {
        let report = evaluate(&HealthInputs {
            connected_peers: 0,
            connected_anchors: 0,
            ..good_inputs()
        });
        assert_eq!(report.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_renewal_failures_degrade_with_detail() {
        let report = evaluate(&HealthInputs {
            cert_remaining_ms: 7_200_000,
            renewal_failures: 3,
            ..good_inputs()
        });
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(report.concerns.iter().any(|c| c.contains("expires in 2h")));
        assert!(report.concerns.iter().any(|c| c.contains("renewal failing")));
    }

    #[test]
    fn test_missing_anchors_and_low_peers_degrade() {
        let report = evaluate(&HealthInputs {
            connected_peers: 1,
            connected_anchors: 0,
            ..good_inputs()
        });
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.concerns.len(), 2);
    }

    #[test]
    fn test_stale_crl_degrades() {
        let report = evaluate(&HealthInputs {
            crl_stale: true,
            ..good_inputs()
        });
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(report.concerns.iter().any(|c| c.contains("CRL")));
    }
}
