//! Join certificate lifecycle: scheduled renewal with backoff.
//!
//! A renewal fires once half of the certificate's validity has elapsed
//! (configurable ratio). Failures back off along a fixed ladder; the
//! fifth consecutive failure at or after expiry shuts the node down.

use std::time::Duration;

use async_trait::async_trait;
use genesis_mesh_core::time;
use genesis_mesh_domain::JoinCertificate;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Renewal failures reported by the authority client.
#[derive(Debug, Error)]
pub enum RenewalError {
    /// Request exceeded its deadline
    #[error("renewal timed out")]
    Timeout,

    /// The authority refused the renewal
    #[error("renewal rejected: {0}")]
    Rejected(String),

    /// Transport failure reaching the authority
    #[error("renewal transport error: {0}")]
    Io(String),

    /// The returned certificate failed verification
    #[error("renewed certificate invalid: {0}")]
    InvalidCertificate(String),
}

/// Remote signer that can renew our join certificate.
///
/// Implemented by the Network Authority HTTP client; test doubles stand
/// in for it in unit tests.
#[async_trait]
pub trait CertificateRenewer: Send + Sync {
    /// Request a successor certificate for `current`.
    async fn renew(&self, current: &JoinCertificate) -> Result<JoinCertificate, RenewalError>;
}

/// Pure renewal policy, separated from the async driver for testability.
#[derive(Debug, Clone)]
pub struct RenewalSchedule {
    /// Fraction of the validity window after which renewal starts
    pub ratio: f64,
    /// Failure backoff ladder, ms; the last step repeats
    pub backoff_ladder_ms: Vec<u64>,
    /// Consecutive failures after which an expired certificate is fatal
    pub max_failures: u32,
}

impl RenewalSchedule {
    /// Schedule with the given renewal ratio and the standard ladder.
    pub fn new(ratio: f64) -> Self {
        Self {
            ratio,
            backoff_ladder_ms: vec![30_000, 60_000, 120_000, 300_000, 600_000],
            max_failures: 5,
        }
    }

    /// Whether renewal is due for `cert` at `now`.
    pub fn is_due(&self, cert: &JoinCertificate, now: u64) -> bool {
        now >= cert.renewal_due_at(self.ratio)
    }

    /// Backoff delay after `failures` consecutive failures (1-based).
    pub fn backoff_ms(&self, failures: u32) -> u64 {
        let last = self.backoff_ladder_ms.len().saturating_sub(1);
        let index = (failures.saturating_sub(1) as usize).min(last);
        self.backoff_ladder_ms.get(index).copied().unwrap_or(60_000)
    }

    /// Whether the failure count and clock mandate shutdown: the fifth
    /// consecutive failure at or after `expires_at`.
    pub fn is_fatal(&self, cert: &JoinCertificate, failures: u32, now: u64) -> bool {
        failures >= self.max_failures && now >= cert.expires_at
    }
}

impl Default for RenewalSchedule {
    fn default() -> Self {
        Self::new(0.5)
    }
}

/// Events emitted by the certificate manager.
#[derive(Debug, Clone)]
pub enum CertEvent {
    /// Renewal succeeded; handshakes must present the new certificate
    Renewed(Box<JoinCertificate>),
    /// One renewal attempt failed
    RenewalFailed {
        /// Consecutive failure count
        attempt: u32,
        /// Next retry delay, ms
        retry_in_ms: u64,
    },
    /// Renewal failed terminally after expiry; the node must shut down
    Expired,
}

/// Drives certificate renewal as a long-lived task.
pub struct CertManager<R: CertificateRenewer> {
    renewer: R,
    schedule: RenewalSchedule,
    cert_tx: watch::Sender<JoinCertificate>,
    events: mpsc::Sender<CertEvent>,
    check_interval: Duration,
}

impl<R: CertificateRenewer> CertManager<R> {
    /// Build the manager around the current certificate.
    ///
    /// Returns the manager plus a watch receiver through which every
    /// subsystem observes the live certificate.
    pub fn new(
        renewer: R,
        schedule: RenewalSchedule,
        initial_cert: JoinCertificate,
        events: mpsc::Sender<CertEvent>,
    ) -> (Self, watch::Receiver<JoinCertificate>) {
        let (cert_tx, cert_rx) = watch::channel(initial_cert);
        (
            Self {
                renewer,
                schedule,
                cert_tx,
                events,
                check_interval: Duration::from_secs(60),
            },
            cert_rx,
        )
    }

    /// Override the due-check cadence.
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Run until shutdown is signalled or renewal fails terminally.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut failures: u32 = 0;

        loop {
            let wait = if failures == 0 {
                self.check_interval
            } else {
                Duration::from_millis(self.schedule.backoff_ms(failures))
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            let current = self.cert_tx.borrow().clone();
            let now = time::unix_ms();
            if failures == 0 && !self.schedule.is_due(&current, now) {
                continue;
            }

            match self.attempt(&current).await {
                Ok(new_cert) => {
                    failures = 0;
                    info!(cert_id = %new_cert.cert_id, expires_at = new_cert.expires_at,
                        "certificate renewed");
                    let _ = self.cert_tx.send(new_cert.clone());
                    let _ = self.events.send(CertEvent::Renewed(Box::new(new_cert))).await;
                }
                Err(e) => {
                    failures += 1;
                    let now = time::unix_ms();
                    if self.schedule.is_fatal(&current, failures, now) {
                        error!(failures, "certificate expired with renewal failing; shutting down");
                        let _ = self.events.send(CertEvent::Expired).await;
                        return;
                    }
                    let retry_in_ms = self.schedule.backoff_ms(failures);
                    warn!(error = %e, attempt = failures, retry_in_ms, "certificate renewal failed");
                    let _ = self
                        .events
                        .send(CertEvent::RenewalFailed {
                            attempt: failures,
                            retry_in_ms,
                        })
                        .await;
                }
            }
        }
    }

    async fn attempt(&self, current: &JoinCertificate) -> Result<JoinCertificate, RenewalError> {
        let new_cert = self.renewer.renew(current).await?;
        if !new_cert.is_well_formed() {
            return Err(RenewalError::InvalidCertificate(
                "renewed certificate is malformed".to_string(),
            ));
        }
        if new_cert.expires_at <= current.expires_at {
            return Err(RenewalError::InvalidCertificate(
                "renewed certificate does not extend validity".to_string(),
            ));
        }
        Ok(new_cert)
    }
}
