//! Control-plane message handler: acceptance rule, replay protection,
//! and dispatch to typed actions.

use std::num::NonZeroUsize;

use genesis_mesh_core::ErrorKind;
use genesis_mesh_crypto::{keys, signing};
use genesis_mesh_domain::{ControlCommand, ControlMessage, Crl, TrustChain, TrustError};
use lru::LruCache;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::rbac::RbacPolicy;

/// Default replay cache capacity.
const REPLAY_CACHE_CAPACITY: usize = 16_384;
/// Default replay entry retention, ms. At least the longest allowed
/// control message validity window.
const REPLAY_TTL_MS: u64 = 3_600_000;

/// Why a control message was rejected.
///
/// The remote peer only ever receives a generic rejection; the specific
/// reason goes to the audit log and metrics.
#[derive(Debug, Error)]
pub enum RejectReason {
    /// Issuer certificate failed trust chain verification
    #[error("issuer certificate invalid: {0}")]
    IssuerCert(#[from] TrustError),

    /// Issuer roles do not permit the command over the scope
    #[error("roles {roles:?} not authorized for {command:?} over '{scope}'")]
    Unauthorized {
        /// Roles carried by the issuer certificate
        roles: Vec<String>,
        /// Requested command
        command: ControlCommand,
        /// Requested scope
        scope: String,
    },

    /// Message signature failed under the issuer subject key
    #[error("message signature invalid")]
    BadSignature,

    /// Message outside its validity window
    #[error("message outside validity window at {now}")]
    Expired {
        /// Evaluation time, unix ms
        now: u64,
    },

    /// Message id already dispatched
    #[error("message id '{message_id}' already processed")]
    Replay {
        /// The replayed id
        message_id: String,
    },

    /// Command payload missing required fields
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

impl RejectReason {
    /// Classify for metrics and audit.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            RejectReason::IssuerCert(TrustError::ExpiredCert { .. }) => ErrorKind::ExpiredCert,
            RejectReason::IssuerCert(TrustError::RevokedCert { .. }) => ErrorKind::RevokedCert,
            RejectReason::IssuerCert(TrustError::UnknownIssuer(_)) => ErrorKind::UnknownIssuer,
            RejectReason::IssuerCert(_) => ErrorKind::BadSignature,
            RejectReason::Unauthorized { .. } => ErrorKind::UnauthorizedRole,
            RejectReason::BadSignature => ErrorKind::BadSignature,
            RejectReason::Expired { .. } => ErrorKind::Timeout,
            RejectReason::Replay { .. } => ErrorKind::ReplayDetected,
            RejectReason::MalformedPayload(_) => ErrorKind::ProtocolViolation,
        }
    }
}

/// Action an accepted control message dispatches into the node.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlAction {
    /// Apply a policy manifest payload
    ApplyPolicy(Value),
    /// Pass a revocation to the CRL store / peer layer
    RevokeCertificate {
        /// Revoked certificate id
        certificate_id: String,
        /// Revoked subject key (base64)
        subject_public_key: String,
        /// Stated reason
        reason: String,
    },
    /// Blacklist a node and drop its connections
    RevokeNode {
        /// Node to revoke
        node_id: String,
        /// Stated reason
        reason: String,
    },
    /// Replace the bootstrap anchor list
    UpdateBootstrap {
        /// New anchor endpoints
        anchors: Vec<String>,
    },
    /// Begin graceful shutdown
    Shutdown {
        /// Stated reason
        reason: String,
    },
    /// Re-flood the CRL carried in the accompanying push
    RelayCrlPush,
}

/// Bounded, TTL-checked cache of processed message ids.
pub struct ReplayCache {
    entries: LruCache<String, u64>,
    ttl_ms: u64,
}

impl ReplayCache {
    /// Cache with explicit bounds.
    pub fn new(capacity: usize, ttl_ms: u64) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            ttl_ms,
        }
    }

    /// Whether `message_id` counts as already processed at `now`.
    pub fn contains(&self, message_id: &str, now: u64) -> bool {
        match self.entries.peek(message_id) {
            Some(&seen_at) => now.saturating_sub(seen_at) <= self.ttl_ms,
            None => false,
        }
    }

    /// Record a dispatched message id.
    pub fn record(&mut self, message_id: &str, now: u64) {
        self.entries.put(message_id.to_string(), now);
    }

    /// Resident entry count.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new(REPLAY_CACHE_CAPACITY, REPLAY_TTL_MS)
    }
}

/// Validates and dispatches control-plane messages.
pub struct ControlHandler {
    local_id: String,
    rbac: RbacPolicy,
    replay: ReplayCache,
}

impl ControlHandler {
    /// Handler for the local node.
    pub fn new(local_id: String, rbac: RbacPolicy) -> Self {
        Self {
            local_id,
            rbac,
            replay: ReplayCache::default(),
        }
    }

    /// Override the replay cache bounds.
    pub fn with_replay_cache(mut self, capacity: usize, ttl_ms: u64) -> Self {
        self.replay = ReplayCache::new(capacity, ttl_ms);
        self
    }

    /// Apply the acceptance rule to one control message.
    ///
    /// On acceptance the message id is recorded and the dispatched
    /// action returned; `Ok(None)` means the message was valid but
    /// addressed to a different node. Every rejection carries the
    /// specific reason for audit, never shared verbatim with the peer.
    pub fn handle(
        &mut self,
        message: &ControlMessage,
        trust: &TrustChain,
        crl: Option<&Crl>,
        now: u64,
    ) -> Result<Option<ControlAction>, RejectReason> {
        // 1. Issuer certificate verifies, unrevoked, unexpired.
        trust.verify_certificate(&message.issuer_cert, now, crl)?;

        // 2. Roles intersect the set permitted for the command.
        // 3. Scope matches a permitted pattern for those roles.
        if !self
            .rbac
            .is_authorized(&message.issuer_cert.roles, message.command, &message.scope)
        {
            return Err(RejectReason::Unauthorized {
                roles: message.issuer_cert.roles.clone(),
                command: message.command,
                scope: message.scope.clone(),
            });
        }

        // 4. Signature over the canonical bytes under the subject key.
        self.verify_message_signature(message)?;

        // 5. Validity window covers now.
        if !message.is_live_at(now) {
            return Err(RejectReason::Expired { now });
        }

        // 6. Message id unseen within the replay window.
        if self.replay.contains(&message.message_id, now) {
            warn!(message_id = %message.message_id, "replayed control message");
            return Err(RejectReason::Replay {
                message_id: message.message_id.clone(),
            });
        }

        // Addressed elsewhere: valid, but not ours to execute.
        if let Some(target) = &message.target {
            if *target != self.local_id {
                debug!(message_id = %message.message_id, %target, "control message not for us");
                return Ok(None);
            }
        }

        let action = self.dispatch(message)?;
        self.replay.record(&message.message_id, now);
        Ok(Some(action))
    }

    fn verify_message_signature(&self, message: &ControlMessage) -> Result<(), RejectReason> {
        let subject_key = &message.issuer_cert.node_public_key;
        let subject_key_id =
            keys::key_id_for_b64(subject_key).map_err(|_| RejectReason::BadSignature)?;

        for entry in &message.signatures {
            if entry.key_id != subject_key_id {
                continue;
            }
            return signing::verify_object(message, entry, subject_key)
                .map_err(|_| RejectReason::BadSignature);
        }
        Err(RejectReason::BadSignature)
    }

    fn dispatch(&self, message: &ControlMessage) -> Result<ControlAction, RejectReason> {
        let data = &message.data;
        let action = match message.command {
            ControlCommand::PolicyUpdate => {
                let policy = data
                    .get("policy")
                    .cloned()
                    .ok_or_else(|| RejectReason::MalformedPayload("missing policy".to_string()))?;
                ControlAction::ApplyPolicy(policy)
            }
            ControlCommand::RevokeCertificate => ControlAction::RevokeCertificate {
                certificate_id: require_str(data, "certificate_id")?,
                subject_public_key: require_str(data, "subject_public_key")?,
                reason: optional_str(data, "reason"),
            },
            ControlCommand::RevokeNode => ControlAction::RevokeNode {
                node_id: require_str(data, "node_id")?,
                reason: optional_str(data, "reason"),
            },
            ControlCommand::UpdateBootstrap => {
                let anchors = data
                    .get("anchors")
                    .and_then(Value::as_array)
                    .ok_or_else(|| RejectReason::MalformedPayload("missing anchors".to_string()))?
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect();
                ControlAction::UpdateBootstrap { anchors }
            }
            ControlCommand::ShutdownNode => ControlAction::Shutdown {
                reason: optional_str(data, "reason"),
            },
            ControlCommand::EmergencyCrlPush => ControlAction::RelayCrlPush,
        };
        Ok(action)
    }
}

fn require_str(data: &Value, field: &str) -> Result<String, RejectReason> {
    data.get(field)
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| RejectReason::MalformedPayload(format!("missing {}", field)))
}

fn optional_str(data: &Value, field: &str) -> String {
    data.get(field)
        .and_then(Value::as_str)
        .unwrap_or("unspecified")
        .to_string()
}
