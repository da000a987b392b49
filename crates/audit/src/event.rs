//! Audit event structure and hash chaining.

use genesis_mesh_crypto::canonical;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `prev_hash` of the first event in a fresh log: 32 zero bytes, hex.
pub const GENESIS_PREV_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Kinds of security-relevant events recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    /// Join certificate issued
    CertIssued,
    /// Join certificate renewed
    CertRenewed,
    /// Certificate revoked
    CertRevoked,
    /// Own certificate expired without renewal
    CertExpired,
    /// Node runtime started
    NodeStarted,
    /// Node runtime stopped
    NodeStopped,
    /// Peer joined the mesh
    NodeJoined,
    /// Peer left the mesh
    NodeLeft,
    /// Peer blacklisted
    NodeBlacklisted,
    /// Connection established
    ConnEstablished,
    /// Connection attempt failed
    ConnFailed,
    /// Connection closed
    ConnClosed,
    /// Control message received
    ControlReceived,
    /// Control message accepted and dispatched
    ControlAccepted,
    /// Control message rejected
    ControlRejected,
    /// Policy manifest applied
    PolicyApplied,
    /// Peer authentication succeeded
    AuthSuccess,
    /// Peer authentication failed
    AuthFailure,
    /// A signature failed verification
    SignatureInvalid,
    /// CRL replaced by a higher sequence
    CrlUpdated,
    /// Received CRL carried an invalid signature
    CrlInvalidSignature,
}

/// One tamper-evident audit event.
///
/// `this_hash = BLAKE3(prev_hash ‖ canonical(fields except this_hash))`,
/// hex encoded. `index` is assigned by the single audit writer and is
/// strictly monotonic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Position in the chain, starting at 0
    pub index: u64,
    /// Hex hash of the predecessor event (zeroes for index 0)
    pub prev_hash: String,
    /// Event time, unix ms
    pub timestamp: u64,
    /// Event kind
    pub kind: AuditEventKind,
    /// Who triggered the event
    #[serde(default)]
    pub actor: Option<String>,
    /// What was affected
    #[serde(default)]
    pub subject: Option<String>,
    /// Structured detail payload
    #[serde(default)]
    pub detail: Value,
    /// Hash over `prev_hash` and the canonical event body
    pub this_hash: String,
}

impl AuditEvent {
    /// Build a fully-hashed event chained onto `prev_hash`.
    pub fn chained(
        index: u64,
        prev_hash: String,
        timestamp: u64,
        kind: AuditEventKind,
        actor: Option<String>,
        subject: Option<String>,
        detail: Value,
    ) -> Self {
        let mut event = Self {
            index,
            prev_hash,
            timestamp,
            kind,
            actor,
            subject,
            detail,
            this_hash: String::new(),
        };
        event.this_hash = event.compute_hash();
        event
    }

    /// Compute the chain hash for this event's current contents.
    pub fn compute_hash(&self) -> String {
        let mut value = match serde_json::to_value(self) {
            Ok(v) => v,
            Err(_) => return String::new(),
        };
        if let Value::Object(ref mut map) = value {
            map.remove("this_hash");
        }
        let body = canonical::to_canonical_json(&value);

        let mut hasher = blake3::Hasher::new();
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(body.as_bytes());
        hasher.finalize().to_hex().to_string()
    }

    /// Whether the stored hash matches the event contents.
    pub fn hash_is_consistent(&self) -> bool {
        self.this_hash == self.compute_hash()
    }
}
