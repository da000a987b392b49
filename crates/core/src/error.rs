//! Error taxonomy for Genesis Mesh.
//!
//! Every failure in the node maps onto one of the closed set of
//! [`ErrorKind`] values so that metrics and audit records can classify
//! errors uniformly across subsystems.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The closed set of failure kinds recognized across the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid or missing configuration
    Config,
    /// Network or filesystem I/O failure
    Io,
    /// Operation exceeded its deadline
    Timeout,
    /// Cryptographic signature did not verify
    BadSignature,
    /// Certificate outside its validity window
    ExpiredCert,
    /// Certificate present in the revocation list
    RevokedCert,
    /// Signer key id not resolvable through the trust chain
    UnknownIssuer,
    /// Issuer role does not permit the requested operation
    UnauthorizedRole,
    /// Message id already processed
    ReplayDetected,
    /// No usable route to the destination
    NoRoute,
    /// Packet time-to-live reached zero
    TtlExpired,
    /// Connection pool at capacity
    PoolFull,
    /// Peer is currently blacklisted
    PeerBlacklisted,
    /// Request rejected by a rate limit
    RateLimited,
    /// Canonical serialization failed
    Canonicalization,
    /// Frame or message violated the wire protocol
    ProtocolViolation,
    /// Audit hash chain verification failed
    ChainBroken,
}

impl ErrorKind {
    /// Stable snake_case name, used as a metrics label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
            ErrorKind::Timeout => "timeout",
            ErrorKind::BadSignature => "bad_signature",
            ErrorKind::ExpiredCert => "expired_cert",
            ErrorKind::RevokedCert => "revoked_cert",
            ErrorKind::UnknownIssuer => "unknown_issuer",
            ErrorKind::UnauthorizedRole => "unauthorized_role",
            ErrorKind::ReplayDetected => "replay_detected",
            ErrorKind::NoRoute => "no_route",
            ErrorKind::TtlExpired => "ttl_expired",
            ErrorKind::PoolFull => "pool_full",
            ErrorKind::PeerBlacklisted => "peer_blacklisted",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Canonicalization => "canonicalization",
            ErrorKind::ProtocolViolation => "protocol_violation",
            ErrorKind::ChainBroken => "chain_broken",
        }
    }

    /// All kinds, in declaration order. Used to pre-register metrics counters.
    pub fn all() -> &'static [ErrorKind] {
        &[
            ErrorKind::Config,
            ErrorKind::Io,
            ErrorKind::Timeout,
            ErrorKind::BadSignature,
            ErrorKind::ExpiredCert,
            ErrorKind::RevokedCert,
            ErrorKind::UnknownIssuer,
            ErrorKind::UnauthorizedRole,
            ErrorKind::ReplayDetected,
            ErrorKind::NoRoute,
            ErrorKind::TtlExpired,
            ErrorKind::PoolFull,
            ErrorKind::PeerBlacklisted,
            ErrorKind::RateLimited,
            ErrorKind::Canonicalization,
            ErrorKind::ProtocolViolation,
            ErrorKind::ChainBroken,
        ]
    }

    /// Whether this kind is security-relevant and must always be audited.
    pub fn is_security_relevant(&self) -> bool {
        matches!(
            self,
            ErrorKind::BadSignature
                | ErrorKind::RevokedCert
                | ErrorKind::UnauthorizedRole
                | ErrorKind::ReplayDetected
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parse error
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

impl CoreError {
    /// Classify this error into the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Config(_) => ErrorKind::Config,
            CoreError::Io(_) => ErrorKind::Io,
            CoreError::Parse(_) => ErrorKind::Config,
        }
    }
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
