//! Control-plane messages: signed administrative commands.

use genesis_mesh_crypto::SignatureEntry;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::certificate::JoinCertificate;

/// Control command kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
    /// Apply a new policy manifest
    PolicyUpdate,
    /// Revoke a certificate
    RevokeCertificate,
    /// Revoke (blacklist) a node
    RevokeNode,
    /// Replace the bootstrap anchor list
    UpdateBootstrap,
    /// Shut the target node down
    ShutdownNode,
    /// Relay an emergency CRL push
    EmergencyCrlPush,
}

impl ControlCommand {
    /// Stable snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlCommand::PolicyUpdate => "policy_update",
            ControlCommand::RevokeCertificate => "revoke_certificate",
            ControlCommand::RevokeNode => "revoke_node",
            ControlCommand::UpdateBootstrap => "update_bootstrap",
            ControlCommand::ShutdownNode => "shutdown_node",
            ControlCommand::EmergencyCrlPush => "emergency_crl_push",
        }
    }
}

/// Conventional control scopes.
///
/// Scopes are free-form strings matched against role scope patterns
/// (exact values or `prefix:*` wildcards); these are the values the
/// built-in constructors use.
pub mod scope {
    /// The entire network
    pub const NETWORK: &str = "network";
    /// A regional subset
    pub const REGION: &str = "region";
    /// A single node; commonly `node:<id>`
    pub const NODE: &str = "node";
    /// Policy administration
    pub const POLICY: &str = "policy:manifest";
    /// Mesh relay operations
    pub const MESH: &str = "mesh:relay";
}

/// Signed administrative command.
///
/// Accepted only when the issuer certificate verifies through the trust
/// chain, its roles permit the command over the scope, the message
/// signature verifies, the validity window holds, and the message id has
/// not been seen before.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Globally unique message id
    pub message_id: String,
    /// Command kind
    pub command: ControlCommand,
    /// Command scope
    pub scope: String,
    /// Issuer key id
    pub issuer: String,
    /// Issuer certificate establishing roles for this command
    pub issuer_cert: JoinCertificate,
    /// Issue timestamp, unix ms
    pub issued_at: u64,
    /// Expiration timestamp, unix ms
    pub expires_at: u64,
    /// Target node or service id, if the command is addressed
    #[serde(default)]
    pub target: Option<String>,
    /// Command payload
    #[serde(default)]
    pub data: Value,
    /// Issuer signature over the canonical message bytes
    #[serde(default)]
    pub signatures: Vec<SignatureEntry>,
}

impl ControlMessage {
    /// Whether the message's validity window covers `now` (inclusive).
    pub fn is_live_at(&self, now: u64) -> bool {
        self.issued_at <= now && now <= self.expires_at
    }

    /// Build an unsigned policy update addressed to the whole network.
    pub fn policy_update(
        message_id: String,
        issuer_cert: JoinCertificate,
        policy: Value,
        now: u64,
        ttl_ms: u64,
    ) -> Self {
        Self::base(
            message_id,
            ControlCommand::PolicyUpdate,
            scope::NETWORK.to_string(),
            issuer_cert,
            now,
            ttl_ms,
            None,
            serde_json::json!({ "policy": policy }),
        )
    }

    /// Build an unsigned certificate revocation.
    pub fn revoke_certificate(
        message_id: String,
        issuer_cert: JoinCertificate,
        certificate_id: &str,
        subject_public_key: &str,
        reason: &str,
        now: u64,
        ttl_ms: u64,
    ) -> Self {
        Self::base(
            message_id,
            ControlCommand::RevokeCertificate,
            scope::NETWORK.to_string(),
            issuer_cert,
            now,
            ttl_ms,
            None,
            serde_json::json!({
                "certificate_id": certificate_id,
                "subject_public_key": subject_public_key,
                "reason": reason,
            }),
        )
    }

    /// Build an unsigned node revocation.
    pub fn revoke_node(
        message_id: String,
        issuer_cert: JoinCertificate,
        node_id: &str,
        reason: &str,
        now: u64,
        ttl_ms: u64,
    ) -> Self {
        Self::base(
            message_id,
            ControlCommand::RevokeNode,
            scope::NETWORK.to_string(),
            issuer_cert,
            now,
            ttl_ms,
            None,
            serde_json::json!({ "node_id": node_id, "reason": reason }),
        )
    }

    /// Build an unsigned bootstrap anchor update.
    pub fn update_bootstrap(
        message_id: String,
        issuer_cert: JoinCertificate,
        anchors: Vec<String>,
        now: u64,
        ttl_ms: u64,
    ) -> Self {
        Self::base(
            message_id,
            ControlCommand::UpdateBootstrap,
            scope::NETWORK.to_string(),
            issuer_cert,
            now,
            ttl_ms,
            None,
            serde_json::json!({ "anchors": anchors }),
        )
    }

    /// Build an unsigned shutdown command for a single node.
    pub fn shutdown_node(
        message_id: String,
        issuer_cert: JoinCertificate,
        target_node: &str,
        reason: &str,
        now: u64,
        ttl_ms: u64,
    ) -> Self {
        Self::base(
            message_id,
            ControlCommand::ShutdownNode,
            format!("{}:{}", scope::NODE, target_node),
            issuer_cert,
            now,
            ttl_ms,
            Some(target_node.to_string()),
            serde_json::json!({ "reason": reason }),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn base(
        message_id: String,
        command: ControlCommand,
        scope: String,
        issuer_cert: JoinCertificate,
        now: u64,
        ttl_ms: u64,
        target: Option<String>,
        data: Value,
    ) -> Self {
        Self {
            message_id,
            command,
            scope,
            issuer: issuer_cert.issued_by.clone(),
            issuer_cert,
            issued_at: now,
            expires_at: now + ttl_ms,
            target,
            data,
            signatures: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert() -> JoinCertificate {
        JoinCertificate {
            cert_id: "cert-1".to_string(),
            node_public_key: "pk".to_string(),
            network_name: "mesh-test".to_string(),
            roles: vec!["role:admin".to_string()],
            scopes: vec!["*".to_string()],
            issued_at: 0,
            expires_at: 1_000_000,
            serial: 1,
            issued_by: "na".to_string(),
            signatures: vec![],
        }
    }

    #[test]
    fn test_validity_window_inclusive() {
        let msg = ControlMessage::policy_update(
            "pu-1".to_string(),
            cert(),
            serde_json::json!({"policy_id": "p1"}),
            1_000,
            500,
        );
        assert!(!msg.is_live_at(999));
        assert!(msg.is_live_at(1_000));
        assert!(msg.is_live_at(1_500));
        assert!(!msg.is_live_at(1_501));
    }

    #[test]
    fn test_shutdown_targets_node_scope() {
        let msg = ControlMessage::shutdown_node(
            "sd-1".to_string(),
            cert(),
            "node-x",
            "decommissioned",
            0,
            100,
        );
        assert_eq!(msg.command, ControlCommand::ShutdownNode);
        assert_eq!(msg.scope, "node:node-x");
        assert_eq!(msg.target.as_deref(), Some("node-x"));
    }

    #[test]
    fn test_command_serde_names() {
        let json = serde_json::to_string(&ControlCommand::PolicyUpdate).unwrap();
        assert_eq!(json, "\"policy_update\"");
        assert_eq!(scope::NETWORK, "network");
    }

    #[test]
    fn test_revoke_certificate_payload() {
        let msg = ControlMessage::revoke_certificate(
            "rv-1".to_string(),
            cert(),
            "cert-9",
            "key-9",
            "compromised",
            0,
            100,
        );
        assert_eq!(msg.data["certificate_id"], "cert-9");
        assert_eq!(msg.data["subject_public_key"], "key-9");
    }
}
