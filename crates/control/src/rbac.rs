//! Role-based access control for the control plane.

use std::collections::HashMap;

use genesis_mesh_domain::ControlCommand;

/// Capabilities attached to one role.
#[derive(Debug, Clone)]
struct RoleCapabilities {
    allowed_commands: Vec<ControlCommand>,
    /// Scope patterns: exact strings or `prefix:*` wildcards; `*`
    /// matches everything.
    allowed_scopes: Vec<String>,
}

/// The role capability table.
///
/// Defaults:
///
/// | role | commands | scopes |
/// |---|---|---|
/// | `role:operator` | policy_update, update_bootstrap | `policy:*`, `network`, `region` |
/// | `role:admin` | all | `*` |
/// | `role:anchor` | emergency_crl_push (relay) | `mesh:*`, `network` |
/// | `role:client` | none | none |
#[derive(Debug, Clone)]
pub struct RbacPolicy {
    roles: HashMap<String, RoleCapabilities>,
}

impl Default for RbacPolicy {
    fn default() -> Self {
        let mut roles = HashMap::new();
        roles.insert(
            "role:operator".to_string(),
            RoleCapabilities {
                allowed_commands: vec![
                    ControlCommand::PolicyUpdate,
                    ControlCommand::UpdateBootstrap,
                ],
                allowed_scopes: vec![
                    "policy:*".to_string(),
                    "network".to_string(),
                    "region".to_string(),
                ],
            },
        );
        roles.insert(
            "role:admin".to_string(),
            RoleCapabilities {
                allowed_commands: vec![
                    ControlCommand::PolicyUpdate,
                    ControlCommand::RevokeCertificate,
                    ControlCommand::RevokeNode,
                    ControlCommand::UpdateBootstrap,
                    ControlCommand::ShutdownNode,
                    ControlCommand::EmergencyCrlPush,
                ],
                allowed_scopes: vec!["*".to_string()],
            },
        );
        roles.insert(
            "role:anchor".to_string(),
            RoleCapabilities {
                allowed_commands: vec![ControlCommand::EmergencyCrlPush],
                allowed_scopes: vec!["mesh:*".to_string(), "network".to_string()],
            },
        );
        roles.insert(
            "role:client".to_string(),
            RoleCapabilities {
                allowed_commands: vec![],
                allowed_scopes: vec![],
            },
        );
        Self { roles }
    }
}

impl RbacPolicy {
    /// Grant a custom role.
    pub fn grant(
        &mut self,
        role: &str,
        commands: Vec<ControlCommand>,
        scopes: Vec<String>,
    ) {
        self.roles.insert(
            role.to_string(),
            RoleCapabilities {
                allowed_commands: commands,
                allowed_scopes: scopes,
            },
        );
    }

    /// Whether any of `roles` permits `command` over `scope`.
    pub fn is_authorized(&self, roles: &[String], command: ControlCommand, scope: &str) -> bool {
        roles
            .iter()
            .any(|role| self.role_permits(role, command, scope))
    }

    fn role_permits(&self, role: &str, command: ControlCommand, scope: &str) -> bool {
        let caps = match self.roles.get(role) {
            Some(caps) => caps,
            None => return false,
        };
        if !caps.allowed_commands.contains(&command) {
            return false;
        }
        caps.allowed_scopes
            .iter()
            .any(|pattern| scope_matches(pattern, scope))
    }
}

/// Match a scope against a pattern: `*` matches anything; a pattern
/// ending in `:*` matches its prefix and anything under it; otherwise
/// the match is exact.
pub fn scope_matches(pattern: &str, scope: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(":*") {
        return scope == prefix || scope.starts_with(&format!("{}:", prefix));
    }
    pattern == scope
}
