//! Ownership and role based authorization

use serde::Serialize;

use crate::claims::TokenClaims;

/// Roles that grant access to identities owned by someone else.
pub const DEFAULT_ADMIN_ROLES: &[&str] = &["admin", "realm-admin"];

/// Result of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PermissionDecision {
    /// Caller may act on the resource
    Allowed,
    /// Caller may not act on the resource
    Denied,
}

impl PermissionDecision {
    /// `true` for [`PermissionDecision::Allowed`].
    #[must_use]
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Evaluates ownership decisions from server-validated claims.
///
/// Identifiers supplied by the caller are only ever the *target* of a
/// comparison; the evidence is always the validated subject and roles.
#[derive(Debug, Clone)]
pub struct PermissionEvaluator {
    client_id: String,
    admin_roles: Vec<String>,
}

impl PermissionEvaluator {
    /// Evaluator for the serving client with the default admin roles.
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            admin_roles: DEFAULT_ADMIN_ROLES.iter().map(ToString::to_string).collect(),
        }
    }

    /// Replace the administrative role list. An empty list keeps the defaults.
    #[must_use]
    pub fn with_admin_roles(mut self, roles: Vec<String>) -> Self {
        if !roles.is_empty() {
            self.admin_roles = roles;
        }
        self
    }

    /// Client whose scoped roles count towards the effective role set.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Whether the caller holds an administrative role.
    #[must_use]
    pub fn is_admin(&self, claims: &TokenClaims) -> bool {
        let roles = claims.effective_roles(&self.client_id);
        self.admin_roles.iter().any(|r| roles.contains(r.as_str()))
    }

    /// Whether the caller holds every role in `required`, counting realm
    /// roles and the roles of every client. An empty list is always held.
    #[must_use]
    pub fn has_all_roles(claims: &TokenClaims, required: &[&str]) -> bool {
        let held = claims.all_roles();
        required.iter().all(|role| held.contains(role))
    }

    /// `Allowed` iff the caller owns the resource or is an administrator.
    ///
    /// A resource without an owner is only reachable by administrators.
    #[must_use]
    pub fn evaluate_ownership(
        &self,
        claims: &TokenClaims,
        resource_owner: Option<&str>,
    ) -> PermissionDecision {
        let owns = resource_owner.is_some_and(|owner| !owner.is_empty() && owner == claims.subject);
        if owns || self.is_admin(claims) {
            PermissionDecision::Allowed
        } else {
            PermissionDecision::Denied
        }
    }
}
