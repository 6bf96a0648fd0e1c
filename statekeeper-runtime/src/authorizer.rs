//! Role based authorization for the `Permission` condition.

use crate::config::AuthorizationConfig;
use statekeeper_core::{Authorizer, Context, Identity};

/// Grants a permission when the identity's role on the subject is granted
/// it in the configuration.
#[derive(Debug, Clone)]
pub struct RoleAuthorizer {
    config: AuthorizationConfig,
}

impl RoleAuthorizer {
    pub fn new(config: AuthorizationConfig) -> Self {
        Self { config }
    }
}

impl Authorizer for RoleAuthorizer {
    fn can(&self, identity: &Identity, permission: &str, ctx: &Context<'_>) -> bool {
        let role = match ctx.role() {
            Some(role) => role.to_string(),
            None => match ctx.subject().role_for(identity) {
                Some(role) => role,
                None => return false,
            },
        };
        let granted = self.config.grants(&role, permission);
        tracing::debug!(
            identity = %identity,
            role = %role,
            permission,
            granted,
            "Permission check"
        );
        granted
    }
}
