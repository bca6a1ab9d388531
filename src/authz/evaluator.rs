use async_trait::async_trait;

use super::principal::Principal;

/// Pluggable authorization decision.
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    async fn can(&self, principal: &Principal, resource: &str, action: &str) -> bool;
}

/// Allows when any grant matches on both sides, either exactly or by wildcard.
#[derive(Debug, Clone, Default)]
pub struct DefaultPolicyEvaluator;

impl DefaultPolicyEvaluator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PolicyEvaluator for DefaultPolicyEvaluator {
    async fn can(&self, principal: &Principal, resource: &str, action: &str) -> bool {
        let allowed = principal.grants.iter().any(|g| g.allows(resource, action));

        tracing::debug!(
            user_id = %principal.user_id,
            resource,
            action,
            allowed,
            "policy evaluated"
        );
        allowed
    }
}
