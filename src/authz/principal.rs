use std::collections::HashSet;

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::models::rbac::Grant;

/// The authenticated user with the union of grants across their active roles.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: Uuid,
    pub roles: HashSet<String>,
    pub grants: HashSet<Grant>,
    /// Highest approval limit over the active roles; zero without roles.
    pub max_approval_limit: Decimal,
}

impl Principal {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            roles: HashSet::new(),
            grants: HashSet::new(),
            max_approval_limit: Decimal::ZERO,
        }
    }

    pub fn with_roles(mut self, roles: impl IntoIterator<Item = String>) -> Self {
        self.roles = roles.into_iter().collect();
        self
    }

    pub fn with_grants(mut self, grants: impl IntoIterator<Item = Grant>) -> Self {
        self.grants = grants.into_iter().collect();
        self
    }

    pub fn with_approval_limit(mut self, limit: Decimal) -> Self {
        self.max_approval_limit = limit;
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    pub fn has_any_role<'a>(&self, roles: impl IntoIterator<Item = &'a str>) -> bool {
        roles.into_iter().any(|r| self.has_role(r))
    }

    pub fn is_super_admin(&self) -> bool {
        self.grants.iter().any(Grant::is_wildcard)
    }
}
