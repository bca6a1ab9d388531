use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::events::{Loggable, Severity};

/// Stored form of the wildcard on either side of a permission.
pub const WILDCARD: &str = "All";

// =============================================================================
// PERMISSION
// =============================================================================

/// One side of a permission: a named resource/action, or every one of them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Target {
    All,
    Named(String),
}

impl Target {
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Target::All => true,
            Target::Named(name) => name == value,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Target::All => WILDCARD,
            Target::Named(name) => name,
        }
    }
}

impl From<String> for Target {
    fn from(value: String) -> Self {
        if value == WILDCARD {
            Target::All
        } else {
            Target::Named(value)
        }
    }
}

impl From<&str> for Target {
    fn from(value: &str) -> Self {
        Target::from(value.to_string())
    }
}

impl From<Target> for String {
    fn from(value: Target) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The (resource, action) pair a permission grants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct Grant {
    #[schema(value_type = String, example = "Workflow")]
    pub resource: Target,
    #[schema(value_type = String, example = "Approve")]
    pub action: Target,
}

impl Grant {
    pub fn new(resource: impl Into<Target>, action: impl Into<Target>) -> Self {
        Self {
            resource: resource.into(),
            action: action.into(),
        }
    }

    pub fn wildcard() -> Self {
        Self::new(Target::All, Target::All)
    }

    pub fn is_wildcard(&self) -> bool {
        self.resource == Target::All && self.action == Target::All
    }

    pub fn allows(&self, resource: &str, action: &str) -> bool {
        self.resource.matches(resource) && self.action.matches(action)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct Permission {
    pub id: Uuid,
    #[serde(flatten)]
    pub grant: Grant,
    pub created_at: DateTime<Utc>,
}

impl Permission {
    pub fn allows(&self, resource: &str, action: &str) -> bool {
        self.grant.allows(resource, action)
    }
}

impl Loggable for Permission {
    fn entity_type() -> &'static str { "permission" }
    fn subject_id(&self) -> Uuid { self.id }
    fn severity(&self) -> Severity { Severity::Critical }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PermissionCreateRequest {
    #[schema(example = "Workflow")]
    pub resource: String,
    #[schema(example = "Approve")]
    pub action: String,
}

// =============================================================================
// ROLE
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Largest amount this role may authorize alone.
    #[schema(value_type = String, example = "50000")]
    pub approval_limit: Decimal,
    pub is_active: bool,
    pub permissions: Vec<Permission>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Loggable for Role {
    fn entity_type() -> &'static str { "role" }
    fn subject_id(&self) -> Uuid { self.id }
    fn severity(&self) -> Severity { Severity::Critical }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RoleCreateRequest {
    #[schema(example = "LoanOfficer")]
    pub name: String,
    #[schema(example = "Originates and approves retail loans")]
    pub description: Option<String>,
    #[serde(default)]
    #[schema(value_type = String, example = "50000")]
    pub approval_limit: Decimal,
    #[serde(default)]
    pub permission_ids: Vec<Uuid>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct RoleUpdateRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    #[schema(value_type = Option<String>)]
    pub approval_limit: Option<Decimal>,
    pub is_active: Option<bool>,
    /// Replaces the whole permission set when present.
    pub permission_ids: Option<Vec<Uuid>>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AssignPermissionToRoleRequest {
    pub permission_id: Uuid,
}

// =============================================================================
// USER-ROLE ASSIGNMENT
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserRoleAssignment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub assigned_by: Uuid,
    pub assigned_at: DateTime<Utc>,
    pub is_active: bool,
}

impl Loggable for UserRoleAssignment {
    fn entity_type() -> &'static str { "user_role" }
    fn subject_id(&self) -> Uuid { self.user_id }
    fn severity(&self) -> Severity { Severity::Critical }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AssignRoleRequest {
    pub role_id: Uuid,
}

// =============================================================================
// AUTHORIZATION QUERIES
// =============================================================================

#[derive(Debug, Deserialize, ToSchema)]
pub struct AuthorizeRequest {
    #[schema(example = "Workflow")]
    pub resource: String,
    #[schema(example = "Approve")]
    pub action: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AuthorizeResponse {
    pub user_id: Uuid,
    pub allowed: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ApprovalLimitRequest {
    #[schema(value_type = String, example = "75000")]
    pub amount: Decimal,
    #[schema(example = "loan_approval")]
    pub action_type: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApprovalRequirement {
    pub requires_approval: bool,
    /// Highest approval limit across the user's active roles (zero without roles).
    #[schema(value_type = String)]
    pub approval_limit: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approver_role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_strings_parse_to_tagged_targets() {
        assert_eq!(Target::from("All"), Target::All);
        assert_eq!(Target::from("Workflow"), Target::Named("Workflow".into()));
        // exact-case sentinel only
        assert_eq!(Target::from("all"), Target::Named("all".into()));
    }

    #[test]
    fn grant_matching_honours_each_wildcard_side() {
        let exact = Grant::new("Workflow", "Approve");
        assert!(exact.allows("Workflow", "Approve"));
        assert!(!exact.allows("Workflow", "Reject"));
        assert!(!exact.allows("Account", "Approve"));

        let any_action = Grant::new("Workflow", Target::All);
        assert!(any_action.allows("Workflow", "Reject"));
        assert!(!any_action.allows("Account", "Reject"));

        let any_resource = Grant::new(Target::All, "View");
        assert!(any_resource.allows("Account", "View"));
        assert!(!any_resource.allows("Account", "Delete"));

        assert!(Grant::wildcard().allows("Anything", "Whatsoever"));
        assert!(Grant::wildcard().is_wildcard());
    }

    #[test]
    fn grant_serializes_with_sentinel_strings() {
        let json = serde_json::to_value(Grant::new(Target::All, "Approve")).unwrap();
        assert_eq!(json, serde_json::json!({"resource": "All", "action": "Approve"}));
    }
}
