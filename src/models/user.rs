use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::events::{Loggable, Severity};

/// A bank staff user. The password hash never leaves [`DbUser`].
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub full_name: String,
    pub email: String,
    pub is_active: bool,
    pub failed_login_attempts: i64,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl Loggable for User {
    fn entity_type() -> &'static str { "user" }
    fn subject_id(&self) -> Uuid { self.id }
    fn severity_for_action(&self, action: &str) -> Severity {
        match action {
            "login" | "logout" => Severity::Noise,
            "login_failed" | "locked" | "deactivated" => Severity::Critical,
            _ => self.severity(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DbUser {
    pub id: Uuid,
    pub username: String,
    pub full_name: String,
    pub email: String,
    pub password_hash: String,
    pub is_active: bool,
    pub failed_login_attempts: i64,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl From<DbUser> for User {
    fn from(value: DbUser) -> Self {
        User {
            id: value.id,
            username: value.username,
            full_name: value.full_name,
            email: value.email,
            is_active: value.is_active,
            failed_login_attempts: value.failed_login_attempts,
            last_login_at: value.last_login_at,
            created_at: value.created_at,
            updated_at: value.updated_at,
            version: value.version,
        }
    }
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct LoginRequest {
    #[schema(example = "backoffice01")]
    pub username: String,
    #[schema(example = "S3cureP@ssw0rd")]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ProvisionUserRequest {
    #[schema(example = "loanofficer01")]
    pub username: String,
    #[schema(example = "Grace Wanjiru")]
    pub full_name: String,
    #[schema(example = "grace@bank.example")]
    pub email: String,
    #[schema(example = "S3cureP@ssw0rd")]
    pub password: String,
}

/// Outcome of a login attempt. Failures carry a message, never an error.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AuthResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl AuthResult {
    pub fn success(user: User, token: String, expires_at: DateTime<Utc>) -> Self {
        Self {
            success: true,
            user: Some(user),
            token: Some(token),
            expires_at: Some(expires_at),
            error_message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            user: None,
            token: None,
            expires_at: None,
            error_message: Some(message.into()),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionStatus {
    pub user_id: Uuid,
    pub active: bool,
}
