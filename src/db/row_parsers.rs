use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::rbac::{Grant, Permission, Role, UserRoleAssignment};
use crate::models::user::DbUser;
use crate::models::workflow::{ApprovalStep, WorkflowInstance};

pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>, AppError> {
    let s = s.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    // SQLite CURRENT_TIMESTAMP format
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(Utc.from_utc_datetime(&naive));
    }

    Err(AppError::internal(format!("invalid datetime: {}", s)))
}

fn parse_opt_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, AppError> {
    match s {
        Some(s) if !s.trim().is_empty() => Ok(Some(parse_datetime(&s)?)),
        _ => Ok(None),
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(s).map_err(|e| AppError::internal(format!("invalid uuid: {}", e)))
}

fn parse_opt_uuid(s: Option<String>) -> Result<Option<Uuid>, AppError> {
    s.as_deref().map(parse_uuid).transpose()
}

fn parse_decimal(s: &str) -> Result<Decimal, AppError> {
    Decimal::from_str(s.trim()).map_err(|e| AppError::internal(format!("invalid amount '{}': {}", s, e)))
}

fn col<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, AppError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| AppError::internal(format!("missing {}: {}", name, e)))
}

pub fn db_user_from_row(row: &SqliteRow) -> Result<DbUser, AppError> {
    Ok(DbUser {
        id: parse_uuid(&col::<String>(row, "id")?)?,
        username: col(row, "username")?,
        full_name: col(row, "full_name")?,
        email: col(row, "email")?,
        password_hash: col(row, "password_hash")?,
        is_active: col(row, "is_active")?,
        failed_login_attempts: col(row, "failed_login_attempts")?,
        last_login_at: parse_opt_datetime(col(row, "last_login_at")?)?,
        created_at: parse_datetime(&col::<String>(row, "created_at")?)?,
        updated_at: parse_datetime(&col::<String>(row, "updated_at")?)?,
        version: col(row, "version")?,
    })
}

/// Role columns only; permissions are attached by the caller.
pub fn role_from_row(row: &SqliteRow) -> Result<Role, AppError> {
    Ok(Role {
        id: parse_uuid(&col::<String>(row, "id")?)?,
        name: col(row, "name")?,
        description: col(row, "description")?,
        approval_limit: parse_decimal(&col::<String>(row, "approval_limit")?)?,
        is_active: col(row, "is_active")?,
        permissions: Vec::new(),
        created_at: parse_datetime(&col::<String>(row, "created_at")?)?,
        updated_at: parse_datetime(&col::<String>(row, "updated_at")?)?,
    })
}

pub fn permission_from_row(row: &SqliteRow) -> Result<Permission, AppError> {
    let resource: String = col(row, "resource")?;
    let action: String = col(row, "action")?;
    Ok(Permission {
        id: parse_uuid(&col::<String>(row, "id")?)?,
        grant: Grant::new(resource, action),
        created_at: parse_datetime(&col::<String>(row, "created_at")?)?,
    })
}

pub fn assignment_from_row(row: &SqliteRow) -> Result<UserRoleAssignment, AppError> {
    Ok(UserRoleAssignment {
        id: parse_uuid(&col::<String>(row, "id")?)?,
        user_id: parse_uuid(&col::<String>(row, "user_id")?)?,
        role_id: parse_uuid(&col::<String>(row, "role_id")?)?,
        assigned_by: parse_uuid(&col::<String>(row, "assigned_by")?)?,
        assigned_at: parse_datetime(&col::<String>(row, "assigned_at")?)?,
        is_active: col(row, "is_active")?,
    })
}

pub fn workflow_from_row(row: &SqliteRow) -> Result<WorkflowInstance, AppError> {
    let data: String = col(row, "data")?;
    let status: String = col(row, "status")?;
    let priority: String = col(row, "priority")?;

    Ok(WorkflowInstance {
        id: parse_uuid(&col::<String>(row, "id")?)?,
        code: col(row, "code")?,
        action_type: col(row, "action_type")?,
        resource_id: parse_uuid(&col::<String>(row, "resource_id")?)?,
        resource_type: col(row, "resource_type")?,
        data: serde_json::from_str(&data).map_err(|e| AppError::internal(format!("invalid workflow data: {}", e)))?,
        business_justification: col(row, "business_justification")?,
        priority: priority.parse()?,
        amount: parse_decimal(&col::<String>(row, "amount")?)?,
        status: status.parse()?,
        initiated_by: parse_uuid(&col::<String>(row, "initiated_by")?)?,
        created_at: parse_datetime(&col::<String>(row, "created_at")?)?,
        approval_deadline: parse_datetime(&col::<String>(row, "approval_deadline")?)?,
        completed_at: parse_opt_datetime(col(row, "completed_at")?)?,
        rejection_reason: col(row, "rejection_reason")?,
        cancellation_reason: col(row, "cancellation_reason")?,
        cancelled_by: parse_opt_uuid(col(row, "cancelled_by")?)?,
        escalation_reason: col(row, "escalation_reason")?,
        escalated_at: parse_opt_datetime(col(row, "escalated_at")?)?,
        version: col(row, "version")?,
        matrix_version: col(row, "matrix_version")?,
    })
}

pub fn step_from_row(row: &SqliteRow) -> Result<ApprovalStep, AppError> {
    let status: String = col(row, "status")?;
    Ok(ApprovalStep {
        id: parse_uuid(&col::<String>(row, "id")?)?,
        workflow_id: parse_uuid(&col::<String>(row, "workflow_id")?)?,
        level: col(row, "level")?,
        approver_role: col(row, "approver_role")?,
        status: status.parse()?,
        processed_by: parse_opt_uuid(col(row, "processed_by")?)?,
        processed_at: parse_opt_datetime(col(row, "processed_at")?)?,
        comments: col(row, "comments")?,
        is_escalated: col(row, "is_escalated")?,
        created_at: parse_datetime(&col::<String>(row, "created_at")?)?,
    })
}
