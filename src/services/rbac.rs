//! Role-based authorization: roles, permissions, assignments and approval limits.
//!
//! Authority is the union over a user's active assignments of active roles.
//! Deactivated users hold no authority.

use std::collections::HashSet;
use std::sync::Arc;

use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::authz::{roles, DefaultPolicyEvaluator, PolicyEvaluator, Principal};
use crate::db::row_parsers::{assignment_from_row, db_user_from_row, permission_from_row, role_from_row};
use crate::db::ts;
use crate::errors::{AppError, AppResult};
use crate::events::{log_activity, log_activity_with_details, EventBus};
use crate::models::rbac::{
    ApprovalRequirement, Grant, Permission, PermissionCreateRequest, Role, RoleCreateRequest, RoleUpdateRequest,
    UserRoleAssignment,
};
use crate::models::user::User;
use crate::utils::utc_now;

const ROLE_COLUMNS: &str = "r.id, r.name, r.description, r.approval_limit, r.is_active, r.created_at, r.updated_at";
const PERMISSION_COLUMNS: &str = "p.id, p.resource, p.action, p.created_at";

/// Suggested approver tiers when an amount exceeds the caller's own limit.
const BRANCH_CEILING: i64 = 100_000;
const REGIONAL_CEILING: i64 = 500_000;

#[derive(Clone)]
pub struct AuthorizationService {
    pool: SqlitePool,
    event_bus: EventBus,
    evaluator: Arc<dyn PolicyEvaluator>,
}

impl AuthorizationService {
    pub fn new(pool: SqlitePool, event_bus: EventBus) -> Self {
        Self::with_evaluator(pool, event_bus, Arc::new(DefaultPolicyEvaluator::new()))
    }

    pub fn with_evaluator(pool: SqlitePool, event_bus: EventBus, evaluator: Arc<dyn PolicyEvaluator>) -> Self {
        Self {
            pool,
            event_bus,
            evaluator,
        }
    }

    // =========================================================================
    // AUTHORIZATION QUERIES
    // =========================================================================

    /// Roles, grants and highest approval limit of a user. Unknown users get
    /// an empty principal.
    pub async fn principal(&self, user_id: Uuid) -> AppResult<Principal> {
        let role_rows = sqlx::query(
            r#"
            SELECT r.name, r.approval_limit
            FROM roles r
            JOIN user_roles ur ON ur.role_id = r.id
            JOIN users u ON u.id = ur.user_id
            WHERE ur.user_id = ? AND ur.is_active = 1 AND r.is_active = 1 AND u.is_active = 1
            "#,
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut role_names = Vec::with_capacity(role_rows.len());
        let mut max_limit = Decimal::ZERO;
        for row in &role_rows {
            let name: String = row.try_get("name")?;
            let limit: String = row.try_get("approval_limit")?;
            max_limit = max_limit.max(limit.trim().parse::<Decimal>()?);
            role_names.push(name);
        }

        let grants = self
            .get_user_permissions(user_id)
            .await?
            .into_iter()
            .map(|p| p.grant);

        Ok(Principal::new(user_id)
            .with_roles(role_names)
            .with_grants(grants)
            .with_approval_limit(max_limit))
    }

    pub async fn authorize_action(&self, user_id: Uuid, resource: &str, action: &str) -> AppResult<bool> {
        let principal = self.principal(user_id).await?;
        Ok(self.evaluator.can(&principal, resource, action).await)
    }

    /// De-duplicated union of permissions across active roles.
    pub async fn get_user_permissions(&self, user_id: Uuid) -> AppResult<Vec<Permission>> {
        let sql = format!(
            r#"
            SELECT DISTINCT {PERMISSION_COLUMNS}
            FROM permissions p
            JOIN role_permissions rp ON rp.permission_id = p.id
            JOIN roles r ON r.id = rp.role_id
            JOIN user_roles ur ON ur.role_id = r.id
            JOIN users u ON u.id = ur.user_id
            WHERE ur.user_id = ? AND ur.is_active = 1 AND r.is_active = 1 AND u.is_active = 1
            ORDER BY p.resource, p.action
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(user_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(permission_from_row).collect()
    }

    /// `requires_approval` iff `amount` exceeds the user's highest role limit.
    pub async fn enforce_approval_limits(
        &self,
        user_id: Uuid,
        amount: Decimal,
        action_type: &str,
    ) -> AppResult<ApprovalRequirement> {
        let limit = self.principal(user_id).await?.max_approval_limit;

        if amount <= limit {
            return Ok(ApprovalRequirement {
                requires_approval: false,
                approval_limit: limit,
                approver_role: None,
                reason: None,
            });
        }

        let approver_role = if amount <= Decimal::from(BRANCH_CEILING) {
            roles::BRANCH_MANAGER
        } else if amount <= Decimal::from(REGIONAL_CEILING) {
            roles::REGIONAL_MANAGER
        } else {
            roles::HEAD_OFFICE
        };

        Ok(ApprovalRequirement {
            requires_approval: true,
            approval_limit: limit,
            approver_role: Some(approver_role.to_string()),
            reason: Some(format!(
                "Amount {amount} exceeds approval limit {limit} for {action_type}"
            )),
        })
    }

    // =========================================================================
    // ROLES
    // =========================================================================

    pub async fn create_role(&self, req: RoleCreateRequest, actor_id: Option<Uuid>) -> AppResult<Role> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(AppError::validation("Role name is required"));
        }
        if req.approval_limit.is_sign_negative() {
            return Err(AppError::validation("Approval limit cannot be negative"));
        }
        if self.get_role_by_name(name).await?.is_some() {
            return Err(AppError::validation(format!("Role '{name}' already exists")));
        }
        self.ensure_permissions_exist(&req.permission_ids).await?;

        let id = Uuid::new_v4();
        let now = ts(utc_now());
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO roles (id, name, description, approval_limit, is_active, created_at, updated_at)
            VALUES (?, ?, ?, ?, 1, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(name)
        .bind(&req.description)
        .bind(req.approval_limit.to_string())
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::unique_violation(e, format!("Role '{name}' already exists")))?;

        for permission_id in dedup(&req.permission_ids) {
            sqlx::query("INSERT INTO role_permissions (role_id, permission_id, assigned_at) VALUES (?, ?, ?)")
                .bind(id.to_string())
                .bind(permission_id.to_string())
                .bind(&now)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        let role = self.require_role(id).await?;
        log_activity(&self.event_bus, "created", actor_id, &role);
        tracing::info!(role_id = %role.id, name = %role.name, "role created");
        Ok(role)
    }

    pub async fn get_role_by_id(&self, role_id: Uuid) -> AppResult<Option<Role>> {
        let sql = format!("SELECT {ROLE_COLUMNS} FROM roles r WHERE r.id = ?");
        let row = sqlx::query(&sql)
            .bind(role_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.with_permissions(role_from_row(&row)?).await?)),
            None => Ok(None),
        }
    }

    pub async fn get_role_by_name(&self, name: &str) -> AppResult<Option<Role>> {
        let sql = format!("SELECT {ROLE_COLUMNS} FROM roles r WHERE r.name = ?");
        let row = sqlx::query(&sql).bind(name).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => Ok(Some(self.with_permissions(role_from_row(&row)?).await?)),
            None => Ok(None),
        }
    }

    pub async fn get_all_roles(&self) -> AppResult<Vec<Role>> {
        let sql = format!("SELECT {ROLE_COLUMNS} FROM roles r ORDER BY r.name");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut roles = Vec::with_capacity(rows.len());
        for row in &rows {
            roles.push(self.with_permissions(role_from_row(row)?).await?);
        }
        Ok(roles)
    }

    pub async fn update_role(&self, role_id: Uuid, req: RoleUpdateRequest, actor_id: Option<Uuid>) -> AppResult<Role> {
        let existing = self.require_role(role_id).await?;

        let name = match req.name.as_deref().map(str::trim) {
            Some("") => return Err(AppError::validation("Role name is required")),
            Some(name) if name != existing.name => {
                if self.get_role_by_name(name).await?.is_some() {
                    return Err(AppError::validation(format!("Role '{name}' already exists")));
                }
                name.to_string()
            }
            _ => existing.name.clone(),
        };
        let approval_limit = req.approval_limit.unwrap_or(existing.approval_limit);
        if approval_limit.is_sign_negative() {
            return Err(AppError::validation("Approval limit cannot be negative"));
        }
        let description = req.description.or(existing.description.clone());
        let is_active = req.is_active.unwrap_or(existing.is_active);
        if let Some(ids) = &req.permission_ids {
            self.ensure_permissions_exist(ids).await?;
        }

        let now = ts(utc_now());
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE roles
            SET name = ?, description = ?, approval_limit = ?, is_active = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&name)
        .bind(&description)
        .bind(approval_limit.to_string())
        .bind(is_active)
        .bind(&now)
        .bind(role_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::unique_violation(e, format!("Role '{name}' already exists")))?;

        if let Some(ids) = &req.permission_ids {
            sqlx::query("DELETE FROM role_permissions WHERE role_id = ?")
                .bind(role_id.to_string())
                .execute(&mut *tx)
                .await?;
            for permission_id in dedup(ids) {
                sqlx::query("INSERT INTO role_permissions (role_id, permission_id, assigned_at) VALUES (?, ?, ?)")
                    .bind(role_id.to_string())
                    .bind(permission_id.to_string())
                    .bind(&now)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;

        let role = self.require_role(role_id).await?;
        log_activity(&self.event_bus, "updated", actor_id, &role);
        Ok(role)
    }

    /// Deactivates a role that is still assigned; removes it outright otherwise.
    pub async fn delete_role(&self, role_id: Uuid, actor_id: Option<Uuid>) -> AppResult<()> {
        let role = self.require_role(role_id).await?;

        let assigned: i64 =
            sqlx::query_scalar("SELECT COUNT(1) FROM user_roles WHERE role_id = ? AND is_active = 1")
                .bind(role_id.to_string())
                .fetch_one(&self.pool)
                .await?;

        if assigned > 0 {
            sqlx::query("UPDATE roles SET is_active = 0, updated_at = ? WHERE id = ?")
                .bind(ts(utc_now()))
                .bind(role_id.to_string())
                .execute(&self.pool)
                .await?;
            log_activity_with_details(
                &self.event_bus,
                "deactivated",
                actor_id,
                &role,
                Some(serde_json::json!({ "active_assignments": assigned })),
            );
            tracing::info!(role_id = %role_id, assigned, "role still assigned, deactivated instead of deleted");
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for sql in [
            "DELETE FROM role_permissions WHERE role_id = ?",
            "DELETE FROM user_roles WHERE role_id = ?",
            "DELETE FROM roles WHERE id = ?",
        ] {
            sqlx::query(sql).bind(role_id.to_string()).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        log_activity(&self.event_bus, "deleted", actor_id, &role);
        Ok(())
    }

    async fn require_role(&self, role_id: Uuid) -> AppResult<Role> {
        self.get_role_by_id(role_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("role {role_id}")))
    }

    async fn with_permissions(&self, mut role: Role) -> AppResult<Role> {
        role.permissions = self.get_role_permissions(role.id).await?;
        Ok(role)
    }

    // =========================================================================
    // ASSIGNMENTS
    // =========================================================================

    /// Re-activates a previous assignment rather than duplicating it.
    pub async fn assign_role_to_user(
        &self,
        user_id: Uuid,
        role_id: Uuid,
        assigned_by: Uuid,
    ) -> AppResult<UserRoleAssignment> {
        self.require_user(user_id).await?;
        let role = self.require_role(role_id).await?;
        if !role.is_active {
            return Err(AppError::validation(format!("Role '{}' is inactive", role.name)));
        }

        let now = ts(utc_now());
        sqlx::query(
            r#"
            INSERT INTO user_roles (id, user_id, role_id, assigned_by, assigned_at, is_active)
            VALUES (?, ?, ?, ?, ?, 1)
            ON CONFLICT (user_id, role_id) DO UPDATE
            SET is_active = 1, assigned_by = excluded.assigned_by, assigned_at = excluded.assigned_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id.to_string())
        .bind(role_id.to_string())
        .bind(assigned_by.to_string())
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let assignment = self
            .find_assignment(user_id, role_id)
            .await?
            .ok_or_else(|| AppError::internal("role assignment vanished after upsert"))?;

        log_activity_with_details(
            &self.event_bus,
            "assigned",
            Some(assigned_by),
            &assignment,
            Some(serde_json::json!({ "role": role.name })),
        );
        tracing::info!(user_id = %user_id, role = %role.name, "role assigned");
        Ok(assignment)
    }

    pub async fn remove_role_from_user(&self, user_id: Uuid, role_id: Uuid, actor_id: Option<Uuid>) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE user_roles SET is_active = 0 WHERE user_id = ? AND role_id = ? AND is_active = 1",
        )
        .bind(user_id.to_string())
        .bind(role_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found("role assignment"));
        }

        if let Some(assignment) = self.find_assignment(user_id, role_id).await? {
            log_activity(&self.event_bus, "revoked", actor_id, &assignment);
        }
        Ok(())
    }

    /// Active roles the user currently holds.
    pub async fn get_user_roles(&self, user_id: Uuid) -> AppResult<Vec<Role>> {
        let sql = format!(
            r#"
            SELECT {ROLE_COLUMNS}
            FROM roles r
            JOIN user_roles ur ON ur.role_id = r.id
            WHERE ur.user_id = ? AND ur.is_active = 1 AND r.is_active = 1
            ORDER BY r.name
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(user_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        let mut roles = Vec::with_capacity(rows.len());
        for row in &rows {
            roles.push(self.with_permissions(role_from_row(row)?).await?);
        }
        Ok(roles)
    }

    /// Active users actively assigned to the role.
    pub async fn get_users_in_role(&self, role_id: Uuid) -> AppResult<Vec<User>> {
        let rows = sqlx::query(
            r#"
            SELECT u.id, u.username, u.full_name, u.email, u.password_hash, u.is_active,
                   u.failed_login_attempts, u.last_login_at, u.created_at, u.updated_at, u.version
            FROM users u
            JOIN user_roles ur ON ur.user_id = u.id
            WHERE ur.role_id = ? AND ur.is_active = 1 AND u.is_active = 1
            ORDER BY u.username
            "#,
        )
        .bind(role_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| db_user_from_row(row).map(User::from))
            .collect()
    }

    /// Ids of active users holding the named active role.
    pub async fn role_member_ids(&self, role_name: &str) -> AppResult<Vec<Uuid>> {
        match self.get_role_by_name(role_name).await? {
            Some(role) if role.is_active => Ok(self
                .get_users_in_role(role.id)
                .await?
                .into_iter()
                .map(|u| u.id)
                .collect()),
            _ => Ok(Vec::new()),
        }
    }

    async fn find_assignment(&self, user_id: Uuid, role_id: Uuid) -> AppResult<Option<UserRoleAssignment>> {
        let row = sqlx::query(
            "SELECT id, user_id, role_id, assigned_by, assigned_at, is_active FROM user_roles WHERE user_id = ? AND role_id = ?",
        )
        .bind(user_id.to_string())
        .bind(role_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(assignment_from_row).transpose()
    }

    async fn require_user(&self, user_id: Uuid) -> AppResult<()> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM users WHERE id = ?")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        exists
            .map(|_| ())
            .ok_or_else(|| AppError::not_found(format!("user {user_id}")))
    }

    // =========================================================================
    // PERMISSIONS
    // =========================================================================

    pub async fn create_permission(&self, req: PermissionCreateRequest, actor_id: Option<Uuid>) -> AppResult<Permission> {
        let resource = req.resource.trim();
        let action = req.action.trim();
        if resource.is_empty() || action.is_empty() {
            return Err(AppError::validation("Permission resource and action are required"));
        }

        let existing: Option<String> =
            sqlx::query_scalar("SELECT id FROM permissions WHERE resource = ? AND action = ?")
                .bind(resource)
                .bind(action)
                .fetch_optional(&self.pool)
                .await?;
        if existing.is_some() {
            return Err(AppError::validation(format!("Permission {resource}/{action} already exists")));
        }

        let permission = Permission {
            id: Uuid::new_v4(),
            grant: Grant::new(resource, action),
            created_at: utc_now(),
        };

        sqlx::query("INSERT INTO permissions (id, resource, action, created_at) VALUES (?, ?, ?, ?)")
            .bind(permission.id.to_string())
            .bind(permission.grant.resource.as_str())
            .bind(permission.grant.action.as_str())
            .bind(ts(permission.created_at))
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::unique_violation(e, format!("Permission {resource}/{action} already exists")))?;

        log_activity(&self.event_bus, "created", actor_id, &permission);
        Ok(permission)
    }

    pub async fn get_all_permissions(&self) -> AppResult<Vec<Permission>> {
        let sql = format!("SELECT {PERMISSION_COLUMNS} FROM permissions p ORDER BY p.resource, p.action");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(permission_from_row).collect()
    }

    pub async fn delete_permission(&self, permission_id: Uuid, actor_id: Option<Uuid>) -> AppResult<()> {
        let permission = self.require_permission(permission_id).await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM role_permissions WHERE permission_id = ?")
            .bind(permission_id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM permissions WHERE id = ?")
            .bind(permission_id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        log_activity(&self.event_bus, "deleted", actor_id, &permission);
        Ok(())
    }

    pub async fn assign_permission_to_role(
        &self,
        role_id: Uuid,
        permission_id: Uuid,
        actor_id: Option<Uuid>,
    ) -> AppResult<Role> {
        self.require_role(role_id).await?;
        let permission = self.require_permission(permission_id).await?;

        sqlx::query(
            "INSERT OR IGNORE INTO role_permissions (role_id, permission_id, assigned_at) VALUES (?, ?, ?)",
        )
        .bind(role_id.to_string())
        .bind(permission_id.to_string())
        .bind(ts(utc_now()))
        .execute(&self.pool)
        .await?;

        let role = self.require_role(role_id).await?;
        log_activity_with_details(
            &self.event_bus,
            "permission_granted",
            actor_id,
            &role,
            Some(serde_json::json!({ "permission": permission.grant })),
        );
        Ok(role)
    }

    pub async fn remove_permission_from_role(
        &self,
        role_id: Uuid,
        permission_id: Uuid,
        actor_id: Option<Uuid>,
    ) -> AppResult<Role> {
        let result = sqlx::query("DELETE FROM role_permissions WHERE role_id = ? AND permission_id = ?")
            .bind(role_id.to_string())
            .bind(permission_id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found("permission is not assigned to this role"));
        }

        let role = self.require_role(role_id).await?;
        log_activity_with_details(
            &self.event_bus,
            "permission_revoked",
            actor_id,
            &role,
            Some(serde_json::json!({ "permission_id": permission_id })),
        );
        Ok(role)
    }

    pub async fn get_role_permissions(&self, role_id: Uuid) -> AppResult<Vec<Permission>> {
        let sql = format!(
            r#"
            SELECT {PERMISSION_COLUMNS}
            FROM permissions p
            JOIN role_permissions rp ON rp.permission_id = p.id
            WHERE rp.role_id = ?
            ORDER BY p.resource, p.action
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(role_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(permission_from_row).collect()
    }

    async fn require_permission(&self, permission_id: Uuid) -> AppResult<Permission> {
        let sql = format!("SELECT {PERMISSION_COLUMNS} FROM permissions p WHERE p.id = ?");
        let row = sqlx::query(&sql)
            .bind(permission_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => permission_from_row(&row),
            None => Err(AppError::not_found(format!("permission {permission_id}"))),
        }
    }

    async fn ensure_permissions_exist(&self, ids: &[Uuid]) -> AppResult<()> {
        for id in dedup(ids) {
            self.require_permission(id).await?;
        }
        Ok(())
    }
}

fn dedup(ids: &[Uuid]) -> Vec<Uuid> {
    let mut seen = HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}
