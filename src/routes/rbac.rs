//! RBAC admin API.
//!
//! Mutations require the Role/Manage permission. A user may read their own
//! roles, permissions and limits without it.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use uuid::Uuid;

use crate::app::AppState;
use crate::authz::permissions::{MANAGE, ROLE};
use crate::errors::{AppError, AppResult};
use crate::jwt::AuthUser;
use crate::models::rbac::*;
use crate::models::user::User;

// =============================================================================
// ROUTER
// =============================================================================

pub fn routes() -> Router<AppState> {
    Router::new()
        // Roles
        .route("/roles", get(list_roles).post(create_role))
        .route("/roles/:role_id", get(get_role).put(update_role).delete(delete_role))
        .route("/roles/:role_id/users", get(get_users_in_role))
        .route(
            "/roles/:role_id/permissions",
            get(get_role_permissions).post(assign_permission_to_role),
        )
        .route(
            "/roles/:role_id/permissions/:permission_id",
            delete(remove_permission_from_role),
        )
        // Permissions
        .route("/permissions", get(list_permissions).post(create_permission))
        .route("/permissions/:permission_id", delete(delete_permission))
        // Users
        .route("/users/:user_id/roles", get(get_user_roles).post(assign_role_to_user))
        .route("/users/:user_id/roles/:role_id", delete(remove_role_from_user))
        .route("/users/:user_id/permissions", get(get_user_permissions))
        .route("/users/:user_id/authorize", post(authorize_action))
        .route("/users/:user_id/approval-limit", post(enforce_approval_limits))
}

pub async fn require_manager(state: &AppState, auth: &AuthUser) -> AppResult<()> {
    if state.rbac.authorize_action(auth.user_id, ROLE, MANAGE).await? {
        Ok(())
    } else {
        Err(AppError::forbidden("Role/Manage permission required"))
    }
}

pub async fn require_self_or_manager(state: &AppState, auth: &AuthUser, user_id: Uuid) -> AppResult<()> {
    if auth.user_id == user_id {
        return Ok(());
    }
    require_manager(state, auth).await
}

// =============================================================================
// ROLE ENDPOINTS
// =============================================================================

/// List all roles
#[utoipa::path(
    get,
    path = "/rbac/roles",
    tag = "RBAC",
    responses((status = 200, description = "List of roles", body = Vec<Role>)),
    security(("bearerAuth" = []))
)]
pub async fn list_roles(State(state): State<AppState>, auth: AuthUser) -> AppResult<Json<Vec<Role>>> {
    require_manager(&state, &auth).await?;
    Ok(Json(state.rbac.get_all_roles().await?))
}

/// Create a new role
#[utoipa::path(
    post,
    path = "/rbac/roles",
    tag = "RBAC",
    request_body = RoleCreateRequest,
    responses(
        (status = 201, description = "Role created", body = Role),
        (status = 400, description = "Role name already exists"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn create_role(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<RoleCreateRequest>,
) -> AppResult<(StatusCode, Json<Role>)> {
    require_manager(&state, &auth).await?;
    let role = state.rbac.create_role(req, Some(auth.user_id)).await?;
    Ok((StatusCode::CREATED, Json(role)))
}

#[utoipa::path(
    get,
    path = "/rbac/roles/{role_id}",
    tag = "RBAC",
    params(("role_id" = Uuid, Path, description = "Role ID")),
    responses(
        (status = 200, description = "Role with permissions", body = Role),
        (status = 404, description = "Role not found"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn get_role(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(role_id): Path<Uuid>,
) -> AppResult<Json<Role>> {
    require_manager(&state, &auth).await?;
    state
        .rbac
        .get_role_by_id(role_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("role {role_id}")))
}

#[utoipa::path(
    put,
    path = "/rbac/roles/{role_id}",
    tag = "RBAC",
    params(("role_id" = Uuid, Path, description = "Role ID")),
    request_body = RoleUpdateRequest,
    responses((status = 200, description = "Role updated", body = Role)),
    security(("bearerAuth" = []))
)]
pub async fn update_role(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(role_id): Path<Uuid>,
    Json(req): Json<RoleUpdateRequest>,
) -> AppResult<Json<Role>> {
    require_manager(&state, &auth).await?;
    Ok(Json(state.rbac.update_role(role_id, req, Some(auth.user_id)).await?))
}

/// Delete a role; still-assigned roles are deactivated instead
#[utoipa::path(
    delete,
    path = "/rbac/roles/{role_id}",
    tag = "RBAC",
    params(("role_id" = Uuid, Path, description = "Role ID")),
    responses(
        (status = 204, description = "Role deleted or deactivated"),
        (status = 404, description = "Role not found"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn delete_role(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(role_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    require_manager(&state, &auth).await?;
    state.rbac.delete_role(role_id, Some(auth.user_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/rbac/roles/{role_id}/users",
    tag = "RBAC",
    params(("role_id" = Uuid, Path, description = "Role ID")),
    responses((status = 200, description = "Active users holding the role", body = Vec<User>)),
    security(("bearerAuth" = []))
)]
pub async fn get_users_in_role(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(role_id): Path<Uuid>,
) -> AppResult<Json<Vec<User>>> {
    require_manager(&state, &auth).await?;
    Ok(Json(state.rbac.get_users_in_role(role_id).await?))
}

#[utoipa::path(
    get,
    path = "/rbac/roles/{role_id}/permissions",
    tag = "RBAC",
    params(("role_id" = Uuid, Path, description = "Role ID")),
    responses((status = 200, description = "Permissions of the role", body = Vec<Permission>)),
    security(("bearerAuth" = []))
)]
pub async fn get_role_permissions(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(role_id): Path<Uuid>,
) -> AppResult<Json<Vec<Permission>>> {
    require_manager(&state, &auth).await?;
    Ok(Json(state.rbac.get_role_permissions(role_id).await?))
}

#[utoipa::path(
    post,
    path = "/rbac/roles/{role_id}/permissions",
    tag = "RBAC",
    params(("role_id" = Uuid, Path, description = "Role ID")),
    request_body = AssignPermissionToRoleRequest,
    responses((status = 200, description = "Permission granted to role", body = Role)),
    security(("bearerAuth" = []))
)]
pub async fn assign_permission_to_role(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(role_id): Path<Uuid>,
    Json(req): Json<AssignPermissionToRoleRequest>,
) -> AppResult<Json<Role>> {
    require_manager(&state, &auth).await?;
    let role = state
        .rbac
        .assign_permission_to_role(role_id, req.permission_id, Some(auth.user_id))
        .await?;
    Ok(Json(role))
}

#[utoipa::path(
    delete,
    path = "/rbac/roles/{role_id}/permissions/{permission_id}",
    tag = "RBAC",
    params(
        ("role_id" = Uuid, Path, description = "Role ID"),
        ("permission_id" = Uuid, Path, description = "Permission ID"),
    ),
    responses((status = 200, description = "Permission removed from role", body = Role)),
    security(("bearerAuth" = []))
)]
pub async fn remove_permission_from_role(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((role_id, permission_id)): Path<(Uuid, Uuid)>,
) -> AppResult<Json<Role>> {
    require_manager(&state, &auth).await?;
    let role = state
        .rbac
        .remove_permission_from_role(role_id, permission_id, Some(auth.user_id))
        .await?;
    Ok(Json(role))
}

// =============================================================================
// PERMISSION ENDPOINTS
// =============================================================================

#[utoipa::path(
    get,
    path = "/rbac/permissions",
    tag = "RBAC",
    responses((status = 200, description = "All permissions", body = Vec<Permission>)),
    security(("bearerAuth" = []))
)]
pub async fn list_permissions(State(state): State<AppState>, auth: AuthUser) -> AppResult<Json<Vec<Permission>>> {
    require_manager(&state, &auth).await?;
    Ok(Json(state.rbac.get_all_permissions().await?))
}

#[utoipa::path(
    post,
    path = "/rbac/permissions",
    tag = "RBAC",
    request_body = PermissionCreateRequest,
    responses((status = 201, description = "Permission created", body = Permission)),
    security(("bearerAuth" = []))
)]
pub async fn create_permission(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<PermissionCreateRequest>,
) -> AppResult<(StatusCode, Json<Permission>)> {
    require_manager(&state, &auth).await?;
    let permission = state.rbac.create_permission(req, Some(auth.user_id)).await?;
    Ok((StatusCode::CREATED, Json(permission)))
}

#[utoipa::path(
    delete,
    path = "/rbac/permissions/{permission_id}",
    tag = "RBAC",
    params(("permission_id" = Uuid, Path, description = "Permission ID")),
    responses((status = 204, description = "Permission deleted")),
    security(("bearerAuth" = []))
)]
pub async fn delete_permission(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(permission_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    require_manager(&state, &auth).await?;
    state.rbac.delete_permission(permission_id, Some(auth.user_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// USER ENDPOINTS
// =============================================================================

#[utoipa::path(
    get,
    path = "/rbac/users/{user_id}/roles",
    tag = "RBAC",
    params(("user_id" = Uuid, Path, description = "User ID")),
    responses((status = 200, description = "Active roles of the user", body = Vec<Role>)),
    security(("bearerAuth" = []))
)]
pub async fn get_user_roles(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<Vec<Role>>> {
    require_self_or_manager(&state, &auth, user_id).await?;
    Ok(Json(state.rbac.get_user_roles(user_id).await?))
}

#[utoipa::path(
    post,
    path = "/rbac/users/{user_id}/roles",
    tag = "RBAC",
    params(("user_id" = Uuid, Path, description = "User ID")),
    request_body = AssignRoleRequest,
    responses(
        (status = 201, description = "Role assigned", body = UserRoleAssignment),
        (status = 404, description = "User or role not found"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn assign_role_to_user(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(user_id): Path<Uuid>,
    Json(req): Json<AssignRoleRequest>,
) -> AppResult<(StatusCode, Json<UserRoleAssignment>)> {
    require_manager(&state, &auth).await?;
    let assignment = state
        .rbac
        .assign_role_to_user(user_id, req.role_id, auth.user_id)
        .await?;
    Ok((StatusCode::CREATED, Json(assignment)))
}

#[utoipa::path(
    delete,
    path = "/rbac/users/{user_id}/roles/{role_id}",
    tag = "RBAC",
    params(
        ("user_id" = Uuid, Path, description = "User ID"),
        ("role_id" = Uuid, Path, description = "Role ID"),
    ),
    responses((status = 204, description = "Role revoked")),
    security(("bearerAuth" = []))
)]
pub async fn remove_role_from_user(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((user_id, role_id)): Path<(Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    require_manager(&state, &auth).await?;
    state
        .rbac
        .remove_role_from_user(user_id, role_id, Some(auth.user_id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/rbac/users/{user_id}/permissions",
    tag = "RBAC",
    params(("user_id" = Uuid, Path, description = "User ID")),
    responses((status = 200, description = "Union of permissions across active roles", body = Vec<Permission>)),
    security(("bearerAuth" = []))
)]
pub async fn get_user_permissions(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<Vec<Permission>>> {
    require_self_or_manager(&state, &auth, user_id).await?;
    Ok(Json(state.rbac.get_user_permissions(user_id).await?))
}

#[utoipa::path(
    post,
    path = "/rbac/users/{user_id}/authorize",
    tag = "RBAC",
    params(("user_id" = Uuid, Path, description = "User ID")),
    request_body = AuthorizeRequest,
    responses((status = 200, description = "Authorization decision", body = AuthorizeResponse)),
    security(("bearerAuth" = []))
)]
pub async fn authorize_action(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(user_id): Path<Uuid>,
    Json(req): Json<AuthorizeRequest>,
) -> AppResult<Json<AuthorizeResponse>> {
    require_self_or_manager(&state, &auth, user_id).await?;
    let allowed = state.rbac.authorize_action(user_id, &req.resource, &req.action).await?;
    Ok(Json(AuthorizeResponse { user_id, allowed }))
}

#[utoipa::path(
    post,
    path = "/rbac/users/{user_id}/approval-limit",
    tag = "RBAC",
    params(("user_id" = Uuid, Path, description = "User ID")),
    request_body = ApprovalLimitRequest,
    responses((status = 200, description = "Whether the amount needs further approval", body = ApprovalRequirement)),
    security(("bearerAuth" = []))
)]
pub async fn enforce_approval_limits(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(user_id): Path<Uuid>,
    Json(req): Json<ApprovalLimitRequest>,
) -> AppResult<Json<ApprovalRequirement>> {
    require_self_or_manager(&state, &auth, user_id).await?;
    let requirement = state
        .rbac
        .enforce_approval_limits(user_id, req.amount, &req.action_type)
        .await?;
    Ok(Json(requirement))
}
