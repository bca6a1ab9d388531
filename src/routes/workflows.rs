use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::app::AppState;
use crate::authz::permissions::{ESCALATE, INITIATE, WORKFLOW};
use crate::errors::{AppError, AppResult};
use crate::jwt::AuthUser;
use crate::models::workflow::{
    ApprovalResult, ApprovalStep, ApproveRequest, EscalationResult, InitiateWorkflowRequest, PendingApproval,
    ReasonRequest, ValidateRulesRequest, ValidationResult, WorkflowInstance, WorkflowMetrics, WorkflowStatus,
};
use crate::utils::utc_now;

const DEFAULT_METRICS_WINDOW_DAYS: i64 = 30;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_workflows).post(initiate_workflow))
        .route("/history", get(workflow_history))
        .route("/queue", get(approval_queue))
        .route("/queue/role/:role", get(approval_queue_by_role))
        .route("/metrics", get(workflow_metrics))
        .route("/validate", post(validate_rules))
        .route("/:id", get(get_workflow))
        .route("/:id/steps", get(get_steps))
        .route("/:id/can-approve", get(can_approve))
        .route("/:id/approve", post(approve_workflow))
        .route("/:id/reject", post(reject_workflow))
        .route("/:id/escalate", post(escalate_workflow))
        .route("/:id/cancel", post(cancel_workflow))
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListQuery {
    /// Filter by status; without it the caller's own workflows are listed.
    pub status: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct HistoryQuery {
    pub page_size: Option<u32>,
    pub page: Option<u32>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct MetricsQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// HTTP status for the error code carried in a typed result.
fn decision_status(error_code: Option<&str>) -> StatusCode {
    match error_code {
        None => StatusCode::OK,
        Some("forbidden") => StatusCode::FORBIDDEN,
        Some("conflict") => StatusCode::CONFLICT,
        Some("not_found") => StatusCode::NOT_FOUND,
        Some("validation") => StatusCode::BAD_REQUEST,
        Some(_) => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

async fn require_permission(state: &AppState, auth: &AuthUser, action: &str) -> AppResult<()> {
    if state.rbac.authorize_action(auth.user_id, WORKFLOW, action).await? {
        Ok(())
    } else {
        Err(AppError::forbidden(format!("Workflow/{action} permission required")))
    }
}

#[utoipa::path(
    post,
    path = "/workflows",
    tag = "Workflows",
    request_body = InitiateWorkflowRequest,
    responses(
        (status = 201, description = "Workflow created with its approval chain", body = WorkflowInstance),
        (status = 400, description = "Invalid maker action or unknown action type"),
        (status = 403, description = "Caller may not initiate workflows"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn initiate_workflow(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(payload): Json<InitiateWorkflowRequest>,
) -> AppResult<(StatusCode, Json<WorkflowInstance>)> {
    require_permission(&state, &auth, INITIATE).await?;
    let workflow = state
        .workflows
        .initiate_maker_action(payload.into_action(auth.user_id))
        .await?;
    Ok((StatusCode::CREATED, Json(workflow)))
}

#[utoipa::path(
    get,
    path = "/workflows",
    tag = "Workflows",
    params(ListQuery),
    responses((status = 200, description = "Workflows", body = [WorkflowInstance])),
    security(("bearerAuth" = []))
)]
pub async fn list_workflows(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<WorkflowInstance>>> {
    let workflows = match query.status.as_deref() {
        Some(raw) => {
            let status: WorkflowStatus = raw
                .parse()
                .map_err(|_| AppError::validation(format!("Unknown workflow status: {raw}")))?;
            state.workflows.get_workflow_instances_by_status(status).await?
        }
        None => state.workflows.get_workflow_instances_by_user(auth.user_id).await?,
    };
    Ok(Json(workflows))
}

#[utoipa::path(
    get,
    path = "/workflows/history",
    tag = "Workflows",
    params(HistoryQuery),
    responses((status = 200, description = "Workflows the caller initiated or decided on", body = [WorkflowInstance])),
    security(("bearerAuth" = []))
)]
pub async fn workflow_history(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<Vec<WorkflowInstance>>> {
    let history = state
        .workflows
        .get_workflow_history(auth.user_id, query.page_size.unwrap_or(20), query.page.unwrap_or(1))
        .await?;
    Ok(Json(history))
}

#[utoipa::path(
    get,
    path = "/workflows/{id}",
    tag = "Workflows",
    params(("id" = Uuid, Path, description = "Workflow id")),
    responses(
        (status = 200, description = "Workflow detail", body = WorkflowInstance),
        (status = 404, description = "Workflow not found"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn get_workflow(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<WorkflowInstance>> {
    state
        .workflows
        .get_workflow_instance(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("workflow {id}")))
}

#[utoipa::path(
    get,
    path = "/workflows/{id}/steps",
    tag = "Workflows",
    params(("id" = Uuid, Path, description = "Workflow id")),
    responses((status = 200, description = "Approval steps by level", body = [ApprovalStep])),
    security(("bearerAuth" = []))
)]
pub async fn get_steps(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vec<ApprovalStep>>> {
    Ok(Json(state.workflows.get_workflow_steps(id).await?))
}

#[utoipa::path(
    get,
    path = "/workflows/{id}/can-approve",
    tag = "Workflows",
    params(("id" = Uuid, Path, description = "Workflow id")),
    responses((status = 200, description = "Whether the caller may decide the current step", body = bool)),
    security(("bearerAuth" = []))
)]
pub async fn can_approve(State(state): State<AppState>, auth: AuthUser, Path(id): Path<Uuid>) -> AppResult<Json<bool>> {
    Ok(Json(state.workflows.can_user_approve_workflow(auth.user_id, id).await?))
}

#[utoipa::path(
    post,
    path = "/workflows/{id}/approve",
    tag = "Workflows",
    params(("id" = Uuid, Path, description = "Workflow id")),
    request_body = ApproveRequest,
    responses(
        (status = 200, description = "Step approved", body = ApprovalResult),
        (status = 403, description = "Caller may not approve this step", body = ApprovalResult),
        (status = 409, description = "Workflow is closed or was decided concurrently", body = ApprovalResult),
    ),
    security(("bearerAuth" = []))
)]
pub async fn approve_workflow(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<ApproveRequest>,
) -> AppResult<(StatusCode, Json<ApprovalResult>)> {
    let result = state
        .workflows
        .submit_for_approval(id, auth.user_id, payload.comments.as_deref())
        .await?;
    Ok((decision_status(result.error_code.as_deref()), Json(result)))
}

#[utoipa::path(
    post,
    path = "/workflows/{id}/reject",
    tag = "Workflows",
    params(("id" = Uuid, Path, description = "Workflow id")),
    request_body = ReasonRequest,
    responses(
        (status = 200, description = "Workflow rejected", body = ApprovalResult),
        (status = 403, description = "Caller may not decide this step", body = ApprovalResult),
        (status = 409, description = "Workflow is closed", body = ApprovalResult),
    ),
    security(("bearerAuth" = []))
)]
pub async fn reject_workflow(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<ReasonRequest>,
) -> AppResult<(StatusCode, Json<ApprovalResult>)> {
    let result = state
        .workflows
        .reject_workflow(id, auth.user_id, &payload.reason)
        .await?;
    Ok((decision_status(result.error_code.as_deref()), Json(result)))
}

#[utoipa::path(
    post,
    path = "/workflows/{id}/escalate",
    tag = "Workflows",
    params(("id" = Uuid, Path, description = "Workflow id")),
    request_body = ReasonRequest,
    responses(
        (status = 200, description = "Workflow escalated", body = EscalationResult),
        (status = 400, description = "Escalation reason missing", body = EscalationResult),
        (status = 403, description = "Caller may not escalate workflows"),
        (status = 404, description = "Workflow not found", body = EscalationResult),
        (status = 409, description = "Workflow is not pending", body = EscalationResult),
    ),
    security(("bearerAuth" = []))
)]
pub async fn escalate_workflow(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<ReasonRequest>,
) -> AppResult<(StatusCode, Json<EscalationResult>)> {
    require_permission(&state, &auth, ESCALATE).await?;
    let result = state
        .workflows
        .escalate_approval_by(id, &payload.reason, Some(auth.user_id))
        .await?;
    Ok((decision_status(result.error_code.as_deref()), Json(result)))
}

#[utoipa::path(
    post,
    path = "/workflows/{id}/cancel",
    tag = "Workflows",
    params(("id" = Uuid, Path, description = "Workflow id")),
    request_body = ReasonRequest,
    responses(
        (status = 200, description = "Workflow cancelled", body = WorkflowInstance),
        (status = 403, description = "Only the maker or a cancel permission holder may cancel"),
        (status = 409, description = "Workflow is already closed"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn cancel_workflow(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<ReasonRequest>,
) -> AppResult<Json<WorkflowInstance>> {
    Ok(Json(state.workflows.cancel(id, auth.user_id, &payload.reason).await?))
}

#[utoipa::path(
    get,
    path = "/workflows/queue",
    tag = "Workflows",
    responses((status = 200, description = "Steps the caller can decide, soonest deadline first", body = [PendingApproval])),
    security(("bearerAuth" = []))
)]
pub async fn approval_queue(State(state): State<AppState>, auth: AuthUser) -> AppResult<Json<Vec<PendingApproval>>> {
    Ok(Json(state.workflows.get_approval_queue(auth.user_id).await?))
}

#[utoipa::path(
    get,
    path = "/workflows/queue/role/{role}",
    tag = "Workflows",
    params(("role" = String, Path, description = "Role name")),
    responses((status = 200, description = "Current steps awaiting the role", body = [PendingApproval])),
    security(("bearerAuth" = []))
)]
pub async fn approval_queue_by_role(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(role): Path<String>,
) -> AppResult<Json<Vec<PendingApproval>>> {
    Ok(Json(state.workflows.get_approval_queue_by_role(&role).await?))
}

#[utoipa::path(
    get,
    path = "/workflows/metrics",
    tag = "Workflows",
    params(MetricsQuery),
    responses((status = 200, description = "Aggregates over workflows created in the window", body = WorkflowMetrics)),
    security(("bearerAuth" = []))
)]
pub async fn workflow_metrics(
    State(state): State<AppState>,
    _auth: AuthUser,
    Query(query): Query<MetricsQuery>,
) -> AppResult<Json<WorkflowMetrics>> {
    let to = query.to.unwrap_or_else(utc_now);
    let from = query
        .from
        .unwrap_or_else(|| to - Duration::days(DEFAULT_METRICS_WINDOW_DAYS));
    if from > to {
        return Err(AppError::validation("`from` must not be after `to`"));
    }
    Ok(Json(state.workflows.get_workflow_metrics(from, to).await?))
}

#[utoipa::path(
    post,
    path = "/workflows/validate",
    tag = "Workflows",
    request_body = ValidateRulesRequest,
    responses((status = 200, description = "Maker-checker rule check", body = ValidationResult)),
    security(("bearerAuth" = []))
)]
pub async fn validate_rules(
    State(state): State<AppState>,
    _auth: AuthUser,
    Json(payload): Json<ValidateRulesRequest>,
) -> AppResult<Json<ValidationResult>> {
    let result = state
        .workflows
        .validate_maker_checker_rules(payload.maker_id, payload.checker_id, &payload.action_type)
        .await?;
    Ok(Json(result))
}
