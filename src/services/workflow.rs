//! Maker-checker workflow engine.
//!
//! Every mutation is read, validate, then a write conditioned on the
//! workflow's `version`. A lost race is a retryable conflict; the operation
//! re-reads and re-validates a bounded number of times before giving up.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::authz::{permissions, roles};
use crate::db::row_parsers::{step_from_row, workflow_from_row};
use crate::db::ts;
use crate::errors::{AppError, AppResult};
use crate::events::{log_activity, log_activity_with_details, EventBus};
use crate::matrix::{resolve_chain, MatrixHandle};
use crate::models::workflow::{
    current_step, ApprovalResult, ApprovalStep, EscalationResult, MakerAction, PendingApproval, StepStatus,
    ValidationResult, WorkflowInstance, WorkflowMetrics, WorkflowStatus,
};
use crate::notify::{dispatch, NotificationDispatcher, NotificationKind};
use crate::services::rbac::AuthorizationService;
use crate::utils::{utc_now, workflow_code};

const MAX_CAS_ATTEMPTS: u32 = 3;

pub const WORKFLOW_COMPLETED: &str = "Workflow completed successfully";
pub const STEP_COMPLETED: &str = "Approval step completed, awaiting next approval";
pub const AUTO_ESCALATION_REASON: &str = "Automatic escalation due to approval deadline exceeded";
pub const SAME_USER_MESSAGE: &str = "Maker and checker cannot be the same user";

const WORKFLOW_COLUMNS: &str = "w.id, w.code, w.action_type, w.resource_id, w.resource_type, w.data, \
     w.business_justification, w.priority, w.amount, w.status, w.initiated_by, w.created_at, \
     w.approval_deadline, w.completed_at, w.rejection_reason, w.cancellation_reason, w.cancelled_by, \
     w.escalation_reason, w.escalated_at, w.version, w.matrix_version";

#[derive(Clone)]
pub struct WorkflowEngine {
    pool: SqlitePool,
    matrix: MatrixHandle,
    rbac: AuthorizationService,
    notifier: Arc<dyn NotificationDispatcher>,
    event_bus: EventBus,
}

/// What a single approve attempt changed.
struct Approval {
    workflow: WorkflowInstance,
    step: ApprovalStep,
    next_role: Option<String>,
}

impl WorkflowEngine {
    pub fn new(
        pool: SqlitePool,
        matrix: MatrixHandle,
        rbac: AuthorizationService,
        notifier: Arc<dyn NotificationDispatcher>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            pool,
            matrix,
            rbac,
            notifier,
            event_bus,
        }
    }

    // =========================================================================
    // INITIATION
    // =========================================================================

    /// Resolves the approval chain and stores the workflow with one pending
    /// step per required role.
    pub async fn initiate_maker_action(&self, action: MakerAction) -> AppResult<WorkflowInstance> {
        action.validate()?;

        let matrix = self.matrix.current();
        let chain = resolve_chain(&matrix, &action.action_type, action.amount)?;
        self.require_user(action.maker_id).await?;

        let now = utc_now();
        let id = Uuid::new_v4();
        let workflow = WorkflowInstance {
            id,
            code: workflow_code(id, now),
            action_type: action.action_type.trim().to_string(),
            resource_id: action.resource_id,
            resource_type: action.resource_type.trim().to_string(),
            approval_deadline: action.approval_deadline(now),
            data: action.data,
            business_justification: action.business_justification.trim().to_string(),
            priority: action.priority,
            amount: action.amount,
            status: WorkflowStatus::Pending,
            initiated_by: action.maker_id,
            created_at: now,
            completed_at: None,
            rejection_reason: None,
            cancellation_reason: None,
            cancelled_by: None,
            escalation_reason: None,
            escalated_at: None,
            version: 0,
            matrix_version: matrix.version,
        };

        let steps: Vec<ApprovalStep> = chain
            .iter()
            .enumerate()
            .map(|(i, role)| new_step(id, i as i64 + 1, role, false, now))
            .collect();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO workflow_instances (
                id, code, action_type, resource_id, resource_type, data, business_justification,
                priority, amount, status, initiated_by, created_at, approval_deadline, version, matrix_version
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(workflow.id.to_string())
        .bind(&workflow.code)
        .bind(&workflow.action_type)
        .bind(workflow.resource_id.to_string())
        .bind(&workflow.resource_type)
        .bind(workflow.data.to_string())
        .bind(&workflow.business_justification)
        .bind(workflow.priority.as_str())
        .bind(workflow.amount.to_string())
        .bind(workflow.status.as_str())
        .bind(workflow.initiated_by.to_string())
        .bind(ts(workflow.created_at))
        .bind(ts(workflow.approval_deadline))
        .bind(workflow.version)
        .bind(workflow.matrix_version)
        .execute(&mut *tx)
        .await?;

        for step in &steps {
            insert_step(&mut tx, step).await?;
        }
        tx.commit().await?;

        log_activity_with_details(
            &self.event_bus,
            "created",
            Some(workflow.initiated_by),
            &workflow,
            Some(json!({ "approval_chain": chain })),
        );
        tracing::info!(
            workflow_id = %workflow.id,
            code = %workflow.code,
            action_type = %workflow.action_type,
            levels = steps.len(),
            "workflow initiated"
        );

        if let Some(first) = steps.first() {
            self.notify_role(
                NotificationKind::Approval,
                &first.approver_role,
                workflow.initiated_by,
                "Approval required",
                format!("Workflow {} ({}) awaits your approval", workflow.code, workflow.action_type),
            );
        }

        Ok(workflow)
    }

    // =========================================================================
    // VALIDATION + QUERIES
    // =========================================================================

    pub async fn validate_maker_checker_rules(
        &self,
        maker_id: Uuid,
        checker_id: Uuid,
        action_type: &str,
    ) -> AppResult<ValidationResult> {
        if maker_id == checker_id {
            return Ok(ValidationResult::invalid(SAME_USER_MESSAGE, "SAME_USER_VIOLATION"));
        }

        let matrix = self.matrix.current();
        let Some(rule) = matrix.rule(action_type) else {
            return Ok(ValidationResult::invalid(
                format!("Unknown action type: {action_type}"),
                "UNKNOWN_ACTION_TYPE",
            ));
        };

        let checker = self.rbac.principal(checker_id).await?;
        if !checker.has_any_role(rule.tiers.iter().map(|t| t.role.as_str())) {
            return Ok(ValidationResult::invalid(
                "Checker does not have required role for this action type",
                "INSUFFICIENT_ROLE",
            ));
        }

        Ok(ValidationResult::valid("Maker-checker rules validated successfully"))
    }

    pub async fn get_workflow_instance(&self, workflow_id: Uuid) -> AppResult<Option<WorkflowInstance>> {
        let sql = format!("SELECT {WORKFLOW_COLUMNS} FROM workflow_instances w WHERE w.id = ?");
        let row = sqlx::query(&sql)
            .bind(workflow_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(workflow_from_row).transpose()
    }

    /// Ascending by level.
    pub async fn get_workflow_steps(&self, workflow_id: Uuid) -> AppResult<Vec<ApprovalStep>> {
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_id, level, approver_role, status, processed_by, processed_at, comments, is_escalated, created_at
            FROM approval_steps
            WHERE workflow_id = ?
            ORDER BY level ASC
            "#,
        )
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(step_from_row).collect()
    }

    pub async fn get_workflow_instances_by_user(&self, user_id: Uuid) -> AppResult<Vec<WorkflowInstance>> {
        let sql = format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflow_instances w WHERE w.initiated_by = ? ORDER BY w.created_at DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(workflow_from_row).collect()
    }

    pub async fn get_workflow_instances_by_status(&self, status: WorkflowStatus) -> AppResult<Vec<WorkflowInstance>> {
        let sql = format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflow_instances w WHERE w.status = ? ORDER BY w.created_at DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(workflow_from_row).collect()
    }

    /// Workflows the user initiated or decided on, newest first. Pages are 1-based.
    pub async fn get_workflow_history(
        &self,
        user_id: Uuid,
        page_size: u32,
        page_number: u32,
    ) -> AppResult<Vec<WorkflowInstance>> {
        let page_size = page_size.clamp(1, 100);
        let offset = i64::from(page_number.saturating_sub(1)) * i64::from(page_size);

        let sql = format!(
            r#"
            SELECT {WORKFLOW_COLUMNS}
            FROM workflow_instances w
            WHERE w.initiated_by = ?
               OR w.id IN (SELECT workflow_id FROM approval_steps WHERE processed_by = ?)
            ORDER BY w.created_at DESC
            LIMIT ? OFFSET ?
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(user_id.to_string())
            .bind(user_id.to_string())
            .bind(i64::from(page_size))
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(workflow_from_row).collect()
    }

    pub async fn can_user_approve_workflow(&self, user_id: Uuid, workflow_id: Uuid) -> AppResult<bool> {
        let (workflow, steps) = self.load(workflow_id).await?;
        if workflow.status.is_terminal() {
            return Ok(false);
        }
        let Some(step) = current_step(&steps) else {
            return Ok(false);
        };

        match self.ensure_checker(&workflow, &steps, step, user_id).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_business_rule() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Current steps the checker could decide on, soonest deadline first.
    /// Workflows the checker initiated or already signed are left out.
    pub async fn get_approval_queue(&self, checker_id: Uuid) -> AppResult<Vec<PendingApproval>> {
        let principal = self.rbac.principal(checker_id).await?;

        let mut queue = Vec::new();
        for role in &principal.roles {
            queue.extend(self.queue_for_role(role, Some(checker_id)).await?);
        }
        queue.sort_by(|a, b| a.approval_deadline.cmp(&b.approval_deadline));
        Ok(queue)
    }

    pub async fn get_approval_queue_by_role(&self, role: &str) -> AppResult<Vec<PendingApproval>> {
        self.queue_for_role(role, None).await
    }

    async fn queue_for_role(&self, role: &str, checker_id: Option<Uuid>) -> AppResult<Vec<PendingApproval>> {
        let checker = checker_id.map(|id| id.to_string());
        let sql = format!(
            r#"
            SELECT {WORKFLOW_COLUMNS}, s.approver_role AS step_role, s.level AS step_level, u.full_name AS initiated_by_name
            FROM approval_steps s
            JOIN workflow_instances w ON w.id = s.workflow_id
            JOIN users u ON u.id = w.initiated_by
            WHERE s.approver_role = ?1
              AND s.status = 'Pending'
              AND w.status IN ('Pending', 'Escalated')
              AND s.level = (
                  SELECT MIN(s2.level) FROM approval_steps s2
                  WHERE s2.workflow_id = s.workflow_id AND s2.status = 'Pending'
              )
              AND (
                  ?2 IS NULL
                  OR (
                      w.initiated_by <> ?2
                      AND NOT EXISTS (
                          SELECT 1 FROM approval_steps p
                          WHERE p.workflow_id = w.id AND p.processed_by = ?2
                      )
                  )
              )
            ORDER BY w.approval_deadline ASC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(role)
            .bind(checker)
            .fetch_all(&self.pool)
            .await?;

        let now = utc_now();
        let mut queue = Vec::with_capacity(rows.len());
        for row in &rows {
            let workflow = workflow_from_row(row)?;
            queue.push(PendingApproval {
                workflow_id: workflow.id,
                code: workflow.code,
                action_type: workflow.action_type,
                resource_type: workflow.resource_type,
                resource_id: workflow.resource_id,
                business_justification: workflow.business_justification,
                amount: workflow.amount,
                priority: workflow.priority,
                initiated_at: workflow.created_at,
                initiated_by_name: row.try_get("initiated_by_name")?,
                approval_deadline: workflow.approval_deadline,
                current_approver_role: row.try_get("step_role")?,
                level: row.try_get("step_level")?,
                days_remaining: (workflow.approval_deadline - now).num_days(),
                is_overdue: workflow.approval_deadline < now,
            });
        }
        Ok(queue)
    }

    /// Pending workflows whose deadline is before `before`.
    pub async fn list_due_workflows(&self, before: DateTime<Utc>) -> AppResult<Vec<WorkflowInstance>> {
        let sql = format!(
            r#"
            SELECT {WORKFLOW_COLUMNS}
            FROM workflow_instances w
            WHERE w.status = 'Pending' AND w.approval_deadline < ?
            ORDER BY w.approval_deadline ASC
            "#
        );
        let rows = sqlx::query(&sql).bind(ts(before)).fetch_all(&self.pool).await?;
        rows.iter().map(workflow_from_row).collect()
    }

    pub async fn get_workflow_metrics(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> AppResult<WorkflowMetrics> {
        let sql = format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflow_instances w WHERE w.created_at >= ? AND w.created_at <= ?"
        );
        let rows = sqlx::query(&sql)
            .bind(ts(from))
            .bind(ts(to))
            .fetch_all(&self.pool)
            .await?;
        let workflows = rows.iter().map(workflow_from_row).collect::<AppResult<Vec<_>>>()?;

        Ok(compute_metrics(&workflows, utc_now()))
    }

    // =========================================================================
    // DECISIONS
    // =========================================================================

    /// Approves the current step. Business-rule failures come back as a
    /// failed [`ApprovalResult`]; only infrastructure faults are errors.
    pub async fn submit_for_approval(
        &self,
        workflow_id: Uuid,
        approver_id: Uuid,
        comments: Option<&str>,
    ) -> AppResult<ApprovalResult> {
        match self.approve(workflow_id, approver_id, comments).await {
            Ok(workflow) => {
                let message = if workflow.status == WorkflowStatus::Approved {
                    WORKFLOW_COMPLETED
                } else {
                    STEP_COMPLETED
                };
                Ok(ApprovalResult::success(message, workflow))
            }
            Err(e) => business_failure(e, workflow_id, "approval refused").map(|e| ApprovalResult::failure(&e)),
        }
    }

    /// Rejects at the current step and closes the workflow.
    pub async fn reject_workflow(
        &self,
        workflow_id: Uuid,
        approver_id: Uuid,
        reason: &str,
    ) -> AppResult<ApprovalResult> {
        match self.reject(workflow_id, approver_id, reason).await {
            Ok(workflow) => Ok(ApprovalResult::success("Workflow rejected", workflow)),
            Err(e) => business_failure(e, workflow_id, "rejection refused").map(|e| ApprovalResult::failure(&e)),
        }
    }

    pub async fn escalate_approval(&self, workflow_id: Uuid, reason: &str) -> AppResult<EscalationResult> {
        self.escalate_approval_by(workflow_id, reason, None).await
    }

    /// [`Self::escalate_approval`] with the acting user recorded in the audit trail.
    pub async fn escalate_approval_by(
        &self,
        workflow_id: Uuid,
        reason: &str,
        actor_id: Option<Uuid>,
    ) -> AppResult<EscalationResult> {
        match self.escalate(workflow_id, reason, actor_id).await {
            Ok(role) => Ok(EscalationResult {
                is_success: true,
                message: "Workflow escalated successfully".to_string(),
                escalated_workflow_ids: vec![workflow_id],
                new_approver_role: Some(role),
                error_code: None,
            }),
            Err(e) => business_failure(e, workflow_id, "escalation refused").map(|e| EscalationResult::failure(&e)),
        }
    }

    /// `true` when the workflow was cancelled by this call.
    pub async fn cancel_workflow(&self, workflow_id: Uuid, canceller_id: Uuid, reason: &str) -> AppResult<bool> {
        match self.cancel(workflow_id, canceller_id, reason).await {
            Ok(_) => Ok(true),
            Err(e) => business_failure(e, workflow_id, "cancellation refused").map(|_| false),
        }
    }

    /// Escalates every overdue pending workflow. Workflows that stopped being
    /// pending since they were listed are skipped.
    pub async fn auto_escalate_expired_workflows(&self, now: DateTime<Utc>) -> AppResult<EscalationResult> {
        let due = self.list_due_workflows(now).await?;

        let mut escalated = Vec::new();
        for workflow in due {
            match self.escalate(workflow.id, AUTO_ESCALATION_REASON, None).await {
                Ok(_) => escalated.push(workflow.id),
                Err(e) if e.is_business_rule() => {
                    tracing::debug!(workflow_id = %workflow.id, error = %e, "skipped during escalation sweep");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(EscalationResult {
            is_success: true,
            message: format!("{} workflow(s) escalated", escalated.len()),
            escalated_workflow_ids: escalated,
            new_approver_role: None,
            error_code: None,
        })
    }

    // =========================================================================
    // COMPARE-AND-SWAP CORE
    // =========================================================================

    async fn approve(&self, workflow_id: Uuid, approver_id: Uuid, comments: Option<&str>) -> AppResult<WorkflowInstance> {
        let mut target = None;
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            match self.approve_once(workflow_id, approver_id, comments, &mut target).await {
                Err(e) if e.is_retryable() => {
                    tracing::debug!(workflow_id = %workflow_id, attempt, "lost approval race, retrying");
                }
                Ok(approval) => {
                    self.after_approval(&approval, approver_id, comments);
                    return Ok(approval.workflow);
                }
                Err(e) => return Err(e),
            }
        }
        Err(AppError::stale("workflow is being modified concurrently"))
    }

    async fn approve_once(
        &self,
        workflow_id: Uuid,
        approver_id: Uuid,
        comments: Option<&str>,
        target: &mut Option<Uuid>,
    ) -> AppResult<Approval> {
        let (workflow, steps) = self.load(workflow_id).await?;
        ensure_open(&workflow)?;
        let step = claim_current_step(&steps, target)?;
        self.ensure_checker(&workflow, &steps, &step, approver_id).await?;

        let next_role = steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending && s.level > step.level)
            .min_by_key(|s| s.level)
            .map(|s| s.approver_role.clone());

        let now = utc_now();
        let mut updated = workflow.clone();
        if next_role.is_none() {
            updated.status = workflow.status.transition(WorkflowStatus::Approved)?;
            updated.completed_at = Some(now);
        }

        let mut tx = self.pool.begin().await?;
        write_workflow(&mut tx, &updated).await?;
        decide_step(&mut tx, &step, StepStatus::Approved, approver_id, comments, now).await?;
        tx.commit().await?;

        updated.version += 1;
        let mut step = step;
        step.status = StepStatus::Approved;
        step.processed_by = Some(approver_id);
        step.processed_at = Some(now);
        step.comments = comments.map(str::to_string);

        Ok(Approval {
            workflow: updated,
            step,
            next_role,
        })
    }

    fn after_approval(&self, approval: &Approval, approver_id: Uuid, comments: Option<&str>) {
        let workflow = &approval.workflow;
        log_activity_with_details(
            &self.event_bus,
            "step_approved",
            Some(approver_id),
            workflow,
            Some(json!({
                "level": approval.step.level,
                "approver_role": approval.step.approver_role,
                "comments": comments,
            })),
        );
        tracing::info!(
            workflow_id = %workflow.id,
            level = approval.step.level,
            approver_id = %approver_id,
            "approval step completed"
        );

        match &approval.next_role {
            Some(role) => self.notify_role(
                NotificationKind::Approval,
                role,
                workflow.initiated_by,
                "Approval required",
                format!("Workflow {} awaits approval at the next level", workflow.code),
            ),
            None => {
                log_activity(&self.event_bus, "approved", Some(approver_id), workflow);
                dispatch(
                    &self.notifier,
                    NotificationKind::Completion,
                    workflow.initiated_by,
                    "Workflow approved",
                    format!("Workflow {} has been fully approved", workflow.code),
                );
            }
        }
    }

    async fn reject(&self, workflow_id: Uuid, approver_id: Uuid, reason: &str) -> AppResult<WorkflowInstance> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(AppError::validation("Rejection reason is required"));
        }

        let mut target = None;
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            match self.reject_once(workflow_id, approver_id, reason, &mut target).await {
                Err(e) if e.is_retryable() => {
                    tracing::debug!(workflow_id = %workflow_id, attempt, "lost rejection race, retrying");
                }
                Ok(workflow) => {
                    log_activity_with_details(
                        &self.event_bus,
                        "rejected",
                        Some(approver_id),
                        &workflow,
                        Some(json!({ "reason": reason })),
                    );
                    tracing::info!(workflow_id = %workflow.id, approver_id = %approver_id, "workflow rejected");
                    dispatch(
                        &self.notifier,
                        NotificationKind::Completion,
                        workflow.initiated_by,
                        "Workflow rejected",
                        format!("Workflow {} was rejected: {}", workflow.code, reason),
                    );
                    return Ok(workflow);
                }
                Err(e) => return Err(e),
            }
        }
        Err(AppError::stale("workflow is being modified concurrently"))
    }

    async fn reject_once(
        &self,
        workflow_id: Uuid,
        approver_id: Uuid,
        reason: &str,
        target: &mut Option<Uuid>,
    ) -> AppResult<WorkflowInstance> {
        let (workflow, steps) = self.load(workflow_id).await?;
        ensure_open(&workflow)?;
        let step = claim_current_step(&steps, target)?;
        self.ensure_checker(&workflow, &steps, &step, approver_id).await?;

        let now = utc_now();
        let mut updated = workflow.clone();
        updated.status = workflow.status.transition(WorkflowStatus::Rejected)?;
        updated.rejection_reason = Some(reason.to_string());
        updated.completed_at = Some(now);

        let mut tx = self.pool.begin().await?;
        write_workflow(&mut tx, &updated).await?;
        decide_step(&mut tx, &step, StepStatus::Rejected, approver_id, Some(reason), now).await?;
        tx.commit().await?;

        updated.version += 1;
        Ok(updated)
    }

    /// Returns the role the workflow was escalated to.
    async fn escalate(&self, workflow_id: Uuid, reason: &str, actor_id: Option<Uuid>) -> AppResult<String> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(AppError::validation("Escalation reason is required"));
        }

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            match self.escalate_once(workflow_id, reason).await {
                Err(e) if e.is_retryable() => {
                    tracing::debug!(workflow_id = %workflow_id, attempt, "lost escalation race, retrying");
                }
                Ok((workflow, role)) => {
                    log_activity_with_details(
                        &self.event_bus,
                        "escalated",
                        actor_id,
                        &workflow,
                        Some(json!({ "reason": reason, "escalated_to": role })),
                    );
                    tracing::info!(workflow_id = %workflow.id, escalated_to = %role, "workflow escalated");
                    self.notify_role(
                        NotificationKind::Escalation,
                        &role,
                        workflow.initiated_by,
                        "Workflow escalated",
                        format!("Workflow {} was escalated: {}", workflow.code, reason),
                    );
                    return Ok(role);
                }
                Err(e) => return Err(e),
            }
        }
        Err(AppError::stale("workflow is being modified concurrently"))
    }

    async fn escalate_once(&self, workflow_id: Uuid, reason: &str) -> AppResult<(WorkflowInstance, String)> {
        let (workflow, steps) = self.load(workflow_id).await?;

        let now = utc_now();
        let mut updated = workflow.clone();
        updated.status = workflow.status.transition(WorkflowStatus::Escalated)?;
        updated.escalation_reason = Some(reason.to_string());
        updated.escalated_at = Some(now);

        let matrix = self.matrix.current();
        let role = matrix
            .rule(&workflow.action_type)
            .and_then(|rule| rule.escalation_target())
            .unwrap_or(roles::BRANCH_MANAGER)
            .to_string();

        let already_pending = steps
            .iter()
            .any(|s| s.status == StepStatus::Pending && s.approver_role == role);
        let next_level = steps.iter().map(|s| s.level).max().unwrap_or(0) + 1;

        let mut tx = self.pool.begin().await?;
        write_workflow(&mut tx, &updated).await?;
        if !already_pending {
            insert_step(&mut tx, &new_step(workflow_id, next_level, &role, true, now)).await?;
        }
        tx.commit().await?;

        updated.version += 1;
        Ok((updated, role))
    }

    /// Cancels a workflow that is still open. Only the maker or a holder of
    /// the workflow cancel permission may cancel.
    pub async fn cancel(&self, workflow_id: Uuid, canceller_id: Uuid, reason: &str) -> AppResult<WorkflowInstance> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(AppError::validation("Cancellation reason is required"));
        }

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            match self.cancel_once(workflow_id, canceller_id, reason).await {
                Err(e) if e.is_retryable() => {
                    tracing::debug!(workflow_id = %workflow_id, attempt, "lost cancellation race, retrying");
                }
                Ok(workflow) => {
                    log_activity_with_details(
                        &self.event_bus,
                        "cancelled",
                        Some(canceller_id),
                        &workflow,
                        Some(json!({ "reason": reason })),
                    );
                    tracing::info!(workflow_id = %workflow.id, cancelled_by = %canceller_id, "workflow cancelled");
                    if canceller_id != workflow.initiated_by {
                        dispatch(
                            &self.notifier,
                            NotificationKind::Completion,
                            workflow.initiated_by,
                            "Workflow cancelled",
                            format!("Workflow {} was cancelled: {}", workflow.code, reason),
                        );
                    }
                    return Ok(workflow);
                }
                Err(e) => return Err(e),
            }
        }
        Err(AppError::stale("workflow is being modified concurrently"))
    }

    async fn cancel_once(&self, workflow_id: Uuid, canceller_id: Uuid, reason: &str) -> AppResult<WorkflowInstance> {
        let (workflow, _) = self.load(workflow_id).await?;
        ensure_open(&workflow)?;

        if canceller_id != workflow.initiated_by
            && !self
                .rbac
                .authorize_action(canceller_id, permissions::WORKFLOW, permissions::CANCEL)
                .await?
        {
            return Err(AppError::forbidden("only the maker or a user allowed to cancel workflows may cancel"));
        }

        let now = utc_now();
        let mut updated = workflow.clone();
        updated.status = workflow.status.transition(WorkflowStatus::Cancelled)?;
        updated.cancellation_reason = Some(reason.to_string());
        updated.cancelled_by = Some(canceller_id);
        updated.completed_at = Some(now);

        let mut tx = self.pool.begin().await?;
        write_workflow(&mut tx, &updated).await?;
        tx.commit().await?;

        updated.version += 1;
        Ok(updated)
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    async fn load(&self, workflow_id: Uuid) -> AppResult<(WorkflowInstance, Vec<ApprovalStep>)> {
        let workflow = self
            .get_workflow_instance(workflow_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("workflow {workflow_id}")))?;
        let steps = self.get_workflow_steps(workflow_id).await?;
        Ok((workflow, steps))
    }

    /// Maker never checks; the checker must hold the step's role and may
    /// sign at most one level of a workflow.
    async fn ensure_checker(
        &self,
        workflow: &WorkflowInstance,
        steps: &[ApprovalStep],
        step: &ApprovalStep,
        checker_id: Uuid,
    ) -> AppResult<()> {
        if checker_id == workflow.initiated_by {
            return Err(AppError::forbidden(SAME_USER_MESSAGE));
        }

        if steps
            .iter()
            .any(|s| s.status == StepStatus::Approved && s.processed_by == Some(checker_id))
        {
            return Err(AppError::forbidden("checker already approved an earlier level of this workflow"));
        }

        let principal = self.rbac.principal(checker_id).await?;
        if !principal.has_role(&step.approver_role) {
            return Err(AppError::forbidden(format!(
                "level {} requires role {}",
                step.level, step.approver_role
            )));
        }
        Ok(())
    }

    async fn require_user(&self, user_id: Uuid) -> AppResult<()> {
        let active: Option<bool> = sqlx::query_scalar("SELECT is_active FROM users WHERE id = ?")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match active {
            Some(true) => Ok(()),
            Some(false) => Err(AppError::validation("Maker account is inactive")),
            None => Err(AppError::not_found(format!("user {user_id}"))),
        }
    }

    /// Resolves recipients and sends on a detached task.
    fn notify_role(
        &self,
        kind: NotificationKind,
        role: &str,
        exclude: Uuid,
        title: &str,
        message: String,
    ) {
        let rbac = self.rbac.clone();
        let notifier = Arc::clone(&self.notifier);
        let role = role.to_string();
        let title = title.to_string();

        tokio::spawn(async move {
            match rbac.role_member_ids(&role).await {
                Ok(ids) => {
                    for user_id in ids.into_iter().filter(|id| *id != exclude) {
                        dispatch(&notifier, kind, user_id, title.clone(), message.clone());
                    }
                }
                Err(e) => {
                    tracing::warn!(role = %role, error = %e, "could not resolve notification recipients");
                }
            }
        });
    }
}

fn ensure_open(workflow: &WorkflowInstance) -> AppResult<()> {
    if workflow.status.is_terminal() {
        return Err(AppError::conflict(format!(
            "workflow {} is {} and no longer accepts changes",
            workflow.code, workflow.status
        )));
    }
    Ok(())
}

/// The lowest pending step. A retry must still be looking at the step the
/// first attempt targeted; if another checker decided it, that is a conflict.
fn claim_current_step(steps: &[ApprovalStep], target: &mut Option<Uuid>) -> AppResult<ApprovalStep> {
    let step = current_step(steps)
        .cloned()
        .ok_or_else(|| AppError::conflict("workflow has no pending approval step"))?;

    match target {
        Some(id) if *id != step.id => Err(AppError::conflict(
            "approval step was already decided by another checker",
        )),
        _ => {
            *target = Some(step.id);
            Ok(step)
        }
    }
}

/// Business-rule failures become typed results; anything else propagates.
fn business_failure(err: AppError, workflow_id: Uuid, what: &str) -> AppResult<AppError> {
    if err.is_business_rule() {
        tracing::debug!(workflow_id = %workflow_id, error = %err, "{what}");
        Ok(err)
    } else {
        Err(err)
    }
}

fn new_step(workflow_id: Uuid, level: i64, role: &str, is_escalated: bool, now: DateTime<Utc>) -> ApprovalStep {
    ApprovalStep {
        id: Uuid::new_v4(),
        workflow_id,
        level,
        approver_role: role.to_string(),
        status: StepStatus::Pending,
        processed_by: None,
        processed_at: None,
        comments: None,
        is_escalated,
        created_at: now,
    }
}

async fn insert_step(tx: &mut Transaction<'_, Sqlite>, step: &ApprovalStep) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO approval_steps (id, workflow_id, level, approver_role, status, is_escalated, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(step.id.to_string())
    .bind(step.workflow_id.to_string())
    .bind(step.level)
    .bind(&step.approver_role)
    .bind(step.status.as_str())
    .bind(step.is_escalated)
    .bind(ts(step.created_at))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Conditional write of every mutable workflow field. `workflow.version` is the
/// version that was read; zero rows affected means someone else wrote first.
async fn write_workflow(tx: &mut Transaction<'_, Sqlite>, workflow: &WorkflowInstance) -> AppResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE workflow_instances
        SET status = ?, completed_at = ?, rejection_reason = ?, cancellation_reason = ?, cancelled_by = ?,
            escalation_reason = ?, escalated_at = ?, version = version + 1
        WHERE id = ? AND version = ?
        "#,
    )
    .bind(workflow.status.as_str())
    .bind(workflow.completed_at.map(ts))
    .bind(&workflow.rejection_reason)
    .bind(&workflow.cancellation_reason)
    .bind(workflow.cancelled_by.map(|id| id.to_string()))
    .bind(&workflow.escalation_reason)
    .bind(workflow.escalated_at.map(ts))
    .bind(workflow.id.to_string())
    .bind(workflow.version)
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::stale(format!("workflow {} changed since it was read", workflow.code)));
    }
    Ok(())
}

async fn decide_step(
    tx: &mut Transaction<'_, Sqlite>,
    step: &ApprovalStep,
    status: StepStatus,
    checker_id: Uuid,
    comments: Option<&str>,
    at: DateTime<Utc>,
) -> AppResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE approval_steps
        SET status = ?, processed_by = ?, processed_at = ?, comments = ?
        WHERE id = ? AND status = 'Pending'
        "#,
    )
    .bind(status.as_str())
    .bind(checker_id.to_string())
    .bind(ts(at))
    .bind(comments)
    .bind(step.id.to_string())
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::stale(format!("approval step {} already decided", step.level)));
    }
    Ok(())
}

fn compute_metrics(workflows: &[WorkflowInstance], now: DateTime<Utc>) -> WorkflowMetrics {
    let mut metrics = WorkflowMetrics {
        total_workflows: workflows.len() as i64,
        ..WorkflowMetrics::default()
    };

    let mut by_type: BTreeMap<String, i64> = BTreeMap::new();
    let mut by_priority: BTreeMap<String, i64> = BTreeMap::new();
    let mut processing_hours = Vec::new();

    for workflow in workflows {
        match workflow.status {
            WorkflowStatus::Pending => metrics.pending_workflows += 1,
            WorkflowStatus::Approved => metrics.approved_workflows += 1,
            WorkflowStatus::Rejected => metrics.rejected_workflows += 1,
            WorkflowStatus::Escalated => metrics.escalated_workflows += 1,
            WorkflowStatus::Cancelled => metrics.cancelled_workflows += 1,
        }
        if workflow.is_overdue(now) {
            metrics.overdue_workflows += 1;
        }
        if let Some(done) = workflow.completed_at {
            processing_hours.push((done - workflow.created_at).num_seconds() as f64 / 3600.0);
        }
        *by_type.entry(workflow.action_type.clone()).or_default() += 1;
        *by_priority.entry(workflow.priority.as_str().to_string()).or_default() += 1;
    }

    if !processing_hours.is_empty() {
        metrics.average_processing_time_hours =
            processing_hours.iter().sum::<f64>() / processing_hours.len() as f64;
    }
    metrics.workflows_by_type = by_type;
    metrics.workflows_by_priority = by_priority;
    metrics
}
