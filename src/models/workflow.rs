use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::events::{Loggable, Severity};

// =============================================================================
// STATUS + TRANSITION TABLE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum WorkflowStatus {
    Pending,
    Escalated,
    Approved,
    Rejected,
    Cancelled,
}

/// Every permitted `(from, to)` edge. Anything absent is a state conflict.
const TRANSITIONS: &[(WorkflowStatus, WorkflowStatus)] = &[
    (WorkflowStatus::Pending, WorkflowStatus::Approved),
    (WorkflowStatus::Pending, WorkflowStatus::Rejected),
    (WorkflowStatus::Pending, WorkflowStatus::Cancelled),
    (WorkflowStatus::Pending, WorkflowStatus::Escalated),
    (WorkflowStatus::Escalated, WorkflowStatus::Approved),
    (WorkflowStatus::Escalated, WorkflowStatus::Rejected),
    (WorkflowStatus::Escalated, WorkflowStatus::Cancelled),
];

impl WorkflowStatus {
    pub const ALL: [WorkflowStatus; 5] = [
        WorkflowStatus::Pending,
        WorkflowStatus::Escalated,
        WorkflowStatus::Approved,
        WorkflowStatus::Rejected,
        WorkflowStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "Pending",
            WorkflowStatus::Escalated => "Escalated",
            WorkflowStatus::Approved => "Approved",
            WorkflowStatus::Rejected => "Rejected",
            WorkflowStatus::Cancelled => "Cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Approved | WorkflowStatus::Rejected | WorkflowStatus::Cancelled
        )
    }

    /// Still awaiting checker decisions.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        TRANSITIONS.iter().any(|&(from, to)| from == *self && to == next)
    }

    /// The single guarded switch every status change goes through.
    pub fn transition(self, next: WorkflowStatus) -> AppResult<WorkflowStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(AppError::conflict(format!(
                "workflow is {} and cannot become {}",
                self.as_str(),
                next.as_str()
            )))
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkflowStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| AppError::internal(format!("unknown workflow status: {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum StepStatus {
    Pending,
    Approved,
    Rejected,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "Pending",
            StepStatus::Approved => "Approved",
            StepStatus::Rejected => "Rejected",
        }
    }
}

impl FromStr for StepStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(StepStatus::Pending),
            "Approved" => Ok(StepStatus::Approved),
            "Rejected" => Ok(StepStatus::Rejected),
            other => Err(AppError::internal(format!("unknown step status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "Low",
            Priority::Normal => "Normal",
            Priority::High => "High",
            Priority::Critical => "Critical",
        }
    }

    /// How long checkers have before the sweep escalates the workflow.
    pub fn approval_window(&self) -> Duration {
        match self {
            Priority::Critical => Duration::hours(4),
            Priority::High => Duration::hours(24),
            Priority::Normal => Duration::days(3),
            Priority::Low => Duration::days(7),
        }
    }
}

impl FromStr for Priority {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Low" => Ok(Priority::Low),
            "Normal" => Ok(Priority::Normal),
            "High" => Ok(Priority::High),
            "Critical" => Ok(Priority::Critical),
            other => Err(AppError::internal(format!("unknown priority: {other}"))),
        }
    }
}

// =============================================================================
// MAKER ACTION
// =============================================================================

/// A sensitive action submitted by a maker. Consumed to create a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MakerAction {
    #[schema(example = "loan_approval")]
    pub action_type: String,
    pub resource_id: Uuid,
    #[schema(example = "Loan")]
    pub resource_type: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub data: Value,
    pub maker_id: Uuid,
    #[schema(example = "Customer requested a top-up")]
    pub business_justification: String,
    #[serde(default)]
    #[schema(value_type = String, example = "75000")]
    pub amount: Decimal,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub requested_completion_date: Option<DateTime<Utc>>,
}

impl MakerAction {
    /// Field-level checks; every problem is reported, joined by `; `.
    pub fn validate(&self) -> AppResult<()> {
        let mut errors = Vec::new();
        if self.action_type.trim().is_empty() {
            errors.push("Action type is required");
        }
        if self.resource_id.is_nil() {
            errors.push("Resource ID is required");
        }
        if self.resource_type.trim().is_empty() {
            errors.push("Resource type is required");
        }
        if self.maker_id.is_nil() {
            errors.push("Maker ID is required");
        }
        if self.business_justification.trim().is_empty() {
            errors.push("Business justification is required");
        }
        if self.amount.is_sign_negative() {
            errors.push("Amount cannot be negative");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AppError::validation(errors.join("; ")))
        }
    }

    pub fn approval_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.requested_completion_date.unwrap_or(now) + self.priority.approval_window()
    }
}

// =============================================================================
// WORKFLOW INSTANCE + STEPS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WorkflowInstance {
    pub id: Uuid,
    #[schema(example = "WF-20261016-1A2B3C4D5E6F")]
    pub code: String,
    pub action_type: String,
    pub resource_id: Uuid,
    pub resource_type: String,
    #[schema(value_type = Object)]
    pub data: Value,
    pub business_justification: String,
    pub priority: Priority,
    #[schema(value_type = String)]
    pub amount: Decimal,
    pub status: WorkflowStatus,
    pub initiated_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub approval_deadline: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub cancellation_reason: Option<String>,
    pub cancelled_by: Option<Uuid>,
    pub escalation_reason: Option<String>,
    pub escalated_at: Option<DateTime<Utc>>,
    /// Optimistic-concurrency stamp, bumped on every conditional write.
    pub version: i64,
    /// Approval matrix version the chain was resolved against.
    pub matrix_version: i64,
}

impl WorkflowInstance {
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == WorkflowStatus::Pending && self.approval_deadline < now
    }
}

impl Loggable for WorkflowInstance {
    fn entity_type() -> &'static str { "workflow" }
    fn subject_id(&self) -> Uuid { self.id }
    fn severity_for_action(&self, action: &str) -> Severity {
        match action {
            "approved" | "rejected" | "cancelled" | "escalated" => Severity::Critical,
            _ => Severity::Important,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApprovalStep {
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// 1-based position in the approval chain.
    pub level: i64,
    #[schema(example = "LoanOfficer")]
    pub approver_role: String,
    pub status: StepStatus,
    pub processed_by: Option<Uuid>,
    pub processed_at: Option<DateTime<Utc>>,
    pub comments: Option<String>,
    pub is_escalated: bool,
    pub created_at: DateTime<Utc>,
}

/// The lowest-level step still awaiting a decision.
pub fn current_step(steps: &[ApprovalStep]) -> Option<&ApprovalStep> {
    steps
        .iter()
        .filter(|s| s.status == StepStatus::Pending)
        .min_by_key(|s| s.level)
}

// =============================================================================
// TYPED RESULTS
// =============================================================================

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApprovalResult {
    pub is_success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_instance: Option<WorkflowInstance>,
}

impl ApprovalResult {
    pub fn success(message: impl Into<String>, workflow: WorkflowInstance) -> Self {
        Self {
            is_success: true,
            message: message.into(),
            error_code: None,
            workflow_instance: Some(workflow),
        }
    }

    pub fn failure(err: &AppError) -> Self {
        Self {
            is_success: false,
            message: err.to_string(),
            error_code: Some(err.code().to_string()),
            workflow_instance: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct EscalationResult {
    pub is_success: bool,
    pub message: String,
    pub escalated_workflow_ids: Vec<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_approver_role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl EscalationResult {
    pub fn failure(err: &AppError) -> Self {
        Self {
            is_success: false,
            message: err.to_string(),
            escalated_workflow_ids: Vec::new(),
            new_approver_role: None,
            error_code: Some(err.code().to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub message: String,
    pub validation_errors: Vec<String>,
}

impl ValidationResult {
    pub fn valid(message: impl Into<String>) -> Self {
        Self {
            is_valid: true,
            message: message.into(),
            validation_errors: Vec::new(),
        }
    }

    pub fn invalid(message: impl Into<String>, code: &str) -> Self {
        Self {
            is_valid: false,
            message: message.into(),
            validation_errors: vec![code.to_string()],
        }
    }
}

/// One row of a checker's approval queue.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PendingApproval {
    pub workflow_id: Uuid,
    pub code: String,
    pub action_type: String,
    pub resource_type: String,
    pub resource_id: Uuid,
    pub business_justification: String,
    #[schema(value_type = String)]
    pub amount: Decimal,
    pub priority: Priority,
    pub initiated_at: DateTime<Utc>,
    pub initiated_by_name: String,
    pub approval_deadline: DateTime<Utc>,
    pub current_approver_role: String,
    pub level: i64,
    pub days_remaining: i64,
    pub is_overdue: bool,
}

#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct WorkflowMetrics {
    pub total_workflows: i64,
    pub pending_workflows: i64,
    pub approved_workflows: i64,
    pub rejected_workflows: i64,
    pub escalated_workflows: i64,
    pub cancelled_workflows: i64,
    pub overdue_workflows: i64,
    pub average_processing_time_hours: f64,
    pub workflows_by_type: std::collections::BTreeMap<String, i64>,
    pub workflows_by_priority: std::collections::BTreeMap<String, i64>,
}

// =============================================================================
// REQUEST BODIES
// =============================================================================

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct ApproveRequest {
    pub comments: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ReasonRequest {
    #[schema(example = "Credit score too low")]
    pub reason: String,
}

/// HTTP form of a [`MakerAction`]; the maker is always the caller.
#[derive(Debug, Deserialize, ToSchema)]
pub struct InitiateWorkflowRequest {
    #[schema(example = "loan_approval")]
    pub action_type: String,
    pub resource_id: Uuid,
    #[schema(example = "Loan")]
    pub resource_type: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub data: Value,
    pub business_justification: String,
    #[serde(default)]
    #[schema(value_type = String, example = "75000")]
    pub amount: Decimal,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub requested_completion_date: Option<DateTime<Utc>>,
}

impl InitiateWorkflowRequest {
    pub fn into_action(self, maker_id: Uuid) -> MakerAction {
        MakerAction {
            action_type: self.action_type,
            resource_id: self.resource_id,
            resource_type: self.resource_type,
            data: self.data,
            maker_id,
            business_justification: self.business_justification,
            amount: self.amount,
            priority: self.priority,
            requested_completion_date: self.requested_completion_date,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ValidateRulesRequest {
    pub maker_id: Uuid,
    pub checker_id: Uuid,
    pub action_type: String,
}
