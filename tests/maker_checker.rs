mod common;

use anyhow::Result;
use chrono::Duration;
use rust_decimal::Decimal;

use common::{maker_action, TestApp};
use dual_control::errors::AppError;
use dual_control::models::workflow::{StepStatus, WorkflowStatus};
use dual_control::services::workflow::{STEP_COMPLETED, WORKFLOW_COMPLETED};
use dual_control::utils::utc_now;

#[tokio::test]
async fn loan_above_officer_limit_needs_two_levels_in_order() -> Result<()> {
    let app = TestApp::new().await?;
    let maker = app.user("maker", &["LoanOfficer"]).await?;
    let officer = app.user("officer", &["LoanOfficer"]).await?;
    let manager = app.user("manager", &["BranchManager"]).await?;
    let engine = &app.state.workflows;

    let wf = engine
        .initiate_maker_action(maker_action(maker.id, "loan_approval", 75_000))
        .await?;
    assert_eq!(wf.status, WorkflowStatus::Pending);
    assert!(wf.code.starts_with("WF-"));
    assert_eq!(wf.code.len(), "WF-20261016-".len() + 12, "{}", wf.code);
    assert_eq!(wf.matrix_version, 1);

    let steps = engine.get_workflow_steps(wf.id).await?;
    let roles: Vec<_> = steps.iter().map(|s| s.approver_role.as_str()).collect();
    assert_eq!(roles, ["LoanOfficer", "BranchManager"]);
    assert!(steps.iter().all(|s| s.status == StepStatus::Pending));

    // level 2 cannot be decided before level 1
    let early = engine.submit_for_approval(wf.id, manager.id, None).await?;
    assert!(!early.is_success);
    assert_eq!(early.error_code.as_deref(), Some("forbidden"));

    let first = engine.submit_for_approval(wf.id, officer.id, Some("docs verified")).await?;
    assert!(first.is_success, "{first:?}");
    assert_eq!(first.message, STEP_COMPLETED);
    assert_eq!(first.workflow_instance.as_ref().map(|w| w.status), Some(WorkflowStatus::Pending));

    let second = engine.submit_for_approval(wf.id, manager.id, None).await?;
    assert!(second.is_success, "{second:?}");
    assert_eq!(second.message, WORKFLOW_COMPLETED);

    let done = engine.get_workflow_instance(wf.id).await?.unwrap();
    assert_eq!(done.status, WorkflowStatus::Approved);
    assert!(done.completed_at.is_some());

    let steps = engine.get_workflow_steps(wf.id).await?;
    assert_eq!(steps[0].processed_by, Some(officer.id));
    assert_eq!(steps[0].comments.as_deref(), Some("docs verified"));
    assert_eq!(steps[1].processed_by, Some(manager.id));
    assert!(steps.iter().all(|s| s.status == StepStatus::Approved));
    Ok(())
}

#[tokio::test]
async fn high_risk_action_always_needs_second_level() -> Result<()> {
    let app = TestApp::new().await?;
    let maker = app.user("maker", &["BackOfficeOfficer"]).await?;

    let wf = app
        .state
        .workflows
        .initiate_maker_action(maker_action(maker.id, "transaction_reversal", 10_000))
        .await?;
    let roles: Vec<_> = app
        .state
        .workflows
        .get_workflow_steps(wf.id)
        .await?
        .into_iter()
        .map(|s| s.approver_role)
        .collect();
    assert_eq!(roles, ["BackOfficeOfficer", "BranchManager"]);
    Ok(())
}

#[tokio::test]
async fn maker_cannot_check_own_workflow() -> Result<()> {
    let app = TestApp::new().await?;
    let maker = app.user("maker", &["LoanOfficer"]).await?;
    let engine = &app.state.workflows;

    let wf = engine
        .initiate_maker_action(maker_action(maker.id, "loan_approval", 20_000))
        .await?;

    let result = engine.submit_for_approval(wf.id, maker.id, None).await?;
    assert!(!result.is_success);
    assert!(result.message.contains("not authorized"), "{}", result.message);
    assert!(result.message.contains("Maker and checker cannot be the same user"));
    assert!(!engine.can_user_approve_workflow(maker.id, wf.id).await?);

    let rejection = engine.reject_workflow(wf.id, maker.id, "self review").await?;
    assert!(!rejection.is_success);

    let still = engine.get_workflow_instance(wf.id).await?.unwrap();
    assert_eq!(still.status, WorkflowStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn one_checker_cannot_sign_two_levels() -> Result<()> {
    let app = TestApp::new().await?;
    let maker = app.user("maker", &["LoanOfficer"]).await?;
    let both = app.user("both", &["LoanOfficer", "BranchManager"]).await?;
    let engine = &app.state.workflows;

    let wf = engine
        .initiate_maker_action(maker_action(maker.id, "loan_approval", 75_000))
        .await?;

    assert!(engine.submit_for_approval(wf.id, both.id, None).await?.is_success);
    let second = engine.submit_for_approval(wf.id, both.id, None).await?;
    assert!(!second.is_success);
    assert_eq!(second.error_code.as_deref(), Some("forbidden"));
    Ok(())
}

#[tokio::test]
async fn rejected_workflow_refuses_further_approval() -> Result<()> {
    let app = TestApp::new().await?;
    let maker = app.user("maker", &["LoanOfficer"]).await?;
    let officer = app.user("officer", &["LoanOfficer"]).await?;
    let manager = app.user("manager", &["BranchManager"]).await?;
    let engine = &app.state.workflows;

    let wf = engine
        .initiate_maker_action(maker_action(maker.id, "loan_approval", 75_000))
        .await?;

    let blank = engine.reject_workflow(wf.id, officer.id, "   ").await?;
    assert!(!blank.is_success);
    assert_eq!(blank.error_code.as_deref(), Some("validation"));

    let rejected = engine.reject_workflow(wf.id, officer.id, "Credit score too low").await?;
    assert!(rejected.is_success);
    let wf_after = rejected.workflow_instance.unwrap();
    assert_eq!(wf_after.status, WorkflowStatus::Rejected);
    assert_eq!(wf_after.rejection_reason.as_deref(), Some("Credit score too low"));

    let again = engine.submit_for_approval(wf.id, manager.id, None).await?;
    assert!(!again.is_success);
    assert_eq!(again.error_code.as_deref(), Some("conflict"));

    let steps = engine.get_workflow_steps(wf.id).await?;
    assert_eq!(steps[0].status, StepStatus::Rejected);
    assert_eq!(steps[1].status, StepStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn cancelled_workflow_refuses_further_approval() -> Result<()> {
    let app = TestApp::new().await?;
    let maker = app.user("maker", &["LoanOfficer"]).await?;
    let officer = app.user("officer", &["LoanOfficer"]).await?;
    let manager = app.user("manager", &["BranchManager"]).await?;
    let engine = &app.state.workflows;

    let wf = engine
        .initiate_maker_action(maker_action(maker.id, "loan_approval", 75_000))
        .await?;
    assert!(engine.submit_for_approval(wf.id, officer.id, None).await?.is_success);

    // an officer without the cancel permission who is not the maker
    assert!(!engine.cancel_workflow(wf.id, officer.id, "not mine").await?);

    assert!(
        engine
            .cancel_workflow(wf.id, manager.id, "Duplicate application found")
            .await?
    );
    let cancelled = engine.get_workflow_instance(wf.id).await?.unwrap();
    assert_eq!(cancelled.status, WorkflowStatus::Cancelled);
    assert_eq!(cancelled.cancelled_by, Some(manager.id));
    assert_eq!(cancelled.cancellation_reason.as_deref(), Some("Duplicate application found"));

    let late = engine.submit_for_approval(wf.id, manager.id, None).await?;
    assert!(!late.is_success);
    assert!(!engine.cancel_workflow(wf.id, maker.id, "again").await?);
    Ok(())
}

#[tokio::test]
async fn maker_may_cancel_own_workflow() -> Result<()> {
    let app = TestApp::new().await?;
    let maker = app.user("maker", &["BancassuranceOfficer"]).await?;
    let engine = &app.state.workflows;

    let wf = engine
        .initiate_maker_action(maker_action(maker.id, "policy_creation", 1_000))
        .await?;
    let cancelled = engine.cancel(wf.id, maker.id, "Customer withdrew").await?;
    assert_eq!(cancelled.status, WorkflowStatus::Cancelled);

    let err = engine.cancel(wf.id, maker.id, "").await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    Ok(())
}

#[tokio::test]
async fn invalid_maker_actions_are_refused() -> Result<()> {
    let app = TestApp::new().await?;
    let maker = app.user("maker", &["LoanOfficer"]).await?;
    let engine = &app.state.workflows;

    let err = engine
        .initiate_maker_action(maker_action(maker.id, "wire_to_moon", 10))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Unknown action type: wire_to_moon"), "{err}");

    let mut action = maker_action(maker.id, "loan_approval", 10);
    action.business_justification = " ".to_string();
    action.resource_type = String::new();
    let err = engine.initiate_maker_action(action).await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("Business justification is required"), "{message}");
    assert!(message.contains("Resource type is required"), "{message}");

    let mut action = maker_action(maker.id, "loan_approval", 0);
    action.amount = Decimal::from(-5);
    assert!(matches!(
        engine.initiate_maker_action(action).await,
        Err(AppError::Validation(_))
    ));

    app.state.auth.deactivate_user(maker.id, None).await?;
    assert!(matches!(
        engine
            .initiate_maker_action(maker_action(maker.id, "loan_approval", 10))
            .await,
        Err(AppError::Validation(_))
    ));

    assert!(engine.get_workflow_instances_by_user(maker.id).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn validate_rules_reports_each_violation() -> Result<()> {
    let app = TestApp::new().await?;
    let maker = app.user("maker", &["LoanOfficer"]).await?;
    let officer = app.user("officer", &["LoanOfficer"]).await?;
    let teller = app.user("teller", &["BackOfficeOfficer"]).await?;
    let engine = &app.state.workflows;

    let same = engine.validate_maker_checker_rules(maker.id, maker.id, "loan_approval").await?;
    assert!(!same.is_valid);
    assert_eq!(same.validation_errors, ["SAME_USER_VIOLATION"]);
    assert!(same.message.contains("same user"), "{}", same.message);

    // same-user wins over every other check, whatever the action type
    for action_type in ["account_creation", "transaction_reversal", "mystery"] {
        let same = engine.validate_maker_checker_rules(officer.id, officer.id, action_type).await?;
        assert!(!same.is_valid);
        assert!(same.message.contains("same user"), "{}", same.message);
        assert_eq!(same.validation_errors, ["SAME_USER_VIOLATION"]);
    }

    let unknown = engine.validate_maker_checker_rules(maker.id, officer.id, "mystery").await?;
    assert_eq!(unknown.validation_errors, ["UNKNOWN_ACTION_TYPE"]);

    let wrong_role = engine.validate_maker_checker_rules(maker.id, teller.id, "loan_approval").await?;
    assert_eq!(wrong_role.validation_errors, ["INSUFFICIENT_ROLE"]);

    let ok = engine.validate_maker_checker_rules(maker.id, officer.id, "loan_approval").await?;
    assert!(ok.is_valid);
    assert!(ok.validation_errors.is_empty());
    Ok(())
}

#[tokio::test]
async fn queues_history_and_metrics_follow_decisions() -> Result<()> {
    let app = TestApp::new().await?;
    let maker = app.user("maker", &["LoanOfficer"]).await?;
    let officer = app.user("officer", &["LoanOfficer"]).await?;
    let engine = &app.state.workflows;

    let small = engine
        .initiate_maker_action(maker_action(maker.id, "loan_approval", 5_000))
        .await?;
    let other = engine
        .initiate_maker_action(maker_action(officer.id, "loan_approval", 7_000))
        .await?;

    let queue = engine.get_approval_queue(officer.id).await?;
    let ids: Vec<_> = queue.iter().map(|p| p.workflow_id).collect();
    assert_eq!(ids, [small.id], "own workflow must not appear in the checker's queue");
    assert_eq!(queue[0].current_approver_role, "LoanOfficer");
    assert_eq!(queue[0].initiated_by_name, "maker Test");
    assert!(!queue[0].is_overdue);

    let by_role = engine.get_approval_queue_by_role("LoanOfficer").await?;
    assert_eq!(by_role.len(), 2);

    assert!(engine.can_user_approve_workflow(officer.id, small.id).await?);
    assert!(engine.submit_for_approval(small.id, officer.id, None).await?.is_success);
    assert!(!engine.can_user_approve_workflow(officer.id, small.id).await?);

    let history = engine.get_workflow_history(officer.id, 10, 1).await?;
    let history_ids: Vec<_> = history.iter().map(|w| w.id).collect();
    assert!(history_ids.contains(&small.id));
    assert!(history_ids.contains(&other.id));
    assert_eq!(engine.get_workflow_history(officer.id, 10, 2).await?.len(), 0);
    assert!(engine.get_workflow_history(officer.id, 100, u32::MAX).await?.is_empty());

    let approved = engine.get_workflow_instances_by_status(WorkflowStatus::Approved).await?;
    assert_eq!(approved.len(), 1);

    let now = utc_now();
    let metrics = engine.get_workflow_metrics(now - Duration::days(1), now).await?;
    assert_eq!(metrics.total_workflows, 2);
    assert_eq!(metrics.approved_workflows, 1);
    assert_eq!(metrics.pending_workflows, 1);
    assert_eq!(metrics.workflows_by_type.get("loan_approval"), Some(&2));
    Ok(())
}

#[tokio::test]
async fn checkers_are_notified_but_not_the_maker() -> Result<()> {
    let app = TestApp::new().await?;
    let maker = app.user("maker", &["LoanOfficer"]).await?;
    let officer = app.user("officer", &["LoanOfficer"]).await?;
    let manager = app.user("manager", &["BranchManager"]).await?;

    let wf = app
        .state
        .workflows
        .initiate_maker_action(maker_action(maker.id, "loan_approval", 75_000))
        .await?;
    app.settle().await;
    assert_eq!(app.notifier.recipients("approval"), [officer.id]);

    app.state.workflows.submit_for_approval(wf.id, officer.id, None).await?;
    app.settle().await;
    assert!(app.notifier.recipients("approval").contains(&manager.id));

    app.state.workflows.submit_for_approval(wf.id, manager.id, None).await?;
    app.settle().await;
    assert_eq!(app.notifier.recipients("completion"), [maker.id]);
    Ok(())
}

#[tokio::test]
async fn queue_leaves_out_workflows_the_checker_already_signed() -> Result<()> {
    let app = TestApp::new().await?;
    let maker = app.user("maker", &["LoanOfficer"]).await?;
    let dual = app.user("dual", &["LoanOfficer", "BranchManager"]).await?;
    let manager = app.user("manager", &["BranchManager"]).await?;
    let engine = &app.state.workflows;

    let wf = engine
        .initiate_maker_action(maker_action(maker.id, "loan_approval", 75_000))
        .await?;
    let ids: Vec<_> = engine.get_approval_queue(dual.id).await?.iter().map(|p| p.workflow_id).collect();
    assert_eq!(ids, [wf.id]);

    assert!(engine.submit_for_approval(wf.id, dual.id, None).await?.is_success);

    // level 2 wants a BranchManager, but dual already signed level 1
    assert!(!engine.can_user_approve_workflow(dual.id, wf.id).await?);
    assert!(engine.get_approval_queue(dual.id).await?.is_empty());

    assert!(engine.can_user_approve_workflow(manager.id, wf.id).await?);
    let queue = engine.get_approval_queue(manager.id).await?;
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].level, 2);

    // the role view is not filtered by signer
    assert_eq!(engine.get_approval_queue_by_role("BranchManager").await?.len(), 1);
    Ok(())
}
