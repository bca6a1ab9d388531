mod common;

use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::Duration;

use common::{maker_action, TestApp};
use dual_control::models::workflow::{Priority, WorkflowStatus};
use dual_control::services::workflow::AUTO_ESCALATION_REASON;
use dual_control::services::EscalationSweeper;
use dual_control::utils::utc_now;

#[tokio::test]
async fn sweep_escalates_only_overdue_pending_workflows() -> Result<()> {
    let app = TestApp::new().await?;
    let maker = app.user("maker", &["LoanOfficer"]).await?;
    let regional = app.user("regional", &["RegionalManager"]).await?;
    let engine = &app.state.workflows;

    let mut overdue = maker_action(maker.id, "loan_approval", 75_000);
    overdue.requested_completion_date = Some(utc_now() - Duration::days(4));
    let overdue = engine.initiate_maker_action(overdue).await?;
    assert!(overdue.is_overdue(utc_now()));

    let fresh = engine
        .initiate_maker_action(maker_action(maker.id, "loan_approval", 75_000))
        .await?;

    let sweeper = EscalationSweeper::new(engine.clone(), StdDuration::from_secs(60));
    let result = sweeper.run_once().await?;
    assert!(result.is_success);
    assert_eq!(result.escalated_workflow_ids, [overdue.id]);

    let escalated = engine.get_workflow_instance(overdue.id).await?.unwrap();
    assert_eq!(escalated.status, WorkflowStatus::Escalated);
    assert_eq!(escalated.escalation_reason.as_deref(), Some(AUTO_ESCALATION_REASON));
    assert!(escalated.escalated_at.is_some());

    let steps = engine.get_workflow_steps(overdue.id).await?;
    let added = steps.last().unwrap();
    assert_eq!(added.approver_role, "RegionalManager");
    assert!(added.is_escalated);
    assert_eq!(added.level, 3);

    let untouched = engine.get_workflow_instance(fresh.id).await?.unwrap();
    assert_eq!(untouched.status, WorkflowStatus::Pending);

    // a second pass finds nothing: escalated workflows are no longer pending
    let again = sweeper.run_once().await?;
    assert!(again.escalated_workflow_ids.is_empty());

    app.settle().await;
    assert!(app.notifier.recipients("escalation").contains(&regional.id));
    Ok(())
}

#[tokio::test]
async fn escalated_workflow_can_still_be_completed() -> Result<()> {
    let app = TestApp::new().await?;
    let maker = app.user("maker", &["LoanOfficer"]).await?;
    let officer = app.user("officer", &["LoanOfficer"]).await?;
    let manager = app.user("manager", &["BranchManager"]).await?;
    let regional = app.user("regional", &["RegionalManager"]).await?;
    let engine = &app.state.workflows;

    let wf = engine
        .initiate_maker_action(maker_action(maker.id, "loan_approval", 75_000))
        .await?;
    let escalation = engine.escalate_approval(wf.id, "customer complaint").await?;
    assert!(escalation.is_success);
    assert_eq!(escalation.new_approver_role.as_deref(), Some("RegionalManager"));

    for checker in [officer.id, manager.id] {
        let step = engine.submit_for_approval(wf.id, checker, None).await?;
        assert!(step.is_success, "{step:?}");
        assert_eq!(step.workflow_instance.unwrap().status, WorkflowStatus::Escalated);
    }

    let last = engine.submit_for_approval(wf.id, regional.id, None).await?;
    assert!(last.is_success, "{last:?}");
    assert_eq!(last.workflow_instance.unwrap().status, WorkflowStatus::Approved);

    let closed = engine.escalate_approval(wf.id, "too late").await?;
    assert!(!closed.is_success);
    Ok(())
}

#[tokio::test]
async fn escalation_requires_a_reason() -> Result<()> {
    let app = TestApp::new().await?;
    let maker = app.user("maker", &["BackOfficeOfficer"]).await?;

    let wf = app
        .state
        .workflows
        .initiate_maker_action(maker_action(maker.id, "account_creation", 500))
        .await?;
    let result = app.state.workflows.escalate_approval(wf.id, "  ").await?;
    assert!(!result.is_success);

    let wf = app.state.workflows.get_workflow_instance(wf.id).await?.unwrap();
    assert_eq!(wf.status, WorkflowStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn background_sweep_runs_until_shutdown() -> Result<()> {
    let app = TestApp::new().await?;
    let maker = app.user("maker", &["BancassuranceOfficer"]).await?;

    let mut action = maker_action(maker.id, "policy_creation", 100);
    action.priority = Priority::Critical;
    action.requested_completion_date = Some(utc_now() - Duration::hours(5));
    let wf = app.state.workflows.initiate_maker_action(action).await?;

    let (handle, stop) = EscalationSweeper::new(app.state.workflows.clone(), StdDuration::from_millis(20)).spawn();

    let mut status = WorkflowStatus::Pending;
    for _ in 0..50 {
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        status = app.state.workflows.get_workflow_instance(wf.id).await?.unwrap().status;
        if status == WorkflowStatus::Escalated {
            break;
        }
    }
    assert_eq!(status, WorkflowStatus::Escalated);

    stop.send(true)?;
    tokio::time::timeout(StdDuration::from_secs(5), handle).await??;
    Ok(())
}
