mod common;

use anyhow::Result;

use common::{maker_action, TestApp};
use dual_control::models::workflow::{StepStatus, WorkflowStatus};

#[tokio::test]
async fn racing_checkers_decide_a_step_exactly_once() -> Result<()> {
    let app = TestApp::new().await?;
    let maker = app.user("maker", &["LoanOfficer"]).await?;
    let a = app.user("officer_a", &["LoanOfficer"]).await?;
    let b = app.user("officer_b", &["LoanOfficer"]).await?;

    let wf = app
        .state
        .workflows
        .initiate_maker_action(maker_action(maker.id, "loan_approval", 75_000))
        .await?;

    let wf_id = wf.id;
    let handles: Vec<_> = [a.id, b.id]
        .into_iter()
        .map(|checker| {
            let engine = app.state.workflows.clone();
            tokio::spawn(async move { engine.submit_for_approval(wf_id, checker, None).await })
        })
        .collect();

    let mut successes = 0;
    for handle in handles {
        let result = handle.await??;
        if result.is_success {
            successes += 1;
        } else {
            assert_eq!(result.error_code.as_deref(), Some("conflict"), "{result:?}");
        }
    }
    assert_eq!(successes, 1);

    // the second level must not have been consumed by the loser's retry
    let steps = app.state.workflows.get_workflow_steps(wf.id).await?;
    assert_eq!(steps[0].status, StepStatus::Approved);
    assert_eq!(steps[1].status, StepStatus::Pending);
    let current = app.state.workflows.get_workflow_instance(wf.id).await?.unwrap();
    assert_eq!(current.status, WorkflowStatus::Pending);
    assert_eq!(current.version, 1);
    Ok(())
}

#[tokio::test]
async fn cancel_racing_final_approval_has_one_winner() -> Result<()> {
    let app = TestApp::new().await?;
    let maker = app.user("maker", &["LoanOfficer"]).await?;
    let officer = app.user("officer", &["LoanOfficer"]).await?;

    let wf = app
        .state
        .workflows
        .initiate_maker_action(maker_action(maker.id, "loan_approval", 1_000))
        .await?;

    let (wf_id, officer_id, maker_id) = (wf.id, officer.id, maker.id);
    let approve = {
        let engine = app.state.workflows.clone();
        tokio::spawn(async move { engine.submit_for_approval(wf_id, officer_id, None).await })
    };
    let cancel = {
        let engine = app.state.workflows.clone();
        tokio::spawn(async move { engine.cancel_workflow(wf_id, maker_id, "Customer withdrew").await })
    };

    let approved = approve.await??.is_success;
    let cancelled = cancel.await??;
    assert!(approved ^ cancelled, "approved={approved} cancelled={cancelled}");

    let final_state = app.state.workflows.get_workflow_instance(wf.id).await?.unwrap();
    let expected = if approved {
        WorkflowStatus::Approved
    } else {
        WorkflowStatus::Cancelled
    };
    assert_eq!(final_state.status, expected);
    Ok(())
}

#[tokio::test]
async fn parallel_escalations_escalate_once() -> Result<()> {
    let app = TestApp::new().await?;
    let maker = app.user("maker", &["LoanOfficer"]).await?;

    let wf = app
        .state
        .workflows
        .initiate_maker_action(maker_action(maker.id, "loan_approval", 75_000))
        .await?;

    let wf_id = wf.id;
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let engine = app.state.workflows.clone();
            tokio::spawn(async move { engine.escalate_approval(wf_id, "stuck with the branch").await })
        })
        .collect();

    let mut successes = 0;
    for handle in handles {
        if handle.await??.is_success {
            successes += 1;
        }
    }
    assert_eq!(successes, 1);

    let steps = app.state.workflows.get_workflow_steps(wf.id).await?;
    assert_eq!(steps.len(), 3);
    assert_eq!(steps.iter().filter(|s| s.is_escalated).count(), 1);
    Ok(())
}
