mod common;

use std::time::Duration;

use anyhow::Result;
use sqlx::SqlitePool;

use common::{maker_action, TestApp};
use dual_control::events::verify_audit_chain;

async fn event_names(pool: &SqlitePool) -> Result<Vec<String>> {
    Ok(sqlx::query_scalar("SELECT event_name FROM audit_log ORDER BY seq ASC")
        .fetch_all(pool)
        .await?)
}

/// Polls until the listener has persisted at least `count` entries.
async fn wait_for_entries(pool: &SqlitePool, count: usize) -> Result<Vec<String>> {
    for _ in 0..100 {
        let names = event_names(pool).await?;
        if names.len() >= count {
            return Ok(names);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    event_names(pool).await
}

#[tokio::test]
async fn workflow_decisions_land_in_a_verifiable_chain() -> Result<()> {
    let app = TestApp::new().await?;
    let maker = app.user("maker", &["LoanOfficer"]).await?;
    let officer = app.user("officer", &["LoanOfficer"]).await?;

    let wf = app
        .state
        .workflows
        .initiate_maker_action(maker_action(maker.id, "loan_approval", 1_000))
        .await?;
    assert!(app.state.workflows.submit_for_approval(wf.id, officer.id, None).await?.is_success);

    // 2 users created + 2 role assignments + created + step_approved + approved
    let names = wait_for_entries(&app.pool, 7).await?;
    assert!(names.contains(&"workflow.created".to_string()), "{names:?}");
    assert!(names.contains(&"workflow.step_approved".to_string()), "{names:?}");
    assert!(names.contains(&"workflow.approved".to_string()), "{names:?}");
    assert!(names.contains(&"user_role.assigned".to_string()), "{names:?}");

    let subject: Option<String> =
        sqlx::query_scalar("SELECT subject_id FROM audit_log WHERE event_name = 'workflow.approved'")
            .fetch_one(&app.pool)
            .await?;
    assert_eq!(subject, Some(wf.id.to_string()));

    assert_eq!(verify_audit_chain(&app.pool).await?, None);
    Ok(())
}

#[tokio::test]
async fn tampering_breaks_the_chain() -> Result<()> {
    let app = TestApp::new().await?;
    let user = app.user("teller", &[]).await?;
    app.state.auth.authenticate("teller", "wrong-password").await?;
    app.state.auth.deactivate_user(user.id, None).await?;

    let names = wait_for_entries(&app.pool, 3).await?;
    assert_eq!(names, ["user.created", "user.login_failed", "user.deactivated"]);
    assert_eq!(verify_audit_chain(&app.pool).await?, None);

    let second: i64 = sqlx::query_scalar("SELECT seq FROM audit_log ORDER BY seq ASC LIMIT 1 OFFSET 1")
        .fetch_one(&app.pool)
        .await?;
    sqlx::query("UPDATE audit_log SET payload = '{}' WHERE seq = ?")
        .bind(second)
        .execute(&app.pool)
        .await?;

    assert_eq!(verify_audit_chain(&app.pool).await?, Some(second));
    Ok(())
}

#[tokio::test]
async fn lockout_is_audited_as_critical() -> Result<()> {
    let app = TestApp::with_config(|c| c.lockout_threshold = 2).await?;
    app.user("teller", &[]).await?;

    for _ in 0..2 {
        app.state.auth.authenticate("teller", "wrong-password").await?;
    }

    let names = wait_for_entries(&app.pool, 3).await?;
    assert_eq!(names.last().map(String::as_str), Some("user.locked"));

    let severity: String = sqlx::query_scalar("SELECT severity FROM audit_log WHERE event_name = 'user.locked'")
        .fetch_one(&app.pool)
        .await?;
    assert_eq!(severity, "critical");
    Ok(())
}
