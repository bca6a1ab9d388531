//! Best-effort notifications to makers and checkers.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::AppResult;

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send_approval_notification(&self, user_id: Uuid, title: &str, message: &str) -> AppResult<bool>;

    async fn send_escalation_notification(&self, user_id: Uuid, title: &str, message: &str) -> AppResult<()>;

    async fn send_completion_notification(&self, user_id: Uuid, title: &str, message: &str) -> AppResult<()>;
}

/// Writes notifications to the log. Used until a delivery channel is wired in.
#[derive(Debug, Clone, Default)]
pub struct TracingDispatcher;

#[async_trait]
impl NotificationDispatcher for TracingDispatcher {
    async fn send_approval_notification(&self, user_id: Uuid, title: &str, message: &str) -> AppResult<bool> {
        tracing::info!(user_id = %user_id, title, message, "approval notification");
        Ok(true)
    }

    async fn send_escalation_notification(&self, user_id: Uuid, title: &str, message: &str) -> AppResult<()> {
        tracing::info!(user_id = %user_id, title, message, "escalation notification");
        Ok(())
    }

    async fn send_completion_notification(&self, user_id: Uuid, title: &str, message: &str) -> AppResult<()> {
        tracing::info!(user_id = %user_id, title, message, "completion notification");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Approval,
    Escalation,
    Completion,
}

/// Sends on a detached task; the caller never waits and failures are only logged.
pub fn dispatch(
    dispatcher: &Arc<dyn NotificationDispatcher>,
    kind: NotificationKind,
    user_id: Uuid,
    title: impl Into<String>,
    message: impl Into<String>,
) {
    let dispatcher = Arc::clone(dispatcher);
    let title = title.into();
    let message = message.into();

    tokio::spawn(async move {
        let outcome = match kind {
            NotificationKind::Approval => dispatcher
                .send_approval_notification(user_id, &title, &message)
                .await
                .map(|_| ()),
            NotificationKind::Escalation => {
                dispatcher.send_escalation_notification(user_id, &title, &message).await
            }
            NotificationKind::Completion => {
                dispatcher.send_completion_notification(user_id, &title, &message).await
            }
        };

        if let Err(e) = outcome {
            tracing::warn!(user_id = %user_id, kind = ?kind, error = %e, "notification delivery failed");
        }
    });
}
