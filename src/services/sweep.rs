//! Periodic escalation of workflows that missed their approval deadline.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::errors::AppResult;
use crate::models::workflow::EscalationResult;
use crate::services::workflow::WorkflowEngine;
use crate::utils::{utc_now, with_deadline};

/// Upper bound for one pass; an abandoned pass rolls back its open transaction.
const PASS_DEADLINE: Duration = Duration::from_secs(60);

pub struct EscalationSweeper {
    engine: WorkflowEngine,
    interval: Duration,
}

impl EscalationSweeper {
    pub fn new(engine: WorkflowEngine, interval: Duration) -> Self {
        Self { engine, interval }
    }

    /// One pass. Idempotent: escalation is conditional on the workflow still
    /// being pending, so overlapping passes cannot double-escalate.
    pub async fn run_once(&self) -> AppResult<EscalationResult> {
        self.engine.auto_escalate_expired_workflows(utc_now()).await
    }

    /// Ticks until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_secs = self.interval.as_secs(), "escalation sweep started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match with_deadline(PASS_DEADLINE, self.run_once()).await {
                        Ok(result) if !result.escalated_workflow_ids.is_empty() => {
                            tracing::info!(count = result.escalated_workflow_ids.len(), "overdue workflows escalated");
                        }
                        Ok(_) => tracing::debug!("escalation sweep found nothing due"),
                        Err(e) => tracing::error!(error = %e, "escalation sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("escalation sweep stopped");
    }

    pub fn spawn(self) -> (JoinHandle<()>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (tokio::spawn(self.run(rx)), tx)
    }
}
