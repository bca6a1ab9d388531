//! Audit trail: domain events on an in-process bus, persisted by a background
//! listener into a SHA-256 hash-chained `audit_log` table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::db::ts;
use crate::errors::AppResult;

pub mod loggable;
pub use loggable::{Loggable, Severity};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: Uuid,
    pub name: String,
    pub occurred_at: DateTime<Utc>,
    pub actor_id: Option<Uuid>,
    pub subject_id: Option<Uuid>,
    pub severity: Severity,
    pub payload: Value,
}

impl DomainEvent {
    pub fn new(name: impl Into<String>, actor_id: Option<Uuid>, subject_id: Option<Uuid>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            occurred_at: Utc::now(),
            actor_id,
            subject_id,
            severity: Severity::Important,
            payload,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

pub type EventBus = broadcast::Sender<DomainEvent>;

pub fn init_event_bus() -> (EventBus, broadcast::Receiver<DomainEvent>) {
    broadcast::channel(1024)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityPayload {
    #[serde(rename = "new")]
    pub current: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

pub fn log_activity<T: Loggable>(event_bus: &EventBus, action: &str, actor_id: Option<Uuid>, entity: &T) {
    log_activity_with_details(event_bus, action, actor_id, entity, None);
}

/// Publishes `<entity_type>.<action>`. Fire and forget: a bus with no
/// listener must not fail the operation being audited.
pub fn log_activity_with_details<T: Loggable>(
    event_bus: &EventBus,
    action: &str,
    actor_id: Option<Uuid>,
    entity: &T,
    details: Option<Value>,
) {
    let payload = ActivityPayload {
        current: serde_json::to_value(entity).unwrap_or_default(),
        old: None,
        details,
    };

    let event = DomainEvent::new(
        format!("{}.{}", T::entity_type(), action),
        actor_id,
        Some(entity.subject_id()),
        serde_json::to_value(&payload).unwrap_or_default(),
    )
    .with_severity(entity.severity_for_action(action));

    let _ = event_bus.send(event);
}

fn chain_hash(prev_hash: Option<&str>, payload: &str) -> String {
    let mut hasher = Sha256::new();
    if let Some(prev) = prev_hash {
        hasher.update(prev.as_bytes());
    }
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

/// Appends one event to the hash chain.
pub async fn append_audit_entry(pool: &SqlitePool, event: &DomainEvent) -> AppResult<String> {
    let payload = serde_json::to_string(event).unwrap_or_default();

    let mut tx = pool.begin().await?;
    let prev_hash: Option<String> = sqlx::query_scalar("SELECT hash FROM audit_log ORDER BY seq DESC LIMIT 1")
        .fetch_optional(&mut *tx)
        .await?;

    let hash = chain_hash(prev_hash.as_deref(), &payload);

    sqlx::query(
        r#"
        INSERT INTO audit_log (id, event_name, occurred_at, actor_id, subject_id, severity, payload, prev_hash, hash)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(event.id.to_string())
    .bind(&event.name)
    .bind(ts(event.occurred_at))
    .bind(event.actor_id.map(|u| u.to_string()))
    .bind(event.subject_id.map(|u| u.to_string()))
    .bind(event.severity.as_str())
    .bind(&payload)
    .bind(&prev_hash)
    .bind(&hash)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(hash)
}

pub async fn start_audit_listener(mut rx: broadcast::Receiver<DomainEvent>, pool: SqlitePool) {
    tracing::info!("audit listener started");
    loop {
        match rx.recv().await {
            Ok(event) => {
                if let Err(e) = append_audit_entry(&pool, &event).await {
                    tracing::error!(event = %event.name, error = %e, "failed to persist audit entry");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "audit listener lagged behind the event bus");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Recomputes the chain. Returns the sequence number of the first broken
/// link, or `None` when the trail is intact.
pub async fn verify_audit_chain(pool: &SqlitePool) -> AppResult<Option<i64>> {
    let rows = sqlx::query("SELECT seq, payload, prev_hash, hash FROM audit_log ORDER BY seq ASC")
        .fetch_all(pool)
        .await?;

    let mut expected_prev: Option<String> = None;
    for row in rows {
        let seq: i64 = row.try_get("seq")?;
        let payload: String = row.try_get("payload")?;
        let prev_hash: Option<String> = row.try_get("prev_hash")?;
        let hash: String = row.try_get("hash")?;

        if prev_hash != expected_prev || chain_hash(prev_hash.as_deref(), &payload) != hash {
            return Ok(Some(seq));
        }
        expected_prev = Some(hash);
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_hash_depends_on_predecessor() {
        let first = chain_hash(None, "payload");
        let second = chain_hash(Some(&first), "payload");
        assert_ne!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn publishing_without_listener_does_not_panic() {
        let (bus, rx) = init_event_bus();
        drop(rx);
        let event = DomainEvent::new("workflow.created", None, None, Value::Null);
        assert!(bus.send(event).is_err());
    }
}
