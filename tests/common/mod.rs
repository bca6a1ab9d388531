#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::SqlitePool;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tower::util::ServiceExt; // for `oneshot`
use uuid::Uuid;

use dual_control::config::AppConfig;
use dual_control::errors::AppResult;
use dual_control::events::{init_event_bus, start_audit_listener};
use dual_control::jwt::JwtConfig;
use dual_control::matrix::default_matrix;
use dual_control::models::user::{ProvisionUserRequest, User};
use dual_control::models::workflow::{MakerAction, Priority};
use dual_control::notify::NotificationDispatcher;
use dual_control::{create_router, AppState};

pub const PASSWORD: &str = "S3cureP@ssw0rd";
pub const JWT_SECRET: &str = "test-secret";

/// Notifications captured as `(kind, user_id, title)`.
#[derive(Default)]
pub struct RecordingDispatcher {
    pub sent: Mutex<Vec<(&'static str, Uuid, String)>>,
}

impl RecordingDispatcher {
    pub fn recipients(&self, kind: &str) -> Vec<Uuid> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, id, _)| *id)
            .collect()
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingDispatcher {
    async fn send_approval_notification(&self, user_id: Uuid, title: &str, _message: &str) -> AppResult<bool> {
        self.sent.lock().unwrap().push(("approval", user_id, title.to_string()));
        Ok(true)
    }

    async fn send_escalation_notification(&self, user_id: Uuid, title: &str, _message: &str) -> AppResult<()> {
        self.sent.lock().unwrap().push(("escalation", user_id, title.to_string()));
        Ok(())
    }

    async fn send_completion_notification(&self, user_id: Uuid, title: &str, _message: &str) -> AppResult<()> {
        self.sent.lock().unwrap().push(("completion", user_id, title.to_string()));
        Ok(())
    }
}

pub struct TestApp {
    pub dir: TempDir,
    pub pool: SqlitePool,
    pub state: AppState,
    pub notifier: Arc<RecordingDispatcher>,
    pub audit: JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Result<Self> {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(tweak: impl FnOnce(&mut AppConfig)) -> Result<Self> {
        let dir = tempfile::tempdir().context("failed to create tempdir")?;
        let db_path = dir.path().join("test.db");

        let opts = SqliteConnectOptions::new()
            .filename(db_path.as_path())
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(10));
        let pool = SqlitePool::connect_with(opts).await?;

        let migrator =
            sqlx::migrate::Migrator::new(std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations")).await?;
        migrator.run(&pool).await?;

        let mut config = AppConfig::with_jwt(JwtConfig::new(JWT_SECRET, 1));
        tweak(&mut config);

        let (event_bus, rx) = init_event_bus();
        let audit = tokio::spawn(start_audit_listener(rx, pool.clone()));
        let notifier = Arc::new(RecordingDispatcher::default());
        let state = AppState::new(pool.clone(), config, default_matrix(), event_bus, notifier.clone());

        Ok(Self {
            dir,
            pool,
            state,
            notifier,
            audit,
        })
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    /// Provisions an active user holding the named seeded roles.
    pub async fn user(&self, username: &str, roles: &[&str]) -> Result<User> {
        let user = self
            .state
            .auth
            .provision_user(ProvisionUserRequest {
                username: username.to_string(),
                full_name: format!("{username} Test"),
                email: format!("{username}@bank.example"),
                password: PASSWORD.to_string(),
            })
            .await?;

        for role in roles {
            let role = self
                .state
                .rbac
                .get_role_by_name(role)
                .await?
                .with_context(|| format!("seeded role {role} missing"))?;
            self.state.rbac.assign_role_to_user(user.id, role.id, user.id).await?;
        }
        Ok(user)
    }

    pub fn token(&self, user: &User) -> Result<String> {
        Ok(self.state.config.jwt.encode(user.id, &user.username)?.0)
    }

    /// Lets detached tasks (audit writes, notifications) run.
    pub async fn settle(&self) {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}

pub fn maker_action(maker_id: Uuid, action_type: &str, amount: i64) -> MakerAction {
    MakerAction {
        action_type: action_type.to_string(),
        resource_id: Uuid::new_v4(),
        resource_type: "Loan".to_string(),
        data: serde_json::json!({ "customer": "C-1001" }),
        maker_id,
        business_justification: "Customer requested a top-up".to_string(),
        amount: Decimal::from(amount),
        priority: Priority::Normal,
        requested_completion_date: None,
    }
}

pub async fn send(app: &Router, req: Request<Body>) -> Result<(StatusCode, Value)> {
    let resp = app.clone().oneshot(req).await?;
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), 10_485_760).await?;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).with_context(|| format!("non-JSON body: {}", String::from_utf8_lossy(&bytes)))?
    };
    Ok((status, value))
}

pub fn json_request(method: &str, uri: &str, token: Option<&str>, body: Value) -> Result<Request<Body>> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    Ok(builder.body(Body::from(body.to_string()))?)
}

pub fn get_request(uri: &str, token: Option<&str>) -> Result<Request<Body>> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    Ok(builder.body(Body::empty())?)
}
