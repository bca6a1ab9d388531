use std::sync::Arc;

use axum::http::Method;
use axum::routing::get;
use axum::Router;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::errors::AppError;
use crate::events::{init_event_bus, start_audit_listener, EventBus};
use crate::matrix::{default_matrix, ApprovalMatrix, MatrixHandle};
use crate::notify::{NotificationDispatcher, TracingDispatcher};
use crate::routes::{auth, health, rbac, workflows};
use crate::services::{Authenticator, AuthorizationService, WorkflowEngine};

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub config: Arc<AppConfig>,
    pub matrix: MatrixHandle,
    pub event_bus: EventBus,
    pub auth: Authenticator,
    pub rbac: AuthorizationService,
    pub workflows: WorkflowEngine,
}

impl AppState {
    pub fn new(
        pool: SqlitePool,
        config: AppConfig,
        matrix: ApprovalMatrix,
        event_bus: EventBus,
        notifier: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        let matrix = MatrixHandle::new(matrix);
        let auth = Authenticator::new(
            pool.clone(),
            config.jwt.clone(),
            config.lockout_threshold,
            event_bus.clone(),
        );
        let rbac = AuthorizationService::new(pool.clone(), event_bus.clone());
        let workflows = WorkflowEngine::new(
            pool.clone(),
            matrix.clone(),
            rbac.clone(),
            notifier,
            event_bus.clone(),
        );

        Self {
            pool,
            config: Arc::new(config),
            matrix,
            event_bus,
            auth,
            rbac,
            workflows,
        }
    }

    /// Loads the configured matrix and starts the audit listener.
    pub fn bootstrap(pool: SqlitePool, config: AppConfig) -> Result<Self, AppError> {
        Self::bootstrap_with_listener(pool, config).map(|(state, _)| state)
    }

    /// As [`Self::bootstrap`], also handing back the audit listener. The
    /// listener drains and exits once every clone of the state is dropped.
    pub fn bootstrap_with_listener(pool: SqlitePool, config: AppConfig) -> Result<(Self, JoinHandle<()>), AppError> {
        let matrix = match &config.matrix_path {
            Some(path) => ApprovalMatrix::load(path)?,
            None => default_matrix(),
        };
        tracing::info!(version = matrix.version, rules = matrix.rules.len(), "approval matrix loaded");

        let (event_bus, rx) = init_event_bus();
        let listener = tokio::spawn(start_audit_listener(rx, pool.clone()));

        let state = Self::new(pool, config, matrix, event_bus, Arc::new(TracingDispatcher));
        Ok((state, listener))
    }
}

pub async fn create_app(pool: SqlitePool) -> Result<Router, AppError> {
    let config = AppConfig::from_env()?;
    let state = AppState::bootstrap(pool, config)?;
    Ok(create_router(state))
}

pub fn create_router(state: AppState) -> Router {
    let timeout = state.config.request_timeout;

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health::health))
        .nest("/auth", auth::routes())
        .nest("/rbac", rbac::routes())
        .nest("/workflows", workflows::routes())
        .with_state(state)
        .layer(TimeoutLayer::new(timeout))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
