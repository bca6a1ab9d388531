use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use crate::app::AppState;
use crate::errors::AppResult;
use crate::jwt::AuthUser;
use crate::models::user::{AuthResult, LoginRequest, SessionStatus, User};

#[derive(Debug, Serialize, ToSchema)]
pub struct MessageResponse {
    message: String,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/me", get(me))
        .route("/session", get(session))
}

#[utoipa::path(
    post,
    path = "/auth/login",
    tag = "Auth",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = AuthResult),
        (status = 401, description = "Invalid credentials or account locked", body = AuthResult)
    )
)]
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> AppResult<(StatusCode, Json<AuthResult>)> {
    let result = state.auth.authenticate(&payload.username, &payload.password).await?;
    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::UNAUTHORIZED
    };
    Ok((status, Json(result)))
}

#[utoipa::path(
    get,
    path = "/auth/me",
    tag = "Auth",
    responses((status = 200, description = "Current user", body = User)),
    security(("bearerAuth" = []))
)]
pub async fn me(State(state): State<AppState>, auth: AuthUser) -> AppResult<Json<User>> {
    Ok(Json(state.auth.get_user(auth.user_id).await?))
}

#[utoipa::path(
    get,
    path = "/auth/session",
    tag = "Auth",
    responses((status = 200, description = "Whether the caller's account is still active", body = SessionStatus)),
    security(("bearerAuth" = []))
)]
pub async fn session(State(state): State<AppState>, auth: AuthUser) -> AppResult<Json<SessionStatus>> {
    let active = state.auth.validate_session(auth.user_id).await?;
    Ok(Json(SessionStatus {
        user_id: auth.user_id,
        active,
    }))
}

#[utoipa::path(
    post,
    path = "/auth/logout",
    tag = "Auth",
    responses((status = 200, description = "Logout acknowledged", body = MessageResponse)),
    security(("bearerAuth" = []))
)]
pub async fn logout(State(state): State<AppState>, auth: AuthUser) -> AppResult<Json<MessageResponse>> {
    state.auth.logout(auth.user_id).await?;
    Ok(Json(MessageResponse {
        message: "Logged out".to_string(),
    }))
}
