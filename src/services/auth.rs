//! Credential authentication with failed-attempt lockout.

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::row_parsers::db_user_from_row;
use crate::db::ts;
use crate::errors::{AppError, AppResult};
use crate::events::{log_activity, log_activity_with_details, EventBus};
use crate::jwt::JwtConfig;
use crate::models::user::{AuthResult, DbUser, ProvisionUserRequest, User};
use crate::utils::{hash_password, utc_now, verify_password};

pub const INVALID_CREDENTIALS: &str = "Invalid credentials";
pub const ACCOUNT_LOCKED: &str = "Account is locked due to multiple failed attempts";

const USER_COLUMNS: &str = "id, username, full_name, email, password_hash, is_active, failed_login_attempts, last_login_at, created_at, updated_at, version";

#[derive(Clone)]
pub struct Authenticator {
    pool: SqlitePool,
    jwt: JwtConfig,
    lockout_threshold: i64,
    event_bus: EventBus,
}

impl Authenticator {
    pub fn new(pool: SqlitePool, jwt: JwtConfig, lockout_threshold: i64, event_bus: EventBus) -> Self {
        Self {
            pool,
            jwt,
            lockout_threshold,
            event_bus,
        }
    }

    /// Unknown user, inactive user and wrong password all read the same from
    /// outside. Lockout is reported distinctly and wins over a correct password.
    pub async fn authenticate(&self, username: &str, password: &str) -> AppResult<AuthResult> {
        if username.trim().is_empty() || password.trim().is_empty() {
            return Ok(AuthResult::failure(INVALID_CREDENTIALS));
        }

        let Some(db_user) = self.find_by_username(username).await? else {
            tracing::debug!("login for unknown username");
            return Ok(AuthResult::failure(INVALID_CREDENTIALS));
        };

        if !db_user.is_active {
            tracing::debug!(user_id = %db_user.id, "login for inactive user");
            return Ok(AuthResult::failure(INVALID_CREDENTIALS));
        }

        if db_user.failed_login_attempts >= self.lockout_threshold {
            tracing::info!(user_id = %db_user.id, "login refused, account locked");
            return Ok(AuthResult::failure(ACCOUNT_LOCKED));
        }

        if !verify_password(password, &db_user.password_hash)? {
            self.record_failed_attempt(&db_user).await?;
            return Ok(AuthResult::failure(INVALID_CREDENTIALS));
        }

        let now = utc_now();
        // A concurrent failure may have locked the account since it was read.
        let reset = sqlx::query(
            r#"
            UPDATE users
            SET failed_login_attempts = 0, last_login_at = ?, updated_at = ?, version = version + 1
            WHERE id = ? AND failed_login_attempts < ?
            "#,
        )
        .bind(ts(now))
        .bind(ts(now))
        .bind(db_user.id.to_string())
        .bind(self.lockout_threshold)
        .execute(&self.pool)
        .await?;

        if reset.rows_affected() == 0 {
            return Ok(AuthResult::failure(ACCOUNT_LOCKED));
        }

        let user: User = self.fetch_user(db_user.id).await?.into();
        let (token, expires_at) = self.jwt.encode(user.id, &user.username)?;

        log_activity(&self.event_bus, "login", Some(user.id), &user);
        tracing::info!(user_id = %user.id, "user logged in");

        Ok(AuthResult::success(user, token, expires_at))
    }

    /// Single-statement increment so concurrent failures are all counted.
    async fn record_failed_attempt(&self, db_user: &DbUser) -> AppResult<()> {
        let attempts: i64 = sqlx::query_scalar(
            r#"
            UPDATE users
            SET failed_login_attempts = failed_login_attempts + 1, updated_at = ?, version = version + 1
            WHERE id = ?
            RETURNING failed_login_attempts
            "#,
        )
        .bind(ts(utc_now()))
        .bind(db_user.id.to_string())
        .fetch_one(&self.pool)
        .await?;

        let user: User = db_user.clone().into();
        let action = if attempts >= self.lockout_threshold { "locked" } else { "login_failed" };
        log_activity_with_details(
            &self.event_bus,
            action,
            None,
            &user,
            Some(serde_json::json!({ "failed_login_attempts": attempts })),
        );
        tracing::info!(user_id = %db_user.id, attempts, "failed login attempt");
        Ok(())
    }

    pub async fn validate_session(&self, user_id: Uuid) -> AppResult<bool> {
        let active: Option<bool> = sqlx::query_scalar("SELECT is_active FROM users WHERE id = ?")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(active.unwrap_or(false))
    }

    /// Sessions are stateless tokens; logout only leaves an audit entry.
    pub async fn logout(&self, user_id: Uuid) -> AppResult<()> {
        if let Some(db_user) = self.find_by_id(user_id).await? {
            let user: User = db_user.into();
            log_activity(&self.event_bus, "logout", Some(user_id), &user);
        }
        Ok(())
    }

    pub async fn provision_user(&self, req: ProvisionUserRequest) -> AppResult<User> {
        let username = req.username.trim();
        if username.is_empty() || req.full_name.trim().is_empty() || req.email.trim().is_empty() {
            return Err(AppError::validation("username, full name and email are required"));
        }
        if self.find_by_username(username).await?.is_some() {
            return Err(AppError::validation("Username already exists"));
        }

        let password_hash = hash_password(&req.password)?;
        let id = Uuid::new_v4();
        let now = ts(utc_now());

        sqlx::query(
            r#"
            INSERT INTO users (id, username, full_name, email, password_hash, is_active, failed_login_attempts, created_at, updated_at, version)
            VALUES (?, ?, ?, ?, ?, 1, 0, ?, ?, 0)
            "#,
        )
        .bind(id.to_string())
        .bind(username)
        .bind(req.full_name.trim())
        .bind(req.email.trim())
        .bind(password_hash)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::unique_violation(e, "Username already exists"))?;

        let user: User = self.fetch_user(id).await?.into();
        log_activity(&self.event_bus, "created", None, &user);
        Ok(user)
    }

    pub async fn deactivate_user(&self, user_id: Uuid, actor_id: Option<Uuid>) -> AppResult<User> {
        let result = sqlx::query(
            "UPDATE users SET is_active = 0, updated_at = ?, version = version + 1 WHERE id = ?",
        )
        .bind(ts(utc_now()))
        .bind(user_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found(format!("user {user_id}")));
        }

        let user: User = self.fetch_user(user_id).await?.into();
        log_activity(&self.event_bus, "deactivated", actor_id, &user);
        Ok(user)
    }

    pub async fn get_user(&self, user_id: Uuid) -> AppResult<User> {
        Ok(self.fetch_user(user_id).await?.into())
    }

    pub async fn get_user_by_username(&self, username: &str) -> AppResult<Option<User>> {
        Ok(self.find_by_username(username.trim()).await?.map(User::from))
    }

    async fn fetch_user(&self, user_id: Uuid) -> AppResult<DbUser> {
        self.find_by_id(user_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("user {user_id}")))
    }

    async fn find_by_id(&self, user_id: Uuid) -> AppResult<Option<DbUser>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(db_user_from_row).transpose()
    }

    /// Exact-case match; SQLite's default collation is binary.
    async fn find_by_username(&self, username: &str) -> AppResult<Option<DbUser>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?");
        let row = sqlx::query(&sql)
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(db_user_from_row).transpose()
    }
}
