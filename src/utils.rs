use std::future::Future;
use std::time::Duration;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Utc};
use rand_core::OsRng;
use uuid::Uuid;

use crate::errors::AppError;

const MIN_PASSWORD_LENGTH: usize = 8;

pub fn hash_password(password: &str) -> Result<String, AppError> {
    if password.len() < MIN_PASSWORD_LENGTH {
        return Err(AppError::validation(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LENGTH
        )));
    }

    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| AppError::internal(format!("failed to hash password: {err}")))
}

pub fn verify_password(password: &str, password_hash: &str) -> Result<bool, AppError> {
    let parsed_hash = PasswordHash::new(password_hash)
        .map_err(|err| AppError::internal(format!("invalid password hash: {err}")))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

/// `WF-20261016-1A2B3C4D5E6F`: date of initiation plus the first 48 random
/// bits of the workflow id.
pub fn workflow_code(id: Uuid, at: DateTime<Utc>) -> String {
    let simple = id.simple().to_string();
    format!("WF-{}-{}", at.format("%Y%m%d"), simple[..12].to_uppercase())
}

/// Runs `fut` under a caller-supplied deadline. Dropping an in-flight sqlx
/// transaction rolls it back, so an elapsed deadline leaves no partial write.
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| AppError::internal(format!("deadline of {}ms elapsed", deadline.as_millis())))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn short_password_is_rejected_before_hashing() {
        assert!(matches!(hash_password("short"), Err(AppError::Validation(_))));
    }

    #[test]
    fn hashed_password_verifies() {
        let hash = hash_password("S3cureP@ss").unwrap();
        assert!(verify_password("S3cureP@ss", &hash).unwrap());
        assert!(!verify_password("wrong-pass", &hash).unwrap());
    }

    #[test]
    fn workflow_code_uses_date_and_id_prefix() {
        let id = Uuid::parse_str("1a2b3c4d-5e6f-4000-8000-000000000000").unwrap();
        let at = Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap();
        assert_eq!(workflow_code(id, at), "WF-20261016-1A2B3C4D5E6F");

        // same 32-bit head, different code
        let sibling = Uuid::parse_str("1a2b3c4d-ffff-4000-8000-000000000000").unwrap();
        assert_ne!(workflow_code(sibling, at), workflow_code(id, at));
    }

    #[tokio::test]
    async fn elapsed_deadline_is_an_error() {
        let result: Result<(), AppError> = with_deadline(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;
        assert!(result.is_err());
    }
}
