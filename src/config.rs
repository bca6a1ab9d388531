use std::path::PathBuf;
use std::time::Duration;

use crate::errors::AppError;
use crate::jwt::JwtConfig;

pub const DEFAULT_LOCKOUT_THRESHOLD: i64 = 5;

/// Runtime settings read from the environment (after `.env` has been loaded).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub jwt: JwtConfig,
    pub lockout_threshold: i64,
    /// `None` disables the background escalation sweep.
    pub sweep_interval: Option<Duration>,
    pub request_timeout: Duration,
    pub matrix_path: Option<PathBuf>,
    pub port: u16,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let jwt = JwtConfig::from_env()?;
        let lockout_threshold = parse_var("LOCKOUT_THRESHOLD", DEFAULT_LOCKOUT_THRESHOLD)?;
        if lockout_threshold < 1 {
            return Err(AppError::configuration("LOCKOUT_THRESHOLD must be at least 1"));
        }

        let sweep_secs: u64 = parse_var("ESCALATION_SWEEP_SECS", 300)?;
        let request_secs: u64 = parse_var("REQUEST_TIMEOUT_SECS", 30)?;
        let port: u16 = parse_var("APP_PORT", 8000)?;

        let matrix_path = std::env::var("APPROVAL_MATRIX_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            jwt,
            lockout_threshold,
            sweep_interval: (sweep_secs > 0).then(|| Duration::from_secs(sweep_secs)),
            request_timeout: Duration::from_secs(request_secs.max(1)),
            matrix_path,
            port,
        })
    }

    /// Settings for tests and embedding: no sweep, default thresholds.
    pub fn with_jwt(jwt: JwtConfig) -> Self {
        Self {
            jwt,
            lockout_threshold: DEFAULT_LOCKOUT_THRESHOLD,
            sweep_interval: None,
            request_timeout: Duration::from_secs(30),
            matrix_path: None,
            port: 8000,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, AppError> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::configuration(format!("{name} must be a valid number"))),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_var_falls_back_to_default() {
        let value: u64 = parse_var("DUAL_CONTROL_TEST_UNSET_VAR", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn parse_var_rejects_garbage() {
        std::env::set_var("DUAL_CONTROL_TEST_GARBAGE", "not-a-number");
        let result: Result<u64, _> = parse_var("DUAL_CONTROL_TEST_GARBAGE", 1);
        assert!(matches!(result, Err(AppError::Configuration(_))));
    }
}
