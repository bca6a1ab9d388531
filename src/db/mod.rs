use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

pub mod row_parsers;

pub async fn init(database_url: &str) -> anyhow::Result<SqlitePool> {
	let options = SqliteConnectOptions::from_str(database_url)
		.context("invalid DATABASE_URL")?
		.create_if_missing(true)
		.journal_mode(SqliteJournalMode::Wal)
		.busy_timeout(Duration::from_secs(10));

	let pool = SqlitePoolOptions::new()
		.max_connections(10)
		.min_connections(1)
		.acquire_timeout(Duration::from_secs(10))
		.connect_with(options)
		.await
		.context("failed to connect to database")?;

	sqlx::migrate!()
		.run(&pool)
		.await
		.context("failed to run migrations")?;

	Ok(pool)
}

/// Canonical timestamp text. Fixed width so SQL string comparison orders correctly.
pub fn ts(at: DateTime<Utc>) -> String {
	at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::TimeZone;

	#[test]
	fn timestamps_sort_lexicographically() {
		let earlier = Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
		let later = earlier + chrono::Duration::milliseconds(1);
		assert!(ts(earlier) < ts(later));
		assert_eq!(ts(earlier), "2026-01-01T09:00:00.000000Z");
	}
}
