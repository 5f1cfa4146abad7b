// src/repositories/api_key_repo.rs

use crate::db::connection::SqlitePool;
use crate::models::api_key::{ApiKey, KeyStatus};
use anyhow::{anyhow, Context, Result};
use log::info;
use rusqlite::{params, ErrorCode};
use std::sync::Arc;
use tokio::task;

pub enum InsertOutcome {
	Inserted,
	DuplicateName,
}

/// Persistent storage for NVD API keys and their counters.
pub struct ApiKeyRepository {
	pool: Arc<SqlitePool>,
}

impl ApiKeyRepository {
	pub fn new(pool: Arc<SqlitePool>) -> Self {
		Self { pool }
	}

	pub async fn insert(&self, key: &ApiKey) -> Result<InsertOutcome> {
		let pool = self.pool.clone();
		let key = key.clone();

		task::spawn_blocking(move || -> Result<_> {
			let conn = pool.get().context("Failed to get database connection")?;
			let result = conn.execute(
				"INSERT INTO nvd_api_keys (key_name, key_value, status, error_count, total_requests)
				 VALUES (?1, ?2, ?3, ?4, ?5)",
				params![
					key.name,
					key.secret(),
					key.status.as_str(),
					key.error_count,
					key.total_requests as i64,
				],
			);

			match result {
				Ok(1) => {
					info!("Stored API key '{}'", key.name);
					Ok(InsertOutcome::Inserted)
				}
				Ok(_) => Err(anyhow!("Failed to insert API key: unexpected row count")),
				Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
					Ok(InsertOutcome::DuplicateName)
				}
				Err(e) => Err(e).context("Failed to insert API key"),
			}
		})
			.await
			.context("Failed to execute database operation")?
	}

	pub async fn list(&self) -> Result<Vec<ApiKey>> {
		let pool = self.pool.clone();

		task::spawn_blocking(move || -> Result<_> {
			let conn = pool.get().context("Failed to get database connection")?;
			let mut stmt = conn
				.prepare(
					"SELECT key_name, key_value, status, error_count, total_requests
					 FROM nvd_api_keys ORDER BY key_id",
				)
				.context("Failed to prepare statement")?;

			let keys = stmt
				.query_map([], |row| {
					let mut key = ApiKey::new(row.get(0)?, row.get(1)?);
					key.status = KeyStatus::from_db(&row.get::<_, String>(2)?);
					key.error_count = row.get(3)?;
					key.total_requests = row.get::<_, i64>(4)?.max(0) as u64;
					Ok(key)
				})?
				.collect::<rusqlite::Result<Vec<_>>>()
				.context("Failed to read API keys")?;
			Ok(keys)
		})
			.await
			.context("Failed to execute database operation")?
	}

	/// Returns whether a key with that name existed.
	pub async fn remove(&self, name: &str) -> Result<bool> {
		let pool = self.pool.clone();
		let name = name.to_string();

		task::spawn_blocking(move || -> Result<_> {
			let conn = pool.get().context("Failed to get database connection")?;
			let removed = conn
				.execute("DELETE FROM nvd_api_keys WHERE key_name = ?1", [&name])
				.context("Failed to delete API key")?;
			Ok(removed > 0)
		})
			.await
			.context("Failed to execute database operation")?
	}

	/// Writes status and counters back; the secret is never rewritten.
	pub async fn save_state(&self, keys: Vec<ApiKey>) -> Result<()> {
		if keys.is_empty() {
			return Ok(());
		}
		let pool = self.pool.clone();

		task::spawn_blocking(move || -> Result<_> {
			let mut conn = pool.get().context("Failed to get database connection")?;
			let tx = conn.transaction().context("Failed to start database transaction")?;
			{
				let mut stmt = tx
					.prepare(
						"UPDATE nvd_api_keys
						 SET status = ?1, error_count = ?2, total_requests = ?3
						 WHERE key_name = ?4",
					)
					.context("Failed to prepare statement")?;
				for key in &keys {
					stmt.execute(params![
						key.status.as_str(),
						key.error_count,
						key.total_requests as i64,
						key.name,
					])
					.with_context(|| format!("Failed to update API key '{}'", key.name))?;
				}
			}
			tx.commit().context("Failed to commit transaction")?;
			Ok(())
		})
			.await
			.context("Failed to execute database operation")?
	}
}
