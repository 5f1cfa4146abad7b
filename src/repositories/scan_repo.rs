// src/repositories/scan_repo.rs

use crate::db::connection::SqlitePool;
use crate::models::cve::CveId;
use crate::models::scan::ScanImport;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::info;
use rusqlite::{params, ErrorCode, OptionalExtension, Row};
use serde::Serialize;
use std::sync::Arc;
use tokio::task;

/// Listing row for a stored scan, without its identifier list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanListing {
	pub name: String,
	pub source_path: Option<String>,
	pub unique: usize,
	pub total_occurrences: usize,
	pub caching_enabled: bool,
	pub imported_at: DateTime<Utc>,
}

fn parse_imported_at(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
	DateTime::parse_from_rfc3339(raw)
		.map(|d| d.with_timezone(&Utc))
		.map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e)))
}

fn scan_from_row(row: &Row<'_>) -> rusqlite::Result<ScanImport> {
	let ids_json: String = row.get(2)?;
	let cve_ids: Vec<CveId> = serde_json::from_str(&ids_json)
		.map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e)))?;
	let imported_at: String = row.get(5)?;

	Ok(ScanImport {
		name: row.get(0)?,
		source_path: row.get(1)?,
		cve_ids,
		total_occurrences: row.get::<_, i64>(3)?.max(0) as usize,
		caching_enabled: row.get(4)?,
		imported_at: parse_imported_at(&imported_at)?,
	})
}

pub struct ScanRepository {
	pool: Arc<SqlitePool>,
}

impl ScanRepository {
	pub fn new(pool: Arc<SqlitePool>) -> Self {
		Self { pool }
	}

	/// Stores a new scan. Returns `false` when the name is already taken.
	pub async fn save(&self, scan: &ScanImport) -> Result<bool> {
		let pool = self.pool.clone();
		let scan = scan.clone();

		task::spawn_blocking(move || -> Result<_> {
			let conn = pool.get().context("Failed to get database connection")?;
			let ids_json = serde_json::to_string(&scan.cve_ids).context("Failed to serialize CVE ids")?;

			let result = conn.execute(
				"INSERT INTO scans (scan_name, source_path, cve_ids, total_occurrences, cache_enabled, imported_at)
				 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
				params![
					scan.name,
					scan.source_path,
					ids_json,
					scan.total_occurrences as i64,
					scan.caching_enabled,
					scan.imported_at.to_rfc3339(),
				],
			);

			match result {
				Ok(1) => {
					info!("Stored scan '{}' with {} unique CVEs", scan.name, scan.cve_ids.len());
					Ok(true)
				}
				Ok(_) => Err(anyhow!("Failed to insert scan: unexpected row count")),
				Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => Ok(false),
				Err(e) => Err(e).context("Failed to insert scan"),
			}
		})
			.await
			.context("Failed to execute database operation")?
	}

	pub async fn get_by_name(&self, name: &str) -> Result<Option<ScanImport>> {
		let pool = self.pool.clone();
		let name = name.to_string();

		task::spawn_blocking(move || -> Result<_> {
			let conn = pool.get().context("Failed to get database connection")?;
			conn.query_row(
				"SELECT scan_name, source_path, cve_ids, total_occurrences, cache_enabled, imported_at
				 FROM scans WHERE scan_name = ?1",
				[&name],
				scan_from_row,
			)
				.optional()
				.with_context(|| format!("Failed to load scan '{}'", name))
		})
			.await
			.context("Failed to execute database operation")?
	}

	pub async fn list(&self) -> Result<Vec<ScanListing>> {
		let pool = self.pool.clone();

		task::spawn_blocking(move || -> Result<_> {
			let conn = pool.get().context("Failed to get database connection")?;
			let mut stmt = conn
				.prepare(
					"SELECT scan_name, source_path, cve_ids, total_occurrences, cache_enabled, imported_at
					 FROM scans ORDER BY imported_at, scan_id",
				)
				.context("Failed to prepare statement")?;

			let scans = stmt
				.query_map([], scan_from_row)?
				.map(|scan| {
					scan.map(|s| ScanListing {
						unique: s.cve_ids.len(),
						name: s.name,
						source_path: s.source_path,
						total_occurrences: s.total_occurrences,
						caching_enabled: s.caching_enabled,
						imported_at: s.imported_at,
					})
				})
				.collect::<rusqlite::Result<Vec<_>>>()
				.context("Failed to read scans")?;
			Ok(scans)
		})
			.await
			.context("Failed to execute database operation")?
	}

	/// Returns whether a scan with that name existed.
	pub async fn set_caching(&self, name: &str, enabled: bool) -> Result<bool> {
		let pool = self.pool.clone();
		let name = name.to_string();

		task::spawn_blocking(move || -> Result<_> {
			let conn = pool.get().context("Failed to get database connection")?;
			let updated = conn
				.execute(
					"UPDATE scans SET cache_enabled = ?1 WHERE scan_name = ?2",
					params![enabled, name],
				)
				.context("Failed to update scan caching flag")?;
			Ok(updated > 0)
		})
			.await
			.context("Failed to execute database operation")?
	}

	pub async fn remove(&self, name: &str) -> Result<bool> {
		let pool = self.pool.clone();
		let name = name.to_string();

		task::spawn_blocking(move || -> Result<_> {
			let conn = pool.get().context("Failed to get database connection")?;
			let removed = conn
				.execute("DELETE FROM scans WHERE scan_name = ?1", [&name])
				.context("Failed to delete scan")?;
			Ok(removed > 0)
		})
			.await
			.context("Failed to execute database operation")?
	}
}
