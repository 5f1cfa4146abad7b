// src/db/schema.rs

use anyhow::{Context, Result};
use rusqlite::Connection;

pub fn create_tables(conn: &Connection) -> Result<()> {
	conn.execute_batch(
		"
		CREATE TABLE IF NOT EXISTS cve_cache (
			cve_id TEXT PRIMARY KEY NOT NULL,
			record_json TEXT NOT NULL,
			fetched_at_ms INTEGER NOT NULL
		);

		CREATE INDEX IF NOT EXISTS idx_cve_cache_fetched
		ON cve_cache(fetched_at_ms);

		CREATE TABLE IF NOT EXISTS nvd_api_keys (
			key_id INTEGER PRIMARY KEY AUTOINCREMENT,
			key_name TEXT UNIQUE NOT NULL,
			key_value TEXT NOT NULL,
			status TEXT NOT NULL DEFAULT 'unvalidated',
			error_count INTEGER NOT NULL DEFAULT 0,
			total_requests INTEGER NOT NULL DEFAULT 0
		);

		CREATE TABLE IF NOT EXISTS scans (
			scan_id INTEGER PRIMARY KEY AUTOINCREMENT,
			scan_name TEXT UNIQUE NOT NULL,
			source_path TEXT,
			cve_ids TEXT NOT NULL,
			total_occurrences INTEGER NOT NULL,
			cache_enabled INTEGER NOT NULL DEFAULT 1,
			imported_at TEXT NOT NULL
		);
		"
	).context("Failed to create tables")?;

	Ok(())
}
