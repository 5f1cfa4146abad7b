// src/db/connection.rs

use anyhow::{Context, Result};
use log::info;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::PathBuf;

pub type SqlitePool = Pool<SqliteConnectionManager>;

/// Establishes a connection pool for the database file at `path`, creating
/// parent directories and the schema as needed.
pub fn establish_pool_with_path(path: PathBuf) -> Result<SqlitePool> {
	info!("SQLite database will be located at: {:?}", path);

	if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
		std::fs::create_dir_all(parent).context("Failed to create database directory")?;
	}

	// Concurrent resolutions write to the cache from several blocking tasks.
	let manager = SqliteConnectionManager::file(path).with_init(|conn| {
		conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
	});

	let pool = Pool::builder()
		.max_size(15)
		.build(manager)
		.context("Failed to create SQLite connection pool")?;

	let conn = pool.get().context("Failed to get database connection")?;
	super::schema::create_tables(&conn)?;

	info!("SQLite connection pool established successfully");
	Ok(pool)
}
