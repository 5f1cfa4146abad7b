// src/repositories/cache_repo.rs

use crate::config::CacheConfig;
use crate::db::connection::SqlitePool;
use crate::models::cve::{CacheEntry, CveId, CveRecord};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use log::{debug, info, warn};
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task;

/// Age-based freshness rule for cached records.
#[derive(Debug, Clone, Copy)]
pub struct StalenessPolicy {
	pub max_age: Duration,
}

impl StalenessPolicy {
	pub fn new(max_age: Duration) -> Self {
		Self { max_age }
	}

	pub fn is_stale(&self, entry: &CacheEntry) -> bool {
		self.is_stale_at(entry, Utc::now())
	}

	pub fn is_stale_at(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
		now - entry.fetched_at > self.max_age
	}

	fn cutoff_millis(&self, now: DateTime<Utc>) -> i64 {
		(now - self.max_age).timestamp_millis()
	}
}

impl From<&CacheConfig> for StalenessPolicy {
	fn from(config: &CacheConfig) -> Self {
		Self::new(config.max_age())
	}
}

/// Outcome of reading one identifier from the store.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheRead {
	Found(CacheEntry),
	Missing,
	/// A row exists but could not be decoded; callers treat it as a miss.
	Corrupt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
	pub entries: usize,
	pub stale: usize,
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
	Utc.timestamp_millis_opt(ms).single()
}

fn decode_row(id: &CveId, record_json: &str, fetched_at_ms: i64) -> CacheRead {
	let record: CveRecord = match serde_json::from_str(record_json) {
		Ok(record) => record,
		Err(e) => return CacheRead::Corrupt(format!("undecodable record: {}", e)),
	};
	if &record.id != id {
		return CacheRead::Corrupt(format!("row holds record for {}", record.id));
	}
	match millis_to_datetime(fetched_at_ms) {
		Some(fetched_at) => CacheRead::Found(CacheEntry { record, fetched_at }),
		None => CacheRead::Corrupt(format!("invalid fetched_at {}", fetched_at_ms)),
	}
}

/// Persistent CVE record cache shared by every resolution. SQLite serializes
/// the writes, so callers need no locking of their own.
#[derive(Clone)]
pub struct CveCacheStore {
	pool: Arc<SqlitePool>,
}

impl CveCacheStore {
	pub fn new(pool: Arc<SqlitePool>) -> Self {
		Self { pool }
	}

	/// Reads a single identifier. A nonexistent key is `Missing`, never an error.
	pub async fn read(&self, id: &CveId) -> Result<CacheRead> {
		let mut reads = self.read_many(std::slice::from_ref(id)).await?;
		Ok(reads.remove(id).unwrap_or(CacheRead::Missing))
	}

	/// Like `read`, with corrupt rows folded into `None`.
	pub async fn get(&self, id: &CveId) -> Result<Option<CacheEntry>> {
		Ok(match self.read(id).await? {
			CacheRead::Found(entry) => Some(entry),
			CacheRead::Missing => None,
			CacheRead::Corrupt(reason) => {
				warn!("Ignoring corrupt cache entry for {}: {}", id, reason);
				None
			}
		})
	}

	pub async fn read_many(&self, ids: &[CveId]) -> Result<HashMap<CveId, CacheRead>> {
		let pool = self.pool.clone();
		let ids = ids.to_vec();

		task::spawn_blocking(move || -> Result<_> {
			let conn = pool.get().context("Failed to get database connection")?;
			let mut stmt = conn
				.prepare_cached("SELECT record_json, fetched_at_ms FROM cve_cache WHERE cve_id = ?1")
				.context("Failed to prepare statement")?;

			let mut reads = HashMap::with_capacity(ids.len());
			for id in ids {
				let row = stmt
					.query_row([id.as_str()], |row| {
						Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
					})
					.optional();

				let read = match row {
					Ok(Some((json, fetched_at_ms))) => decode_row(&id, &json, fetched_at_ms),
					Ok(None) => CacheRead::Missing,
					// Wrong column types count as corruption of that row only.
					Err(rusqlite::Error::InvalidColumnType(..)) | Err(rusqlite::Error::FromSqlConversionFailure(..)) => {
						CacheRead::Corrupt("unreadable row".to_string())
					}
					Err(e) => return Err(e).context("Failed to read cache entry"),
				};
				reads.insert(id, read);
			}
			Ok(reads)
		})
			.await
			.context("Failed to execute database operation")?
	}

	/// Stores `record`, superseding any earlier entry for the same identifier.
	pub async fn put(&self, record: CveRecord) -> Result<CacheEntry> {
		self.put_many(vec![record])
			.await?
			.pop()
			.ok_or_else(|| anyhow!("Cache write returned no entry"))
	}

	pub async fn put_many(&self, records: Vec<CveRecord>) -> Result<Vec<CacheEntry>> {
		self.put_with_timestamp(records, Utc::now()).await
	}

	/// Writes whole entries in one transaction. `fetched_at` never moves
	/// backwards for an identifier, even if the clock does.
	pub(crate) async fn put_with_timestamp(
		&self,
		records: Vec<CveRecord>,
		fetched_at: DateTime<Utc>,
	) -> Result<Vec<CacheEntry>> {
		if records.is_empty() {
			return Ok(Vec::new());
		}
		let pool = self.pool.clone();
		let fetched_at_ms = fetched_at.timestamp_millis();

		task::spawn_blocking(move || -> Result<_> {
			let mut conn = pool.get().context("Failed to get database connection")?;
			let tx = conn.transaction().context("Failed to start database transaction")?;

			let mut entries = Vec::with_capacity(records.len());
			{
				let mut stmt = tx
					.prepare(
						"INSERT INTO cve_cache (cve_id, record_json, fetched_at_ms)
						 VALUES (?1, ?2, ?3)
						 ON CONFLICT(cve_id) DO UPDATE SET
							record_json = excluded.record_json,
							fetched_at_ms = MAX(cve_cache.fetched_at_ms, excluded.fetched_at_ms)
						 RETURNING fetched_at_ms",
					)
					.context("Failed to prepare statement")?;

				for record in records {
					let json = serde_json::to_string(&record).context("Failed to serialize CVE record")?;
					let stored_ms: i64 = stmt
						.query_row(params![record.id.as_str(), json, fetched_at_ms], |row| row.get(0))
						.with_context(|| format!("Failed to cache {}", record.id))?;
					let fetched_at = millis_to_datetime(stored_ms)
						.ok_or_else(|| anyhow!("Invalid stored timestamp {}", stored_ms))?;
					entries.push(CacheEntry { record, fetched_at });
				}
			}

			tx.commit().context("Failed to commit transaction")?;
			debug!("Cached {} CVE records", entries.len());
			Ok(entries)
		})
			.await
			.context("Failed to execute database operation")?
	}

	pub async fn stats(&self, policy: StalenessPolicy) -> Result<CacheStats> {
		let pool = self.pool.clone();
		let cutoff = policy.cutoff_millis(Utc::now());

		task::spawn_blocking(move || -> Result<_> {
			let conn = pool.get().context("Failed to get database connection")?;
			let (entries, stale): (i64, i64) = conn
				.query_row(
					"SELECT COUNT(*), COALESCE(SUM(fetched_at_ms < ?1), 0) FROM cve_cache",
					[cutoff],
					|row| Ok((row.get(0)?, row.get(1)?)),
				)
				.context("Failed to compute cache statistics")?;
			Ok(CacheStats {
				entries: entries as usize,
				stale: stale as usize,
			})
		})
			.await
			.context("Failed to execute database operation")?
	}

	/// Share of `ids` with a cache entry, in percent rounded to one decimal.
	pub async fn cached_percentage(&self, ids: &[CveId]) -> Result<f64> {
		if ids.is_empty() {
			return Ok(0.0);
		}
		let pool = self.pool.clone();
		let ids = ids.to_vec();

		task::spawn_blocking(move || -> Result<_> {
			let conn = pool.get().context("Failed to get database connection")?;
			let mut stmt = conn
				.prepare_cached("SELECT 1 FROM cve_cache WHERE cve_id = ?1")
				.context("Failed to prepare statement")?;

			let mut cached = 0usize;
			for id in &ids {
				if stmt.exists([id.as_str()]).context("Failed to query cache")? {
					cached += 1;
				}
			}
			Ok(((cached as f64 / ids.len() as f64) * 1000.0).round() / 10.0)
		})
			.await
			.context("Failed to execute database operation")?
	}

	pub async fn purge_stale(&self, policy: StalenessPolicy) -> Result<usize> {
		let pool = self.pool.clone();
		let cutoff = policy.cutoff_millis(Utc::now());

		task::spawn_blocking(move || -> Result<_> {
			let conn = pool.get().context("Failed to get database connection")?;
			let removed = conn
				.execute("DELETE FROM cve_cache WHERE fetched_at_ms < ?1", [cutoff])
				.context("Failed to purge stale cache entries")?;
			info!("Purged {} stale cache entries", removed);
			Ok(removed)
		})
			.await
			.context("Failed to execute database operation")?
	}

	pub async fn clear(&self) -> Result<usize> {
		let pool = self.pool.clone();

		task::spawn_blocking(move || -> Result<_> {
			let conn = pool.get().context("Failed to get database connection")?;
			let removed = conn
				.execute("DELETE FROM cve_cache", [])
				.context("Failed to clear cache")?;
			info!("Cleared {} cache entries", removed);
			Ok(removed)
		})
			.await
			.context("Failed to execute database operation")?
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use crate::db::connection;
	use crate::models::cve::{CvssMetrics, CvssVersion};
	use tempfile::{tempdir, TempDir};

	pub(crate) fn setup_test_db() -> Result<(TempDir, Arc<SqlitePool>)> {
		let dir = tempdir()?;
		let db_path = dir.path().join("test.db");
		let pool = Arc::new(connection::establish_pool_with_path(db_path)?);
		Ok((dir, pool))
	}

	pub(crate) fn sample_record(id: &str, score: f64) -> CveRecord {
		CveRecord {
			id: id.parse().unwrap(),
			description: Some(format!("Test record for {}", id)),
			published: None,
			last_modified: None,
			cvss: Some(CvssMetrics {
				version: CvssVersion::V31,
				base_score: score,
				base_severity: "HIGH".to_string(),
				vector: "CVSS:3.1/AV:N/AC:L/PR:N/UI:N/S:U/C:H/I:H/A:H".to_string(),
				attack_vector: "NETWORK".to_string(),
				attack_complexity: "LOW".to_string(),
				privileges_required: "NONE".to_string(),
				user_interaction: "NONE".to_string(),
				confidentiality_impact: "HIGH".to_string(),
				integrity_impact: "HIGH".to_string(),
				availability_impact: "HIGH".to_string(),
			}),
			temporal: None,
			in_kev: false,
		}
	}

	#[tokio::test]
	async fn test_put_then_get_round_trip() -> Result<()> {
		let (_dir, pool) = setup_test_db()?;
		let store = CveCacheStore::new(pool);
		let record = sample_record("CVE-2021-44228", 10.0);

		let before = Utc::now().timestamp_millis();
		let written = store.put(record.clone()).await?;
		let after = Utc::now().timestamp_millis();

		let entry = store.get(&record.id).await?.expect("entry should exist");
		assert_eq!(entry.record, record);
		assert_eq!(entry, written);
		let ms = entry.fetched_at.timestamp_millis();
		assert!(ms >= before && ms <= after);
		Ok(())
	}

	#[tokio::test]
	async fn test_missing_key_is_absent_not_error() -> Result<()> {
		let (_dir, pool) = setup_test_db()?;
		let store = CveCacheStore::new(pool);
		let id: CveId = "CVE-2099-0001".parse().unwrap();

		assert_eq!(store.read(&id).await?, CacheRead::Missing);
		assert!(store.get(&id).await?.is_none());
		Ok(())
	}

	#[tokio::test]
	async fn test_put_supersedes_and_timestamp_never_decreases() -> Result<()> {
		let (_dir, pool) = setup_test_db()?;
		let store = CveCacheStore::new(pool);
		let now = Utc::now();

		store
			.put_with_timestamp(vec![sample_record("CVE-2020-1472", 10.0)], now)
			.await?;
		let older = now - Duration::hours(1);
		let entries = store
			.put_with_timestamp(vec![sample_record("CVE-2020-1472", 5.5)], older)
			.await?;

		assert_eq!(entries[0].fetched_at.timestamp_millis(), now.timestamp_millis());
		let entry = store.get(&"CVE-2020-1472".parse().unwrap()).await?.unwrap();
		assert_eq!(entry.record.base_score(), Some(5.5));
		assert_eq!(entry.fetched_at.timestamp_millis(), now.timestamp_millis());
		Ok(())
	}

	#[tokio::test]
	async fn test_corrupt_entry_reads_as_corrupt() -> Result<()> {
		let (_dir, pool) = setup_test_db()?;
		pool.get()?.execute(
			"INSERT INTO cve_cache (cve_id, record_json, fetched_at_ms) VALUES (?1, ?2, ?3)",
			params!["CVE-2019-0708", "{not json", Utc::now().timestamp_millis()],
		)?;
		let store = CveCacheStore::new(pool);
		let id: CveId = "CVE-2019-0708".parse().unwrap();

		assert!(matches!(store.read(&id).await?, CacheRead::Corrupt(_)));
		assert!(store.get(&id).await?.is_none());

		// A fresh write replaces the corrupt row.
		store.put(sample_record("CVE-2019-0708", 9.8)).await?;
		assert!(matches!(store.read(&id).await?, CacheRead::Found(_)));
		Ok(())
	}

	#[tokio::test]
	async fn test_persists_across_pools() -> Result<()> {
		let dir = tempdir()?;
		let db_path = dir.path().join("persist.db");
		let record = sample_record("CVE-2017-0144", 8.1);

		{
			let pool = Arc::new(connection::establish_pool_with_path(db_path.clone())?);
			CveCacheStore::new(pool).put(record.clone()).await?;
		}

		let pool = Arc::new(connection::establish_pool_with_path(db_path)?);
		let entry = CveCacheStore::new(pool).get(&record.id).await?.unwrap();
		assert_eq!(entry.record, record);
		Ok(())
	}

	#[test]
	fn test_staleness_policy() {
		let policy = StalenessPolicy::new(Duration::days(7));
		let now = Utc::now();
		let fresh = CacheEntry {
			record: sample_record("CVE-2021-0001", 1.0),
			fetched_at: now - Duration::days(6),
		};
		let stale = CacheEntry {
			record: sample_record("CVE-2021-0001", 1.0),
			fetched_at: now - Duration::days(8),
		};
		assert!(!policy.is_stale_at(&fresh, now));
		assert!(policy.is_stale_at(&stale, now));
	}

	#[tokio::test]
	async fn test_stats_purge_and_percentage() -> Result<()> {
		let (_dir, pool) = setup_test_db()?;
		let store = CveCacheStore::new(pool);
		let policy = StalenessPolicy::new(Duration::days(7));

		store
			.put_with_timestamp(vec![sample_record("CVE-2018-0001", 5.0)], Utc::now() - Duration::days(30))
			.await?;
		store.put(sample_record("CVE-2018-0002", 6.0)).await?;

		assert_eq!(store.stats(policy).await?, CacheStats { entries: 2, stale: 1 });

		let ids: Vec<CveId> = ["CVE-2018-0001", "CVE-2018-0002", "CVE-2018-0003"]
			.iter()
			.map(|s| s.parse().unwrap())
			.collect();
		assert_eq!(store.cached_percentage(&ids).await?, 66.7);
		assert_eq!(store.cached_percentage(&[]).await?, 0.0);

		assert_eq!(store.purge_stale(policy).await?, 1);
		assert_eq!(store.stats(policy).await?, CacheStats { entries: 1, stale: 0 });
		assert_eq!(store.clear().await?, 1);
		assert_eq!(store.stats(policy).await?.entries, 0);
		Ok(())
	}
}
