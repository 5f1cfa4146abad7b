// src/config.rs

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use log::{debug, info, warn};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "SCAN_DELTA_";
const DEFAULT_NVD_BASE_URL: &str = "https://services.nvd.nist.gov/rest/json/cves/2.0";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
	pub database_path: Option<PathBuf>,
	pub nvd: NvdConfig,
	pub retrieval: RetrievalConfig,
	pub cache: CacheConfig,
	pub kev: KevConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NvdConfig {
	pub base_url: String,
	pub request_timeout_secs: u64,
	/// NVD allows 50 requests per rolling 30 seconds per key.
	pub requests_per_window: u32,
	pub window_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
	pub workers: usize,
	pub max_retries: u32,
	pub backoff_base_ms: u64,
	pub backoff_max_ms: u64,
	pub jitter_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
	pub staleness_days: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KevConfig {
	pub path: Option<PathBuf>,
	pub url: Option<String>,
}

impl Default for NvdConfig {
	fn default() -> Self {
		Self {
			base_url: DEFAULT_NVD_BASE_URL.to_string(),
			request_timeout_secs: 90,
			requests_per_window: 50,
			window_secs: 30,
		}
	}
}

impl Default for RetrievalConfig {
	fn default() -> Self {
		Self {
			workers: 4,
			max_retries: 4,
			backoff_base_ms: 1000,
			backoff_max_ms: 30_000,
			jitter_ms: 250,
		}
	}
}

impl Default for CacheConfig {
	fn default() -> Self {
		Self { staleness_days: 7 }
	}
}

impl NvdConfig {
	pub fn request_timeout(&self) -> Duration {
		Duration::from_secs(self.request_timeout_secs)
	}

	pub fn window(&self) -> Duration {
		Duration::from_secs(self.window_secs)
	}
}

impl RetrievalConfig {
	pub fn backoff_base(&self) -> Duration {
		Duration::from_millis(self.backoff_base_ms)
	}

	pub fn backoff_max(&self) -> Duration {
		Duration::from_millis(self.backoff_max_ms)
	}

	pub fn jitter(&self) -> Duration {
		Duration::from_millis(self.jitter_ms)
	}
}

impl CacheConfig {
	pub fn max_age(&self) -> ChronoDuration {
		ChronoDuration::days(self.staleness_days)
	}
}

impl AppConfig {
	/// Loads the TOML file at `path` (or the per-user default when it exists),
	/// then applies `SCAN_DELTA_*` environment overrides.
	pub fn load(path: Option<&Path>) -> Result<Self> {
		let file = match path {
			Some(p) => Some(p.to_path_buf()),
			None => default_config_path().filter(|p| p.exists()),
		};

		let mut config = match file {
			Some(p) => {
				info!("Loading configuration from {:?}", p);
				let raw = std::fs::read_to_string(&p)
					.with_context(|| format!("Failed to read config file {:?}", p))?;
				Self::from_toml(&raw).with_context(|| format!("Invalid config file {:?}", p))?
			}
			None => {
				debug!("No configuration file found, using defaults");
				Self::default()
			}
		};

		config.apply_env_overrides(|name| std::env::var(name).ok());
		config.sanitize();
		Ok(config)
	}

	pub fn from_toml(raw: &str) -> Result<Self> {
		toml::from_str(raw).context("Failed to parse TOML configuration")
	}

	fn apply_env_overrides<F>(&mut self, lookup: F)
	where
		F: Fn(&str) -> Option<String>,
	{
		let var = |suffix: &str| lookup(&format!("{}{}", ENV_PREFIX, suffix)).filter(|v| !v.is_empty());

		if let Some(path) = var("DATABASE_PATH") {
			self.database_path = Some(PathBuf::from(path));
		}
		if let Some(url) = var("NVD_BASE_URL") {
			self.nvd.base_url = url;
		}
		if let Some(days) = var("STALENESS_DAYS") {
			match days.parse() {
				Ok(d) => self.cache.staleness_days = d,
				Err(_) => warn!("Ignoring invalid {}STALENESS_DAYS: {}", ENV_PREFIX, days),
			}
		}
		if let Some(workers) = var("WORKERS") {
			match workers.parse() {
				Ok(w) => self.retrieval.workers = w,
				Err(_) => warn!("Ignoring invalid {}WORKERS: {}", ENV_PREFIX, workers),
			}
		}
		if let Some(path) = var("KEV_PATH") {
			self.kev.path = Some(PathBuf::from(path));
		}
		if let Some(url) = var("KEV_URL") {
			self.kev.url = Some(url);
		}
	}

	fn sanitize(&mut self) {
		if self.retrieval.workers == 0 {
			warn!("retrieval.workers must be at least 1, using 1");
			self.retrieval.workers = 1;
		}
		if self.nvd.requests_per_window == 0 {
			warn!("nvd.requests_per_window must be at least 1, using 1");
			self.nvd.requests_per_window = 1;
		}
		if self.cache.staleness_days < 0 {
			warn!("cache.staleness_days cannot be negative, using 0");
			self.cache.staleness_days = 0;
		}
	}

	pub fn database_path(&self) -> PathBuf {
		self.database_path.clone().unwrap_or_else(default_database_path)
	}
}

fn default_config_path() -> Option<PathBuf> {
	dirs::config_dir().map(|dir| dir.join("scan_delta").join("config.toml"))
}

fn default_database_path() -> PathBuf {
	match dirs::data_dir() {
		Some(dir) => dir.join("scan_delta").join("scan_delta.db"),
		None => {
			let mut db_path = PathBuf::from(".");
			db_path.push("database");
			db_path.push("scan_delta.db");
			db_path
		}
	}
}
