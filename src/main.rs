// src/main.rs

mod config;
mod db;
mod errors;
mod models;
mod repositories;
mod services;
mod utils;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use config::AppConfig;
use db::connection::{self, SqlitePool};
use errors::KeyPoolError;
use log::{error, info, warn};
use models::cve::CveId;
use models::scan::{ResolvedScan, ScanImport};
use repositories::api_key_repo::{ApiKeyRepository, InsertOutcome};
use repositories::cache_repo::{CveCacheStore, StalenessPolicy};
use repositories::scan_repo::ScanRepository;
use serde::Serialize;
use serde_json::json;
use services::comparison;
use services::key_pool::ApiKeyPool;
use services::retrieval::{ResolveOptions, RetrievalCoordinator};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use utils::csv_importer::extract_cve_ids_from_path;
use utils::kev::KevCatalog;
use utils::nvd_api::NvdApiClient;

#[derive(Parser)]
#[command(name = "scan_delta", version, about = "Resolve scanner CVE exports against NVD and diff them")]
struct Cli {
	/// TOML configuration file
	#[arg(long, global = true)]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Manage NVD API keys
	Keys {
		#[command(subcommand)]
		action: KeysCommand,
	},
	/// Import a scanner CSV export under a unique name
	Import {
		name: String,
		csv: PathBuf,
		/// Do not write this scan's fetch results to the shared cache
		#[arg(long)]
		no_cache: bool,
	},
	/// Manage imported scans
	Scans {
		#[command(subcommand)]
		action: ScansCommand,
	},
	/// Resolve every CVE of a scan and print the result
	Resolve {
		scan: String,
		#[arg(long)]
		force_refresh: bool,
	},
	/// Compare scans against a baseline, or consecutively with --pairwise
	Compare {
		baseline: String,
		#[arg(required = true)]
		scans: Vec<String>,
		#[arg(long)]
		pairwise: bool,
		#[arg(long)]
		force_refresh: bool,
	},
	/// Inspect or maintain the CVE cache
	Cache {
		#[command(subcommand)]
		action: CacheCommand,
	},
}

#[derive(Subcommand)]
enum KeysCommand {
	Add {
		name: String,
		value: String,
		#[arg(long)]
		no_validate: bool,
	},
	List,
	Remove {
		name: String,
	},
	Validate,
}

#[derive(Subcommand)]
enum ScansCommand {
	List,
	SetCache {
		name: String,
		state: Toggle,
	},
	Remove {
		name: String,
	},
}

#[derive(Subcommand)]
enum CacheCommand {
	Stats,
	/// Print the cached entry for one CVE identifier
	Show {
		id: String,
	},
	PurgeStale,
	Clear,
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
	On,
	Off,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
	let rendered = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
	println!("{}", rendered);
	Ok(())
}

struct App {
	config: AppConfig,
	cache: Arc<CveCacheStore>,
	keys: Arc<ApiKeyPool>,
	key_repo: ApiKeyRepository,
	scan_repo: ScanRepository,
	nvd_client: Arc<NvdApiClient>,
	shutdown: CancellationToken,
}

impl App {
	async fn new(config_path: Option<PathBuf>) -> Result<Self> {
		utils::logger::init();
		info!("Starting scan_delta {}", env!("CARGO_PKG_VERSION"));

		let config = AppConfig::load(config_path.as_deref()).context("Failed to load configuration")?;
		let pool: Arc<SqlitePool> = Arc::new(
			connection::establish_pool_with_path(config.database_path())
				.context("Failed to establish database connection pool")?,
		);

		let nvd_client = Arc::new(NvdApiClient::new(&config.nvd).context("Failed to create NVD API client")?);

		let key_repo = ApiKeyRepository::new(pool.clone());
		let stored_keys = key_repo.list().await.context("Failed to load API keys")?;
		info!("Loaded {} NVD API keys", stored_keys.len());
		let keys = Arc::new(ApiKeyPool::with_keys(&config.nvd, stored_keys));

		Ok(App {
			cache: Arc::new(CveCacheStore::new(pool.clone())),
			scan_repo: ScanRepository::new(pool),
			key_repo,
			keys,
			nvd_client,
			config,
			shutdown: CancellationToken::new(),
		})
	}

	fn listen_for_shutdown(&self) {
		let shutdown = self.shutdown.clone();
		tokio::spawn(async move {
			match signal::ctrl_c().await {
				Ok(()) => {
					info!("Received Ctrl+C, finishing in-flight requests");
					shutdown.cancel();
				}
				Err(err) => {
					error!("Failed to listen for ctrl-c signal: {}", err);
				}
			}
		});
	}

	fn staleness(&self) -> StalenessPolicy {
		StalenessPolicy::from(&self.config.cache)
	}

	async fn run(&self, command: Command) -> Result<()> {
		self.listen_for_shutdown();

		match command {
			Command::Keys { action } => self.keys_command(action).await,
			Command::Import { name, csv, no_cache } => self.import(name, csv, !no_cache).await,
			Command::Scans { action } => self.scans_command(action).await,
			Command::Resolve { scan, force_refresh } => {
				let scan = self.load_scan(&scan).await?;
				let coordinator = self.coordinator().await;
				let resolved = self.resolve_scan(&coordinator, scan, force_refresh).await;
				self.persist_key_state().await;
				print_json(&resolved)
			}
			Command::Compare {
				baseline,
				scans,
				pairwise,
				force_refresh,
			} => self.compare(baseline, scans, pairwise, force_refresh).await,
			Command::Cache { action } => self.cache_command(action).await,
		}
	}

	async fn resolve_scan(&self, coordinator: &RetrievalCoordinator, scan: ScanImport, force_refresh: bool) -> ResolvedScan {
		if !force_refresh {
			return coordinator.resolve(scan).await;
		}
		let options = ResolveOptions {
			force_refresh,
			cancel: self.shutdown.clone(),
		};
		coordinator.resolve_with(scan, options).await
	}

	async fn load_kev(&self) -> KevCatalog {
		let loaded = if let Some(path) = &self.config.kev.path {
			KevCatalog::from_path(path).await
		} else if let Some(url) = &self.config.kev.url {
			KevCatalog::fetch(&reqwest::Client::new(), url).await
		} else {
			info!("No KEV catalog configured, KEV flags will be unset");
			return KevCatalog::empty();
		};

		match loaded {
			Ok(catalog) if catalog.is_empty() => {
				warn!("KEV catalog is empty");
				catalog
			}
			Ok(catalog) => {
				info!(
					"Using KEV catalog {} released {} with {} entries",
					catalog.catalog_version.as_deref().unwrap_or("(unversioned)"),
					catalog.date_released.as_deref().unwrap_or("(undated)"),
					catalog.len()
				);
				catalog
			}
			Err(e) => {
				warn!("Could not load KEV catalog, continuing without it: {:#}", e);
				KevCatalog::empty()
			}
		}
	}

	async fn coordinator(&self) -> RetrievalCoordinator {
		if self.keys.is_empty().await {
			warn!("No NVD API keys configured; only cached records can be resolved");
		}
		RetrievalCoordinator::new(
			self.cache.clone(),
			self.keys.clone(),
			self.nvd_client.clone(),
			Arc::new(self.load_kev().await),
			self.config.retrieval.clone(),
			self.staleness(),
		)
		.with_shutdown(self.shutdown.clone())
	}

	async fn persist_key_state(&self) {
		if let Err(e) = self.key_repo.save_state(self.keys.keys().await).await {
			warn!("Failed to persist API key counters: {:#}", e);
		}
	}

	async fn load_scan(&self, name: &str) -> Result<ScanImport> {
		self.scan_repo
			.get_by_name(name)
			.await?
			.ok_or_else(|| anyhow!("No scan named '{}'", name))
	}

	async fn import(&self, name: String, csv: PathBuf, caching_enabled: bool) -> Result<()> {
		if name.trim().is_empty() {
			bail!("Scan name cannot be empty");
		}
		if self.scan_repo.get_by_name(&name).await?.is_some() {
			bail!("A scan named '{}' already exists", name);
		}

		let extraction = extract_cve_ids_from_path(&csv)
			.await
			.with_context(|| format!("Failed to import {}", csv.display()))?;

		let mut scan = ScanImport::new(name, extraction.cve_ids, caching_enabled);
		scan.total_occurrences = extraction.total_occurrences;
		scan.source_path = Some(csv.display().to_string());

		if !self.scan_repo.save(&scan).await? {
			bail!("A scan named '{}' already exists", scan.name);
		}
		let cached_percentage = self.cache.cached_percentage(&scan.cve_ids).await?;

		print_json(&json!({
			"name": scan.name,
			"unique": scan.cve_ids.len(),
			"total_occurrences": scan.total_occurrences,
			"skipped_rows": extraction.skipped_rows,
			"column_index": extraction.column_index,
			"column_header": extraction.column_header,
			"caching_enabled": scan.caching_enabled,
			"cached_percentage": cached_percentage,
		}))
	}

	async fn compare(&self, baseline: String, others: Vec<String>, pairwise: bool, force_refresh: bool) -> Result<()> {
		let mut imports = vec![self.load_scan(&baseline).await?];
		for name in &others {
			imports.push(self.load_scan(name).await?);
		}

		let coordinator = self.coordinator().await;
		let mut resolved: Vec<ResolvedScan> = Vec::with_capacity(imports.len());
		for scan in imports {
			resolved.push(self.resolve_scan(&coordinator, scan, force_refresh).await);
		}
		self.persist_key_state().await;

		let comparisons = if pairwise {
			comparison::compare_pairwise(&resolved)
		} else {
			comparison::compare_to_baseline(&resolved[0], &resolved[1..])
		};
		print_json(&json!({
			"aggregate": comparison::aggregate(&resolved),
			"comparisons": comparisons,
		}))
	}

	async fn keys_command(&self, action: KeysCommand) -> Result<()> {
		match action {
			KeysCommand::Add {
				name,
				value,
				no_validate,
			} => {
				self.keys.add(&name, &value).await?;
				let name = name.trim().to_string();
				if !no_validate {
					match self.keys.validate(&name, self.nvd_client.as_ref()).await {
						Ok(status) => info!("Key '{}' validated as {}", name, status),
						Err(KeyPoolError::Validation(e)) => warn!("Key '{}' stored unvalidated: {}", name, e),
						Err(e) => return Err(e.into()),
					}
				}

				let key = self
					.keys
					.keys()
					.await
					.into_iter()
					.find(|k| k.name == name)
					.ok_or_else(|| KeyPoolError::UnknownKey(name.clone()))?;
				match self.key_repo.insert(&key).await? {
					InsertOutcome::Inserted => print_json(&key.info()),
					InsertOutcome::DuplicateName => Err(KeyPoolError::DuplicateName(name).into()),
				}
			}
			KeysCommand::List => print_json(&self.keys.snapshot().await),
			KeysCommand::Remove { name } => {
				if !self.key_repo.remove(&name).await? {
					return Err(KeyPoolError::UnknownKey(name).into());
				}
				self.keys.remove(&name).await?;
				info!("Removed API key '{}'", name);
				Ok(())
			}
			KeysCommand::Validate => {
				for (name, verdict) in self.keys.validate_all(self.nvd_client.as_ref()).await {
					if let Err(e) = verdict {
						warn!("Key '{}': {}", name, e);
					}
				}
				self.persist_key_state().await;
				print_json(&self.keys.snapshot().await)
			}
		}
	}

	async fn scans_command(&self, action: ScansCommand) -> Result<()> {
		match action {
			ScansCommand::List => {
				let mut listing = Vec::new();
				for scan in self.scan_repo.list().await? {
					let imported = self.load_scan(&scan.name).await?;
					let cached = self.cache.cached_percentage(&imported.cve_ids).await?;
					listing.push(json!({ "scan": scan, "cached_percentage": cached }));
				}
				print_json(&listing)
			}
			ScansCommand::SetCache { name, state } => {
				let enabled = matches!(state, Toggle::On);
				if !self.scan_repo.set_caching(&name, enabled).await? {
					bail!("No scan named '{}'", name);
				}
				info!("Caching for scan '{}' is now {}", name, if enabled { "on" } else { "off" });
				Ok(())
			}
			ScansCommand::Remove { name } => {
				if !self.scan_repo.remove(&name).await? {
					bail!("No scan named '{}'", name);
				}
				info!("Removed scan '{}'", name);
				Ok(())
			}
		}
	}

	async fn cache_command(&self, action: CacheCommand) -> Result<()> {
		match action {
			CacheCommand::Stats => {
				let stats = self.cache.stats(self.staleness()).await?;
				print_json(&json!({
					"entries": stats.entries,
					"stale": stats.stale,
					"staleness_days": self.config.cache.staleness_days,
				}))
			}
			CacheCommand::Show { id } => {
				let id: CveId = id.parse()?;
				match self.cache.get(&id).await? {
					Some(entry) => {
						let stale = self.staleness().is_stale(&entry);
						print_json(&json!({ "entry": entry, "stale": stale }))
					}
					None => bail!("{} is not cached", id),
				}
			}
			CacheCommand::PurgeStale => {
				let removed = self.cache.purge_stale(self.staleness()).await?;
				print_json(&json!({ "removed": removed }))
			}
			CacheCommand::Clear => {
				let removed = self.cache.clear().await?;
				print_json(&json!({ "removed": removed }))
			}
		}
	}
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();
	let app = App::new(cli.config).await?;
	let result = app.run(cli.command).await;
	if let Err(e) = &result {
		error!("{:#}", e);
	}
	result
}
