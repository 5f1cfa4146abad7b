// src/services/retrieval.rs

use crate::config::RetrievalConfig;
use crate::errors::FetchError;
use crate::models::api_key::KeyOutcome;
use crate::models::cve::{CacheEntry, CveId, CveRecord};
use crate::models::scan::{
	AbsenceReason, Resolution, ResolutionReport, ResolutionSource, ResolvedEntry, ResolvedScan, ScanImport,
};
use crate::repositories::cache_repo::{CacheRead, CveCacheStore, StalenessPolicy};
use crate::services::key_pool::ApiKeyPool;
use crate::utils::kev::KevLookup;
use crate::utils::nvd_api::CveFetcher;
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
	/// Refetch every identifier even when a fresh cache entry exists.
	pub force_refresh: bool,
	pub cancel: CancellationToken,
}

/// Lifecycle of one identifier's fetch. `Retrying` loops back to `InFlight`
/// until the retry budget runs out.
enum FetchState {
	Pending,
	InFlight { attempt: u32 },
	Retrying { attempt: u32, delay: Duration, last_error: String },
	Succeeded(CveRecord),
	Failed(AbsenceReason),
}

struct Candidate {
	id: CveId,
	/// Entry to fall back on when the refetch fails.
	fallback: Option<CacheEntry>,
}

/// Turns a `ScanImport` into a `ResolvedScan`, consulting the shared cache
/// first and the NVD only for what the cache cannot answer.
pub struct RetrievalCoordinator {
	cache: Arc<CveCacheStore>,
	keys: Arc<ApiKeyPool>,
	fetcher: Arc<dyn CveFetcher>,
	kev: Arc<dyn KevLookup>,
	config: RetrievalConfig,
	staleness: StalenessPolicy,
	shutdown: CancellationToken,
}

impl RetrievalCoordinator {
	pub fn new(
		cache: Arc<CveCacheStore>,
		keys: Arc<ApiKeyPool>,
		fetcher: Arc<dyn CveFetcher>,
		kev: Arc<dyn KevLookup>,
		config: RetrievalConfig,
		staleness: StalenessPolicy,
	) -> Self {
		Self {
			cache,
			keys,
			fetcher,
			kev,
			config,
			staleness,
			shutdown: CancellationToken::new(),
		}
	}

	/// Token that cancels resolutions started through `resolve`.
	pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
		self.shutdown = shutdown;
		self
	}

	pub async fn resolve(&self, scan: ScanImport) -> ResolvedScan {
		let options = ResolveOptions {
			force_refresh: false,
			cancel: self.shutdown.clone(),
		};
		self.resolve_with(scan, options).await
	}

	/// Never fails: identifiers that cannot be resolved come back as absent
	/// with a reason, in the same order as the scan.
	pub async fn resolve_with(&self, scan: ScanImport, options: ResolveOptions) -> ResolvedScan {
		let mut report = ResolutionReport::default();
		let mut resolved: HashMap<CveId, Resolution> = HashMap::with_capacity(scan.cve_ids.len());

		let reads = match self.cache.read_many(&scan.cve_ids).await {
			Ok(reads) => reads,
			Err(e) => {
				warn!("Cache unavailable for scan '{}', fetching everything: {:#}", scan.name, e);
				HashMap::new()
			}
		};

		let mut candidates = Vec::new();
		let mut seen = HashSet::with_capacity(scan.cve_ids.len());
		for id in &scan.cve_ids {
			if !seen.insert(id) {
				continue;
			}
			let fallback = match reads.get(id) {
				Some(CacheRead::Found(entry)) => {
					if !options.force_refresh && !self.staleness.is_stale(entry) {
						report.cache_hits += 1;
						resolved.insert(
							id.clone(),
							Resolution::Resolved {
								record: entry.record.clone(),
								source: ResolutionSource::Cache,
							},
						);
						continue;
					}
					Some(entry.clone())
				}
				Some(CacheRead::Corrupt(reason)) => {
					warn!("Corrupt cache entry for {} will be refetched: {}", id, reason);
					report.corrupt_cache_entries.push(id.clone());
					None
				}
				Some(CacheRead::Missing) | None => None,
			};
			candidates.push(Candidate {
				id: id.clone(),
				fallback,
			});
		}

		debug!(
			"Scan '{}': {} cache hits, {} identifiers to fetch",
			scan.name,
			report.cache_hits,
			candidates.len()
		);

		let cancel = &options.cancel;
		let write_back = scan.caching_enabled;
		let outcomes: Vec<(Candidate, Result<CveRecord, AbsenceReason>)> = stream::iter(candidates)
			.map(|candidate| async move {
				let outcome = self.fetch_with_retry(&candidate.id, cancel).await;
				// Opting out of caching only stops writes; reads above still happen.
				if let (true, Ok(record)) = (write_back, &outcome) {
					if let Err(e) = self.cache.put(record.clone()).await {
						warn!("Failed to cache {}: {:#}", record.id, e);
					}
				}
				(candidate, outcome)
			})
			.buffer_unordered(self.config.workers.max(1))
			.collect()
			.await;

		for (candidate, outcome) in outcomes {
			let resolution = match outcome {
				Ok(record) => {
					report.fetched += 1;
					Resolution::Resolved {
						record,
						source: ResolutionSource::Network,
					}
				}
				Err(reason) => match candidate.fallback {
					Some(entry) => {
						debug!("Refetch of {} failed ({:?}), serving cached copy", candidate.id, reason);
						let source = if self.staleness.is_stale(&entry) {
							report.stale_served += 1;
							ResolutionSource::StaleCache
						} else {
							report.cache_hits += 1;
							ResolutionSource::Cache
						};
						Resolution::Resolved {
							record: entry.record,
							source,
						}
					}
					None => Resolution::Absent { reason },
				},
			};
			resolved.insert(candidate.id, resolution);
		}

		let entries: Vec<ResolvedEntry> = scan
			.cve_ids
			.iter()
			.map(|id| {
				let resolution = match resolved.get(id) {
					Some(Resolution::Resolved { record, source }) => {
						let mut record = record.clone();
						record.in_kev = self.kev.contains(id);
						Resolution::Resolved { record, source: *source }
					}
					Some(absent) => absent.clone(),
					None => Resolution::Absent {
						reason: AbsenceReason::Cancelled,
					},
				};
				if let Resolution::Absent { reason } = &resolution {
					report.absent.push((id.clone(), reason.clone()));
				}
				ResolvedEntry {
					id: id.clone(),
					resolution,
				}
			})
			.collect();

		report.cancelled = cancel.is_cancelled();
		info!(
			"Resolved scan '{}': {} from cache, {} fetched, {} stale, {} absent{}",
			scan.name,
			report.cache_hits,
			report.fetched,
			report.stale_served,
			report.absent.len(),
			if report.cancelled { " (cancelled)" } else { "" }
		);

		ResolvedScan { scan, entries, report }
	}

	async fn fetch_with_retry(&self, id: &CveId, cancel: &CancellationToken) -> Result<CveRecord, AbsenceReason> {
		let mut state = FetchState::Pending;
		loop {
			state = match state {
				FetchState::Pending => {
					if cancel.is_cancelled() {
						FetchState::Failed(AbsenceReason::Cancelled)
					} else {
						FetchState::InFlight { attempt: 0 }
					}
				}
				FetchState::InFlight { attempt } => self.attempt(id, attempt).await,
				FetchState::Retrying {
					attempt,
					delay,
					last_error,
				} => {
					if attempt >= self.config.max_retries {
						warn!("Giving up on {} after {} attempts: {}", id, attempt + 1, last_error);
						FetchState::Failed(AbsenceReason::RetriesExhausted(last_error))
					} else {
						debug!("Retrying {} in {:?} ({})", id, delay, last_error);
						tokio::select! {
							_ = cancel.cancelled() => FetchState::Failed(AbsenceReason::Cancelled),
							_ = tokio::time::sleep(delay) => FetchState::InFlight { attempt: attempt + 1 },
						}
					}
				}
				FetchState::Succeeded(record) => return Ok(record),
				FetchState::Failed(reason) => return Err(reason),
			};
		}
	}

	/// One request with one leased key.
	async fn attempt(&self, id: &CveId, attempt: u32) -> FetchState {
		let lease = match self.keys.acquire().await {
			Ok(lease) => lease,
			Err(e) => {
				// Without a reset time no key will come back by waiting.
				return match e.retry_after {
					Some(retry_after) => FetchState::Retrying {
						attempt,
						delay: self.backoff_delay(attempt, Some(retry_after)),
						last_error: e.to_string(),
					},
					None => FetchState::Failed(AbsenceReason::NoUsableKey),
				};
			}
		};

		debug!("Fetching {} with key '{}' (attempt {})", id, lease.name(), attempt + 1);
		let result = self.fetcher.fetch_cve(id, lease.secret()).await;
		let outcome = match &result {
			Ok(_) | Err(FetchError::NotFound) | Err(FetchError::MalformedResponse(_)) => KeyOutcome::Success,
			Err(FetchError::RateLimited) => KeyOutcome::RateLimited,
			Err(FetchError::Unauthorized) => KeyOutcome::Rejected,
			Err(_) => KeyOutcome::Failure,
		};
		self.keys.release(lease, outcome).await;

		match result {
			Ok(record) => FetchState::Succeeded(record),
			Err(FetchError::NotFound) => FetchState::Failed(AbsenceReason::NotFound),
			Err(FetchError::MalformedResponse(detail)) => {
				warn!("Malformed NVD response for {}: {}", id, detail);
				FetchState::Failed(AbsenceReason::MalformedResponse(detail))
			}
			Err(e) if e.is_retryable() => FetchState::Retrying {
				attempt,
				delay: self.backoff_delay(attempt, None),
				last_error: e.to_string(),
			},
			Err(e) => FetchState::Failed(AbsenceReason::Rejected(e.to_string())),
		}
	}

	/// The larger of the exponential delay and a known reset time, plus jitter,
	/// never above the configured ceiling.
	fn backoff_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
		let exponential = self
			.config
			.backoff_base()
			.saturating_mul(2u32.saturating_pow(attempt.min(16)));
		let max_jitter = self.config.jitter();
		let jitter = if max_jitter.is_zero() {
			Duration::ZERO
		} else {
			rand::thread_rng().gen_range(Duration::ZERO..=max_jitter)
		};
		let floor = exponential.max(retry_after.unwrap_or(Duration::ZERO));
		(floor + jitter).min(self.config.backoff_max())
	}
}
