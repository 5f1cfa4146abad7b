// src/services/key_pool.rs

use crate::config::NvdConfig;
use crate::errors::{KeyPoolError, NoKeyAvailable};
use crate::models::api_key::{ApiKey, KeyInfo, KeyOutcome, KeyStatus};
use crate::utils::nvd_api::CveFetcher;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct Slot {
	key: ApiKey,
	window_start: Instant,
	used_in_window: u32,
	parked_until: Option<Instant>,
}

impl Slot {
	fn new(key: ApiKey) -> Self {
		Self {
			key,
			window_start: Instant::now(),
			used_in_window: 0,
			parked_until: None,
		}
	}

	/// Rolls the window forward and lifts an expired parking.
	fn refresh(&mut self, now: Instant, window: Duration) {
		if self.parked_until.is_some_and(|until| now >= until) {
			self.parked_until = None;
			self.window_start = now;
			self.used_in_window = 0;
		}
		if now.duration_since(self.window_start) >= window {
			self.window_start = now;
			self.used_in_window = 0;
		}
	}

	fn usable(&self, budget: u32) -> bool {
		self.key.status != KeyStatus::Invalid && self.parked_until.is_none() && self.used_in_window < budget
	}

	fn available_at(&self, window: Duration) -> Instant {
		self.parked_until.unwrap_or(self.window_start + window)
	}
}

struct PoolState {
	slots: Vec<Slot>,
	cursor: usize,
}

impl PoolState {
	fn position(&self, name: &str) -> Option<usize> {
		self.slots.iter().position(|s| s.key.name == name)
	}
}

/// A key handed out by `ApiKeyPool::acquire`. Hand it back with `release`.
#[derive(Clone)]
pub struct KeyLease {
	name: String,
	secret: String,
}

impl KeyLease {
	pub fn name(&self) -> &str {
		&self.name
	}

	pub(crate) fn secret(&self) -> &str {
		&self.secret
	}
}

impl std::fmt::Debug for KeyLease {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("KeyLease").field("name", &self.name).finish_non_exhaustive()
	}
}

/// Round-robin pool of NVD API keys with per-key window budgets.
///
/// Every method takes `&self`; state lives behind one async mutex, so the pool
/// can be shared through an `Arc` by any number of concurrent fetches.
pub struct ApiKeyPool {
	state: Mutex<PoolState>,
	requests_per_window: u32,
	window: Duration,
}

impl ApiKeyPool {
	pub fn new(requests_per_window: u32, window: Duration) -> Self {
		Self {
			state: Mutex::new(PoolState {
				slots: Vec::new(),
				cursor: 0,
			}),
			requests_per_window: requests_per_window.max(1),
			window,
		}
	}

	pub fn from_config(config: &NvdConfig) -> Self {
		Self::new(config.requests_per_window, config.window())
	}

	/// Builds a pool from previously persisted keys, keeping their status and counters.
	pub fn with_keys(config: &NvdConfig, keys: Vec<ApiKey>) -> Self {
		let mut pool = Self::from_config(config);
		pool.state.get_mut().slots = keys.into_iter().map(Slot::new).collect();
		pool
	}

	pub async fn add(&self, name: &str, secret: &str) -> Result<(), KeyPoolError> {
		let (name, secret) = (name.trim(), secret.trim());
		if name.is_empty() || secret.is_empty() {
			return Err(KeyPoolError::EmptyField);
		}

		let mut state = self.state.lock().await;
		if state.position(name).is_some() {
			return Err(KeyPoolError::DuplicateName(name.to_string()));
		}
		state.slots.push(Slot::new(ApiKey::new(name.to_string(), secret.to_string())));
		info!("Added API key '{}' to the pool", name);
		Ok(())
	}

	pub async fn remove(&self, name: &str) -> Result<(), KeyPoolError> {
		let mut state = self.state.lock().await;
		let idx = state
			.position(name)
			.ok_or_else(|| KeyPoolError::UnknownKey(name.to_string()))?;
		state.slots.remove(idx);
		if state.cursor > idx {
			state.cursor -= 1;
		}
		Ok(())
	}

	/// Checks one key against NVD. The lock is not held across the network call.
	pub async fn validate(&self, name: &str, fetcher: &dyn CveFetcher) -> Result<KeyStatus, KeyPoolError> {
		let secret = {
			let state = self.state.lock().await;
			let idx = state
				.position(name)
				.ok_or_else(|| KeyPoolError::UnknownKey(name.to_string()))?;
			state.slots[idx].key.secret().to_string()
		};

		let verdict = fetcher.validate_key(&secret).await;

		let mut state = self.state.lock().await;
		let idx = state
			.position(name)
			.ok_or_else(|| KeyPoolError::UnknownKey(name.to_string()))?;
		let key = &mut state.slots[idx].key;
		key.total_requests += 1;
		match verdict {
			Ok(valid) => {
				key.status = if valid { KeyStatus::Valid } else { KeyStatus::Invalid };
				info!("API key '{}' is {}", name, key.status);
				Ok(key.status)
			}
			Err(e) => {
				key.error_count += 1;
				warn!("Validation of API key '{}' failed: {}", name, e);
				Err(KeyPoolError::Validation(e))
			}
		}
	}

	/// Validates every key, returning each name with its verdict.
	pub async fn validate_all(&self, fetcher: &dyn CveFetcher) -> Vec<(String, Result<KeyStatus, KeyPoolError>)> {
		let names: Vec<String> = {
			let state = self.state.lock().await;
			state.slots.iter().map(|s| s.key.name.clone()).collect()
		};

		let mut results = Vec::with_capacity(names.len());
		for name in names {
			let verdict = self.validate(&name, fetcher).await;
			results.push((name, verdict));
		}
		results
	}

	/// Picks the next key under budget, round-robin. Invalid and parked keys are
	/// skipped. `retry_after` is when the earliest usable key frees up.
	pub async fn acquire(&self) -> Result<KeyLease, NoKeyAvailable> {
		let now = Instant::now();
		let mut state = self.state.lock().await;
		let len = state.slots.len();

		for offset in 0..len {
			let idx = (state.cursor + offset) % len;
			let slot = &mut state.slots[idx];
			slot.refresh(now, self.window);
			if !slot.usable(self.requests_per_window) {
				continue;
			}

			slot.used_in_window += 1;
			slot.key.total_requests += 1;
			if slot.used_in_window >= self.requests_per_window {
				// Budget spent: sit out the rest of the window.
				slot.parked_until = Some(slot.window_start + self.window);
			}
			let lease = KeyLease {
				name: slot.key.name.clone(),
				secret: slot.key.secret().to_string(),
			};
			state.cursor = (idx + 1) % len;
			return Ok(lease);
		}

		let retry_after = state
			.slots
			.iter()
			.filter(|s| s.key.status != KeyStatus::Invalid)
			.map(|s| s.available_at(self.window).saturating_duration_since(now))
			.min();
		debug!("No API key available, retry after {:?}", retry_after);
		Err(NoKeyAvailable { retry_after })
	}

	/// Records the outcome of a request made with `lease`.
	pub async fn release(&self, lease: KeyLease, outcome: KeyOutcome) {
		let now = Instant::now();
		let mut state = self.state.lock().await;
		let Some(idx) = state.position(&lease.name) else {
			// Removed while the request was in flight.
			return;
		};
		let slot = &mut state.slots[idx];

		match outcome {
			KeyOutcome::Success => {
				if slot.key.status == KeyStatus::Unvalidated {
					slot.key.status = KeyStatus::Valid;
				}
			}
			KeyOutcome::Failure => slot.key.error_count += 1,
			KeyOutcome::RateLimited => {
				slot.key.error_count += 1;
				let reset = slot.window_start + self.window;
				let until = if reset > now { reset } else { now + self.window };
				slot.parked_until = Some(until);
				warn!("API key '{}' was rate limited, parked for {:?}", lease.name, until - now);
			}
			KeyOutcome::Rejected => {
				slot.key.error_count += 1;
				slot.key.status = KeyStatus::Invalid;
				warn!("API key '{}' was rejected by NVD and marked invalid", lease.name);
			}
		}
	}

	/// Inspection view of every key, invalid ones included.
	pub async fn snapshot(&self) -> Vec<KeyInfo> {
		let state = self.state.lock().await;
		state.slots.iter().map(|s| s.key.info()).collect()
	}

	/// Current key state, for persisting counters and status.
	pub async fn keys(&self) -> Vec<ApiKey> {
		let state = self.state.lock().await;
		state.slots.iter().map(|s| s.key.clone()).collect()
	}

	pub async fn is_empty(&self) -> bool {
		self.state.lock().await.slots.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::errors::FetchError;
	use crate::models::cve::{CveId, CveRecord};
	use async_trait::async_trait;
	use std::collections::HashSet;
	use std::sync::Arc;

	struct StaticValidator;

	#[async_trait]
	impl CveFetcher for StaticValidator {
		async fn fetch_cve(&self, _id: &CveId, _api_key: &str) -> Result<CveRecord, FetchError> {
			Err(FetchError::NotFound)
		}

		async fn validate_key(&self, api_key: &str) -> Result<bool, FetchError> {
			match api_key {
				"good" => Ok(true),
				"flaky" => Err(FetchError::Transport("connection reset".into())),
				_ => Ok(false),
			}
		}
	}

	fn pool(budget: u32) -> ApiKeyPool {
		ApiKeyPool::new(budget, Duration::from_secs(30))
	}

	#[tokio::test]
	async fn test_empty_pool_has_no_key() {
		let pool = pool(5);
		let err = pool.acquire().await.unwrap_err();
		assert_eq!(err.retry_after, None);
	}

	#[tokio::test]
	async fn test_add_rejects_duplicates_and_blanks() {
		let pool = pool(5);
		pool.add("a", "secret-a").await.unwrap();
		assert_eq!(pool.add("a", "other").await, Err(KeyPoolError::DuplicateName("a".into())));
		assert_eq!(pool.add(" ", "x").await, Err(KeyPoolError::EmptyField));
		assert_eq!(pool.remove("zzz").await, Err(KeyPoolError::UnknownKey("zzz".into())));
	}

	#[tokio::test]
	async fn test_round_robin() {
		let pool = pool(5);
		pool.add("a", "secret-a").await.unwrap();
		pool.add("b", "secret-b").await.unwrap();

		let mut names = Vec::new();
		for _ in 0..4 {
			let lease = pool.acquire().await.unwrap();
			names.push(lease.name().to_string());
			pool.release(lease, KeyOutcome::Success).await;
		}
		assert_eq!(names, vec!["a", "b", "a", "b"]);
	}

	#[tokio::test(start_paused = true)]
	async fn test_budget_exhaustion_parks_until_window_resets() {
		let pool = pool(2);
		pool.add("a", "secret-a").await.unwrap();

		for _ in 0..2 {
			let lease = pool.acquire().await.unwrap();
			pool.release(lease, KeyOutcome::Success).await;
		}
		let err = pool.acquire().await.unwrap_err();
		let wait = err.retry_after.expect("a parked key has a reset time");
		assert!(wait <= Duration::from_secs(30));

		tokio::time::advance(wait).await;
		assert!(pool.acquire().await.is_ok());
	}

	#[tokio::test(start_paused = true)]
	async fn test_rate_limited_outcome_parks_key() {
		let pool = pool(50);
		pool.add("a", "secret-a").await.unwrap();
		pool.add("b", "secret-b").await.unwrap();

		let lease = pool.acquire().await.unwrap();
		assert_eq!(lease.name(), "a");
		pool.release(lease, KeyOutcome::RateLimited).await;

		for _ in 0..3 {
			let lease = pool.acquire().await.unwrap();
			assert_eq!(lease.name(), "b");
			pool.release(lease, KeyOutcome::Success).await;
		}

		tokio::time::advance(Duration::from_secs(31)).await;
		let names: HashSet<String> = [pool.acquire().await.unwrap(), pool.acquire().await.unwrap()]
			.iter()
			.map(|l| l.name().to_string())
			.collect();
		assert!(names.contains("a"));
	}

	#[tokio::test]
	async fn test_rejected_key_excluded_but_visible() {
		let pool = pool(5);
		pool.add("a", "secret-a").await.unwrap();

		let lease = pool.acquire().await.unwrap();
		pool.release(lease, KeyOutcome::Rejected).await;

		let err = pool.acquire().await.unwrap_err();
		assert_eq!(err.retry_after, None);

		let snapshot = pool.snapshot().await;
		assert_eq!(snapshot.len(), 1);
		assert_eq!(snapshot[0].status, KeyStatus::Invalid);
		assert_eq!(snapshot[0].error_count, 1);
		assert_eq!(snapshot[0].masked_value, "****et-a");
	}

	#[tokio::test]
	async fn test_validate() {
		let pool = pool(5);
		pool.add("good", "good").await.unwrap();
		pool.add("bad", "bad").await.unwrap();
		pool.add("flaky", "flaky").await.unwrap();

		let results = pool.validate_all(&StaticValidator).await;
		assert_eq!(results[0].1, Ok(KeyStatus::Valid));
		assert_eq!(results[1].1, Ok(KeyStatus::Invalid));
		assert!(matches!(results[2].1, Err(KeyPoolError::Validation(FetchError::Transport(_)))));

		let snapshot = pool.snapshot().await;
		assert_eq!(snapshot[2].status, KeyStatus::Unvalidated);
		assert_eq!(snapshot[2].error_count, 1);

		// Only the valid and still-unvalidated keys are handed out.
		let mut seen = HashSet::new();
		for _ in 0..4 {
			let lease = pool.acquire().await.unwrap();
			seen.insert(lease.name().to_string());
			pool.release(lease, KeyOutcome::Success).await;
		}
		assert_eq!(seen, HashSet::from(["good".to_string(), "flaky".to_string()]));
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn test_concurrent_acquire_respects_budget() {
		let pool = Arc::new(pool(10));
		pool.add("a", "secret-a").await.unwrap();
		pool.add("b", "secret-b").await.unwrap();

		let mut handles = Vec::new();
		for _ in 0..50 {
			let pool = pool.clone();
			handles.push(tokio::spawn(async move {
				match pool.acquire().await {
					Ok(lease) => {
						pool.release(lease, KeyOutcome::Success).await;
						true
					}
					Err(_) => false,
				}
			}));
		}

		let mut granted = 0;
		for handle in handles {
			if handle.await.unwrap() {
				granted += 1;
			}
		}
		assert_eq!(granted, 20);

		let total: u64 = pool.snapshot().await.iter().map(|k| k.total_requests).sum();
		assert_eq!(total, 20);
	}
}
