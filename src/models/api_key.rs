// src/models/api_key.rs

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
	Unvalidated,
	Valid,
	Invalid,
}

impl KeyStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			KeyStatus::Unvalidated => "unvalidated",
			KeyStatus::Valid => "valid",
			KeyStatus::Invalid => "invalid",
		}
	}

	/// Unknown values read back from the database fall back to `Unvalidated`.
	pub fn from_db(value: &str) -> Self {
		match value.to_ascii_lowercase().as_str() {
			"valid" => KeyStatus::Valid,
			"invalid" => KeyStatus::Invalid,
			_ => KeyStatus::Unvalidated,
		}
	}
}

impl fmt::Display for KeyStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// An NVD API key and its bookkeeping. The secret never appears in `Debug`
/// output or in serialized snapshots.
#[derive(Clone)]
pub struct ApiKey {
	pub name: String,
	secret: String,
	pub status: KeyStatus,
	pub error_count: u32,
	pub total_requests: u64,
}

impl ApiKey {
	pub fn new(name: String, secret: String) -> Self {
		Self {
			name,
			secret,
			status: KeyStatus::Unvalidated,
			error_count: 0,
			total_requests: 0,
		}
	}

	pub(crate) fn secret(&self) -> &str {
		&self.secret
	}

	/// Last four characters of the secret, for display.
	pub fn masked(&self) -> String {
		let tail: String = self
			.secret
			.chars()
			.rev()
			.take(4)
			.collect::<Vec<_>>()
			.into_iter()
			.rev()
			.collect();
		format!("****{}", tail)
	}

	pub fn info(&self) -> KeyInfo {
		KeyInfo {
			name: self.name.clone(),
			masked_value: self.masked(),
			status: self.status,
			error_count: self.error_count,
			total_requests: self.total_requests,
		}
	}
}

impl fmt::Debug for ApiKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ApiKey")
			.field("name", &self.name)
			.field("secret", &self.masked())
			.field("status", &self.status)
			.field("error_count", &self.error_count)
			.field("total_requests", &self.total_requests)
			.finish()
	}
}

/// Inspection view of a pooled key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyInfo {
	pub name: String,
	pub masked_value: String,
	pub status: KeyStatus,
	pub error_count: u32,
	pub total_requests: u64,
}

/// What happened to a request made with a leased key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOutcome {
	Success,
	Failure,
	RateLimited,
	Rejected,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_debug_redacts_secret() {
		let key = ApiKey::new("primary".to_string(), "abcdef-123456-7890".to_string());
		let debug = format!("{:?}", key);
		assert!(!debug.contains("abcdef-123456"));
		assert!(debug.contains("****7890"));
	}

	#[test]
	fn test_status_round_trip() {
		for status in [KeyStatus::Unvalidated, KeyStatus::Valid, KeyStatus::Invalid] {
			assert_eq!(KeyStatus::from_db(status.as_str()), status);
		}
		assert_eq!(KeyStatus::from_db("Valid"), KeyStatus::Valid);
		assert_eq!(KeyStatus::from_db("garbage"), KeyStatus::Unvalidated);
	}

	#[test]
	fn test_masked_short_secret() {
		let key = ApiKey::new("tiny".to_string(), "ab".to_string());
		assert_eq!(key.masked(), "****ab");
	}
}
