// src/errors.rs

use std::time::Duration;
use thiserror::Error;

/// File-level failures while pulling CVE identifiers out of a scanner export.
#[derive(Error, Debug)]
pub enum ExtractionError {
	#[error("CSV content is empty")]
	Empty,

	#[error("No column containing CVE identifiers was found")]
	NoCveColumnFound,

	#[error("Malformed CSV: {0}")]
	Csv(#[from] csv::Error),

	#[error("Failed to read scan file: {0}")]
	Io(#[from] std::io::Error),
}

/// Per-identifier failures reported by a `CveFetcher`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
	#[error("CVE not found in NVD")]
	NotFound,

	#[error("Rate limited by NVD")]
	RateLimited,

	#[error("API key rejected by NVD")]
	Unauthorized,

	#[error("Transport error: {0}")]
	Transport(String),

	#[error("Malformed NVD response: {0}")]
	MalformedResponse(String),

	#[error("Unexpected NVD status: {0}")]
	UnexpectedStatus(u16),
}

impl FetchError {
	/// Whether another attempt (possibly with another key) may succeed.
	pub fn is_retryable(&self) -> bool {
		match self {
			FetchError::RateLimited | FetchError::Unauthorized | FetchError::Transport(_) => true,
			FetchError::UnexpectedStatus(status) => *status >= 500,
			FetchError::NotFound | FetchError::MalformedResponse(_) => false,
		}
	}
}

impl From<reqwest::Error> for FetchError {
	fn from(err: reqwest::Error) -> Self {
		if err.is_decode() {
			FetchError::MalformedResponse(err.to_string())
		} else {
			FetchError::Transport(err.to_string())
		}
	}
}

/// Returned by the key pool when every key is parked or the pool is empty.
/// Callers back off and retry; this is never fatal on its own.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("No NVD API key available")]
pub struct NoKeyAvailable {
	pub retry_after: Option<Duration>,
}

/// Pool configuration mistakes, surfaced to the caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KeyPoolError {
	#[error("Key name or value cannot be empty")]
	EmptyField,

	#[error("An API key named '{0}' already exists")]
	DuplicateName(String),

	#[error("No API key named '{0}'")]
	UnknownKey(String),

	#[error("Could not validate key: {0}")]
	Validation(FetchError),
}
