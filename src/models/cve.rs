// src/models/cve.rs

use chrono::{DateTime, NaiveDateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

lazy_static! {
	static ref CVE_ID_PATTERN: Regex = Regex::new(r"^CVE-[0-9]{4}-[0-9]{4,}$").unwrap();
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Invalid CVE identifier: '{0}'")]
pub struct InvalidCveId(pub String);

/// A canonical, upper-case CVE identifier such as `CVE-2021-44228`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CveId(String);

impl CveId {
	/// Trims and upper-cases `raw`, returning `None` unless it is a well-formed identifier.
	pub fn parse(raw: &str) -> Option<Self> {
		let normalized = raw.trim().to_ascii_uppercase();
		if CVE_ID_PATTERN.is_match(&normalized) {
			Some(Self(normalized))
		} else {
			None
		}
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Year and sequence number, used for numeric ordering.
	fn sort_key(&self) -> (u32, u64) {
		let mut parts = self.0[4..].splitn(2, '-');
		let year = parts.next().and_then(|y| y.parse().ok()).unwrap_or(0);
		let seq = parts.next().and_then(|n| n.parse().ok()).unwrap_or(u64::MAX);
		(year, seq)
	}
}

impl Ord for CveId {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		self.sort_key()
			.cmp(&other.sort_key())
			.then_with(|| self.0.cmp(&other.0))
	}
}

impl PartialOrd for CveId {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl fmt::Display for CveId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for CveId {
	type Err = InvalidCveId;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::parse(s).ok_or_else(|| InvalidCveId(s.to_string()))
	}
}

impl TryFrom<String> for CveId {
	type Error = InvalidCveId;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		value.parse()
	}
}

impl From<CveId> for String {
	fn from(id: CveId) -> Self {
		id.0
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CvssVersion {
	#[serde(rename = "3.1")]
	V31,
	#[serde(rename = "3.0")]
	V30,
	#[serde(rename = "2.0")]
	V2,
}

/// Base metrics of the CVSS entry selected for a record. CVSS v2 values are
/// already mapped onto the v3 vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvssMetrics {
	pub version: CvssVersion,
	pub base_score: f64,
	pub base_severity: String,
	pub vector: String,
	pub attack_vector: String,
	pub attack_complexity: String,
	pub privileges_required: String,
	pub user_interaction: String,
	pub confidentiality_impact: String,
	pub integrity_impact: String,
	pub availability_impact: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalMetrics {
	pub score: f64,
	pub vector: String,
}

/// Snapshot of NVD state for one CVE as of retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CveRecord {
	pub id: CveId,
	pub description: Option<String>,
	pub published: Option<NaiveDateTime>,
	pub last_modified: Option<NaiveDateTime>,
	pub cvss: Option<CvssMetrics>,
	pub temporal: Option<TemporalMetrics>,
	pub in_kev: bool,
}

impl CveRecord {
	pub fn base_score(&self) -> Option<f64> {
		self.cvss.as_ref().map(|m| m.base_score)
	}

	pub fn severity(&self) -> &str {
		self.cvss.as_ref().map_or("UNKNOWN", |m| m.base_severity.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
	pub record: CveRecord,
	pub fetched_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_normalizes_case_and_whitespace() {
		let id = CveId::parse("  cve-2021-44228 ").unwrap();
		assert_eq!(id.as_str(), "CVE-2021-44228");
	}

	#[test]
	fn test_parse_rejects_malformed_ids() {
		assert!(CveId::parse("CVE-2021-123").is_none());
		assert!(CveId::parse("CVE-21-1234").is_none());
		assert!(CveId::parse("CWE-2021-1234").is_none());
		assert!(CveId::parse("CVE-2021-1234 extra").is_none());
		assert!(CveId::parse("").is_none());
	}

	#[test]
	fn test_serde_rejects_invalid_id() {
		let ok: CveId = serde_json::from_str("\"cve-2020-0601\"").unwrap();
		assert_eq!(ok.to_string(), "CVE-2020-0601");
		assert!(serde_json::from_str::<CveId>("\"not-a-cve\"").is_err());
	}

	#[test]
	fn test_ids_order_by_year_then_sequence() {
		let mut ids: Vec<CveId> = ["CVE-2022-0002", "CVE-2021-10000", "CVE-2021-9999", "CVE-2022-0001"]
			.iter()
			.map(|s| s.parse().unwrap())
			.collect();
		ids.sort();
		let sorted: Vec<&str> = ids.iter().map(CveId::as_str).collect();
		assert_eq!(sorted, vec!["CVE-2021-9999", "CVE-2021-10000", "CVE-2022-0001", "CVE-2022-0002"]);
	}
}
