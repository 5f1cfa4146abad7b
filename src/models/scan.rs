// src/models/scan.rs

use crate::models::cve::{CveId, CveRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Ordered CVE identifiers drawn from one scanner export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanImport {
	pub name: String,
	pub source_path: Option<String>,
	pub cve_ids: Vec<CveId>,
	pub total_occurrences: usize,
	pub caching_enabled: bool,
	pub imported_at: DateTime<Utc>,
}

impl ScanImport {
	pub fn new(name: String, cve_ids: Vec<CveId>, caching_enabled: bool) -> Self {
		let total_occurrences = cve_ids.len();
		Self {
			name,
			source_path: None,
			cve_ids,
			total_occurrences,
			caching_enabled,
			imported_at: Utc::now(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
	Cache,
	Network,
	/// A stale cache entry served because the refetch failed.
	StaleCache,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum AbsenceReason {
	NotFound,
	MalformedResponse(String),
	RetriesExhausted(String),
	Rejected(String),
	/// Every key is invalid or the pool is empty.
	NoUsableKey,
	Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Resolution {
	Resolved {
		record: CveRecord,
		source: ResolutionSource,
	},
	Absent {
		reason: AbsenceReason,
	},
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedEntry {
	pub id: CveId,
	pub resolution: Resolution,
}

impl ResolvedEntry {
	pub fn record(&self) -> Option<&CveRecord> {
		match &self.resolution {
			Resolution::Resolved { record, .. } => Some(record),
			Resolution::Absent { .. } => None,
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolutionReport {
	pub cache_hits: usize,
	pub fetched: usize,
	pub stale_served: usize,
	pub corrupt_cache_entries: Vec<CveId>,
	pub absent: Vec<(CveId, AbsenceReason)>,
	pub cancelled: bool,
}

/// A scan with every identifier either resolved or explicitly absent, in the
/// order of the originating import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedScan {
	pub scan: ScanImport,
	pub entries: Vec<ResolvedEntry>,
	pub report: ResolutionReport,
}

impl ResolvedScan {
	pub fn ids(&self) -> impl Iterator<Item = &CveId> {
		self.entries.iter().map(|e| &e.id)
	}

	/// Identifier to record lookup; absent identifiers map to `None`.
	pub fn records_by_id(&self) -> HashMap<&CveId, Option<&CveRecord>> {
		self.entries.iter().map(|e| (&e.id, e.record())).collect()
	}

	pub fn absent_ids(&self) -> Vec<&CveId> {
		self.entries
			.iter()
			.filter(|e| e.record().is_none())
			.map(|e| &e.id)
			.collect()
	}
}
