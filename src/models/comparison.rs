// src/models/comparison.rs

use crate::models::cve::CveId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KevTransition {
	Listed,
	Delisted,
	Unchanged,
}

impl KevTransition {
	pub fn between(before: bool, after: bool) -> Self {
		match (before, after) {
			(false, true) => KevTransition::Listed,
			(true, false) => KevTransition::Delisted,
			_ => KevTransition::Unchanged,
		}
	}
}

/// Metric change for an identifier present in both scans. `NoData` means at
/// least one side lacks a record, which is not the same as a zero delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricDelta {
	NoData,
	Computed {
		score_before: Option<f64>,
		score_after: Option<f64>,
		/// `None` when either record carries no CVSS metrics.
		score_delta: Option<f64>,
		kev: KevTransition,
	},
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommonEntry {
	pub id: CveId,
	pub delta: MetricDelta,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricDistribution {
	pub severity: BTreeMap<String, usize>,
	pub attack_vector: BTreeMap<String, usize>,
	pub attack_complexity: BTreeMap<String, usize>,
	pub privileges_required: BTreeMap<String, usize>,
	pub user_interaction: BTreeMap<String, usize>,
	pub confidentiality_impact: BTreeMap<String, usize>,
	pub integrity_impact: BTreeMap<String, usize>,
	pub availability_impact: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSummary {
	pub name: String,
	pub imported_at: DateTime<Utc>,
	pub total_occurrences: usize,
	/// Counts below are per distinct identifier.
	pub unique: usize,
	pub resolved: usize,
	pub absent: usize,
	pub kev_count: usize,
	/// Share of `unique` that resolved.
	pub resolved_percentage: f64,
	/// Shares of `resolved`.
	pub kev_percentage: f64,
	pub severity_percentages: BTreeMap<String, f64>,
	pub distribution: MetricDistribution,
}

/// Structural diff of two resolved scans. All identifier lists are sorted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
	pub baseline: ScanSummary,
	pub target: ScanSummary,
	pub added: Vec<CveId>,
	pub removed: Vec<CveId>,
	pub common: Vec<CommonEntry>,
	pub absent_in_baseline: Vec<CveId>,
	pub absent_in_target: Vec<CveId>,
	/// `added` minus `removed`.
	pub net_change: i64,
}

/// One scan's figures as a percentage of the reference scan's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRelation {
	pub name: String,
	pub unique: f64,
	pub kev: f64,
	pub severity: BTreeMap<String, f64>,
}

/// Totals and leaders across a set of scans; the first scan is the reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScansAggregate {
	pub scans: Vec<String>,
	pub total_occurrences: usize,
	pub total_unique: usize,
	pub total_resolved: usize,
	pub total_kev: usize,
	/// Scan with the most unique identifiers; `None` when every scan is empty.
	pub most_unique: Option<String>,
	pub most_kev: Option<String>,
	pub most_by_severity: BTreeMap<String, String>,
	pub relative_to_reference: Vec<ScanRelation>,
}
