// src/services/comparison.rs

use crate::models::comparison::{
	CommonEntry, ComparisonResult, KevTransition, MetricDelta, MetricDistribution, ScanRelation, ScanSummary,
	ScansAggregate,
};
use crate::models::cve::{CveId, CveRecord};
use crate::models::scan::ResolvedScan;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// `count` as a share of `total`, in percent with one decimal. Zero for an
/// empty total. `count` may exceed `total` when relating two scans.
pub fn percentage(count: usize, total: usize) -> f64 {
	if total == 0 {
		return 0.0;
	}
	((count as f64 / total as f64) * 1000.0).round() / 10.0
}

fn round_score(value: f64) -> f64 {
	(value * 10.0).round() / 10.0
}

fn bump(map: &mut BTreeMap<String, usize>, value: &str) {
	*map.entry(value.to_string()).or_insert(0) += 1;
}

pub fn summarize(scan: &ResolvedScan) -> ScanSummary {
	let mut distribution = MetricDistribution::default();
	let mut seen = HashSet::with_capacity(scan.entries.len());
	let mut unique = 0;
	let mut resolved = 0;
	let mut kev_count = 0;

	for entry in &scan.entries {
		if !seen.insert(&entry.id) {
			continue;
		}
		unique += 1;
		let Some(record) = entry.record() else {
			continue;
		};
		resolved += 1;
		if record.in_kev {
			kev_count += 1;
		}
		bump(&mut distribution.severity, record.severity());
		if let Some(cvss) = &record.cvss {
			bump(&mut distribution.attack_vector, &cvss.attack_vector);
			bump(&mut distribution.attack_complexity, &cvss.attack_complexity);
			bump(&mut distribution.privileges_required, &cvss.privileges_required);
			bump(&mut distribution.user_interaction, &cvss.user_interaction);
			bump(&mut distribution.confidentiality_impact, &cvss.confidentiality_impact);
			bump(&mut distribution.integrity_impact, &cvss.integrity_impact);
			bump(&mut distribution.availability_impact, &cvss.availability_impact);
		}
	}

	let severity_percentages = distribution
		.severity
		.iter()
		.map(|(severity, count)| (severity.clone(), percentage(*count, resolved)))
		.collect();

	ScanSummary {
		name: scan.scan.name.clone(),
		imported_at: scan.scan.imported_at,
		total_occurrences: scan.scan.total_occurrences,
		unique,
		resolved,
		absent: unique - resolved,
		kev_count,
		resolved_percentage: percentage(resolved, unique),
		kev_percentage: percentage(kev_count, resolved),
		severity_percentages,
		distribution,
	}
}

fn metric_delta(before: Option<&CveRecord>, after: Option<&CveRecord>) -> MetricDelta {
	match (before, after) {
		(Some(before), Some(after)) => {
			let score_before = before.base_score();
			let score_after = after.base_score();
			MetricDelta::Computed {
				score_before,
				score_after,
				score_delta: score_before
					.zip(score_after)
					.map(|(b, a)| round_score(a - b)),
				kev: KevTransition::between(before.in_kev, after.in_kev),
			}
		}
		_ => MetricDelta::NoData,
	}
}

/// Diffs `target` against `baseline`. Output lists are sorted by identifier,
/// so equal inputs always give equal results.
pub fn compare(baseline: &ResolvedScan, target: &ResolvedScan) -> ComparisonResult {
	let before: BTreeSet<&CveId> = baseline.ids().collect();
	let after: BTreeSet<&CveId> = target.ids().collect();
	let records_before = baseline.records_by_id();
	let records_after = target.records_by_id();

	let added: Vec<CveId> = after.difference(&before).map(|id| (*id).clone()).collect();
	let removed: Vec<CveId> = before.difference(&after).map(|id| (*id).clone()).collect();
	let net_change = added.len() as i64 - removed.len() as i64;
	let common = before
		.intersection(&after)
		.map(|id| CommonEntry {
			id: (*id).clone(),
			delta: metric_delta(
				records_before.get(id).copied().flatten(),
				records_after.get(id).copied().flatten(),
			),
		})
		.collect();

	let sorted_absent = |scan: &ResolvedScan| -> Vec<CveId> {
		scan.absent_ids()
			.into_iter()
			.cloned()
			.collect::<BTreeSet<_>>()
			.into_iter()
			.collect()
	};

	ComparisonResult {
		baseline: summarize(baseline),
		target: summarize(target),
		added,
		removed,
		common,
		absent_in_baseline: sorted_absent(baseline),
		absent_in_target: sorted_absent(target),
		net_change,
	}
}

/// Compares every scan in `others` against the same baseline.
pub fn compare_to_baseline(baseline: &ResolvedScan, others: &[ResolvedScan]) -> Vec<ComparisonResult> {
	others.iter().map(|scan| compare(baseline, scan)).collect()
}

/// Compares consecutive scans in the given order, for trend views.
pub fn compare_pairwise(scans: &[ResolvedScan]) -> Vec<ComparisonResult> {
	scans.windows(2).map(|pair| compare(&pair[0], &pair[1])).collect()
}

/// Name of the scan with the strictly greatest nonzero value. Ties keep the
/// earlier scan.
fn leader<F>(summaries: &[ScanSummary], value: F) -> Option<String>
where
	F: Fn(&ScanSummary) -> usize,
{
	let mut best: Option<(&ScanSummary, usize)> = None;
	for summary in summaries {
		let v = value(summary);
		if v > best.map_or(0, |(_, b)| b) {
			best = Some((summary, v));
		}
	}
	best.map(|(summary, _)| summary.name.clone())
}

fn severity_count(summary: &ScanSummary, severity: &str) -> usize {
	summary.distribution.severity.get(severity).copied().unwrap_or(0)
}

/// Totals across `scans`, which scan leads each figure, and every scan
/// related to the first one.
pub fn aggregate(scans: &[ResolvedScan]) -> ScansAggregate {
	let summaries: Vec<ScanSummary> = scans.iter().map(summarize).collect();

	let severities: BTreeSet<&String> = summaries
		.iter()
		.flat_map(|s| s.distribution.severity.keys())
		.collect();
	let most_by_severity = severities
		.iter()
		.filter_map(|severity| {
			leader(&summaries, |s| severity_count(s, severity)).map(|name| ((*severity).clone(), name))
		})
		.collect();

	let relative_to_reference = match summaries.first() {
		Some(reference) => summaries
			.iter()
			.map(|s| ScanRelation {
				name: s.name.clone(),
				unique: percentage(s.unique, reference.unique),
				kev: percentage(s.kev_count, reference.kev_count),
				severity: severities
					.iter()
					.map(|severity| {
						(
							(*severity).clone(),
							percentage(severity_count(s, severity), severity_count(reference, severity)),
						)
					})
					.collect(),
			})
			.collect(),
		None => Vec::new(),
	};

	ScansAggregate {
		scans: summaries.iter().map(|s| s.name.clone()).collect(),
		total_occurrences: summaries.iter().map(|s| s.total_occurrences).sum(),
		total_unique: summaries.iter().map(|s| s.unique).sum(),
		total_resolved: summaries.iter().map(|s| s.resolved).sum(),
		total_kev: summaries.iter().map(|s| s.kev_count).sum(),
		most_unique: leader(&summaries, |s| s.unique),
		most_kev: leader(&summaries, |s| s.kev_count),
		most_by_severity,
		relative_to_reference,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::models::cve::{CvssMetrics, CvssVersion};
	use crate::models::scan::{
		AbsenceReason, Resolution, ResolutionReport, ResolutionSource, ResolvedEntry, ScanImport,
	};
	use std::collections::HashSet;

	fn record(id: &str, score: f64, severity: &str, in_kev: bool) -> CveRecord {
		CveRecord {
			id: id.parse().unwrap(),
			description: None,
			published: None,
			last_modified: None,
			cvss: Some(CvssMetrics {
				version: CvssVersion::V31,
				base_score: score,
				base_severity: severity.to_string(),
				vector: String::new(),
				attack_vector: "NETWORK".to_string(),
				attack_complexity: "LOW".to_string(),
				privileges_required: "NONE".to_string(),
				user_interaction: "NONE".to_string(),
				confidentiality_impact: "HIGH".to_string(),
				integrity_impact: "LOW".to_string(),
				availability_impact: "NONE".to_string(),
			}),
			temporal: None,
			in_kev,
		}
	}

	/// `None` marks the identifier absent.
	fn resolved(name: &str, entries: Vec<(&str, Option<CveRecord>)>) -> ResolvedScan {
		let ids = entries.iter().map(|(id, _)| id.parse().unwrap()).collect();
		let entries = entries
			.into_iter()
			.map(|(id, record)| ResolvedEntry {
				id: id.parse().unwrap(),
				resolution: match record {
					Some(record) => Resolution::Resolved {
						record,
						source: ResolutionSource::Cache,
					},
					None => Resolution::Absent {
						reason: AbsenceReason::NotFound,
					},
				},
			})
			.collect();
		ResolvedScan {
			scan: ScanImport::new(name.to_string(), ids, true),
			entries,
			report: ResolutionReport::default(),
		}
	}

	fn ids(list: &[CveId]) -> Vec<&str> {
		list.iter().map(|i| i.as_str()).collect()
	}

	#[test]
	fn test_added_removed_common() {
		let a = resolved(
			"a",
			vec![
				("CVE-2021-0001", Some(record("CVE-2021-0001", 5.0, "MEDIUM", false))),
				("CVE-2021-0002", Some(record("CVE-2021-0002", 7.5, "HIGH", false))),
			],
		);
		let b = resolved(
			"b",
			vec![
				("CVE-2021-0002", Some(record("CVE-2021-0002", 9.8, "CRITICAL", true))),
				("CVE-2021-0003", Some(record("CVE-2021-0003", 4.0, "MEDIUM", false))),
			],
		);

		let result = compare(&a, &b);

		assert_eq!(ids(&result.added), vec!["CVE-2021-0003"]);
		assert_eq!(ids(&result.removed), vec!["CVE-2021-0001"]);
		assert_eq!(result.common.len(), 1);
		assert_eq!(result.common[0].id.as_str(), "CVE-2021-0002");
		assert_eq!(
			result.common[0].delta,
			MetricDelta::Computed {
				score_before: Some(7.5),
				score_after: Some(9.8),
				score_delta: Some(2.3),
				kev: KevTransition::Listed,
			}
		);
		assert_eq!(result.net_change, 0);
	}

	#[test]
	fn test_absent_identifiers_have_no_delta() {
		let a = resolved(
			"a",
			vec![
				("CVE-2022-0001", None),
				("CVE-2022-0002", Some(record("CVE-2022-0002", 6.0, "MEDIUM", true))),
			],
		);
		let b = resolved(
			"b",
			vec![
				("CVE-2022-0001", Some(record("CVE-2022-0001", 6.0, "MEDIUM", false))),
				("CVE-2022-0002", Some(record("CVE-2022-0002", 6.0, "MEDIUM", false))),
			],
		);

		let result = compare(&a, &b);

		assert_eq!(result.common.len(), 2);
		assert_eq!(result.common[0].delta, MetricDelta::NoData);
		assert_eq!(
			result.common[1].delta,
			MetricDelta::Computed {
				score_before: Some(6.0),
				score_after: Some(6.0),
				score_delta: Some(0.0),
				kev: KevTransition::Delisted,
			}
		);
		assert_eq!(ids(&result.absent_in_baseline), vec!["CVE-2022-0001"]);
		assert!(result.absent_in_target.is_empty());
	}

	#[test]
	fn test_missing_cvss_gives_undefined_score_delta() {
		let mut unscored = record("CVE-2023-0001", 0.0, "NONE", false);
		unscored.cvss = None;
		let a = resolved("a", vec![("CVE-2023-0001", Some(unscored))]);
		let b = resolved("b", vec![("CVE-2023-0001", Some(record("CVE-2023-0001", 8.0, "HIGH", false)))]);

		match &compare(&a, &b).common[0].delta {
			MetricDelta::Computed { score_delta, score_after, .. } => {
				assert_eq!(*score_delta, None);
				assert_eq!(*score_after, Some(8.0));
			}
			other => panic!("unexpected delta {:?}", other),
		}
	}

	#[test]
	fn test_partition_is_exhaustive_disjoint_and_sorted() {
		let a = resolved(
			"a",
			vec![
				("CVE-2020-10000", None),
				("CVE-2020-0005", None),
				("CVE-2019-0001", None),
				("CVE-2021-0001", None),
			],
		);
		let b = resolved(
			"b",
			vec![("CVE-2021-0001", None), ("CVE-2020-0005", None), ("CVE-2018-0001", None)],
		);

		let result = compare(&a, &b);

		let added: HashSet<_> = result.added.iter().collect();
		let removed: HashSet<_> = result.removed.iter().collect();
		let common: HashSet<_> = result.common.iter().map(|c| &c.id).collect();
		assert!(added.is_disjoint(&removed));
		assert!(added.is_disjoint(&common));
		assert!(removed.is_disjoint(&common));

		let union: HashSet<_> = added.union(&removed).chain(common.iter()).cloned().collect();
		let expected: HashSet<_> = a.ids().chain(b.ids()).collect();
		assert_eq!(union, expected);

		assert_eq!(ids(&result.removed), vec!["CVE-2019-0001", "CVE-2020-10000"]);
		assert_eq!(compare(&a, &b), result);
	}

	#[test]
	fn test_summary_distribution() {
		let scan = resolved(
			"q3",
			vec![
				("CVE-2024-0001", Some(record("CVE-2024-0001", 9.8, "CRITICAL", true))),
				("CVE-2024-0002", Some(record("CVE-2024-0002", 7.5, "HIGH", false))),
				("CVE-2024-0003", Some(record("CVE-2024-0003", 8.1, "HIGH", false))),
				("CVE-2024-0004", None),
			],
		);

		let summary = summarize(&scan);

		assert_eq!(summary.unique, 4);
		assert_eq!(summary.resolved, 3);
		assert_eq!(summary.absent, 1);
		assert_eq!(summary.kev_count, 1);
		assert_eq!(summary.distribution.severity.get("HIGH"), Some(&2));
		assert_eq!(summary.distribution.attack_vector.get("NETWORK"), Some(&3));
		assert_eq!(summary.resolved_percentage, 75.0);
		assert_eq!(summary.kev_percentage, 33.3);
		assert_eq!(summary.severity_percentages.get("HIGH"), Some(&66.7));
		assert_eq!(summary.severity_percentages.get("CRITICAL"), Some(&33.3));
		assert_eq!(percentage(2, 3), 66.7);
		assert_eq!(percentage(0, 0), 0.0);
	}

	#[test]
	fn test_summary_counts_repeated_identifiers_once() {
		let mut scan = resolved(
			"dupes",
			vec![
				("CVE-2024-0001", Some(record("CVE-2024-0001", 9.8, "CRITICAL", true))),
				("CVE-2024-0002", None),
			],
		);
		// The same identifier reported at a second position.
		let repeat = scan.entries[0].clone();
		scan.entries.push(repeat);

		let summary = summarize(&scan);

		assert_eq!(summary.unique, 2);
		assert_eq!(summary.resolved, 1);
		assert_eq!(summary.absent, 1);
		assert_eq!(summary.kev_count, 1);
		assert_eq!(summary.distribution.severity.get("CRITICAL"), Some(&1));
		assert_eq!(summary.resolved_percentage, 50.0);
	}

	#[test]
	fn test_net_change_counts_added_minus_removed() {
		let a = resolved("a", vec![("CVE-2021-0001", None)]);
		let b = resolved(
			"b",
			vec![("CVE-2021-0002", None), ("CVE-2021-0003", None), ("CVE-2021-0004", None)],
		);

		assert_eq!(compare(&a, &b).net_change, 2);
		assert_eq!(compare(&b, &a).net_change, -2);
		let rendered = serde_json::to_value(compare(&a, &b)).unwrap();
		assert_eq!(rendered["net_change"], 2);
	}

	#[test]
	fn test_aggregate_totals_leaders_and_relations() {
		let scans = vec![
			resolved(
				"jan",
				vec![
					("CVE-2021-0001", Some(record("CVE-2021-0001", 9.8, "CRITICAL", true))),
					("CVE-2021-0002", Some(record("CVE-2021-0002", 7.5, "HIGH", false))),
				],
			),
			resolved(
				"feb",
				vec![
					("CVE-2021-0002", Some(record("CVE-2021-0002", 7.5, "HIGH", false))),
					("CVE-2021-0003", Some(record("CVE-2021-0003", 8.1, "HIGH", false))),
					("CVE-2021-0004", None),
				],
			),
		];

		let totals = aggregate(&scans);

		assert_eq!(totals.scans, vec!["jan", "feb"]);
		assert_eq!(totals.total_unique, 5);
		assert_eq!(totals.total_resolved, 4);
		assert_eq!(totals.total_kev, 1);
		assert_eq!(totals.most_unique.as_deref(), Some("feb"));
		assert_eq!(totals.most_kev.as_deref(), Some("jan"));
		assert_eq!(totals.most_by_severity.get("HIGH").map(String::as_str), Some("feb"));
		assert_eq!(totals.most_by_severity.get("CRITICAL").map(String::as_str), Some("jan"));

		let feb = &totals.relative_to_reference[1];
		assert_eq!(feb.name, "feb");
		assert_eq!(feb.unique, 150.0);
		assert_eq!(feb.kev, 0.0);
		assert_eq!(feb.severity.get("HIGH"), Some(&200.0));
		assert_eq!(totals.relative_to_reference[0].unique, 100.0);
	}

	#[test]
	fn test_aggregate_of_empty_scans_has_no_leaders() {
		let scans = vec![resolved("a", vec![]), resolved("b", vec![])];

		let totals = aggregate(&scans);

		assert_eq!(totals.total_unique, 0);
		assert_eq!(totals.most_unique, None);
		assert_eq!(totals.most_kev, None);
		assert!(totals.most_by_severity.is_empty());
		assert_eq!(totals.relative_to_reference[1].unique, 0.0);
		assert!(aggregate(&[]).relative_to_reference.is_empty());
	}

	#[test]
	fn test_n_scan_comparisons() {
		let scans = vec![
			resolved("jan", vec![("CVE-2021-0001", None)]),
			resolved("feb", vec![("CVE-2021-0001", None), ("CVE-2021-0002", None)]),
			resolved("mar", vec![("CVE-2021-0002", None)]),
		];

		let baseline = compare_to_baseline(&scans[0], &scans[1..]);
		assert_eq!(baseline.len(), 2);
		assert_eq!(baseline[1].target.name, "mar");
		assert_eq!(ids(&baseline[1].removed), vec!["CVE-2021-0001"]);

		let trend = compare_pairwise(&scans);
		assert_eq!(trend.len(), 2);
		assert_eq!(trend[0].baseline.name, "jan");
		assert_eq!(trend[1].baseline.name, "feb");
		assert_eq!(ids(&trend[1].removed), vec!["CVE-2021-0001"]);
		assert!(compare_pairwise(&scans[..1]).is_empty());
	}
}
