// src/utils/kev.rs

use crate::models::cve::CveId;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

/// Set-membership query against a Known Exploited Vulnerabilities snapshot.
pub trait KevLookup: Send + Sync {
	fn contains(&self, id: &CveId) -> bool;
}

// CISA KEV feed layout
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CisaKevFeed {
	catalog_version: Option<String>,
	date_released: Option<String>,
	vulnerabilities: Vec<CisaKevEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CisaKevEntry {
	#[serde(rename = "cveID")]
	cve_id: String,
}

/// An immutable KEV snapshot.
#[derive(Debug, Clone, Default)]
pub struct KevCatalog {
	ids: HashSet<CveId>,
	pub catalog_version: Option<String>,
	pub date_released: Option<String>,
}

impl KevCatalog {
	pub fn empty() -> Self {
		Self::default()
	}

	pub fn from_ids<I: IntoIterator<Item = CveId>>(ids: I) -> Self {
		Self {
			ids: ids.into_iter().collect(),
			..Self::default()
		}
	}

	/// Parses the CISA `known_exploited_vulnerabilities.json` feed.
	pub fn from_cisa_json(raw: &str) -> Result<Self> {
		let feed: CisaKevFeed = serde_json::from_str(raw).context("Failed to parse KEV catalog")?;

		let mut ids = HashSet::with_capacity(feed.vulnerabilities.len());
		for entry in feed.vulnerabilities {
			match CveId::parse(&entry.cve_id) {
				Some(id) => {
					ids.insert(id);
				}
				None => warn!("Ignoring malformed KEV entry: {}", entry.cve_id),
			}
		}

		info!(
			"Loaded KEV catalog {} with {} entries",
			feed.catalog_version.as_deref().unwrap_or("(unversioned)"),
			ids.len()
		);
		Ok(Self {
			ids,
			catalog_version: feed.catalog_version,
			date_released: feed.date_released,
		})
	}

	pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		debug!("Reading KEV catalog from {}", path.display());
		let raw = tokio::fs::read_to_string(path)
			.await
			.with_context(|| format!("Failed to read KEV catalog {}", path.display()))?;
		Self::from_cisa_json(&raw)
	}

	pub async fn fetch(client: &reqwest::Client, url: &str) -> Result<Self> {
		info!("Downloading KEV catalog from {}", url);
		let raw = client
			.get(url)
			.send()
			.await
			.context("Failed to fetch KEV catalog")?
			.error_for_status()
			.context("KEV catalog request was rejected")?
			.text()
			.await
			.context("Failed to read KEV catalog body")?;
		Self::from_cisa_json(&raw)
	}

	pub fn len(&self) -> usize {
		self.ids.len()
	}

	pub fn is_empty(&self) -> bool {
		self.ids.is_empty()
	}
}

impl KevLookup for KevCatalog {
	fn contains(&self, id: &CveId) -> bool {
		self.ids.contains(id)
	}
}
