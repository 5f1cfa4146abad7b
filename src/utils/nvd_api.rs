// src/utils/nvd_api.rs

use crate::config::NvdConfig;
use crate::errors::FetchError;
use crate::models::cve::{CveId, CveRecord, CvssMetrics, CvssVersion, TemporalMetrics};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Response, StatusCode};
use serde::Deserialize;

const API_KEY_HEADER: &str = "apiKey";

/// Network capability used by the retrieval coordinator and the key pool.
#[async_trait]
pub trait CveFetcher: Send + Sync {
	async fn fetch_cve(&self, id: &CveId, api_key: &str) -> Result<CveRecord, FetchError>;

	/// `Ok(false)` when NVD rejects the key; `Err` when the answer is unknown.
	async fn validate_key(&self, api_key: &str) -> Result<bool, FetchError>;
}

#[derive(Debug, Deserialize)]
struct NvdApiResponse {
	#[serde(default)]
	vulnerabilities: Vec<NvdVulnerability>,
}

#[derive(Debug, Deserialize)]
struct NvdVulnerability {
	cve: NvdCve,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NvdCve {
	id: String,
	published: Option<String>,
	last_modified: Option<String>,
	#[serde(default)]
	descriptions: Vec<NvdDescription>,
	metrics: Option<NvdMetrics>,
}

#[derive(Debug, Deserialize)]
struct NvdDescription {
	lang: String,
	value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NvdMetrics {
	cvss_metric_v31: Option<Vec<CvssMetricV3>>,
	cvss_metric_v30: Option<Vec<CvssMetricV3>>,
	cvss_metric_v2: Option<Vec<CvssMetricV2>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CvssMetricV3 {
	#[serde(rename = "type")]
	metric_type: Option<String>,
	cvss_data: CvssDataV3,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CvssDataV3 {
	base_score: f64,
	#[serde(default)]
	base_severity: String,
	#[serde(default)]
	vector_string: String,
	#[serde(default)]
	attack_vector: String,
	#[serde(default)]
	attack_complexity: String,
	#[serde(default)]
	privileges_required: String,
	#[serde(default)]
	user_interaction: String,
	#[serde(default)]
	confidentiality_impact: String,
	#[serde(default)]
	integrity_impact: String,
	#[serde(default)]
	availability_impact: String,
	temporal_score: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CvssMetricV2 {
	#[serde(rename = "type")]
	metric_type: Option<String>,
	cvss_data: CvssDataV2,
	base_severity: Option<String>,
	user_interaction_required: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CvssDataV2 {
	base_score: f64,
	#[serde(default)]
	vector_string: String,
	#[serde(default)]
	access_vector: String,
	#[serde(default)]
	access_complexity: String,
	#[serde(default)]
	authentication: String,
	#[serde(default)]
	confidentiality_impact: String,
	#[serde(default)]
	integrity_impact: String,
	#[serde(default)]
	availability_impact: String,
	temporal_score: Option<f64>,
}

trait TypedMetric {
	fn metric_type(&self) -> Option<&str>;
}

impl TypedMetric for CvssMetricV3 {
	fn metric_type(&self) -> Option<&str> {
		self.metric_type.as_deref()
	}
}

impl TypedMetric for CvssMetricV2 {
	fn metric_type(&self) -> Option<&str> {
		self.metric_type.as_deref()
	}
}

/// The NVD-scored (`Primary`) entry when present, otherwise the first one.
fn primary_or_first<T: TypedMetric>(metrics: &Option<Vec<T>>) -> Option<&T> {
	let metrics = metrics.as_ref()?;
	metrics
		.iter()
		.find(|m| m.metric_type().map_or(false, |t| t.eq_ignore_ascii_case("Primary")))
		.or_else(|| metrics.first())
}

fn map_v2_impact(value: &str) -> String {
	match value.to_ascii_uppercase().as_str() {
		"PARTIAL" => "LOW".to_string(),
		"COMPLETE" => "HIGH".to_string(),
		other => other.to_string(),
	}
}

fn from_v3(metric: &CvssMetricV3, version: CvssVersion) -> (CvssMetrics, Option<TemporalMetrics>) {
	let data = &metric.cvss_data;
	let temporal = data.temporal_score.map(|score| TemporalMetrics {
		score,
		vector: data.vector_string.clone(),
	});
	(
		CvssMetrics {
			version,
			base_score: data.base_score,
			base_severity: data.base_severity.to_uppercase(),
			vector: data.vector_string.clone(),
			attack_vector: data.attack_vector.to_uppercase(),
			attack_complexity: data.attack_complexity.to_uppercase(),
			privileges_required: data.privileges_required.to_uppercase(),
			user_interaction: data.user_interaction.to_uppercase(),
			confidentiality_impact: data.confidentiality_impact.to_uppercase(),
			integrity_impact: data.integrity_impact.to_uppercase(),
			availability_impact: data.availability_impact.to_uppercase(),
		},
		temporal,
	)
}

fn from_v2(metric: &CvssMetricV2) -> (CvssMetrics, Option<TemporalMetrics>) {
	let data = &metric.cvss_data;
	let user_interaction = match metric.user_interaction_required {
		Some(true) => "REQUIRED",
		_ => "NONE",
	};
	let temporal = data.temporal_score.map(|score| TemporalMetrics {
		score,
		vector: data.vector_string.clone(),
	});
	(
		CvssMetrics {
			version: CvssVersion::V2,
			base_score: data.base_score,
			base_severity: metric
				.base_severity
				.as_deref()
				.unwrap_or("UNKNOWN")
				.to_uppercase(),
			vector: data.vector_string.clone(),
			attack_vector: data.access_vector.to_uppercase(),
			attack_complexity: data.access_complexity.to_uppercase(),
			privileges_required: data.authentication.to_uppercase(),
			user_interaction: user_interaction.to_string(),
			confidentiality_impact: map_v2_impact(&data.confidentiality_impact),
			integrity_impact: map_v2_impact(&data.integrity_impact),
			availability_impact: map_v2_impact(&data.availability_impact),
		},
		temporal,
	)
}

/// CVSS v3.1 first, then v3.0, then v2.
fn select_cvss(metrics: &NvdMetrics) -> Option<(CvssMetrics, Option<TemporalMetrics>)> {
	if let Some(m) = primary_or_first(&metrics.cvss_metric_v31) {
		return Some(from_v3(m, CvssVersion::V31));
	}
	if let Some(m) = primary_or_first(&metrics.cvss_metric_v30) {
		return Some(from_v3(m, CvssVersion::V30));
	}
	primary_or_first(&metrics.cvss_metric_v2).map(from_v2)
}

fn parse_timestamp(value: &Option<String>) -> Option<NaiveDateTime> {
	let value = value.as_deref()?;
	NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
		.map_err(|e| debug!("Unparseable NVD timestamp '{}': {}", value, e))
		.ok()
}

fn get_english_description(descriptions: &[NvdDescription]) -> Option<String> {
	descriptions
		.iter()
		.find(|desc| desc.lang == "en")
		.map(|desc| desc.value.clone())
}

/// Turns a raw NVD response body into a record for `id`.
fn parse_cve_response(id: &CveId, body: &str) -> Result<CveRecord, FetchError> {
	let data: NvdApiResponse = serde_json::from_str(body)
		.map_err(|e| FetchError::MalformedResponse(e.to_string()))?;

	let vuln = data
		.vulnerabilities
		.into_iter()
		.find(|v| v.cve.id.eq_ignore_ascii_case(id.as_str()))
		.ok_or(FetchError::NotFound)?;
	let cve = vuln.cve;

	let (cvss, temporal) = match cve.metrics.as_ref().and_then(select_cvss) {
		Some((cvss, temporal)) => (Some(cvss), temporal),
		None => (None, None),
	};

	Ok(CveRecord {
		id: id.clone(),
		description: get_english_description(&cve.descriptions),
		published: parse_timestamp(&cve.published),
		last_modified: parse_timestamp(&cve.last_modified),
		cvss,
		temporal,
		in_kev: false,
	})
}

/// Maps non-success statuses onto the fetch taxonomy. NVD answers an unknown
/// API key with a 404 carrying a `message` header, and throttles with 403 or 429.
fn classify_failure(response: &Response) -> FetchError {
	let status = response.status();
	match status {
		StatusCode::UNAUTHORIZED => FetchError::Unauthorized,
		StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited,
		StatusCode::NOT_FOUND => {
			let rejects_key = response
				.headers()
				.get("message")
				.and_then(|v| v.to_str().ok())
				.map_or(false, |m| m.to_ascii_lowercase().contains("apikey"));
			if rejects_key {
				FetchError::Unauthorized
			} else {
				FetchError::NotFound
			}
		}
		other => FetchError::UnexpectedStatus(other.as_u16()),
	}
}

#[derive(Clone)]
pub struct NvdApiClient {
	client: reqwest::Client,
	base_url: String,
}

impl NvdApiClient {
	pub fn new(config: &NvdConfig) -> Result<Self> {
		let mut headers = HeaderMap::new();
		headers.insert(
			USER_AGENT,
			HeaderValue::from_static(concat!("scan_delta/", env!("CARGO_PKG_VERSION"))),
		);

		let client = reqwest::Client::builder()
			.default_headers(headers)
			.timeout(config.request_timeout())
			.build()
			.context("Failed to create HTTP client")?;

		Ok(Self {
			client,
			base_url: config.base_url.clone(),
		})
	}

	async fn get(&self, query: &[(&str, &str)], api_key: &str) -> Result<Response, FetchError> {
		let response = self
			.client
			.get(&self.base_url)
			.query(query)
			.header(API_KEY_HEADER, api_key)
			.send()
			.await?;
		Ok(response)
	}
}

#[async_trait]
impl CveFetcher for NvdApiClient {
	async fn fetch_cve(&self, id: &CveId, api_key: &str) -> Result<CveRecord, FetchError> {
		debug!("Fetching NVD data for {}", id);
		let response = self.get(&[("cveId", id.as_str())], api_key).await?;

		if !response.status().is_success() {
			let err = classify_failure(&response);
			debug!("NVD request for {} failed: {}", id, err);
			return Err(err);
		}

		let body = response.text().await?;
		parse_cve_response(id, &body)
	}

	async fn validate_key(&self, api_key: &str) -> Result<bool, FetchError> {
		let response = self
			.get(&[("resultsPerPage", "1"), ("startIndex", "0")], api_key)
			.await?;

		if response.status().is_success() {
			return Ok(true);
		}
		match classify_failure(&response) {
			FetchError::Unauthorized => Ok(false),
			other => {
				warn!("Could not validate API key: {}", other);
				Err(other)
			}
		}
	}
}
