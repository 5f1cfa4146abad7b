// src/utils/csv_importer.rs

use crate::errors::ExtractionError;
use crate::models::cve::CveId;
use csv::{ReaderBuilder, StringRecord};
use encoding_rs::{Encoding, WINDOWS_1252};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::path::Path;

/// Number of well-formed data rows inspected when looking for the CVE column.
const SAMPLE_ROWS: usize = 200;

/// Number of leading lines used to sniff the delimiter.
const SNIFF_LINES: usize = 20;

/// Share of non-empty sampled cells that must be CVE identifiers for a column to qualify.
const CONFIDENCE_THRESHOLD: f64 = 0.6;

const CANDIDATE_DELIMITERS: [u8; 4] = [b',', b';', b'\t', b'|'];

/// Result of pulling CVE identifiers out of a scanner export.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
	/// Unique identifiers in first-seen order.
	pub cve_ids: Vec<CveId>,
	/// Every valid identifier found, duplicates included.
	pub total_occurrences: usize,
	/// Rows whose field count did not match the header.
	pub skipped_rows: usize,
	pub column_index: usize,
	pub column_header: String,
}

/// Reads and decodes a scanner export, then extracts its CVE identifiers.
pub async fn extract_cve_ids_from_path(path: impl AsRef<Path>) -> Result<Extraction, ExtractionError> {
	let path = path.as_ref();
	info!("Extracting CVE identifiers from {}", path.display());

	let bytes = tokio::fs::read(path).await?;
	extract_cve_ids(&decode_csv_bytes(&bytes))
}

/// Decodes raw file bytes: BOM-marked UTF-8/UTF-16 first, then plain UTF-8,
/// then Windows-1252 as the lenient fallback.
pub fn decode_csv_bytes(bytes: &[u8]) -> String {
	if let Some((encoding, bom_len)) = Encoding::for_bom(bytes) {
		debug!("Detected {} byte order mark", encoding.name());
		let (text, _) = encoding.decode_without_bom_handling(&bytes[bom_len..]);
		return text.into_owned();
	}

	match std::str::from_utf8(bytes) {
		Ok(text) => text.to_string(),
		Err(_) => {
			debug!("Input is not valid UTF-8, decoding as Windows-1252");
			let (text, _, _) = WINDOWS_1252.decode(bytes);
			text.into_owned()
		}
	}
}

/// Extracts a deduplicated, ordered sequence of CVE identifiers from CSV
/// content whose layout is unknown.
pub fn extract_cve_ids(content: &str) -> Result<Extraction, ExtractionError> {
	if content.trim().is_empty() {
		return Err(ExtractionError::Empty);
	}

	let delimiter = sniff_delimiter(content);
	debug!("Using delimiter {:?}", delimiter as char);

	let mut rdr = ReaderBuilder::new()
		.delimiter(delimiter)
		.has_headers(true)
		.flexible(true)
		.trim(csv::Trim::All)
		.from_reader(content.as_bytes());

	let headers = rdr.headers()?.clone();
	if headers.is_empty() {
		return Err(ExtractionError::Empty);
	}

	let mut rows = Vec::new();
	let mut skipped_rows = 0;

	for (index, result) in rdr.records().enumerate() {
		// Header is line 1.
		let line_number = index + 2;
		match result {
			Ok(record) if record.len() == headers.len() => rows.push(record),
			Ok(record) => {
				warn!(
					"Skipping malformed row at line {}: expected {} fields, found {}",
					line_number,
					headers.len(),
					record.len()
				);
				skipped_rows += 1;
			}
			Err(e) => {
				warn!("Skipping unreadable row at line {}: {}", line_number, e);
				skipped_rows += 1;
			}
		}
	}

	let column_index = detect_cve_column(&headers, &rows).ok_or(ExtractionError::NoCveColumnFound)?;
	let column_header = headers.get(column_index).unwrap_or_default().to_string();
	info!("CVE identifiers found in column {} ('{}')", column_index + 1, column_header);

	let mut seen = HashSet::new();
	let mut cve_ids = Vec::new();
	let mut total_occurrences = 0;
	let mut ignored_tokens = 0;

	for row in &rows {
		let cell = row.get(column_index).unwrap_or_default();
		for token in cell_tokens(cell) {
			match CveId::parse(token) {
				Some(id) => {
					total_occurrences += 1;
					if seen.insert(id.clone()) {
						cve_ids.push(id);
					}
				}
				None => ignored_tokens += 1,
			}
		}
	}

	if ignored_tokens > 0 {
		debug!("Ignored {} non-CVE tokens in the CVE column", ignored_tokens);
	}
	info!(
		"Extracted {} unique CVE identifiers ({} total, {} rows skipped)",
		cve_ids.len(),
		total_occurrences,
		skipped_rows
	);

	Ok(Extraction {
		cve_ids,
		total_occurrences,
		skipped_rows,
		column_index,
		column_header,
	})
}

/// Picks the delimiter under which the most sampled lines agree with the
/// header's field count. Defaults to a comma.
fn sniff_delimiter(content: &str) -> u8 {
	let sample: String = content
		.lines()
		.take(SNIFF_LINES)
		.collect::<Vec<_>>()
		.join("\n");

	let mut best = (b',', 0usize);
	for &candidate in CANDIDATE_DELIMITERS.iter() {
		let score = delimiter_score(&sample, candidate);
		if score > best.1 {
			best = (candidate, score);
		}
	}
	best.0
}

fn delimiter_score(sample: &str, delimiter: u8) -> usize {
	let mut rdr = ReaderBuilder::new()
		.delimiter(delimiter)
		.has_headers(false)
		.flexible(true)
		.from_reader(sample.as_bytes());

	let mut records = rdr.records().filter_map(|r| r.ok());
	let header_len = match records.next() {
		Some(header) if header.len() > 1 => header.len(),
		_ => return 0,
	};

	1 + records.filter(|r| r.len() == header_len).count()
}

/// Splits a cell that may hold several identifiers.
fn cell_tokens(cell: &str) -> impl Iterator<Item = &str> {
	cell.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
		.filter(|t| !t.is_empty())
}

/// A cell matches when it is non-empty and every token in it is a CVE identifier.
fn cell_is_cve_list(cell: &str) -> Option<bool> {
	let mut tokens = cell_tokens(cell).peekable();
	tokens.peek()?;
	Some(tokens.all(|t| CveId::parse(t).is_some()))
}

fn detect_cve_column(headers: &StringRecord, rows: &[StringRecord]) -> Option<usize> {
	let sample = &rows[..rows.len().min(SAMPLE_ROWS)];
	let mut best: Option<(usize, bool, usize)> = None;

	for column in 0..headers.len() {
		let mut non_empty = 0;
		let mut matching = 0;

		for row in sample {
			match cell_is_cve_list(row.get(column).unwrap_or_default()) {
				Some(true) => {
					non_empty += 1;
					matching += 1;
				}
				Some(false) => non_empty += 1,
				None => {}
			}
		}

		if matching == 0 || (matching as f64) / (non_empty as f64) < CONFIDENCE_THRESHOLD {
			continue;
		}

		let header_hint = headers
			.get(column)
			.map_or(false, |h| h.to_ascii_uppercase().contains("CVE"));
		debug!(
			"Column {} qualifies: {}/{} cells are CVE identifiers",
			column, matching, non_empty
		);

		// Earlier columns win ties because only strictly better candidates replace `best`.
		let better = match best {
			None => true,
			Some((_, best_hint, best_matching)) => {
				(matching, header_hint) > (best_matching, best_hint)
			}
		};
		if better {
			best = Some((column, header_hint, matching));
		}
	}

	best.map(|(column, _, _)| column)
}
