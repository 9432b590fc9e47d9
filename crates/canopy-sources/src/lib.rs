//! Per-source fetch + normalize modules.
//!
//! Each external dataset gets a [`LicenseSource`]: an async fetch step that
//! produces [`RawRow`]s (CSV records, API page elements, or scraped store
//! entries) and a pure `normalize` step mapping one raw row to at most one
//! [`NormalizedLicenseRecord`]. Normalization never errors; a row that cannot
//! identify a license is simply skipped.

use std::env;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::warn;

use canopy_core::{NormalizedLicenseRecord, SourceCode, SourceSelector};
use canopy_store::{FetchError, HttpFetcher};

mod california;
mod colorado;
mod consolidated;
mod maine;
mod massachusetts;
mod new_brunswick;
mod new_york;
mod washington;

pub use california::CaliforniaSource;
pub use colorado::{ColoradoSheet, ColoradoSource};
pub use consolidated::ConsolidatedSource;
pub use maine::MaineSource;
pub use massachusetts::MassachusettsSource;
pub use new_brunswick::NewBrunswickSource;
pub use new_york::NewYorkSource;
pub use washington::WashingtonSource;

pub const CRATE_NAME: &str = "canopy-sources";

#[derive(Debug, Error)]
pub enum SourceError {
    /// Required configuration is absent; loud per-source failure, never a
    /// silent no-op.
    #[error("source configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("csv parse error: {0}")]
    Csv(String),
    #[error("response decode error: {0}")]
    Decode(String),
}

/// One semi-structured source row. Keys are whatever the upstream dataset
/// uses; values are kept as JSON so the original row survives verbatim into
/// the license's raw payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRow {
    fields: Map<String, JsonValue>,
}

impl RawRow {
    pub fn new(fields: Map<String, JsonValue>) -> Self {
        Self { fields }
    }

    pub fn insert(&mut self, key: &str, value: JsonValue) {
        self.fields.insert(key.to_string(), value);
    }

    /// First non-empty trimmed string among the candidate column names.
    /// Upstream exports rename and re-case headers between publications, so
    /// every field read tries each alias exactly, then lowercased, then
    /// uppercased.
    pub fn pick(&self, keys: &[&str]) -> Option<String> {
        for key in keys {
            for variant in [key.to_string(), key.to_lowercase(), key.to_uppercase()] {
                let Some(value) = self.fields.get(&variant) else {
                    continue;
                };
                let text = match value {
                    JsonValue::String(s) => s.trim().to_string(),
                    JsonValue::Number(n) => n.to_string(),
                    _ => continue,
                };
                if !text.is_empty() {
                    return Some(text);
                }
            }
        }
        None
    }

    /// Numeric field that may arrive as a JSON number or a decorated string
    /// ("  45.12 ", "$1,200").
    pub fn pick_float(&self, keys: &[&str]) -> Option<f64> {
        for key in keys {
            match self.fields.get(*key) {
                Some(JsonValue::Number(n)) => return n.as_f64(),
                Some(JsonValue::String(s)) => {
                    let cleaned: String = s
                        .chars()
                        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                        .collect();
                    if let Ok(v) = cleaned.parse::<f64>() {
                        return Some(v);
                    }
                }
                _ => {}
            }
        }
        None
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(self.fields.clone())
    }
}

/// Parse a header-row CSV body into raw rows, one per record.
pub fn parse_csv(body: &str) -> Result<Vec<RawRow>, SourceError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| SourceError::Csv(e.to_string()))?
        .clone();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| SourceError::Csv(e.to_string()))?;
        let mut fields = Map::new();
        for (header, value) in headers.iter().zip(record.iter()) {
            fields.insert(header.to_string(), JsonValue::String(value.to_string()));
        }
        if fields.values().any(|v| v.as_str().is_some_and(|s| !s.is_empty())) {
            rows.push(RawRow::new(fields));
        }
    }
    Ok(rows)
}

/// ISO / near-ISO date ("2024-03-01", "2024-03-01T00:00:00..."). Unparseable
/// input is dropped with a warning; bad dates never fail a row.
pub fn parse_iso_date(source: SourceCode, field: &str, value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let candidate = value.split('T').next().unwrap_or(value);
    match NaiveDate::parse_from_str(candidate, "%Y-%m-%d") {
        Ok(date) => Some(date),
        Err(_) => {
            warn!(source = %source, field, value, "unrecognized date format, dropping");
            None
        }
    }
}

/// `MM/DD/YYYY` as published by Maine OCP.
pub fn parse_mdy_date(source: SourceCode, field: &str, value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    match NaiveDate::parse_from_str(value, "%m/%d/%Y") {
        Ok(date) => Some(date),
        Err(_) => {
            warn!(source = %source, field, value, "unrecognized date format, dropping");
            None
        }
    }
}

/// One page of a `data`-array API response, plus whether more pages follow
/// (`metadata.has_next` / `metadata.hasNext`).
pub(crate) fn page_elements(body: &str) -> Result<(Vec<RawRow>, bool), SourceError> {
    let envelope: JsonValue =
        serde_json::from_str(body).map_err(|e| SourceError::Decode(e.to_string()))?;
    let rows = envelope
        .get("data")
        .and_then(JsonValue::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_object().cloned())
                .map(RawRow::new)
                .collect()
        })
        .unwrap_or_default();
    let has_next = envelope
        .pointer("/metadata/has_next")
        .or_else(|| envelope.pointer("/metadata/hasNext"))
        .and_then(JsonValue::as_bool)
        .unwrap_or(false);
    Ok((rows, has_next))
}

/// Drive a pageNumber-style API until it reports no next page. A fetch
/// failure after the first page keeps the pages already collected instead
/// of discarding them; a first-page failure is the source failing outright.
pub(crate) async fn fetch_paginated<F, Fut>(
    source: SourceCode,
    mut fetch_page: F,
) -> Result<Vec<RawRow>, SourceError>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<String, SourceError>>,
{
    let mut rows = Vec::new();
    let mut page = 1usize;
    loop {
        let body = match fetch_page(page).await {
            Ok(body) => body,
            Err(err) if page > 1 => {
                warn!(
                    source = %source,
                    page,
                    error = %err,
                    "page fetch failed; keeping pages already fetched"
                );
                break;
            }
            Err(err) => return Err(err),
        };
        let (page_rows, has_next) = page_elements(&body)?;
        rows.extend(page_rows);
        if !has_next {
            break;
        }
        page += 1;
    }
    Ok(rows)
}

/// One external license dataset: how to fetch it and how to read its rows.
#[async_trait]
pub trait LicenseSource: Send + Sync {
    fn code(&self) -> SourceCode;
    fn display_name(&self) -> &'static str;

    async fn fetch_rows(
        &self,
        http: &HttpFetcher,
        config: &SourceConfig,
    ) -> Result<Vec<RawRow>, SourceError>;

    /// Pure. `None` means the row cannot be used (no license identity),
    /// which callers count as filtered, not failed.
    fn normalize(&self, row: &RawRow) -> Option<NormalizedLicenseRecord>;
}

/// Runtime configuration for the source fetchers. Stable government URLs are
/// baked in; datasets whose URLs rotate (dated filenames, published sheet
/// ids) come from the environment and are required only when that source
/// actually runs.
#[derive(Debug, Clone, Default)]
pub struct SourceConfig {
    /// Maine OCP CSV; the published filename carries a date and changes.
    pub maine_csv_url: Option<String>,
    /// Colorado MED sheet exports, one per license category.
    pub colorado_sheets: Vec<ColoradoSheet>,
    /// New York OCM paginated API base URL.
    pub new_york_api_url: Option<String>,
    pub new_york_page_size: usize,
    /// Washington LCB license CSV (re-hosted export of the published lists).
    pub washington_csv_url: Option<String>,
    /// Consolidated multi-state dataset (JSON array).
    pub consolidated_url: Option<String>,
    /// Consolidated COA metadata feed (CSV).
    pub coa_feed_url: Option<String>,
}

impl SourceConfig {
    pub fn from_env() -> Self {
        Self {
            maine_csv_url: env::var("CANOPY_ME_CSV_URL").ok(),
            colorado_sheets: env::var("CANOPY_CO_SHEETS")
                .ok()
                .map(|raw| ColoradoSheet::parse_list(&raw))
                .unwrap_or_default(),
            new_york_api_url: env::var("CANOPY_NY_API_URL").ok(),
            new_york_page_size: env::var("CANOPY_NY_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            washington_csv_url: env::var("CANOPY_WA_CSV_URL").ok(),
            consolidated_url: env::var("CANOPY_CONSOLIDATED_URL").ok(),
            coa_feed_url: env::var("CANOPY_COA_FEED_URL").ok(),
        }
    }

    pub fn require_maine_url(&self) -> Result<&str, SourceError> {
        self.maine_csv_url.as_deref().ok_or_else(|| {
            SourceError::Config("CANOPY_ME_CSV_URL is not set (Maine CSV filename is dated)".into())
        })
    }

    pub fn require_new_york_url(&self) -> Result<&str, SourceError> {
        self.new_york_api_url
            .as_deref()
            .ok_or_else(|| SourceError::Config("CANOPY_NY_API_URL is not set".into()))
    }

    pub fn require_washington_url(&self) -> Result<&str, SourceError> {
        self.washington_csv_url.as_deref().ok_or_else(|| {
            SourceError::Config("CANOPY_WA_CSV_URL is not set (LCB lists need a hosted CSV)".into())
        })
    }

    pub fn require_consolidated_url(&self) -> Result<&str, SourceError> {
        self.consolidated_url
            .as_deref()
            .ok_or_else(|| SourceError::Config("CANOPY_CONSOLIDATED_URL is not set".into()))
    }

    pub fn require_coa_feed_url(&self) -> Result<&str, SourceError> {
        self.coa_feed_url
            .as_deref()
            .ok_or_else(|| SourceError::Config("CANOPY_COA_FEED_URL is not set".into()))
    }
}

pub fn source_for_code(code: SourceCode) -> Box<dyn LicenseSource> {
    match code {
        SourceCode::Ma => Box::new(MassachusettsSource),
        SourceCode::Me => Box::new(MaineSource),
        SourceCode::Co => Box::new(ColoradoSource),
        SourceCode::Nb => Box::new(NewBrunswickSource),
        SourceCode::Ny => Box::new(NewYorkSource),
        SourceCode::Ca => Box::new(CaliforniaSource),
        SourceCode::Wa => Box::new(WashingtonSource),
        SourceCode::Consolidated => Box::new(ConsolidatedSource),
    }
}

pub fn sources_for_selector(selector: SourceSelector) -> Vec<Box<dyn LicenseSource>> {
    match selector {
        SourceSelector::All => SourceCode::ALL.iter().copied().map(source_for_code).collect(),
        SourceSelector::One(code) => vec![source_for_code(code)],
    }
}
