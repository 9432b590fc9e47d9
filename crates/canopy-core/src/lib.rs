//! Core domain model for the Canopy license-transparency ingestion pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub mod classify;

pub use classify::{classify_license_type, LicenseClass, LocationType};

pub const CRATE_NAME: &str = "canopy-core";

/// Identifies one external dataset feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceCode {
    /// Massachusetts Cannabis Control Commission open-data CSV.
    Ma,
    /// Maine Office of Cannabis Policy adult-use CSV.
    Me,
    /// Colorado MED published sheet CSVs (one per license category).
    Co,
    /// New Brunswick store-locator HTML scrape.
    Nb,
    /// New York OCM paginated open-data API.
    Ny,
    /// California DCC paginated license-search API.
    Ca,
    /// Washington LCB frequently-requested-lists CSV.
    Wa,
    /// Consolidated multi-state third-party dataset.
    Consolidated,
}

impl SourceCode {
    pub const ALL: [SourceCode; 8] = [
        SourceCode::Ma,
        SourceCode::Me,
        SourceCode::Co,
        SourceCode::Nb,
        SourceCode::Ny,
        SourceCode::Ca,
        SourceCode::Wa,
        SourceCode::Consolidated,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceCode::Ma => "MA",
            SourceCode::Me => "ME",
            SourceCode::Co => "CO",
            SourceCode::Nb => "NB",
            SourceCode::Ny => "NY",
            SourceCode::Ca => "CA",
            SourceCode::Wa => "WA",
            SourceCode::Consolidated => "CONSOLIDATED",
        }
    }
}

impl fmt::Display for SourceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MA" => Ok(SourceCode::Ma),
            "ME" => Ok(SourceCode::Me),
            "CO" => Ok(SourceCode::Co),
            "NB" => Ok(SourceCode::Nb),
            "NY" => Ok(SourceCode::Ny),
            "CA" => Ok(SourceCode::Ca),
            "WA" => Ok(SourceCode::Wa),
            "CONSOLIDATED" => Ok(SourceCode::Consolidated),
            other => Err(format!("unknown source code: {other}")),
        }
    }
}

/// Operator-facing run selector: everything, or one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceSelector {
    All,
    One(SourceCode),
}

impl FromStr for SourceSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("ALL") {
            Ok(SourceSelector::All)
        } else {
            s.parse().map(SourceSelector::One)
        }
    }
}

/// Canonical handoff contract from a source normalizer into the
/// reconciliation engine. `None` optionals mean "not provided by this
/// source"; the engine must not overwrite stored values with them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedLicenseRecord {
    pub source: SourceCode,
    pub jurisdiction: String,
    pub license_number: String,
    pub license_type: String,
    pub status: String,
    pub entity_name: String,
    /// Trade/DBA name, already suppressed when identical to the legal name.
    pub trade_name: Option<String>,
    pub address_line1: Option<String>,
    pub address_line2: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub issued_at: Option<NaiveDate>,
    pub expires_at: Option<NaiveDate>,
    pub source_url: Option<String>,
    pub source_system: Option<String>,
    /// Original source row, preserved verbatim for audit.
    pub raw: JsonValue,
}

impl NormalizedLicenseRecord {
    /// Display name used for the facility established by this license.
    pub fn display_name(&self) -> &str {
        self.trade_name.as_deref().unwrap_or(&self.entity_name)
    }
}

/// Keep the trade/DBA name only when it actually differs from the legal
/// name, so "Foo LLC (DBA: Foo LLC)"-style noise never reaches storage.
pub fn resolve_trade_name(entity_name: &str, dba: Option<&str>) -> Option<String> {
    let dba = dba.map(str::trim).filter(|s| !s.is_empty())?;
    if dba.eq_ignore_ascii_case(entity_name.trim()) {
        None
    } else {
        Some(dba.to_string())
    }
}

/// Concatenate a designation/sub-type onto the license type unless the
/// type text already carries it (case-insensitive).
pub fn combine_type_and_designation(license_type: &str, designation: Option<&str>) -> String {
    let license_type = license_type.trim();
    let Some(designation) = designation.map(str::trim).filter(|s| !s.is_empty()) else {
        return license_type.to_string();
    };
    let haystack = license_type.to_ascii_lowercase();
    if haystack.contains(&designation.to_ascii_lowercase()) {
        license_type.to_string()
    } else {
        format!("{designation} {license_type}").trim().to_string()
    }
}

/// Lowercase alphanumeric slug with single hyphens, used as the Facility key.
pub fn slug(name: &str) -> String {
    name.to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Canonical persisted license, keyed by (jurisdiction, license_number).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct License {
    pub id: Uuid,
    pub jurisdiction: String,
    pub license_number: String,
    pub license_type: String,
    pub status: String,
    pub entity_name: String,
    pub trade_name: Option<String>,
    pub address_line1: Option<String>,
    pub address_line2: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub issued_at: Option<NaiveDate>,
    pub expires_at: Option<NaiveDate>,
    pub source_url: Option<String>,
    pub source_system: Option<String>,
    pub raw_payload: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl License {
    pub fn from_record(record: &NormalizedLicenseRecord, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            jurisdiction: record.jurisdiction.clone(),
            license_number: record.license_number.clone(),
            license_type: record.license_type.clone(),
            status: record.status.clone(),
            entity_name: record.entity_name.clone(),
            trade_name: record.trade_name.clone(),
            address_line1: record.address_line1.clone(),
            address_line2: record.address_line2.clone(),
            city: record.city.clone(),
            postal_code: record.postal_code.clone(),
            country: record.country.clone(),
            latitude: record.latitude,
            longitude: record.longitude,
            issued_at: record.issued_at,
            expires_at: record.expires_at,
            source_url: record.source_url.clone(),
            source_system: record.source_system.clone(),
            raw_payload: record.raw.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Partial-update: always-present fields are replaced, optional fields
    /// only when the incoming record provides them. A fresher snapshot that
    /// omits a field must not null out what an earlier one stored.
    pub fn merge_from(&mut self, record: &NormalizedLicenseRecord, now: DateTime<Utc>) {
        self.license_type = record.license_type.clone();
        self.status = record.status.clone();
        self.entity_name = record.entity_name.clone();
        if record.trade_name.is_some() {
            self.trade_name = record.trade_name.clone();
        }
        if record.address_line1.is_some() {
            self.address_line1 = record.address_line1.clone();
        }
        if record.address_line2.is_some() {
            self.address_line2 = record.address_line2.clone();
        }
        if record.city.is_some() {
            self.city = record.city.clone();
        }
        if record.postal_code.is_some() {
            self.postal_code = record.postal_code.clone();
        }
        if record.country.is_some() {
            self.country = record.country.clone();
        }
        if record.latitude.is_some() {
            self.latitude = record.latitude;
        }
        if record.longitude.is_some() {
            self.longitude = record.longitude;
        }
        if record.issued_at.is_some() {
            self.issued_at = record.issued_at;
        }
        if record.expires_at.is_some() {
            self.expires_at = record.expires_at;
        }
        if record.source_url.is_some() {
            self.source_url = record.source_url.clone();
        }
        if record.source_system.is_some() {
            self.source_system = record.source_system.clone();
        }
        if !record.raw.is_null() {
            self.raw_payload = record.raw.clone();
        }
        self.updated_at = now;
    }
}

/// Physical operating location (non-lab facility).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub location_type: LocationType,
    pub jurisdiction: String,
    pub address_line1: Option<String>,
    pub address_line2: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// License that established this location, once linked.
    pub license_id: Option<Uuid>,
}

/// Testing laboratory facility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lab {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub jurisdiction: String,
    pub city: Option<String>,
    pub license_id: Option<Uuid>,
}

/// Tracked production lot, keyed by batch code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub batch_code: String,
    pub jurisdiction: Option<String>,
    pub product_name: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Observed presence of a batch at a location over time. Append/refresh only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchLocation {
    pub batch_id: Uuid,
    pub location_id: Uuid,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Uploaded-document registry entry (read-only external collaborator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedDocument {
    pub id: Uuid,
    pub verified: bool,
    pub media_type: String,
    pub file_name: String,
    pub file_path: Option<String>,
    pub batch_code: Option<String>,
    pub lab_name: Option<String>,
    pub sample_id: Option<String>,
    pub license_number: Option<String>,
    pub extracted_text: Option<String>,
    pub sampled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Parsed COA content, declared up front instead of inferred from usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoaContent {
    /// Relational skeleton only; analyte parsing happens later.
    Pending,
    /// Identity fields recovered from the document metadata.
    Extracted {
        sample_id: Option<String>,
        collected_at: Option<DateTime<Utc>>,
    },
}

/// Structured analytic record linking a batch, a lab, and (at most once)
/// the uploaded document it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabResult {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub lab_id: Option<Uuid>,
    pub sample_id: Option<String>,
    pub status: String,
    pub content: CoaContent,
    pub uploaded_document_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Source provenance tag for COA documents. Automated feeds are
/// deduplicated; manual uploads are append-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoaSourceType {
    ManualUpload,
    ConsolidatedFeed,
}

impl CoaSourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            CoaSourceType::ManualUpload => "manual-upload",
            CoaSourceType::ConsolidatedFeed => "consolidated-feed",
        }
    }
}

/// Document-level COA record carrying the human-facing metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoaDocument {
    pub id: Uuid,
    pub title: String,
    pub lab_name: Option<String>,
    pub batch_ref: Option<String>,
    pub sample_id: Option<String>,
    pub license_ref: Option<String>,
    pub product_name: Option<String>,
    pub jurisdiction: Option<String>,
    pub file_type: Option<String>,
    pub file_url: Option<String>,
    pub source_type: CoaSourceType,
    pub source_url: Option<String>,
    pub raw_text: Option<String>,
    pub sample_collected_at: Option<DateTime<Utc>>,
    pub sample_tested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Per-source ingestion counts surfaced to operators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceReport {
    pub source: String,
    pub total_fetched: usize,
    pub total_filtered: usize,
    pub total_processed: usize,
    pub total_upserts: usize,
    pub total_skipped: usize,
    pub total_failed: usize,
    pub notes: Vec<String>,
}

impl SourceReport {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }
}

/// Structured report for one import run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportReport {
    pub run_id: Uuid,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceReport>,
}

impl ImportReport {
    pub fn total_processed(&self) -> usize {
        self.sources.iter().map(|s| s.total_processed).sum()
    }

    pub fn total_upserts(&self) -> usize {
        self.sources.iter().map(|s| s.total_upserts).sum()
    }

    pub fn total_skipped(&self) -> usize {
        self.sources.iter().map(|s| s.total_skipped).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.sources.iter().map(|s| s.total_failed).sum()
    }
}

/// Report for one COA linking pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoaLinkReport {
    pub dry_run: bool,
    pub processed: usize,
    pub upserts: usize,
    pub skipped: usize,
    pub notes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(jurisdiction: &str, number: &str) -> NormalizedLicenseRecord {
        NormalizedLicenseRecord {
            source: SourceCode::Ma,
            jurisdiction: jurisdiction.to_string(),
            license_number: number.to_string(),
            license_type: "Marijuana Retailer".to_string(),
            status: "Active".to_string(),
            entity_name: "Green Leaf LLC".to_string(),
            trade_name: None,
            address_line1: None,
            address_line2: None,
            city: Some("Boston".to_string()),
            postal_code: None,
            country: None,
            latitude: None,
            longitude: None,
            issued_at: None,
            expires_at: None,
            source_url: None,
            source_system: Some("MA_CCC".to_string()),
            raw: json!({"License Number": number}),
        }
    }

    #[test]
    fn trade_name_suppressed_when_equal_to_legal_name() {
        assert_eq!(resolve_trade_name("Acme LLC", Some("Acme LLC")), None);
        assert_eq!(resolve_trade_name("Acme LLC", Some("acme llc")), None);
        assert_eq!(
            resolve_trade_name("Acme LLC", Some("Acme Dispensary")),
            Some("Acme Dispensary".to_string())
        );
        assert_eq!(resolve_trade_name("Acme LLC", Some("  ")), None);
        assert_eq!(resolve_trade_name("Acme LLC", None), None);
    }

    #[test]
    fn designation_concatenated_only_when_new_information() {
        assert_eq!(
            combine_type_and_designation("Retailer", Some("Adult-Use")),
            "Adult-Use Retailer"
        );
        assert_eq!(
            combine_type_and_designation("Adult-Use Retailer", Some("adult-use")),
            "Adult-Use Retailer"
        );
        assert_eq!(combine_type_and_designation("Retailer", None), "Retailer");
        assert_eq!(combine_type_and_designation("Retailer", Some("")), "Retailer");
    }

    #[test]
    fn merge_does_not_null_out_missing_fields() {
        let now = Utc::now();
        let mut license = License::from_record(&record("MA", "MA-0001"), now);
        assert_eq!(license.city.as_deref(), Some("Boston"));

        let mut update = record("MA", "MA-0001");
        update.city = None;
        update.status = "Suspended".to_string();
        license.merge_from(&update, now);

        assert_eq!(license.city.as_deref(), Some("Boston"));
        assert_eq!(license.status, "Suspended");
    }

    #[test]
    fn merge_takes_provided_fields() {
        let now = Utc::now();
        let mut license = License::from_record(&record("MA", "MA-0001"), now);

        let mut update = record("MA", "MA-0001");
        update.city = Some("Cambridge".to_string());
        update.postal_code = Some("02139".to_string());
        license.merge_from(&update, now);

        assert_eq!(license.city.as_deref(), Some("Cambridge"));
        assert_eq!(license.postal_code.as_deref(), Some("02139"));
    }

    #[test]
    fn slug_collapses_punctuation_and_case() {
        assert_eq!(slug("GreenLeaf Dispensary"), "greenleaf-dispensary");
        assert_eq!(slug("Cannabis NB - Bathurst"), "cannabis-nb-bathurst");
        assert_eq!(slug("  A&B  Labs, Inc. "), "a-b-labs-inc");
    }

    #[test]
    fn display_name_prefers_trade_name() {
        let mut rec = record("MA", "MA-0001");
        assert_eq!(rec.display_name(), "Green Leaf LLC");
        rec.trade_name = Some("GreenLeaf Dispensary".to_string());
        assert_eq!(rec.display_name(), "GreenLeaf Dispensary");
    }

    #[test]
    fn selector_parses_all_and_codes() {
        assert_eq!("ALL".parse::<SourceSelector>(), Ok(SourceSelector::All));
        assert_eq!(
            "ma".parse::<SourceSelector>(),
            Ok(SourceSelector::One(SourceCode::Ma))
        );
        assert!("XX".parse::<SourceSelector>().is_err());
    }
}
