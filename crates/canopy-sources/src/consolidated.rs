//! Consolidated multi-state third-party dataset (JSON array). Jurisdictions
//! that have a dedicated importer are skipped here so the richer feed wins.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use canopy_core::{
    combine_type_and_designation, resolve_trade_name, NormalizedLicenseRecord, SourceCode,
};
use canopy_store::HttpFetcher;

use crate::{parse_iso_date, LicenseSource, RawRow, SourceConfig, SourceError};

/// States covered by dedicated sources.
const DEDICATED: [&str; 6] = ["MA", "ME", "CO", "NY", "CA", "WA"];

pub struct ConsolidatedSource;

#[async_trait]
impl LicenseSource for ConsolidatedSource {
    fn code(&self) -> SourceCode {
        SourceCode::Consolidated
    }

    fn display_name(&self) -> &'static str {
        "Consolidated multi-state feed"
    }

    async fn fetch_rows(
        &self,
        http: &HttpFetcher,
        config: &SourceConfig,
    ) -> Result<Vec<RawRow>, SourceError> {
        let url = config.require_consolidated_url()?;
        let body = http.fetch_text("consolidated", url).await?;
        let parsed: JsonValue =
            serde_json::from_str(&body).map_err(|e| SourceError::Decode(e.to_string()))?;
        let items = parsed
            .as_array()
            .ok_or_else(|| SourceError::Decode("expected a top-level JSON array".into()))?;
        let rows = items
            .iter()
            .filter_map(|item| item.as_object().cloned())
            .map(|mut fields| {
                fields.insert("__source_url".to_string(), JsonValue::String(url.to_string()));
                RawRow::new(fields)
            })
            .collect();
        Ok(rows)
    }

    fn normalize(&self, row: &RawRow) -> Option<NormalizedLicenseRecord> {
        let state = row
            .pick(&["premise_state", "state_code"])?
            .to_ascii_uppercase();
        if DEDICATED.contains(&state.as_str()) {
            return None;
        }

        let license_number = row.pick(&["license_number"]).unwrap_or_default();
        let entity_name = row
            .pick(&["business_legal_name", "business_name"])
            .unwrap_or_default();
        if license_number.is_empty() || entity_name.is_empty() {
            return None;
        }

        let base_type = row.pick(&["license_type"]).unwrap_or_default();
        let designation = row.pick(&["license_designation"]);
        let dba = row.pick(&["business_dba_name", "business_dba"]);

        // e.g. IL + licensing_authority_id "CC" -> "IL_CC"
        let source_system = match row.pick(&["licensing_authority_id"]) {
            Some(authority) => format!("{state}_{authority}"),
            None => state.clone(),
        };

        Some(NormalizedLicenseRecord {
            source: SourceCode::Consolidated,
            jurisdiction: state,
            license_number,
            license_type: combine_type_and_designation(&base_type, designation.as_deref()),
            status: row
                .pick(&["license_status"])
                .unwrap_or_else(|| "Unknown".to_string()),
            trade_name: resolve_trade_name(&entity_name, dba.as_deref()),
            entity_name,
            address_line1: row.pick(&["premise_street_address"]),
            address_line2: None,
            city: row.pick(&["premise_city"]),
            postal_code: row.pick(&["premise_zip_code"]),
            country: Some("US".to_string()),
            latitude: row.pick_float(&["premise_latitude"]),
            longitude: row.pick_float(&["premise_longitude"]),
            issued_at: row
                .pick(&["issue_date"])
                .and_then(|v| parse_iso_date(SourceCode::Consolidated, "issue_date", &v)),
            expires_at: row
                .pick(&["expiration_date"])
                .and_then(|v| parse_iso_date(SourceCode::Consolidated, "expiration_date", &v)),
            source_url: row.pick(&["__source_url"]),
            source_system: Some(source_system),
            raw: row.to_json(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(state: &str) -> RawRow {
        let mut row = RawRow::default();
        row.insert("premise_state", json!(state));
        row.insert("license_number", json!("X-100"));
        row.insert("license_type", json!("Dispensary"));
        row.insert("business_legal_name", json!("High Plains LLC"));
        row.insert("licensing_authority_id", json!("CC"));
        row.insert("premise_latitude", json!("41.88"));
        row
    }

    #[test]
    fn dedicated_states_are_skipped() {
        assert!(ConsolidatedSource.normalize(&row("MA")).is_none());
        assert!(ConsolidatedSource.normalize(&row("ME")).is_none());
        assert!(ConsolidatedSource.normalize(&row("CA")).is_none());
        assert!(ConsolidatedSource.normalize(&row("WA")).is_none());
        assert!(ConsolidatedSource.normalize(&row("il")).is_some());
    }

    #[test]
    fn source_system_includes_authority_id() {
        let record = ConsolidatedSource.normalize(&row("IL")).unwrap();
        assert_eq!(record.source_system.as_deref(), Some("IL_CC"));
        assert_eq!(record.jurisdiction, "IL");
        assert_eq!(record.latitude, Some(41.88));
        assert_eq!(record.status, "Unknown");
    }
}
