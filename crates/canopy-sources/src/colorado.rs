//! Colorado MED published sheet CSVs, one export per license category. The
//! sheet ids rotate with each monthly publication, so the sheet list is
//! configuration (`CANOPY_CO_SHEETS`).

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::warn;

use canopy_core::{resolve_trade_name, NormalizedLicenseRecord, SourceCode};
use canopy_store::HttpFetcher;

use crate::{parse_csv, LicenseSource, RawRow, SourceConfig, SourceError};

/// One published sheet: a license category whose type is implied by the
/// export rather than carried per row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColoradoSheet {
    pub license_type: String,
    pub sheet_id: String,
}

impl ColoradoSheet {
    /// Parse `"Marijuana Store=abc123;Cultivation Facility=def456"`.
    /// Malformed entries are dropped with a warning.
    pub fn parse_list(raw: &str) -> Vec<ColoradoSheet> {
        raw.split(';')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .filter_map(|entry| match entry.split_once('=') {
                Some((license_type, sheet_id))
                    if !license_type.trim().is_empty() && !sheet_id.trim().is_empty() =>
                {
                    Some(ColoradoSheet {
                        license_type: license_type.trim().to_string(),
                        sheet_id: sheet_id.trim().to_string(),
                    })
                }
                _ => {
                    warn!(entry, "ignoring malformed Colorado sheet entry");
                    None
                }
            })
            .collect()
    }

    pub fn csv_url(&self) -> String {
        format!(
            "https://docs.google.com/spreadsheets/d/{}/export?format=csv&gid=0",
            self.sheet_id
        )
    }

    pub fn page_url(&self) -> String {
        format!(
            "https://docs.google.com/spreadsheets/d/{}/edit#gid=0",
            self.sheet_id
        )
    }
}

pub struct ColoradoSource;

#[async_trait]
impl LicenseSource for ColoradoSource {
    fn code(&self) -> SourceCode {
        SourceCode::Co
    }

    fn display_name(&self) -> &'static str {
        "Colorado MED"
    }

    async fn fetch_rows(
        &self,
        http: &HttpFetcher,
        config: &SourceConfig,
    ) -> Result<Vec<RawRow>, SourceError> {
        if config.colorado_sheets.is_empty() {
            return Err(SourceError::Config(
                "CANOPY_CO_SHEETS is not set (MED sheet ids rotate per publication)".into(),
            ));
        }

        let mut rows = Vec::new();
        for (index, sheet) in config.colorado_sheets.iter().enumerate() {
            if index > 0 {
                http.polite_pause().await;
            }
            // One bad sheet must not take down the other categories.
            let body = match http.fetch_text("co", &sheet.csv_url()).await {
                Ok(body) => body,
                Err(err) => {
                    warn!(license_type = %sheet.license_type, error = %err,
                        "skipping Colorado sheet after fetch failure");
                    continue;
                }
            };
            let sheet_rows = match parse_csv(&body) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(license_type = %sheet.license_type, error = %err,
                        "skipping unparseable Colorado sheet");
                    continue;
                }
            };
            for mut row in sheet_rows {
                row.insert("__license_type", JsonValue::String(sheet.license_type.clone()));
                row.insert("__source_url", JsonValue::String(sheet.page_url()));
                rows.push(row);
            }
        }
        Ok(rows)
    }

    fn normalize(&self, row: &RawRow) -> Option<NormalizedLicenseRecord> {
        let license_number = row
            .pick(&["License Number", "License #", "License"])
            .unwrap_or_default();
        let entity_name = row
            .pick(&["Licensee", "Licensee Name", "Entity Name"])
            .unwrap_or_default();
        if license_number.is_empty() || entity_name.is_empty() {
            return None;
        }

        let trade_name = row.pick(&["Trade Name", "DBA"]);

        Some(NormalizedLicenseRecord {
            source: SourceCode::Co,
            jurisdiction: "CO".to_string(),
            license_number,
            license_type: row.pick(&["__license_type"]).unwrap_or_default(),
            // MED publishes active licenses only; absent status means active.
            status: row
                .pick(&["License Status", "Status"])
                .unwrap_or_else(|| "Active".to_string()),
            trade_name: resolve_trade_name(&entity_name, trade_name.as_deref()),
            entity_name,
            address_line1: None,
            address_line2: None,
            city: row.pick(&["City", "Town"]),
            postal_code: None,
            country: Some("US".to_string()),
            latitude: None,
            longitude: None,
            issued_at: None,
            expires_at: None,
            source_url: row.pick(&["__source_url"]),
            source_system: Some("CO_MED".to_string()),
            raw: row.to_json(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sheet_list_parses_and_drops_malformed_entries() {
        let sheets = ColoradoSheet::parse_list(
            "Marijuana Store=abc123; Cultivation Facility=def456 ;bogus;=nope",
        );
        assert_eq!(sheets.len(), 2);
        assert_eq!(sheets[0].license_type, "Marijuana Store");
        assert_eq!(sheets[1].sheet_id, "def456");
        assert!(sheets[0].csv_url().contains("abc123"));
    }
}
