//! Washington Liquor and Cannabis Board license lists. The board publishes
//! spreadsheets rather than a stable CSV endpoint, so the URL points at a
//! re-hosted CSV export and is configuration.

use async_trait::async_trait;

use canopy_core::{resolve_trade_name, NormalizedLicenseRecord, SourceCode};
use canopy_store::HttpFetcher;

use crate::{parse_csv, parse_mdy_date, LicenseSource, RawRow, SourceConfig, SourceError};

pub struct WashingtonSource;

#[async_trait]
impl LicenseSource for WashingtonSource {
    fn code(&self) -> SourceCode {
        SourceCode::Wa
    }

    fn display_name(&self) -> &'static str {
        "Washington LCB"
    }

    async fn fetch_rows(
        &self,
        http: &HttpFetcher,
        config: &SourceConfig,
    ) -> Result<Vec<RawRow>, SourceError> {
        let url = config.require_washington_url()?;
        let body = http.fetch_text("wa", url).await?;
        let mut rows = parse_csv(&body)?;
        for row in &mut rows {
            row.insert("__source_url", serde_json::Value::String(url.to_string()));
        }
        Ok(rows)
    }

    fn normalize(&self, row: &RawRow) -> Option<NormalizedLicenseRecord> {
        let license_number = row
            .pick(&["License Number", "License", "License #"])
            .unwrap_or_default();
        let entity_name = row
            .pick(&["Organization", "Licensee", "Entity Name"])
            .unwrap_or_default();
        if license_number.is_empty() || entity_name.is_empty() {
            return None;
        }

        // The LCB lists call the type column "Privilege".
        let license_type = row
            .pick(&["Privilege", "Privilege Description", "License Type"])
            .unwrap_or_default();
        let dba = row.pick(&["Tradename", "Trade Name", "DBA"]);
        let issued_at = row
            .pick(&["Date Issued", "Issue Date"])
            .and_then(|v| parse_mdy_date(SourceCode::Wa, "Date Issued", &v));

        Some(NormalizedLicenseRecord {
            source: SourceCode::Wa,
            jurisdiction: "WA".to_string(),
            license_number,
            license_type,
            status: row
                .pick(&["Status", "License Status"])
                .unwrap_or_else(|| "Unknown".to_string()),
            trade_name: resolve_trade_name(&entity_name, dba.as_deref()),
            entity_name,
            address_line1: row.pick(&["Address", "Street Address"]),
            address_line2: row.pick(&["Address Line 2", "Suite Rm"]),
            city: row.pick(&["City"]),
            postal_code: row.pick(&["Zip Code", "Zip"]),
            country: Some("US".to_string()),
            latitude: None,
            longitude: None,
            issued_at,
            expires_at: None,
            source_url: row.pick(&["__source_url"]),
            source_system: Some("WA_LCB".to_string()),
            raw: row.to_json(),
        })
    }
}
