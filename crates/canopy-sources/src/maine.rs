//! Maine Office of Cannabis Policy adult-use establishments CSV. The
//! published filename carries a date, so the URL is configuration.

use async_trait::async_trait;

use canopy_core::{resolve_trade_name, NormalizedLicenseRecord, SourceCode};
use canopy_store::HttpFetcher;

use crate::{parse_csv, parse_mdy_date, LicenseSource, RawRow, SourceConfig, SourceError};

pub struct MaineSource;

#[async_trait]
impl LicenseSource for MaineSource {
    fn code(&self) -> SourceCode {
        SourceCode::Me
    }

    fn display_name(&self) -> &'static str {
        "Maine OCP"
    }

    async fn fetch_rows(
        &self,
        http: &HttpFetcher,
        config: &SourceConfig,
    ) -> Result<Vec<RawRow>, SourceError> {
        let url = config.require_maine_url()?;
        let body = http.fetch_text("me", url).await?;
        let mut rows = parse_csv(&body)?;
        for row in &mut rows {
            row.insert("__source_url", serde_json::Value::String(url.to_string()));
        }
        Ok(rows)
    }

    fn normalize(&self, row: &RawRow) -> Option<NormalizedLicenseRecord> {
        let license_number = row.pick(&["LICENSE", "License"]).unwrap_or_default();
        let entity_name = row
            .pick(&["LICENSE_NAME", "Licensee", "LICENSEE_NAME"])
            .unwrap_or_default();
        if license_number.is_empty() || entity_name.is_empty() {
            return None;
        }

        // Category carries the establishment kind; type adds detail when it
        // differs ("Adult Use Store - Drive Through").
        let category = row.pick(&["LICENSE_CATEGORY"]).unwrap_or_default();
        let kind = row.pick(&["LICENSE_TYPE"]).unwrap_or_default();
        let license_type = if !kind.is_empty()
            && !category.is_empty()
            && !kind.eq_ignore_ascii_case(&category)
        {
            format!("{category} - {kind}")
        } else if !category.is_empty() {
            category
        } else {
            kind
        };

        let dba = row.pick(&["DBA"]);
        let issued_at = row
            .pick(&["ISSUE_DATE", "License Issue Date"])
            .and_then(|v| parse_mdy_date(SourceCode::Me, "ISSUE_DATE", &v));
        let expires_at = row
            .pick(&["EXPIRATION_DATE", "License Expiration Date"])
            .and_then(|v| parse_mdy_date(SourceCode::Me, "EXPIRATION_DATE", &v));

        Some(NormalizedLicenseRecord {
            source: SourceCode::Me,
            jurisdiction: "ME".to_string(),
            license_number,
            license_type,
            status: row
                .pick(&["LICENSE_STATUS", "Status"])
                .unwrap_or_else(|| "Unknown".to_string()),
            trade_name: resolve_trade_name(&entity_name, dba.as_deref()),
            entity_name,
            address_line1: None,
            address_line2: None,
            city: row.pick(&["LICENSE_CITY", "City"]),
            postal_code: None,
            country: Some("US".to_string()),
            latitude: None,
            longitude: None,
            issued_at,
            expires_at,
            source_url: row.pick(&["__source_url"]),
            source_system: Some("ME_OCP".to_string()),
            raw: row.to_json(),
        })
    }
}
