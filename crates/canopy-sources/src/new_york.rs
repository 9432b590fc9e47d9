//! New York OCM paginated open-data API. Pages carry a `data` array and a
//! `metadata.has_next` flag; only active licenses are kept.

use async_trait::async_trait;
use tracing::info;

use canopy_core::{
    combine_type_and_designation, resolve_trade_name, NormalizedLicenseRecord, SourceCode,
};
use canopy_store::HttpFetcher;

use crate::{
    fetch_paginated, parse_iso_date, LicenseSource, RawRow, SourceConfig, SourceError,
};

pub struct NewYorkSource;

#[async_trait]
impl LicenseSource for NewYorkSource {
    fn code(&self) -> SourceCode {
        SourceCode::Ny
    }

    fn display_name(&self) -> &'static str {
        "New York OCM"
    }

    async fn fetch_rows(
        &self,
        http: &HttpFetcher,
        config: &SourceConfig,
    ) -> Result<Vec<RawRow>, SourceError> {
        let base = config.require_new_york_url()?;
        let page_size = config.new_york_page_size.max(1);

        let rows = fetch_paginated(SourceCode::Ny, |page| {
            let url = format!("{base}?pageNumber={page}&pageSize={page_size}");
            async move {
                if page > 1 {
                    http.polite_pause().await;
                }
                Ok(http.fetch_text("ny", &url).await?)
            }
        })
        .await?;
        info!(total = rows.len(), "fetched New York license pages");
        Ok(rows)
    }

    fn normalize(&self, row: &RawRow) -> Option<NormalizedLicenseRecord> {
        // Active-only policy for this source; everything else is filtered.
        let status = row.pick(&["licenseStatus"])?;
        if !status.eq_ignore_ascii_case("active") {
            return None;
        }

        let license_number = row.pick(&["licenseNumber"]).unwrap_or_default();
        let entity_name = row.pick(&["businessName"]).unwrap_or_default();
        if license_number.is_empty() || entity_name.is_empty() {
            return None;
        }

        let base_type = row.pick(&["licenseType"]).unwrap_or_default();
        let designation = row.pick(&["licenseDesignation"]);
        let dba = row.pick(&["businessDBA", "businessDBAName"]);

        Some(NormalizedLicenseRecord {
            source: SourceCode::Ny,
            jurisdiction: "NY".to_string(),
            license_number,
            license_type: combine_type_and_designation(&base_type, designation.as_deref()),
            status,
            trade_name: resolve_trade_name(&entity_name, dba.as_deref()),
            entity_name,
            address_line1: row.pick(&["premiseStreetAddress"]),
            address_line2: None,
            city: row.pick(&["premiseCity"]),
            postal_code: row.pick(&["premiseZipCode"]),
            country: Some("US".to_string()),
            latitude: row.pick_float(&["premiseLatitude"]),
            longitude: row.pick_float(&["premiseLongitude"]),
            issued_at: row
                .pick(&["issueDate"])
                .and_then(|v| parse_iso_date(SourceCode::Ny, "issueDate", &v)),
            expires_at: row
                .pick(&["expirationDate"])
                .and_then(|v| parse_iso_date(SourceCode::Ny, "expirationDate", &v)),
            source_url: None,
            source_system: Some("NY_OCM".to_string()),
            raw: row.to_json(),
        })
    }
}
