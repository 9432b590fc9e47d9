//! California Department of Cannabis Control license-search API. Same
//! envelope as New York (`data` array + `metadata.hasNext`); only active
//! licenses are kept.

use async_trait::async_trait;
use tracing::info;

use canopy_core::{
    combine_type_and_designation, resolve_trade_name, NormalizedLicenseRecord, SourceCode,
};
use canopy_store::HttpFetcher;

use crate::{
    fetch_paginated, parse_iso_date, LicenseSource, RawRow, SourceConfig, SourceError,
};

const CA_API_URL: &str =
    "https://as-cdt-pub-vip-cannabis-ww-p-002.azurewebsites.net/licenses/filteredSearch";
const CA_SEARCH_URL: &str = "https://cannabis.ca.gov/license-search";
const CA_PAGE_SIZE: usize = 100;

pub struct CaliforniaSource;

#[async_trait]
impl LicenseSource for CaliforniaSource {
    fn code(&self) -> SourceCode {
        SourceCode::Ca
    }

    fn display_name(&self) -> &'static str {
        "California DCC"
    }

    async fn fetch_rows(
        &self,
        http: &HttpFetcher,
        _config: &SourceConfig,
    ) -> Result<Vec<RawRow>, SourceError> {
        let rows = fetch_paginated(SourceCode::Ca, |page| {
            let url = format!(
                "{CA_API_URL}?pageNumber={page}&pageSize={CA_PAGE_SIZE}&searchQuery="
            );
            async move {
                if page > 1 {
                    http.polite_pause().await;
                }
                Ok(http.fetch_text("ca", &url).await?)
            }
        })
        .await?;
        info!(total = rows.len(), "fetched California license pages");
        Ok(rows)
    }

    fn normalize(&self, row: &RawRow) -> Option<NormalizedLicenseRecord> {
        // Active-only policy, as with the other search-API sources.
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
        let dba = row.pick(&["businessDBA", "businessDBAName", "business_dba_name"]);

        Some(NormalizedLicenseRecord {
            source: SourceCode::Ca,
            jurisdiction: "CA".to_string(),
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
                .and_then(|v| parse_iso_date(SourceCode::Ca, "issueDate", &v)),
            expires_at: row
                .pick(&["expirationDate"])
                .and_then(|v| parse_iso_date(SourceCode::Ca, "expirationDate", &v)),
            source_url: Some(CA_SEARCH_URL.to_string()),
            source_system: Some("CA_DCC".to_string()),
            raw: row.to_json(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn active_row() -> RawRow {
        let mut row = RawRow::default();
        row.insert("licenseNumber", json!("C10-0000042-LIC"));
        row.insert("licenseStatus", json!("Active"));
        row.insert("licenseType", json!("Cannabis - Retailer License"));
        row.insert("licenseDesignation", json!("Adult-Use"));
        row.insert("businessName", json!("Golden State Collective"));
        row.insert("premiseCity", json!("Oakland"));
        row
    }

    #[test]
    fn active_license_is_normalized_with_designation() {
        let record = CaliforniaSource.normalize(&active_row()).unwrap();
        assert_eq!(record.jurisdiction, "CA");
        assert_eq!(record.license_type, "Adult-Use Cannabis - Retailer License");
        assert_eq!(record.source_system.as_deref(), Some("CA_DCC"));
        assert_eq!(record.city.as_deref(), Some("Oakland"));
    }

    #[test]
    fn non_active_licenses_are_filtered() {
        let mut row = active_row();
        row.insert("licenseStatus", json!("Surrendered"));
        assert!(CaliforniaSource.normalize(&row).is_none());
    }
}
