//! Massachusetts Cannabis Control Commission open-data CSV (adult-use + MTC
//! licensing tracker).

use async_trait::async_trait;

use canopy_core::{
    combine_type_and_designation, resolve_trade_name, NormalizedLicenseRecord, SourceCode,
};
use canopy_store::HttpFetcher;

use crate::{parse_iso_date, parse_csv, LicenseSource, RawRow, SourceConfig, SourceError};

const MA_CSV_URL: &str = "https://masscannabiscontrol.com/resource/l_licenses_aumtc.csv";

pub struct MassachusettsSource;

#[async_trait]
impl LicenseSource for MassachusettsSource {
    fn code(&self) -> SourceCode {
        SourceCode::Ma
    }

    fn display_name(&self) -> &'static str {
        "Massachusetts CCC"
    }

    async fn fetch_rows(
        &self,
        http: &HttpFetcher,
        _config: &SourceConfig,
    ) -> Result<Vec<RawRow>, SourceError> {
        let body = http.fetch_text("ma", MA_CSV_URL).await?;
        parse_csv(&body)
    }

    fn normalize(&self, row: &RawRow) -> Option<NormalizedLicenseRecord> {
        let license_number = row
            .pick(&["License Number", "License #", "License ID", "License"])
            .unwrap_or_default();
        let entity_name = row
            .pick(&["Licensee Name", "Entity Name", "Name"])
            .unwrap_or_default();
        if license_number.is_empty() || entity_name.is_empty() {
            return None;
        }

        let base_type = row
            .pick(&["License Type", "License Category"])
            .unwrap_or_default();
        let designation = row.pick(&["License Designation", "Designation"]);
        let license_type = combine_type_and_designation(&base_type, designation.as_deref());

        let dba = row.pick(&["Doing Business As", "DBA", "Trade Name"]);
        let issued_at = row
            .pick(&["Issue Date", "Issued"])
            .and_then(|v| parse_iso_date(SourceCode::Ma, "Issue Date", &v));

        Some(NormalizedLicenseRecord {
            source: SourceCode::Ma,
            jurisdiction: "MA".to_string(),
            license_number,
            license_type,
            status: row
                .pick(&["License Status", "Status", "Application/License Status"])
                .unwrap_or_else(|| "Unknown".to_string()),
            trade_name: resolve_trade_name(&entity_name, dba.as_deref()),
            entity_name,
            address_line1: None,
            address_line2: None,
            city: row.pick(&["City", "Town", "Municipality"]),
            postal_code: None,
            country: Some("US".to_string()),
            latitude: None,
            longitude: None,
            issued_at,
            expires_at: None,
            source_url: Some(MA_CSV_URL.to_string()),
            source_system: Some("MA_CCC".to_string()),
            raw: row.to_json(),
        })
    }
}
