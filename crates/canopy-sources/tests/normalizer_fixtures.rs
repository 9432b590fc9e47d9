//! Fixture-driven normalizer tests over realistic source exports.

use canopy_core::SourceCode;
use canopy_sources::{parse_csv, LicenseSource, MaineSource, MassachusettsSource, RawRow};
use chrono::NaiveDate;
use serde_json::json;

const MA_CSV: &str = "\
License Number,License Type,License Designation,License Status,Licensee Name,Doing Business As,City,Issue Date
MA-0001,Marijuana Retailer,,Active,Green Leaf LLC,GreenLeaf Dispensary,Boston,2023-06-15
MA-0002,Marijuana Cultivator,Adult-Use,Active,Berkshire Roots Inc,Berkshire Roots Inc,Pittsfield,
,,,,,,Springfield,
";

const ME_CSV: &str = "\
LICENSE,LICENSE_CATEGORY,LICENSE_TYPE,LICENSE_STATUS,LICENSE_NAME,DBA,LICENSE_CITY,ISSUE_DATE,EXPIRATION_DATE
AMS338,Adult Use Store,,Active,Coastal Cannabis Co,The Lighthouse,Portland,03/01/2024,03/01/2026
CUL112,Adult Use Cultivation Facility,Tier 2,Active,Pine State Growers,,Bangor,13/45/2024,
";

#[test]
fn massachusetts_row_produces_license_with_dba_location() {
    let rows = parse_csv(MA_CSV).unwrap();
    let record = MassachusettsSource.normalize(&rows[0]).unwrap();

    assert_eq!(record.source, SourceCode::Ma);
    assert_eq!(record.jurisdiction, "MA");
    assert_eq!(record.license_number, "MA-0001");
    assert_eq!(record.entity_name, "Green Leaf LLC");
    assert_eq!(record.trade_name.as_deref(), Some("GreenLeaf Dispensary"));
    assert_eq!(record.display_name(), "GreenLeaf Dispensary");
    assert_eq!(record.city.as_deref(), Some("Boston"));
    assert_eq!(record.status, "Active");
    assert_eq!(record.issued_at, NaiveDate::from_ymd_opt(2023, 6, 15));
    assert_eq!(record.raw["License Number"], json!("MA-0001"));
}

#[test]
fn massachusetts_dba_equal_to_entity_is_suppressed() {
    let rows = parse_csv(MA_CSV).unwrap();
    let record = MassachusettsSource.normalize(&rows[1]).unwrap();

    assert_eq!(record.trade_name, None);
    assert_eq!(record.display_name(), "Berkshire Roots Inc");
    // Designation folded into the type text.
    assert_eq!(record.license_type, "Adult-Use Marijuana Cultivator");
}

#[test]
fn row_without_license_or_name_is_skipped() {
    let rows = parse_csv(MA_CSV).unwrap();
    assert_eq!(rows.len(), 3);
    assert!(MassachusettsSource.normalize(&rows[2]).is_none());
}

#[test]
fn maine_combines_category_and_type_and_parses_mdy_dates() {
    let rows = parse_csv(ME_CSV).unwrap();

    let store = MaineSource.normalize(&rows[0]).unwrap();
    assert_eq!(store.license_type, "Adult Use Store");
    assert_eq!(store.trade_name.as_deref(), Some("The Lighthouse"));
    assert_eq!(store.issued_at, NaiveDate::from_ymd_opt(2024, 3, 1));
    assert_eq!(store.expires_at, NaiveDate::from_ymd_opt(2026, 3, 1));

    let cultivator = MaineSource.normalize(&rows[1]).unwrap();
    assert_eq!(cultivator.license_type, "Adult Use Cultivation Facility - Tier 2");
    // Invalid calendar date dropped, not an error.
    assert_eq!(cultivator.issued_at, None);
    assert_eq!(cultivator.expires_at, None);
}

#[test]
fn numeric_json_fields_are_readable_as_text() {
    let mut row = RawRow::default();
    row.insert("licenseNumber", json!(12345));
    assert_eq!(row.pick(&["licenseNumber"]), Some("12345".to_string()));
}
