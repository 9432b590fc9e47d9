//! License-type classification: lab vs facility, and facility sub-type.
//!
//! Government sources carry a bounded, known vocabulary of license types,
//! so each gets an enumerated mapping table consulted first. The keyword
//! heuristic is the fallback for the consolidated feed and for any type
//! string a table does not recognize.

use serde::{Deserialize, Serialize};

use crate::SourceCode;

/// Facility sub-type for non-lab locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LocationType {
    Cultivation,
    Manufacturing,
    Dispensary,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LicenseClass {
    Lab,
    Facility(LocationType),
}

/// Enumerated vocabulary per government source. Matching is
/// case-insensitive on the full type string.
fn vocabulary(source: SourceCode) -> &'static [(&'static str, LicenseClass)] {
    use LicenseClass::{Facility, Lab};
    use LocationType::*;
    match source {
        SourceCode::Ma => &[
            ("marijuana retailer", Facility(Dispensary)),
            ("marijuana cultivator", Facility(Cultivation)),
            ("marijuana product manufacturer", Facility(Manufacturing)),
            ("independent testing laboratory", Lab),
            ("marijuana microbusiness", Facility(Other)),
            ("marijuana transporter", Facility(Other)),
        ],
        SourceCode::Me => &[
            ("adult use store", Facility(Dispensary)),
            ("adult use cultivation facility", Facility(Cultivation)),
            ("adult use products manufacturing facility", Facility(Manufacturing)),
            ("adult use testing facility", Lab),
        ],
        SourceCode::Co => &[
            ("marijuana store", Facility(Dispensary)),
            ("cultivation facility", Facility(Cultivation)),
            ("product manufacturer", Facility(Manufacturing)),
            ("testing facility", Lab),
            ("transporter", Facility(Other)),
            ("hospitality", Facility(Other)),
            ("operator", Facility(Other)),
        ],
        SourceCode::Nb => &[("retail store", Facility(Dispensary))],
        SourceCode::Ny => &[
            ("adult-use retail dispensary", Facility(Dispensary)),
            ("adult-use cultivator", Facility(Cultivation)),
            ("adult-use processor", Facility(Manufacturing)),
            ("adult-use conditional cultivator", Facility(Cultivation)),
            ("cannabis laboratory", Lab),
            ("microbusiness", Facility(Other)),
        ],
        SourceCode::Ca => &[
            ("cannabis - retailer license", Facility(Dispensary)),
            ("cannabis - cultivation license", Facility(Cultivation)),
            ("cannabis - manufacturer license", Facility(Manufacturing)),
            ("cannabis - testing laboratory license", Lab),
            ("cannabis - distributor license", Facility(Other)),
            ("cannabis - microbusiness license", Facility(Other)),
            ("cannabis - event organizer license", Facility(Other)),
        ],
        SourceCode::Wa => &[
            ("cannabis producer", Facility(Cultivation)),
            ("cannabis processor", Facility(Manufacturing)),
            ("cannabis producer/processor", Facility(Cultivation)),
            ("cannabis retailer", Facility(Dispensary)),
            ("cannabis testing lab", Lab),
            ("cannabis transporter", Facility(Other)),
        ],
        // Unbounded vocabulary; keyword fallback only.
        SourceCode::Consolidated => &[],
    }
}

/// Keyword fallback with a codified precedence: a lab/test match wins over
/// every facility keyword, then cultivation, manufacturing,
/// retail/dispensary, other. First match wins because free-text categories
/// are not mutually exclusive.
fn classify_keywords(license_type: &str) -> LicenseClass {
    let lower = license_type.to_ascii_lowercase();
    if lower.contains("lab") || lower.contains("test") {
        return LicenseClass::Lab;
    }
    if lower.contains("cultiv") {
        LicenseClass::Facility(LocationType::Cultivation)
    } else if lower.contains("manufact") || lower.contains("process") {
        LicenseClass::Facility(LocationType::Manufacturing)
    } else if lower.contains("retail") || lower.contains("dispens") || lower.contains("store") {
        LicenseClass::Facility(LocationType::Dispensary)
    } else {
        LicenseClass::Facility(LocationType::Other)
    }
}

/// Classify a license-type string, preferring the source's enumerated
/// vocabulary over the keyword heuristic.
pub fn classify_license_type(source: SourceCode, license_type: &str) -> LicenseClass {
    let lower = license_type.trim().to_ascii_lowercase();
    for (known, class) in vocabulary(source) {
        if lower == *known {
            return *class;
        }
    }
    classify_keywords(&lower)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocabulary_match_beats_keywords() {
        // "Marijuana Microbusiness" contains no useful keywords; the table
        // pins it to Other instead of falling through unpredictably.
        assert_eq!(
            classify_license_type(SourceCode::Ma, "Marijuana Microbusiness"),
            LicenseClass::Facility(LocationType::Other)
        );
        assert_eq!(
            classify_license_type(SourceCode::Ma, "Independent Testing Laboratory"),
            LicenseClass::Lab
        );
    }

    #[test]
    fn lab_keywords_take_precedence_over_facility_keywords() {
        assert_eq!(
            classify_license_type(SourceCode::Consolidated, "Retail Testing Laboratory"),
            LicenseClass::Lab
        );
        assert_eq!(
            classify_license_type(SourceCode::Consolidated, "Cultivation Lab Annex"),
            LicenseClass::Lab
        );
    }

    #[test]
    fn facility_keyword_order_is_cultivation_first() {
        assert_eq!(
            classify_license_type(SourceCode::Consolidated, "Retail Cultivation Site"),
            LicenseClass::Facility(LocationType::Cultivation)
        );
        assert_eq!(
            classify_license_type(SourceCode::Consolidated, "Product Manufacturer"),
            LicenseClass::Facility(LocationType::Manufacturing)
        );
        assert_eq!(
            classify_license_type(SourceCode::Consolidated, "Medical Dispensary"),
            LicenseClass::Facility(LocationType::Dispensary)
        );
        assert_eq!(
            classify_license_type(SourceCode::Consolidated, "Delivery Courier"),
            LicenseClass::Facility(LocationType::Other)
        );
    }

    #[test]
    fn unknown_type_in_government_source_falls_back_to_keywords() {
        assert_eq!(
            classify_license_type(SourceCode::Ma, "Craft Marijuana Cultivator Cooperative"),
            LicenseClass::Facility(LocationType::Cultivation)
        );
    }
}
