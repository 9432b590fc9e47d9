//! Cannabis NB store-locator page scrape. The province runs a retail
//! monopoly, so each store is modelled as a retail license with a
//! deterministic city-derived license number.

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value as JsonValue;
use tracing::warn;

use canopy_core::{slug, NormalizedLicenseRecord, SourceCode};
use canopy_store::HttpFetcher;

use crate::{LicenseSource, RawRow, SourceConfig, SourceError};

const NB_STORES_URL: &str = "https://www.cannabis-nb.com/stores/";

pub struct NewBrunswickSource;

fn store_rows_from_html(html: &str) -> Result<Vec<RawRow>, SourceError> {
    let document = Html::parse_document(html);
    // Store addresses are the map links; the city sits in the first cell of
    // the same table row.
    let anchor_sel = Selector::parse(r#"a[href*="google"][href*="maps"]"#)
        .map_err(|e| SourceError::Decode(e.to_string()))?;
    let td_sel = Selector::parse("td").map_err(|e| SourceError::Decode(e.to_string()))?;

    let mut rows = Vec::new();
    for anchor in document.select(&anchor_sel) {
        let address = anchor.text().collect::<String>().trim().to_string();
        if address.is_empty() {
            continue;
        }
        let city = anchor
            .ancestors()
            .filter_map(ElementRef::wrap)
            .find(|el| el.value().name() == "tr")
            .and_then(|tr| tr.select(&td_sel).next())
            .map(|td| td.text().collect::<String>().trim().to_string())
            .filter(|s| !s.is_empty());

        let mut row = RawRow::default();
        row.insert("address", JsonValue::String(address));
        if let Some(city) = city {
            row.insert("city", JsonValue::String(city));
        }
        rows.push(row);
    }

    if rows.is_empty() {
        warn!(url = NB_STORES_URL, "no store links found; page structure may have changed");
    }
    Ok(rows)
}

#[async_trait]
impl LicenseSource for NewBrunswickSource {
    fn code(&self) -> SourceCode {
        SourceCode::Nb
    }

    fn display_name(&self) -> &'static str {
        "Cannabis NB"
    }

    async fn fetch_rows(
        &self,
        http: &HttpFetcher,
        _config: &SourceConfig,
    ) -> Result<Vec<RawRow>, SourceError> {
        let html = http.fetch_text("nb", NB_STORES_URL).await?;
        store_rows_from_html(&html)
    }

    fn normalize(&self, row: &RawRow) -> Option<NormalizedLicenseRecord> {
        let address = row.pick(&["address"])?;
        let parts: Vec<&str> = address.split(',').map(str::trim).collect();

        // Two published shapes: with or without a suite line.
        //   [street], [suite], [city], [NB X1Y 2Z3], [Canada]
        //   [street], [city], [NB X1Y 2Z3], [Canada]
        let (address_line1, address_line2, postal_code, country) = match parts.len() {
            5 => (
                parts[0].to_string(),
                Some(parts[1].to_string()),
                Some(parts[3].trim_start_matches("NB").trim().to_string()),
                parts[4].to_string(),
            ),
            4 => (
                parts[0].to_string(),
                None,
                Some(parts[2].trim_start_matches("NB").trim().to_string()),
                parts[3].to_string(),
            ),
            _ => (address.clone(), None, None, "Canada".to_string()),
        };

        let city = row.pick(&["city"]).or_else(|| {
            // Fall back to the third-from-last address component.
            (parts.len() >= 3).then(|| parts[parts.len() - 3].to_string())
        })?;

        let store_name = format!("Cannabis NB - {city}");
        let license_number = format!("NB-RETAIL-{}", slug(&city).to_ascii_uppercase());

        Some(NormalizedLicenseRecord {
            source: SourceCode::Nb,
            jurisdiction: "NB".to_string(),
            license_number,
            license_type: "Retail Store".to_string(),
            // The locator lists operating stores only.
            status: "Active".to_string(),
            entity_name: "Cannabis NB".to_string(),
            trade_name: Some(store_name),
            address_line1: Some(address_line1),
            address_line2,
            city: Some(city),
            postal_code: postal_code.filter(|s| !s.is_empty()),
            country: Some(country),
            latitude: None,
            longitude: None,
            issued_at: None,
            expires_at: None,
            source_url: Some(NB_STORES_URL.to_string()),
            source_system: Some("NB_CANNABIS_NB".to_string()),
            raw: row.to_json(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STORES_HTML: &str = r#"
        <html><body><table>
          <tr>
            <td>Bathurst</td>
            <td><a href="https://www.google.com/maps/place/x">420 St Peter Ave, Bathurst, NB E2A 2Y7, Canada</a></td>
          </tr>
          <tr>
            <td>Fredericton</td>
            <td><a href="https://www.google.com/maps/place/y">500 Queen St, Suite 2, Fredericton, NB E3B 1B2, Canada</a></td>
          </tr>
        </table></body></html>"#;

    #[test]
    fn scrape_extracts_address_and_row_city() {
        let rows = store_rows_from_html(STORES_HTML).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].pick(&["city"]), Some("Bathurst".to_string()));
        assert!(rows[1].pick(&["address"]).unwrap().contains("Suite 2"));
    }

    #[test]
    fn scrape_of_drifted_page_yields_zero_rows() {
        let rows = store_rows_from_html("<html><body><p>moved</p></body></html>").unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn normalize_builds_deterministic_license_numbers() {
        let rows = store_rows_from_html(STORES_HTML).unwrap();
        let source = NewBrunswickSource;

        let bathurst = source.normalize(&rows[0]).unwrap();
        assert_eq!(bathurst.license_number, "NB-RETAIL-BATHURST");
        assert_eq!(bathurst.trade_name.as_deref(), Some("Cannabis NB - Bathurst"));
        assert_eq!(bathurst.postal_code.as_deref(), Some("E2A 2Y7"));
        assert_eq!(bathurst.status, "Active");

        let fredericton = source.normalize(&rows[1]).unwrap();
        assert_eq!(fredericton.address_line2.as_deref(), Some("Suite 2"));
        assert_eq!(fredericton.city.as_deref(), Some("Fredericton"));
    }
}
