//! Reconciliation/upsert engine: one normalized record in, canonical
//! License + establishing facility out.

use chrono::{DateTime, Utc};
use tracing::{debug, error};
use uuid::Uuid;

use canopy_core::{
    classify_license_type, slug, Lab, License, LicenseClass, Location, NormalizedLicenseRecord,
};
use canopy_store::{Store, StoreError};

/// Outcome of one record's upsert, for counting. Failures are soft: they
/// are logged and reported, never propagated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Failed(String),
}

/// Upsert one license and its establishing facility. Any store error is
/// logged with the license identity and swallowed into the outcome so a bad
/// record cannot abort its source.
pub async fn upsert_license(
    store: &dyn Store,
    record: &NormalizedLicenseRecord,
    now: DateTime<Utc>,
) -> UpsertOutcome {
    match try_upsert(store, record, now).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(
                license_number = %record.license_number,
                jurisdiction = %record.jurisdiction,
                error = %err,
                "license upsert failed"
            );
            UpsertOutcome::Failed(err.to_string())
        }
    }
}

async fn try_upsert(
    store: &dyn Store,
    record: &NormalizedLicenseRecord,
    now: DateTime<Utc>,
) -> Result<UpsertOutcome, StoreError> {
    let (license, outcome) = match store
        .find_license(&record.jurisdiction, &record.license_number)
        .await?
    {
        Some(mut existing) => {
            existing.merge_from(record, now);
            store.update_license(&existing).await?;
            (existing, UpsertOutcome::Updated)
        }
        None => {
            let license = License::from_record(record, now);
            store.insert_license(&license).await?;
            (license, UpsertOutcome::Created)
        }
    };

    match classify_license_type(record.source, &record.license_type) {
        LicenseClass::Lab => ensure_lab(store, record, &license).await?,
        LicenseClass::Facility(location_type) => {
            ensure_location(store, record, &license, location_type).await?
        }
    }

    Ok(outcome)
}

/// Resolve the establishing lab for a license. A facility already linked to
/// this license always wins; a name match is only adopted when unlinked, so
/// name collisions across licenses never silently merge.
async fn ensure_lab(
    store: &dyn Store,
    record: &NormalizedLicenseRecord,
    license: &License,
) -> Result<(), StoreError> {
    if store.find_lab_by_license(license.id).await?.is_some() {
        return Ok(());
    }

    let name = record.display_name();
    if let Some(lab) = store.find_lab_by_name(&record.jurisdiction, name).await? {
        if lab.license_id.is_none() {
            store.link_lab_to_license(lab.id, license.id).await?;
            return Ok(());
        }
        debug!(lab = %lab.name, "name matches a lab linked elsewhere; creating a new one");
    }

    let lab = Lab {
        id: Uuid::new_v4(),
        name: name.to_string(),
        slug: slug(name),
        jurisdiction: record.jurisdiction.clone(),
        city: record.city.clone(),
        license_id: Some(license.id),
    };
    store.insert_lab(&lab).await
}

async fn ensure_location(
    store: &dyn Store,
    record: &NormalizedLicenseRecord,
    license: &License,
    location_type: canopy_core::LocationType,
) -> Result<(), StoreError> {
    if store.find_location_by_license(license.id).await?.is_some() {
        return Ok(());
    }

    let name = record.display_name();
    if let Some(location) = store
        .find_location_by_name(&record.jurisdiction, name)
        .await?
    {
        if location.license_id.is_none() {
            store
                .link_location_to_license(location.id, license.id)
                .await?;
            return Ok(());
        }
        debug!(location = %location.name, "name matches a location linked elsewhere; creating a new one");
    }

    let location = Location {
        id: Uuid::new_v4(),
        name: name.to_string(),
        slug: slug(name),
        location_type,
        jurisdiction: record.jurisdiction.clone(),
        address_line1: record.address_line1.clone(),
        address_line2: record.address_line2.clone(),
        city: record.city.clone(),
        postal_code: record.postal_code.clone(),
        country: record.country.clone(),
        latitude: record.latitude,
        longitude: record.longitude,
        license_id: Some(license.id),
    };
    store.insert_location(&location).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::{LocationType, SourceCode};
    use canopy_store::MemoryStore;
    use serde_json::json;

    fn record(number: &str, license_type: &str, entity: &str) -> NormalizedLicenseRecord {
        NormalizedLicenseRecord {
            source: SourceCode::Ma,
            jurisdiction: "MA".to_string(),
            license_number: number.to_string(),
            license_type: license_type.to_string(),
            status: "Active".to_string(),
            entity_name: entity.to_string(),
            trade_name: None,
            address_line1: None,
            address_line2: None,
            city: Some("Boston".to_string()),
            postal_code: None,
            country: None,
            latitude: None,
            longitude: None,
            issued_at: None,
            expires_at: None,
            source_url: None,
            source_system: Some("MA_CCC".to_string()),
            raw: json!({"License Number": number}),
        }
    }

    #[tokio::test]
    async fn reingestion_updates_instead_of_duplicating() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let rec = record("MA-0001", "Marijuana Retailer", "Green Leaf LLC");

        assert_eq!(upsert_license(&store, &rec, now).await, UpsertOutcome::Created);
        assert_eq!(upsert_license(&store, &rec, now).await, UpsertOutcome::Updated);

        assert_eq!(store.license_count().await, 1);
        assert_eq!(store.location_count().await, 1);
    }

    #[tokio::test]
    async fn partial_update_preserves_city() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let rec = record("MA-0001", "Marijuana Retailer", "Green Leaf LLC");
        upsert_license(&store, &rec, now).await;

        let mut sparse = rec.clone();
        sparse.city = None;
        sparse.status = "Suspended".to_string();
        upsert_license(&store, &sparse, now).await;

        let stored = store.get_license("MA", "MA-0001").await.unwrap();
        assert_eq!(stored.city.as_deref(), Some("Boston"));
        assert_eq!(stored.status, "Suspended");
    }

    #[tokio::test]
    async fn lab_license_creates_lab_not_location() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let rec = record("MA-0100", "Independent Testing Laboratory", "Bay State Labs");
        upsert_license(&store, &rec, now).await;

        assert_eq!(store.lab_count().await, 1);
        assert_eq!(store.location_count().await, 0);
        let lab = &store.labs().await[0];
        assert_eq!(lab.name, "Bay State Labs");
        assert!(lab.license_id.is_some());
    }

    #[tokio::test]
    async fn retail_testing_laboratory_is_a_lab() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut rec = record("MA-0101", "Retail Testing Laboratory", "Crossover Labs");
        rec.source = SourceCode::Consolidated;
        rec.jurisdiction = "IL".to_string();
        upsert_license(&store, &rec, now).await;

        assert_eq!(store.lab_count().await, 1);
        assert_eq!(store.location_count().await, 0);
    }

    #[tokio::test]
    async fn unlinked_name_match_is_adopted_linked_one_is_not() {
        let store = MemoryStore::new();
        let now = Utc::now();

        // Pre-existing unlinked location with the same display name.
        store
            .seed_location(Location {
                id: Uuid::new_v4(),
                name: "Green Leaf LLC".to_string(),
                slug: slug("Green Leaf LLC"),
                location_type: LocationType::Dispensary,
                jurisdiction: "MA".to_string(),
                address_line1: None,
                address_line2: None,
                city: None,
                postal_code: None,
                country: None,
                latitude: None,
                longitude: None,
                license_id: None,
            })
            .await;

        let rec = record("MA-0001", "Marijuana Retailer", "Green Leaf LLC");
        upsert_license(&store, &rec, now).await;
        // Adopted, not duplicated.
        assert_eq!(store.location_count().await, 1);
        assert!(store.locations().await[0].license_id.is_some());

        // Same name under a different license: direct link beats name match,
        // so a fresh location is created instead of stealing the first.
        let other = record("MA-0002", "Marijuana Retailer", "Green Leaf LLC");
        upsert_license(&store, &other, now).await;
        assert_eq!(store.location_count().await, 2);

        // Re-running the first license does not touch the second's facility.
        upsert_license(&store, &rec, now).await;
        assert_eq!(store.location_count().await, 2);
    }

    #[tokio::test]
    async fn store_failure_is_soft_and_carries_context() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.fail_next_write_for("MA-0001").await;

        let rec = record("MA-0001", "Marijuana Retailer", "Green Leaf LLC");
        match upsert_license(&store, &rec, now).await {
            UpsertOutcome::Failed(message) => assert!(message.contains("MA-0001")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(store.license_count().await, 0);

        // The very next attempt succeeds.
        assert_eq!(upsert_license(&store, &rec, now).await, UpsertOutcome::Created);
    }
}
