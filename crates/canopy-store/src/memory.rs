//! In-memory reference implementation of [`Store`].
//!
//! Backs the test suites and dry-run experiments; the behavior here is the
//! executable description of what `PgStore` must do.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use canopy_core::{
    Batch, BatchLocation, CoaDocument, CoaSourceType, Lab, LabResult, License, Location,
    UploadedDocument,
};

use crate::{Store, StoreError};

#[derive(Debug, Default)]
struct Inner {
    licenses: Vec<License>,
    labs: Vec<Lab>,
    locations: Vec<Location>,
    batches: Vec<Batch>,
    batch_locations: Vec<BatchLocation>,
    uploaded_documents: Vec<UploadedDocument>,
    lab_results: Vec<LabResult>,
    coa_documents: Vec<CoaDocument>,
    lease: Option<Lease>,
    /// License numbers whose next write fails, for failure-path tests.
    fail_license_numbers: HashSet<String>,
}

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arrange for the next insert/update of this license number to fail
    /// with a constraint-violation-shaped backend error.
    pub async fn fail_next_write_for(&self, license_number: &str) {
        let mut inner = self.inner.lock().await;
        inner.fail_license_numbers.insert(license_number.to_string());
    }

    pub async fn seed_uploaded_document(&self, document: UploadedDocument) {
        let mut inner = self.inner.lock().await;
        inner.uploaded_documents.push(document);
    }

    pub async fn seed_lab(&self, lab: Lab) {
        let mut inner = self.inner.lock().await;
        inner.labs.push(lab);
    }

    pub async fn seed_location(&self, location: Location) {
        let mut inner = self.inner.lock().await;
        inner.locations.push(location);
    }

    pub async fn license_count(&self) -> usize {
        self.inner.lock().await.licenses.len()
    }

    pub async fn lab_count(&self) -> usize {
        self.inner.lock().await.labs.len()
    }

    pub async fn location_count(&self) -> usize {
        self.inner.lock().await.locations.len()
    }

    pub async fn batch_count(&self) -> usize {
        self.inner.lock().await.batches.len()
    }

    pub async fn batch_location_count(&self) -> usize {
        self.inner.lock().await.batch_locations.len()
    }

    pub async fn lab_result_count(&self) -> usize {
        self.inner.lock().await.lab_results.len()
    }

    pub async fn coa_document_count(&self) -> usize {
        self.inner.lock().await.coa_documents.len()
    }

    pub async fn get_license(&self, jurisdiction: &str, number: &str) -> Option<License> {
        let inner = self.inner.lock().await;
        inner
            .licenses
            .iter()
            .find(|l| l.jurisdiction == jurisdiction && l.license_number == number)
            .cloned()
    }

    pub async fn labs(&self) -> Vec<Lab> {
        self.inner.lock().await.labs.clone()
    }

    pub async fn locations(&self) -> Vec<Location> {
        self.inner.lock().await.locations.clone()
    }

    pub async fn batches(&self) -> Vec<Batch> {
        self.inner.lock().await.batches.clone()
    }

    pub async fn batch_locations(&self) -> Vec<BatchLocation> {
        self.inner.lock().await.batch_locations.clone()
    }

    pub async fn lab_results(&self) -> Vec<LabResult> {
        self.inner.lock().await.lab_results.clone()
    }

    pub async fn coa_documents(&self) -> Vec<CoaDocument> {
        self.inner.lock().await.coa_documents.clone()
    }
}

fn check_fault(inner: &mut Inner, license_number: &str) -> Result<(), StoreError> {
    if inner.fail_license_numbers.remove(license_number) {
        return Err(StoreError::Backend(format!(
            "duplicate key value violates unique constraint (license {license_number})"
        )));
    }
    Ok(())
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_license(
        &self,
        jurisdiction: &str,
        license_number: &str,
    ) -> Result<Option<License>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .licenses
            .iter()
            .find(|l| l.jurisdiction == jurisdiction && l.license_number == license_number)
            .cloned())
    }

    async fn insert_license(&self, license: &License) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        check_fault(&mut inner, &license.license_number)?;
        inner.licenses.push(license.clone());
        Ok(())
    }

    async fn update_license(&self, license: &License) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        check_fault(&mut inner, &license.license_number)?;
        match inner.licenses.iter_mut().find(|l| l.id == license.id) {
            Some(existing) => {
                *existing = license.clone();
                Ok(())
            }
            None => Err(StoreError::Backend(format!(
                "license {} not found for update",
                license.id
            ))),
        }
    }

    async fn find_lab_by_license(&self, license_id: Uuid) -> Result<Option<Lab>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .labs
            .iter()
            .find(|lab| lab.license_id == Some(license_id))
            .cloned())
    }

    async fn find_lab_by_name(
        &self,
        jurisdiction: &str,
        name: &str,
    ) -> Result<Option<Lab>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .labs
            .iter()
            .find(|lab| lab.jurisdiction == jurisdiction && lab.name.eq_ignore_ascii_case(name))
            .cloned())
    }

    async fn insert_lab(&self, lab: &Lab) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.labs.push(lab.clone());
        Ok(())
    }

    async fn link_lab_to_license(
        &self,
        lab_id: Uuid,
        license_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.labs.iter_mut().find(|lab| lab.id == lab_id) {
            Some(lab) => {
                lab.license_id = Some(license_id);
                Ok(())
            }
            None => Err(StoreError::Backend(format!("lab {lab_id} not found"))),
        }
    }

    async fn find_location_by_license(
        &self,
        license_id: Uuid,
    ) -> Result<Option<Location>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .locations
            .iter()
            .find(|loc| loc.license_id == Some(license_id))
            .cloned())
    }

    async fn find_location_by_name(
        &self,
        jurisdiction: &str,
        name: &str,
    ) -> Result<Option<Location>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .locations
            .iter()
            .find(|loc| loc.jurisdiction == jurisdiction && loc.name.eq_ignore_ascii_case(name))
            .cloned())
    }

    async fn insert_location(&self, location: &Location) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.locations.push(location.clone());
        Ok(())
    }

    async fn link_location_to_license(
        &self,
        location_id: Uuid,
        license_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.locations.iter_mut().find(|loc| loc.id == location_id) {
            Some(location) => {
                location.license_id = Some(license_id);
                Ok(())
            }
            None => Err(StoreError::Backend(format!(
                "location {location_id} not found"
            ))),
        }
    }

    async fn find_batch_by_code(&self, batch_code: &str) -> Result<Option<Batch>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .batches
            .iter()
            .find(|b| b.batch_code == batch_code)
            .cloned())
    }

    async fn insert_batch(&self, batch: &Batch) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.batches.push(batch.clone());
        Ok(())
    }

    async fn touch_batch_location(
        &self,
        batch_id: Uuid,
        location_id: Uuid,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner
            .batch_locations
            .iter_mut()
            .find(|bl| bl.batch_id == batch_id && bl.location_id == location_id)
        {
            Some(existing) => {
                existing.last_seen = seen_at;
            }
            None => {
                inner.batch_locations.push(BatchLocation {
                    batch_id,
                    location_id,
                    first_seen: seen_at,
                    last_seen: seen_at,
                });
            }
        }
        Ok(())
    }

    async fn pending_coa_uploads(
        &self,
        media_types: &[&str],
        limit: usize,
    ) -> Result<Vec<UploadedDocument>, StoreError> {
        let inner = self.inner.lock().await;
        let linked: HashSet<Uuid> = inner
            .lab_results
            .iter()
            .filter_map(|r| r.uploaded_document_id)
            .collect();
        let mut candidates: Vec<UploadedDocument> = inner
            .uploaded_documents
            .iter()
            .filter(|doc| {
                doc.verified
                    && media_types.contains(&doc.media_type.as_str())
                    && !linked.contains(&doc.id)
            })
            .cloned()
            .collect();
        candidates.sort_by_key(|doc| doc.created_at);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn lab_result_for_document(
        &self,
        document_id: Uuid,
    ) -> Result<Option<Uuid>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .lab_results
            .iter()
            .find(|r| r.uploaded_document_id == Some(document_id))
            .map(|r| r.id))
    }

    async fn insert_lab_result(&self, result: &LabResult) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.lab_results.push(result.clone());
        Ok(())
    }

    async fn find_coa_document(
        &self,
        source_type: CoaSourceType,
        title: &str,
        lab_name: Option<&str>,
    ) -> Result<Option<CoaDocument>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .coa_documents
            .iter()
            .find(|doc| {
                doc.source_type == source_type
                    && doc.title == title
                    && doc.lab_name.as_deref() == lab_name
            })
            .cloned())
    }

    async fn insert_coa_document(&self, document: &CoaDocument) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.coa_documents.push(document.clone());
        Ok(())
    }

    async fn update_coa_document(&self, document: &CoaDocument) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.coa_documents.iter_mut().find(|d| d.id == document.id) {
            Some(existing) => {
                *existing = document.clone();
                Ok(())
            }
            None => Err(StoreError::Backend(format!(
                "coa document {} not found for update",
                document.id
            ))),
        }
    }

    async fn acquire_import_lease(
        &self,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1));
        match &inner.lease {
            Some(lease) if lease.holder != holder && lease.expires_at > now => Ok(false),
            _ => {
                inner.lease = Some(Lease {
                    holder: holder.to_string(),
                    expires_at,
                });
                Ok(true)
            }
        }
    }

    async fn release_import_lease(&self, holder: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner
            .lease
            .as_ref()
            .is_some_and(|lease| lease.holder == holder)
        {
            inner.lease = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lab(name: &str, jurisdiction: &str) -> Lab {
        Lab {
            id: Uuid::new_v4(),
            name: name.to_string(),
            slug: canopy_core::slug(name),
            jurisdiction: jurisdiction.to_string(),
            city: None,
            license_id: None,
        }
    }

    #[tokio::test]
    async fn lab_name_lookup_is_case_insensitive_and_jurisdiction_scoped() {
        let store = MemoryStore::new();
        store.seed_lab(lab("Pine Labs", "ME")).await;

        let hit = store.find_lab_by_name("ME", "pine labs").await.unwrap();
        assert!(hit.is_some());
        let miss = store.find_lab_by_name("MA", "Pine Labs").await.unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn batch_location_touch_refreshes_last_seen_only() {
        let store = MemoryStore::new();
        let batch_id = Uuid::new_v4();
        let location_id = Uuid::new_v4();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::hours(2);

        store
            .touch_batch_location(batch_id, location_id, t0)
            .await
            .unwrap();
        store
            .touch_batch_location(batch_id, location_id, t1)
            .await
            .unwrap();

        let rows = store.batch_locations().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].first_seen, t0);
        assert_eq!(rows[0].last_seen, t1);
    }

    #[tokio::test]
    async fn lease_blocks_other_holders_until_expiry() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let ttl = Duration::from_secs(600);

        assert!(store.acquire_import_lease("a", ttl, now).await.unwrap());
        assert!(!store.acquire_import_lease("b", ttl, now).await.unwrap());
        // Same holder may re-acquire (renewal).
        assert!(store.acquire_import_lease("a", ttl, now).await.unwrap());

        let later = now + chrono::Duration::seconds(700);
        assert!(store.acquire_import_lease("b", ttl, later).await.unwrap());

        store.release_import_lease("b").await.unwrap();
        assert!(store.acquire_import_lease("c", ttl, later).await.unwrap());
    }

    #[tokio::test]
    async fn pending_uploads_exclude_linked_and_unverified() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mk = |verified: bool, media_type: &str| UploadedDocument {
            id: Uuid::new_v4(),
            verified,
            media_type: media_type.to_string(),
            file_name: "coa.pdf".to_string(),
            file_path: Some("/uploads/coa.pdf".to_string()),
            batch_code: Some("B-1".to_string()),
            lab_name: None,
            sample_id: None,
            license_number: None,
            extracted_text: None,
            sampled_at: None,
            created_at: now,
        };

        let linked = mk(true, "application/pdf");
        store.seed_uploaded_document(linked.clone()).await;
        store.seed_uploaded_document(mk(true, "application/pdf")).await;
        store.seed_uploaded_document(mk(false, "application/pdf")).await;
        store.seed_uploaded_document(mk(true, "text/plain")).await;

        store
            .insert_lab_result(&LabResult {
                id: Uuid::new_v4(),
                batch_id: Uuid::new_v4(),
                lab_id: None,
                sample_id: None,
                status: "pending".to_string(),
                content: canopy_core::CoaContent::Pending,
                uploaded_document_id: Some(linked.id),
                created_at: now,
            })
            .await
            .unwrap();

        let pending = store
            .pending_coa_uploads(&["application/pdf"], 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_ne!(pending[0].id, linked.id);
    }

    #[tokio::test]
    async fn injected_write_failure_fires_once() {
        let store = MemoryStore::new();
        store.fail_next_write_for("MA-0001").await;

        let now = Utc::now();
        let license = License {
            id: Uuid::new_v4(),
            jurisdiction: "MA".to_string(),
            license_number: "MA-0001".to_string(),
            license_type: "Marijuana Retailer".to_string(),
            status: "Active".to_string(),
            entity_name: "Green Leaf LLC".to_string(),
            trade_name: None,
            address_line1: None,
            address_line2: None,
            city: None,
            postal_code: None,
            country: None,
            latitude: None,
            longitude: None,
            issued_at: None,
            expires_at: None,
            source_url: None,
            source_system: None,
            raw_payload: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        };

        assert!(store.insert_license(&license).await.is_err());
        assert!(store.insert_license(&license).await.is_ok());
    }
}
