//! Persistent-store abstraction and HTTP fetch utilities for Canopy.
//!
//! The ingestion core talks to a [`Store`] trait object; `MemoryStore` is
//! the in-process reference implementation and `PgStore` the Postgres one.
//! Individual operations are atomic; nothing here assumes cross-entity
//! transactions, since idempotent natural keys make repeated runs safe.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use canopy_core::{
    Batch, CoaDocument, CoaSourceType, Lab, LabResult, License, Location, UploadedDocument,
};

mod http;
mod memory;
mod postgres;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "canopy-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Find / create / update / link operations over the canonical entity
/// graph. Name lookups are case-insensitive; natural keys are documented
/// on each entity in `canopy-core`.
#[async_trait]
pub trait Store: Send + Sync {
    async fn find_license(
        &self,
        jurisdiction: &str,
        license_number: &str,
    ) -> Result<Option<License>, StoreError>;
    async fn insert_license(&self, license: &License) -> Result<(), StoreError>;
    async fn update_license(&self, license: &License) -> Result<(), StoreError>;

    async fn find_lab_by_license(&self, license_id: Uuid) -> Result<Option<Lab>, StoreError>;
    async fn find_lab_by_name(
        &self,
        jurisdiction: &str,
        name: &str,
    ) -> Result<Option<Lab>, StoreError>;
    async fn insert_lab(&self, lab: &Lab) -> Result<(), StoreError>;
    async fn link_lab_to_license(&self, lab_id: Uuid, license_id: Uuid)
        -> Result<(), StoreError>;

    async fn find_location_by_license(
        &self,
        license_id: Uuid,
    ) -> Result<Option<Location>, StoreError>;
    async fn find_location_by_name(
        &self,
        jurisdiction: &str,
        name: &str,
    ) -> Result<Option<Location>, StoreError>;
    async fn insert_location(&self, location: &Location) -> Result<(), StoreError>;
    async fn link_location_to_license(
        &self,
        location_id: Uuid,
        license_id: Uuid,
    ) -> Result<(), StoreError>;

    async fn find_batch_by_code(&self, batch_code: &str) -> Result<Option<Batch>, StoreError>;
    async fn insert_batch(&self, batch: &Batch) -> Result<(), StoreError>;
    /// Insert the (batch, location) observation or refresh its last-seen
    /// timestamp. Never deletes.
    async fn touch_batch_location(
        &self,
        batch_id: Uuid,
        location_id: Uuid,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Uploaded documents that are verified, of one of the given media
    /// types, and not yet linked to a LabResult, oldest first.
    async fn pending_coa_uploads(
        &self,
        media_types: &[&str],
        limit: usize,
    ) -> Result<Vec<UploadedDocument>, StoreError>;
    async fn lab_result_for_document(
        &self,
        document_id: Uuid,
    ) -> Result<Option<Uuid>, StoreError>;
    async fn insert_lab_result(&self, result: &LabResult) -> Result<(), StoreError>;

    async fn find_coa_document(
        &self,
        source_type: CoaSourceType,
        title: &str,
        lab_name: Option<&str>,
    ) -> Result<Option<CoaDocument>, StoreError>;
    async fn insert_coa_document(&self, document: &CoaDocument) -> Result<(), StoreError>;
    async fn update_coa_document(&self, document: &CoaDocument) -> Result<(), StoreError>;

    /// Advisory run lease: returns true when acquired (no live lease held
    /// by someone else). A lease whose expiry has passed is reclaimable.
    async fn acquire_import_lease(
        &self,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    async fn release_import_lease(&self, holder: &str) -> Result<(), StoreError>;
}
