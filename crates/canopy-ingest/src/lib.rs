//! Reconciliation/upsert engine, batch run orchestration, and COA linking.

use thiserror::Error;

use canopy_store::StoreError;

pub mod coa;
pub mod engine;
pub mod orchestrator;

pub use coa::{ingest_coa_feed, link_pending_coas, CoaLinkOptions};
pub use engine::{upsert_license, UpsertOutcome};
pub use orchestrator::{
    run_import, run_import_with_sources, ImportOptions, LEASE_TTL, UPSERT_CHUNK_SIZE,
};

pub const CRATE_NAME: &str = "canopy-ingest";

#[derive(Debug, Error)]
pub enum IngestError {
    /// Another run holds the import lease; try again after it expires.
    #[error("an import run is already in progress (lease held)")]
    LeaseHeld,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Source(#[from] canopy_sources::SourceError),
}
