//! Postgres-backed [`Store`].
//!
//! Queries use runtime binding (not the compile-time checked macros) so the
//! crate builds without a live database. `ensure_schema` creates the tables
//! idempotently; there is no migration history to replay for a fresh deploy.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use canopy_core::{
    Batch, CoaDocument, CoaSourceType, Lab, LabResult, License, Location, LocationType,
    UploadedDocument,
};

use crate::{Store, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS licenses (
    id UUID PRIMARY KEY,
    jurisdiction TEXT NOT NULL,
    license_number TEXT NOT NULL,
    license_type TEXT NOT NULL,
    status TEXT NOT NULL,
    entity_name TEXT NOT NULL,
    trade_name TEXT,
    address_line1 TEXT,
    address_line2 TEXT,
    city TEXT,
    postal_code TEXT,
    country TEXT,
    latitude DOUBLE PRECISION,
    longitude DOUBLE PRECISION,
    issued_at DATE,
    expires_at DATE,
    source_url TEXT,
    source_system TEXT,
    raw_payload JSONB NOT NULL DEFAULT 'null'::jsonb,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    UNIQUE (jurisdiction, license_number)
);

CREATE TABLE IF NOT EXISTS locations (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    slug TEXT NOT NULL,
    location_type TEXT NOT NULL,
    jurisdiction TEXT NOT NULL,
    address_line1 TEXT,
    address_line2 TEXT,
    city TEXT,
    postal_code TEXT,
    country TEXT,
    latitude DOUBLE PRECISION,
    longitude DOUBLE PRECISION,
    license_id UUID REFERENCES licenses(id)
);

CREATE TABLE IF NOT EXISTS labs (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    slug TEXT NOT NULL,
    jurisdiction TEXT NOT NULL,
    city TEXT,
    license_id UUID REFERENCES licenses(id)
);

CREATE TABLE IF NOT EXISTS batches (
    id UUID PRIMARY KEY,
    batch_code TEXT NOT NULL UNIQUE,
    jurisdiction TEXT,
    product_name TEXT,
    notes TEXT,
    created_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS batch_locations (
    batch_id UUID NOT NULL REFERENCES batches(id),
    location_id UUID NOT NULL REFERENCES locations(id),
    first_seen TIMESTAMPTZ NOT NULL,
    last_seen TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (batch_id, location_id)
);

CREATE TABLE IF NOT EXISTS uploaded_documents (
    id UUID PRIMARY KEY,
    verified BOOLEAN NOT NULL DEFAULT FALSE,
    media_type TEXT NOT NULL,
    file_name TEXT NOT NULL,
    file_path TEXT,
    batch_code TEXT,
    lab_name TEXT,
    sample_id TEXT,
    license_number TEXT,
    extracted_text TEXT,
    sampled_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS lab_results (
    id UUID PRIMARY KEY,
    batch_id UUID NOT NULL REFERENCES batches(id),
    lab_id UUID REFERENCES labs(id),
    sample_id TEXT,
    status TEXT NOT NULL,
    content JSONB NOT NULL,
    uploaded_document_id UUID REFERENCES uploaded_documents(id),
    created_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS coa_documents (
    id UUID PRIMARY KEY,
    title TEXT NOT NULL,
    lab_name TEXT,
    batch_ref TEXT,
    sample_id TEXT,
    license_ref TEXT,
    product_name TEXT,
    jurisdiction TEXT,
    file_type TEXT,
    file_url TEXT,
    source_type TEXT NOT NULL,
    source_url TEXT,
    raw_text TEXT,
    sample_collected_at TIMESTAMPTZ,
    sample_tested_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS import_lease (
    singleton BOOLEAN PRIMARY KEY DEFAULT TRUE,
    holder TEXT NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL,
    CHECK (singleton)
);
"#;

fn location_type_to_str(location_type: LocationType) -> &'static str {
    match location_type {
        LocationType::Cultivation => "CULTIVATION",
        LocationType::Manufacturing => "MANUFACTURING",
        LocationType::Dispensary => "DISPENSARY",
        LocationType::Other => "OTHER",
    }
}

fn location_type_from_str(value: &str) -> Result<LocationType, StoreError> {
    match value {
        "CULTIVATION" => Ok(LocationType::Cultivation),
        "MANUFACTURING" => Ok(LocationType::Manufacturing),
        "DISPENSARY" => Ok(LocationType::Dispensary),
        "OTHER" => Ok(LocationType::Other),
        other => Err(StoreError::Serialization(format!(
            "unknown location_type in store: {other}"
        ))),
    }
}

fn coa_source_type_from_str(value: &str) -> Result<CoaSourceType, StoreError> {
    match value {
        "manual-upload" => Ok(CoaSourceType::ManualUpload),
        "consolidated-feed" => Ok(CoaSourceType::ConsolidatedFeed),
        other => Err(StoreError::Serialization(format!(
            "unknown coa source_type in store: {other}"
        ))),
    }
}

fn license_from_row(row: &PgRow) -> Result<License, StoreError> {
    Ok(License {
        id: row.try_get("id")?,
        jurisdiction: row.try_get("jurisdiction")?,
        license_number: row.try_get("license_number")?,
        license_type: row.try_get("license_type")?,
        status: row.try_get("status")?,
        entity_name: row.try_get("entity_name")?,
        trade_name: row.try_get("trade_name")?,
        address_line1: row.try_get("address_line1")?,
        address_line2: row.try_get("address_line2")?,
        city: row.try_get("city")?,
        postal_code: row.try_get("postal_code")?,
        country: row.try_get("country")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        issued_at: row.try_get("issued_at")?,
        expires_at: row.try_get("expires_at")?,
        source_url: row.try_get("source_url")?,
        source_system: row.try_get("source_system")?,
        raw_payload: row.try_get("raw_payload")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn location_from_row(row: &PgRow) -> Result<Location, StoreError> {
    let location_type: String = row.try_get("location_type")?;
    Ok(Location {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        slug: row.try_get("slug")?,
        location_type: location_type_from_str(&location_type)?,
        jurisdiction: row.try_get("jurisdiction")?,
        address_line1: row.try_get("address_line1")?,
        address_line2: row.try_get("address_line2")?,
        city: row.try_get("city")?,
        postal_code: row.try_get("postal_code")?,
        country: row.try_get("country")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        license_id: row.try_get("license_id")?,
    })
}

fn lab_from_row(row: &PgRow) -> Result<Lab, StoreError> {
    Ok(Lab {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        slug: row.try_get("slug")?,
        jurisdiction: row.try_get("jurisdiction")?,
        city: row.try_get("city")?,
        license_id: row.try_get("license_id")?,
    })
}

fn batch_from_row(row: &PgRow) -> Result<Batch, StoreError> {
    Ok(Batch {
        id: row.try_get("id")?,
        batch_code: row.try_get("batch_code")?,
        jurisdiction: row.try_get("jurisdiction")?,
        product_name: row.try_get("product_name")?,
        notes: row.try_get("notes")?,
        created_at: row.try_get("created_at")?,
    })
}

fn uploaded_document_from_row(row: &PgRow) -> Result<UploadedDocument, StoreError> {
    Ok(UploadedDocument {
        id: row.try_get("id")?,
        verified: row.try_get("verified")?,
        media_type: row.try_get("media_type")?,
        file_name: row.try_get("file_name")?,
        file_path: row.try_get("file_path")?,
        batch_code: row.try_get("batch_code")?,
        lab_name: row.try_get("lab_name")?,
        sample_id: row.try_get("sample_id")?,
        license_number: row.try_get("license_number")?,
        extracted_text: row.try_get("extracted_text")?,
        sampled_at: row.try_get("sampled_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn coa_document_from_row(row: &PgRow) -> Result<CoaDocument, StoreError> {
    let source_type: String = row.try_get("source_type")?;
    Ok(CoaDocument {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        lab_name: row.try_get("lab_name")?,
        batch_ref: row.try_get("batch_ref")?,
        sample_id: row.try_get("sample_id")?,
        license_ref: row.try_get("license_ref")?,
        product_name: row.try_get("product_name")?,
        jurisdiction: row.try_get("jurisdiction")?,
        file_type: row.try_get("file_type")?,
        file_url: row.try_get("file_url")?,
        source_type: coa_source_type_from_str(&source_type)?,
        source_url: row.try_get("source_url")?,
        raw_text: row.try_get("raw_text")?,
        sample_collected_at: row.try_get("sample_collected_at")?,
        sample_tested_at: row.try_get("sample_tested_at")?,
        created_at: row.try_get("created_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Create all tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn find_license(
        &self,
        jurisdiction: &str,
        license_number: &str,
    ) -> Result<Option<License>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM licenses WHERE jurisdiction = $1 AND license_number = $2",
        )
        .bind(jurisdiction)
        .bind(license_number)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(license_from_row).transpose()
    }

    async fn insert_license(&self, license: &License) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO licenses (id, jurisdiction, license_number, license_type, status, \
             entity_name, trade_name, address_line1, address_line2, city, postal_code, country, \
             latitude, longitude, issued_at, expires_at, source_url, source_system, raw_payload, \
             created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, \
             $18, $19, $20, $21)",
        )
        .bind(license.id)
        .bind(&license.jurisdiction)
        .bind(&license.license_number)
        .bind(&license.license_type)
        .bind(&license.status)
        .bind(&license.entity_name)
        .bind(&license.trade_name)
        .bind(&license.address_line1)
        .bind(&license.address_line2)
        .bind(&license.city)
        .bind(&license.postal_code)
        .bind(&license.country)
        .bind(license.latitude)
        .bind(license.longitude)
        .bind(license.issued_at)
        .bind(license.expires_at)
        .bind(&license.source_url)
        .bind(&license.source_system)
        .bind(&license.raw_payload)
        .bind(license.created_at)
        .bind(license.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_license(&self, license: &License) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE licenses SET license_type = $2, status = $3, entity_name = $4, \
             trade_name = $5, address_line1 = $6, address_line2 = $7, city = $8, \
             postal_code = $9, country = $10, latitude = $11, longitude = $12, issued_at = $13, \
             expires_at = $14, source_url = $15, source_system = $16, raw_payload = $17, \
             updated_at = $18 WHERE id = $1",
        )
        .bind(license.id)
        .bind(&license.license_type)
        .bind(&license.status)
        .bind(&license.entity_name)
        .bind(&license.trade_name)
        .bind(&license.address_line1)
        .bind(&license.address_line2)
        .bind(&license.city)
        .bind(&license.postal_code)
        .bind(&license.country)
        .bind(license.latitude)
        .bind(license.longitude)
        .bind(license.issued_at)
        .bind(license.expires_at)
        .bind(&license.source_url)
        .bind(&license.source_system)
        .bind(&license.raw_payload)
        .bind(license.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_lab_by_license(&self, license_id: Uuid) -> Result<Option<Lab>, StoreError> {
        let row = sqlx::query("SELECT * FROM labs WHERE license_id = $1")
            .bind(license_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(lab_from_row).transpose()
    }

    async fn find_lab_by_name(
        &self,
        jurisdiction: &str,
        name: &str,
    ) -> Result<Option<Lab>, StoreError> {
        let row =
            sqlx::query("SELECT * FROM labs WHERE jurisdiction = $1 AND LOWER(name) = LOWER($2)")
                .bind(jurisdiction)
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        row.as_ref().map(lab_from_row).transpose()
    }

    async fn insert_lab(&self, lab: &Lab) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO labs (id, name, slug, jurisdiction, city, license_id) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(lab.id)
        .bind(&lab.name)
        .bind(&lab.slug)
        .bind(&lab.jurisdiction)
        .bind(&lab.city)
        .bind(lab.license_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn link_lab_to_license(
        &self,
        lab_id: Uuid,
        license_id: Uuid,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE labs SET license_id = $2 WHERE id = $1")
            .bind(lab_id)
            .bind(license_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_location_by_license(
        &self,
        license_id: Uuid,
    ) -> Result<Option<Location>, StoreError> {
        let row = sqlx::query("SELECT * FROM locations WHERE license_id = $1")
            .bind(license_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(location_from_row).transpose()
    }

    async fn find_location_by_name(
        &self,
        jurisdiction: &str,
        name: &str,
    ) -> Result<Option<Location>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM locations WHERE jurisdiction = $1 AND LOWER(name) = LOWER($2)",
        )
        .bind(jurisdiction)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(location_from_row).transpose()
    }

    async fn insert_location(&self, location: &Location) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO locations (id, name, slug, location_type, jurisdiction, address_line1, \
             address_line2, city, postal_code, country, latitude, longitude, license_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(location.id)
        .bind(&location.name)
        .bind(&location.slug)
        .bind(location_type_to_str(location.location_type))
        .bind(&location.jurisdiction)
        .bind(&location.address_line1)
        .bind(&location.address_line2)
        .bind(&location.city)
        .bind(&location.postal_code)
        .bind(&location.country)
        .bind(location.latitude)
        .bind(location.longitude)
        .bind(location.license_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn link_location_to_license(
        &self,
        location_id: Uuid,
        license_id: Uuid,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE locations SET license_id = $2 WHERE id = $1")
            .bind(location_id)
            .bind(license_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_batch_by_code(&self, batch_code: &str) -> Result<Option<Batch>, StoreError> {
        let row = sqlx::query("SELECT * FROM batches WHERE batch_code = $1")
            .bind(batch_code)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(batch_from_row).transpose()
    }

    async fn insert_batch(&self, batch: &Batch) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO batches (id, batch_code, jurisdiction, product_name, notes, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(batch.id)
        .bind(&batch.batch_code)
        .bind(&batch.jurisdiction)
        .bind(&batch.product_name)
        .bind(&batch.notes)
        .bind(batch.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_batch_location(
        &self,
        batch_id: Uuid,
        location_id: Uuid,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO batch_locations (batch_id, location_id, first_seen, last_seen) \
             VALUES ($1, $2, $3, $3) \
             ON CONFLICT (batch_id, location_id) DO UPDATE SET last_seen = EXCLUDED.last_seen",
        )
        .bind(batch_id)
        .bind(location_id)
        .bind(seen_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending_coa_uploads(
        &self,
        media_types: &[&str],
        limit: usize,
    ) -> Result<Vec<UploadedDocument>, StoreError> {
        let media_types: Vec<String> = media_types.iter().map(|s| s.to_string()).collect();
        let rows = sqlx::query(
            "SELECT d.* FROM uploaded_documents d \
             WHERE d.verified AND d.media_type = ANY($1) \
             AND NOT EXISTS (SELECT 1 FROM lab_results r WHERE r.uploaded_document_id = d.id) \
             ORDER BY d.created_at ASC LIMIT $2",
        )
        .bind(&media_types)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(uploaded_document_from_row).collect()
    }

    async fn lab_result_for_document(
        &self,
        document_id: Uuid,
    ) -> Result<Option<Uuid>, StoreError> {
        let row = sqlx::query("SELECT id FROM lab_results WHERE uploaded_document_id = $1")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("id")))
    }

    async fn insert_lab_result(&self, result: &LabResult) -> Result<(), StoreError> {
        let content = serde_json::to_value(&result.content)?;
        sqlx::query(
            "INSERT INTO lab_results (id, batch_id, lab_id, sample_id, status, content, \
             uploaded_document_id, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(result.id)
        .bind(result.batch_id)
        .bind(result.lab_id)
        .bind(&result.sample_id)
        .bind(&result.status)
        .bind(content)
        .bind(result.uploaded_document_id)
        .bind(result.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_coa_document(
        &self,
        source_type: CoaSourceType,
        title: &str,
        lab_name: Option<&str>,
    ) -> Result<Option<CoaDocument>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM coa_documents WHERE source_type = $1 AND title = $2 \
             AND lab_name IS NOT DISTINCT FROM $3",
        )
        .bind(source_type.as_str())
        .bind(title)
        .bind(lab_name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(coa_document_from_row).transpose()
    }

    async fn insert_coa_document(&self, document: &CoaDocument) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO coa_documents (id, title, lab_name, batch_ref, sample_id, license_ref, \
             product_name, jurisdiction, file_type, file_url, source_type, source_url, raw_text, \
             sample_collected_at, sample_tested_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(document.id)
        .bind(&document.title)
        .bind(&document.lab_name)
        .bind(&document.batch_ref)
        .bind(&document.sample_id)
        .bind(&document.license_ref)
        .bind(&document.product_name)
        .bind(&document.jurisdiction)
        .bind(&document.file_type)
        .bind(&document.file_url)
        .bind(document.source_type.as_str())
        .bind(&document.source_url)
        .bind(&document.raw_text)
        .bind(document.sample_collected_at)
        .bind(document.sample_tested_at)
        .bind(document.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_coa_document(&self, document: &CoaDocument) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE coa_documents SET batch_ref = $2, sample_id = $3, license_ref = $4, \
             product_name = $5, jurisdiction = $6, file_type = $7, file_url = $8, \
             source_url = $9, raw_text = $10, sample_collected_at = $11, sample_tested_at = $12 \
             WHERE id = $1",
        )
        .bind(document.id)
        .bind(&document.batch_ref)
        .bind(&document.sample_id)
        .bind(&document.license_ref)
        .bind(&document.product_name)
        .bind(&document.jurisdiction)
        .bind(&document.file_type)
        .bind(&document.file_url)
        .bind(&document.source_url)
        .bind(&document.raw_text)
        .bind(document.sample_collected_at)
        .bind(document.sample_tested_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn acquire_import_lease(
        &self,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let expires_at =
            now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1));
        let result = sqlx::query(
            "INSERT INTO import_lease (singleton, holder, expires_at) VALUES (TRUE, $1, $2) \
             ON CONFLICT (singleton) DO UPDATE SET holder = EXCLUDED.holder, \
             expires_at = EXCLUDED.expires_at \
             WHERE import_lease.holder = EXCLUDED.holder OR import_lease.expires_at <= $3",
        )
        .bind(holder)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_import_lease(&self, holder: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM import_lease WHERE holder = $1")
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
