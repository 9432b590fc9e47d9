//! COA ingestion: linking verified uploaded documents into the batch/lab
//! graph, and pulling the consolidated COA metadata feed.
//!
//! Analyte/potency parsing is a later phase; this module only builds the
//! relational skeleton (Batch, Lab, LabResult, CoaDocument).

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use canopy_core::{
    slug, Batch, CoaContent, CoaDocument, CoaLinkReport, CoaSourceType, Lab, LabResult,
    SourceReport, UploadedDocument,
};
use canopy_sources::{parse_csv, RawRow, SourceConfig};
use canopy_store::{HttpFetcher, Store};

use crate::IngestError;

/// Media types that look like a COA scan or export.
pub const POSSIBLE_MEDIA_TYPES: [&str; 4] =
    ["application/pdf", "image/png", "image/jpeg", "image/jpg"];

/// Labs first seen via COA documents carry no jurisdiction yet.
const UNSCOPED_JURISDICTION: &str = "UNKNOWN";

const US_STATE_CODES: [&str; 51] = [
    "AK", "AL", "AR", "AZ", "CA", "CO", "CT", "DC", "DE", "FL", "GA", "HI", "IA", "ID", "IL",
    "IN", "KS", "KY", "LA", "MA", "MD", "ME", "MI", "MN", "MO", "MS", "MT", "NC", "ND", "NE",
    "NH", "NJ", "NM", "NV", "NY", "OH", "OK", "OR", "PA", "RI", "SC", "SD", "TN", "TX", "UT",
    "VA", "VT", "WA", "WI", "WV", "WY",
];

#[derive(Debug, Clone)]
pub struct CoaLinkOptions {
    pub dry_run: bool,
    pub limit: usize,
}

impl Default for CoaLinkOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            limit: 100,
        }
    }
}

fn infer_file_type(media_type: &str) -> Option<&'static str> {
    if media_type == "application/pdf" {
        Some("pdf")
    } else if media_type.starts_with("image/") {
        Some("image")
    } else {
        None
    }
}

/// Link verified, COA-shaped uploaded documents that have no LabResult yet.
/// Each document yields one Batch (resolved or placeholder), optionally one
/// Lab, one LabResult, and one CoaDocument.
pub async fn link_pending_coas(
    store: &dyn Store,
    options: &CoaLinkOptions,
) -> Result<CoaLinkReport, IngestError> {
    let mut report = CoaLinkReport {
        dry_run: options.dry_run,
        ..CoaLinkReport::default()
    };

    let candidates = store
        .pending_coa_uploads(&POSSIBLE_MEDIA_TYPES, options.limit)
        .await?;
    report
        .notes
        .push(format!("found {} candidate uploaded documents", candidates.len()));

    for doc in candidates {
        report.processed += 1;

        if doc.file_path.is_none() {
            report.skipped += 1;
            report
                .notes
                .push(format!("skipping document {}: missing file path", doc.id));
            continue;
        }

        // Re-check in case a LabResult appeared since the candidate query.
        if store.lab_result_for_document(doc.id).await?.is_some() {
            report.skipped += 1;
            report
                .notes
                .push(format!("skipping document {}: lab result already exists", doc.id));
            continue;
        }

        if doc.batch_code.is_none() && doc.lab_name.is_none() {
            report.skipped += 1;
            report.notes.push(format!(
                "skipping document {}: no batch code or lab name to anchor on",
                doc.id
            ));
            continue;
        }

        if options.dry_run {
            report.upserts += 1;
            continue;
        }

        let now = Utc::now();
        let batch_id = resolve_or_create_batch(store, &doc, now).await?;
        let lab_id = match doc.lab_name.as_deref() {
            Some(name) => Some(resolve_or_create_lab(store, name).await?),
            None => None,
        };

        let content = match (&doc.sample_id, doc.sampled_at) {
            (None, None) => CoaContent::Pending,
            (sample_id, collected_at) => CoaContent::Extracted {
                sample_id: sample_id.clone(),
                collected_at,
            },
        };

        store
            .insert_lab_result(&LabResult {
                id: Uuid::new_v4(),
                batch_id,
                lab_id,
                sample_id: doc.sample_id.clone(),
                status: "pending".to_string(),
                content,
                uploaded_document_id: Some(doc.id),
                created_at: now,
            })
            .await?;

        let title = if !doc.file_name.is_empty() {
            doc.file_name.clone()
        } else if let Some(code) = &doc.batch_code {
            format!("COA for batch {code}")
        } else {
            format!("COA for uploaded document {}", doc.id)
        };

        // Manual uploads are append-only; no dedupe lookup.
        store
            .insert_coa_document(&CoaDocument {
                id: Uuid::new_v4(),
                title,
                lab_name: doc.lab_name.clone(),
                batch_ref: doc.batch_code.clone(),
                sample_id: doc.sample_id.clone(),
                license_ref: doc.license_number.clone(),
                product_name: None,
                jurisdiction: None,
                file_type: infer_file_type(&doc.media_type).map(str::to_string),
                file_url: doc.file_path.clone(),
                source_type: CoaSourceType::ManualUpload,
                source_url: None,
                raw_text: doc.extracted_text.clone(),
                sample_collected_at: doc.sampled_at,
                sample_tested_at: None,
                created_at: now,
            })
            .await?;

        report.upserts += 1;
    }

    info!(
        processed = report.processed,
        upserts = report.upserts,
        skipped = report.skipped,
        dry_run = report.dry_run,
        "coa linking pass finished"
    );
    Ok(report)
}

async fn resolve_or_create_batch(
    store: &dyn Store,
    doc: &UploadedDocument,
    now: DateTime<Utc>,
) -> Result<Uuid, IngestError> {
    let (batch_code, notes) = match &doc.batch_code {
        Some(code) => (code.clone(), "Auto-created from uploaded COA."),
        // Placeholder so the lab result has something to hang on.
        None => (
            format!("uploaded-{}", doc.id),
            "Auto-created placeholder batch from uploaded COA without explicit batch code.",
        ),
    };

    if let Some(existing) = store.find_batch_by_code(&batch_code).await? {
        return Ok(existing.id);
    }

    let batch = Batch {
        id: Uuid::new_v4(),
        batch_code,
        jurisdiction: None,
        product_name: None,
        notes: Some(notes.to_string()),
        created_at: now,
    };
    store.insert_batch(&batch).await?;
    Ok(batch.id)
}

async fn resolve_or_create_lab(store: &dyn Store, name: &str) -> Result<Uuid, IngestError> {
    if let Some(existing) = store.find_lab_by_name(UNSCOPED_JURISDICTION, name).await? {
        return Ok(existing.id);
    }
    let lab = Lab {
        id: Uuid::new_v4(),
        name: name.to_string(),
        slug: slug(name),
        jurisdiction: UNSCOPED_JURISDICTION.to_string(),
        city: None,
        license_id: None,
    };
    store.insert_lab(&lab).await?;
    Ok(lab.id)
}

fn normalize_state(row: &RawRow) -> Option<String> {
    for key in ["producer_region", "producer_state", "producer_subregion", "state", "origin"] {
        if let Some(value) = row.pick(&[key]) {
            let code: String = value.to_ascii_uppercase().chars().take(2).collect();
            if US_STATE_CODES.contains(&code.as_str()) {
                return Some(code);
            }
        }
    }
    None
}

fn parse_feed_datetime(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    let date_part = value.split(['T', ' ']).next().unwrap_or(value);
    match NaiveDate::parse_from_str(date_part, "%Y-%m-%d") {
        Ok(date) => date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc()),
        Err(_) => {
            warn!(value, "unrecognized feed date, dropping");
            None
        }
    }
}

/// Pull the consolidated COA metadata feed and upsert CoaDocuments. Feed
/// documents dedupe by (source type, title, lab name); rows with no sample
/// id, batch ref, or file URL at all are skipped.
pub async fn ingest_coa_feed(
    store: &dyn Store,
    http: &HttpFetcher,
    config: &SourceConfig,
    options: &CoaLinkOptions,
) -> Result<SourceReport, IngestError> {
    let url = config.require_coa_feed_url()?;
    let body = http.fetch_text("coa-feed", url).await.map_err(canopy_sources::SourceError::from)?;
    let rows = parse_csv(&body)?;

    let mut report = SourceReport::new("COA_FEED");
    report.total_fetched = rows.len();
    if options.dry_run {
        report.notes.push("dry run: no documents written".to_string());
    }

    let usable: Vec<(String, RawRow)> = rows
        .into_iter()
        .filter_map(|row| normalize_state(&row).map(|state| (state, row)))
        .collect();
    report.total_filtered = usable.len();
    report.total_skipped = report.total_fetched - usable.len();

    for (state, row) in usable.into_iter().take(options.limit) {
        report.total_processed += 1;

        let sample_id = row.pick(&["sample_id", "sampleid", "sample"]);
        let batch_ref = row
            .pick(&["batch", "batch_number", "metrc_id"])
            .or_else(|| sample_id.clone());
        let source_url = row.pick(&["url", "lab_results_url"]);
        let file_url = row.pick(&["coa_pdf", "coa_url"]).or_else(|| source_url.clone());

        if sample_id.is_none() && batch_ref.is_none() && file_url.is_none() {
            report.total_skipped += 1;
            continue;
        }

        let product_name = row
            .pick(&["product_name", "reported_name", "strain"])
            .unwrap_or_else(|| "Unknown product".to_string());
        let lab_name = row.pick(&["lab", "lab_name"]);

        let mut title_parts = vec![product_name.clone()];
        if let Some(identity) = sample_id.as_ref().or(batch_ref.as_ref()) {
            title_parts.push(identity.clone());
        }
        title_parts.push(state.clone());
        let title = title_parts.join(" - ");

        if options.dry_run {
            report.total_upserts += 1;
            continue;
        }

        let document = CoaDocument {
            id: Uuid::new_v4(),
            title: title.clone(),
            lab_name: lab_name.clone(),
            batch_ref,
            sample_id,
            license_ref: row.pick(&["producer_license_number", "license"]),
            product_name: Some(product_name),
            jurisdiction: Some(state),
            file_type: file_url.as_ref().map(|_| "url".to_string()),
            file_url,
            source_type: CoaSourceType::ConsolidatedFeed,
            source_url,
            raw_text: Some(row.to_json().to_string()),
            sample_collected_at: row.pick(&["date_collected"]).and_then(|v| parse_feed_datetime(&v)),
            sample_tested_at: row.pick(&["date_tested"]).and_then(|v| parse_feed_datetime(&v)),
            created_at: Utc::now(),
        };

        match store
            .find_coa_document(CoaSourceType::ConsolidatedFeed, &title, lab_name.as_deref())
            .await?
        {
            Some(existing) => {
                let refreshed = CoaDocument {
                    id: existing.id,
                    created_at: existing.created_at,
                    ..document
                };
                store.update_coa_document(&refreshed).await?;
            }
            None => store.insert_coa_document(&document).await?,
        }
        report.total_upserts += 1;
    }

    Ok(report)
}
