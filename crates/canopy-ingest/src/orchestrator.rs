//! Batch run orchestration: sequential across sources, chunked-concurrent
//! upserts within a source, one structured report per run.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use canopy_core::{ImportReport, SourceReport, SourceSelector};
use canopy_sources::{sources_for_selector, LicenseSource, SourceConfig};
use canopy_store::{HttpFetcher, Store};

use crate::engine::{upsert_license, UpsertOutcome};
use crate::IngestError;

/// Upserts are awaited in chunks of this size within one source.
pub const UPSERT_CHUNK_SIZE: usize = 200;

/// A crashed run's lease becomes reclaimable after this long.
pub const LEASE_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub dry_run: bool,
    /// Cap on records processed per source, for smoke runs.
    pub limit: Option<usize>,
    /// Lease holder identity; distinct per process.
    pub holder: String,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            limit: None,
            holder: format!("canopy-{}", Uuid::new_v4()),
        }
    }
}

/// Run an import over the selected sources. Refuses to start while another
/// live run holds the lease; dry runs skip the lease and every write.
pub async fn run_import(
    store: &dyn Store,
    http: &HttpFetcher,
    config: &SourceConfig,
    selector: SourceSelector,
    options: &ImportOptions,
) -> Result<ImportReport, IngestError> {
    run_import_with_sources(store, http, config, sources_for_selector(selector), options).await
}

pub async fn run_import_with_sources(
    store: &dyn Store,
    http: &HttpFetcher,
    config: &SourceConfig,
    sources: Vec<Box<dyn LicenseSource>>,
    options: &ImportOptions,
) -> Result<ImportReport, IngestError> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();

    if !options.dry_run
        && !store
            .acquire_import_lease(&options.holder, LEASE_TTL, started_at)
            .await?
    {
        return Err(IngestError::LeaseHeld);
    }

    let mut reports = Vec::with_capacity(sources.len());
    for source in &sources {
        let report = run_source(store, http, config, source.as_ref(), options)
            .instrument(info_span!("import_source", source = source.code().as_str()))
            .await;
        info!(
            source = %report.source,
            fetched = report.total_fetched,
            processed = report.total_processed,
            upserts = report.total_upserts,
            skipped = report.total_skipped,
            failed = report.total_failed,
            "source finished"
        );
        reports.push(report);
    }

    if !options.dry_run {
        store.release_import_lease(&options.holder).await?;
    }

    Ok(ImportReport {
        run_id,
        dry_run: options.dry_run,
        started_at,
        finished_at: Utc::now(),
        sources: reports,
    })
}

/// One source, fault-isolated: fetch/config failures become a note on the
/// report and never abort the run.
async fn run_source(
    store: &dyn Store,
    http: &HttpFetcher,
    config: &SourceConfig,
    source: &dyn LicenseSource,
    options: &ImportOptions,
) -> SourceReport {
    let mut report = SourceReport::new(source.code().as_str());

    let rows = match source.fetch_rows(http, config).await {
        Ok(rows) => rows,
        Err(err) => {
            error!(source = source.code().as_str(), error = %err, "source fetch failed");
            report
                .notes
                .push(format!("{}: {err}", source.display_name()));
            return report;
        }
    };
    report.total_fetched = rows.len();

    let records: Vec<_> = rows.iter().filter_map(|row| source.normalize(row)).collect();
    report.total_filtered = records.len();
    report.total_skipped = report.total_fetched - records.len();

    // Same natural key twice in one run would race find-then-insert inside a
    // chunk; collapse to the last occurrence (fresher snapshot wins) so the
    // store only ever sees one write stream per (jurisdiction, number).
    let mut records = dedupe_by_natural_key(records);
    let duplicates = report.total_filtered - records.len();
    if duplicates > 0 {
        report
            .notes
            .push(format!("{duplicates} duplicate license number(s) collapsed"));
    }

    if let Some(limit) = options.limit {
        records.truncate(limit);
    }
    report.total_processed = records.len();

    if options.dry_run {
        report
            .notes
            .push("dry run: no records written".to_string());
        return report;
    }

    let now = Utc::now();
    for chunk in records.chunks(UPSERT_CHUNK_SIZE) {
        let outcomes = join_all(chunk.iter().map(|record| upsert_license(store, record, now))).await;
        for (record, outcome) in chunk.iter().zip(outcomes) {
            match outcome {
                UpsertOutcome::Created | UpsertOutcome::Updated => report.total_upserts += 1,
                UpsertOutcome::Failed(message) => {
                    report.total_failed += 1;
                    report.notes.push(format!(
                        "{}/{}: {message}",
                        record.jurisdiction, record.license_number
                    ));
                }
            }
        }
    }

    report
}

/// Keep one record per (jurisdiction, license_number), the last one seen,
/// preserving first-seen order.
fn dedupe_by_natural_key(
    records: Vec<canopy_core::NormalizedLicenseRecord>,
) -> Vec<canopy_core::NormalizedLicenseRecord> {
    let mut deduped = Vec::with_capacity(records.len());
    let mut index_by_key: HashMap<(String, String), usize> = HashMap::new();
    for record in records {
        let key = (record.jurisdiction.clone(), record.license_number.clone());
        match index_by_key.get(&key) {
            Some(&i) => deduped[i] = record,
            None => {
                index_by_key.insert(key, deduped.len());
                deduped.push(record);
            }
        }
    }
    deduped
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use canopy_core::{NormalizedLicenseRecord, SourceCode};
    use canopy_sources::{RawRow, SourceError};
    use canopy_store::{HttpClientConfig, MemoryStore};
    use serde_json::json;

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig::default()).unwrap()
    }

    /// Source double that serves rows from memory.
    struct StaticSource {
        code: SourceCode,
        rows: Vec<RawRow>,
        fail_fetch: bool,
    }

    impl StaticSource {
        fn with_licenses(code: SourceCode, numbers: &[&str]) -> Self {
            let rows = numbers
                .iter()
                .map(|number| {
                    let mut row = RawRow::default();
                    row.insert("license_number", json!(number));
                    row.insert("entity_name", json!(format!("{number} Operator LLC")));
                    row
                })
                .collect();
            Self {
                code,
                rows,
                fail_fetch: false,
            }
        }

        fn broken(code: SourceCode) -> Self {
            Self {
                code,
                rows: Vec::new(),
                fail_fetch: true,
            }
        }
    }

    #[async_trait]
    impl LicenseSource for StaticSource {
        fn code(&self) -> SourceCode {
            self.code
        }

        fn display_name(&self) -> &'static str {
            "static test source"
        }

        async fn fetch_rows(
            &self,
            _http: &HttpFetcher,
            _config: &SourceConfig,
        ) -> Result<Vec<RawRow>, SourceError> {
            if self.fail_fetch {
                return Err(SourceError::Config("missing source url".into()));
            }
            Ok(self.rows.clone())
        }

        fn normalize(&self, row: &RawRow) -> Option<NormalizedLicenseRecord> {
            let license_number = row.pick(&["license_number"])?;
            Some(NormalizedLicenseRecord {
                source: self.code,
                jurisdiction: "MA".to_string(),
                license_number,
                license_type: "Marijuana Retailer".to_string(),
                status: "Active".to_string(),
                entity_name: row.pick(&["entity_name"]).unwrap_or_default(),
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
                raw: row.to_json(),
            })
        }
    }

    #[tokio::test]
    async fn dry_run_counts_without_writing() {
        let store = MemoryStore::new();
        let numbers: Vec<String> = (1..=10).map(|i| format!("MA-{i:04}")).collect();
        let refs: Vec<&str> = numbers.iter().map(String::as_str).collect();
        let sources: Vec<Box<dyn LicenseSource>> =
            vec![Box::new(StaticSource::with_licenses(SourceCode::Ma, &refs))];

        let options = ImportOptions {
            dry_run: true,
            ..ImportOptions::default()
        };
        let report =
            run_import_with_sources(&store, &fetcher(), &SourceConfig::default(), sources, &options)
                .await
                .unwrap();

        assert!(report.dry_run);
        assert_eq!(report.total_processed(), 10);
        assert_eq!(report.total_upserts(), 0);
        assert_eq!(store.license_count().await, 0);
        assert_eq!(store.location_count().await, 0);
    }

    #[tokio::test]
    async fn failing_source_does_not_stop_the_run() {
        let store = MemoryStore::new();
        let sources: Vec<Box<dyn LicenseSource>> = vec![
            Box::new(StaticSource::broken(SourceCode::Me)),
            Box::new(StaticSource::with_licenses(SourceCode::Ma, &["MA-0001", "MA-0002"])),
        ];

        let report = run_import_with_sources(
            &store,
            &fetcher(),
            &SourceConfig::default(),
            sources,
            &ImportOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(report.sources.len(), 2);
        assert!(report.sources[0].notes[0].contains("missing source url"));
        assert_eq!(report.sources[0].total_processed, 0);
        assert_eq!(report.sources[1].total_upserts, 2);
        assert_eq!(store.license_count().await, 2);
    }

    #[tokio::test]
    async fn record_failure_is_counted_and_noted_not_fatal() {
        let store = MemoryStore::new();
        store.fail_next_write_for("MA-0002").await;
        let sources: Vec<Box<dyn LicenseSource>> = vec![Box::new(StaticSource::with_licenses(
            SourceCode::Ma,
            &["MA-0001", "MA-0002", "MA-0003"],
        ))];

        let report = run_import_with_sources(
            &store,
            &fetcher(),
            &SourceConfig::default(),
            sources,
            &ImportOptions::default(),
        )
        .await
        .unwrap();

        let source = &report.sources[0];
        assert_eq!(source.total_processed, 3);
        assert_eq!(source.total_upserts, 2);
        assert_eq!(source.total_failed, 1);
        assert!(source.notes.iter().any(|n| n.contains("MA/MA-0002")));
        assert_eq!(store.license_count().await, 2);
    }

    #[tokio::test]
    async fn unusable_rows_count_as_skipped() {
        let store = MemoryStore::new();
        let mut source = StaticSource::with_licenses(SourceCode::Ma, &["MA-0001"]);
        source.rows.push(RawRow::default()); // no license identity
        let sources: Vec<Box<dyn LicenseSource>> = vec![Box::new(source)];

        let report = run_import_with_sources(
            &store,
            &fetcher(),
            &SourceConfig::default(),
            sources,
            &ImportOptions::default(),
        )
        .await
        .unwrap();

        let source = &report.sources[0];
        assert_eq!(source.total_fetched, 2);
        assert_eq!(source.total_skipped, 1);
        assert_eq!(source.total_failed, 0);
        assert_eq!(source.total_upserts, 1);
    }

    #[tokio::test]
    async fn concurrent_run_is_refused_while_lease_is_held() {
        let store = MemoryStore::new();
        store
            .acquire_import_lease("someone-else", LEASE_TTL, Utc::now())
            .await
            .unwrap();

        let sources: Vec<Box<dyn LicenseSource>> =
            vec![Box::new(StaticSource::with_licenses(SourceCode::Ma, &["MA-0001"]))];
        let result = run_import_with_sources(
            &store,
            &fetcher(),
            &SourceConfig::default(),
            sources,
            &ImportOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(IngestError::LeaseHeld)));

        // A dry run is read-only and may proceed regardless.
        let sources: Vec<Box<dyn LicenseSource>> =
            vec![Box::new(StaticSource::with_licenses(SourceCode::Ma, &["MA-0001"]))];
        let options = ImportOptions {
            dry_run: true,
            ..ImportOptions::default()
        };
        let report =
            run_import_with_sources(&store, &fetcher(), &SourceConfig::default(), sources, &options)
                .await
                .unwrap();
        assert_eq!(report.total_processed(), 1);
    }

    #[tokio::test]
    async fn repeated_license_number_in_one_chunk_never_duplicates() {
        let store = MemoryStore::new();
        let mut source = StaticSource::with_licenses(SourceCode::Ma, &["MA-0001", "MA-0002"]);
        // Same natural key again in the same chunk, with fresher data.
        let mut rebrand = RawRow::default();
        rebrand.insert("license_number", json!("MA-0001"));
        rebrand.insert("entity_name", json!("Rebranded Operator LLC"));
        source.rows.push(rebrand);
        let sources: Vec<Box<dyn LicenseSource>> = vec![Box::new(source)];

        let report = run_import_with_sources(
            &store,
            &fetcher(),
            &SourceConfig::default(),
            sources,
            &ImportOptions::default(),
        )
        .await
        .unwrap();

        let source = &report.sources[0];
        assert_eq!(source.total_fetched, 3);
        assert_eq!(source.total_processed, 2);
        assert_eq!(source.total_upserts, 2);
        assert_eq!(source.total_failed, 0);
        assert!(source.notes.iter().any(|n| n.contains("duplicate")));

        assert_eq!(store.license_count().await, 2);
        let stored = store.get_license("MA", "MA-0001").await.unwrap();
        // Last occurrence wins.
        assert_eq!(stored.entity_name, "Rebranded Operator LLC");
    }

    #[tokio::test]
    async fn limit_caps_processed_records() {
        let store = MemoryStore::new();
        let sources: Vec<Box<dyn LicenseSource>> = vec![Box::new(StaticSource::with_licenses(
            SourceCode::Ma,
            &["MA-0001", "MA-0002", "MA-0003"],
        ))];
        let options = ImportOptions {
            limit: Some(2),
            ..ImportOptions::default()
        };

        let report =
            run_import_with_sources(&store, &fetcher(), &SourceConfig::default(), sources, &options)
                .await
                .unwrap();
        assert_eq!(report.sources[0].total_fetched, 3);
        assert_eq!(report.sources[0].total_processed, 2);
        assert_eq!(store.license_count().await, 2);
    }
}
