use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use canopy_core::{ImportReport, SourceSelector};
use canopy_ingest::{ingest_coa_feed, link_pending_coas, run_import, CoaLinkOptions, ImportOptions};
use canopy_sources::SourceConfig;
use canopy_store::{HttpClientConfig, HttpFetcher, PgStore};

#[derive(Debug, Parser)]
#[command(name = "canopy")]
#[command(about = "Canopy license-transparency ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, normalize, and upsert license data.
    Import {
        /// Source code (MA, ME, CO, NB, NY, CA, WA, CONSOLIDATED) or ALL.
        #[arg(long, default_value = "ALL")]
        source: SourceSelector,
        /// Fetch and count without writing anything.
        #[arg(long)]
        dry_run: bool,
        /// Cap records processed per source.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Link verified uploaded COA documents into the batch/lab graph.
    LinkCoas {
        #[arg(long, default_value_t = 100)]
        limit: usize,
        #[arg(long)]
        dry_run: bool,
    },
    /// Pull the consolidated COA metadata feed.
    IngestCoaFeed {
        #[arg(long, default_value_t = 10_000)]
        limit: usize,
        #[arg(long)]
        dry_run: bool,
    },
    /// Create database tables if missing.
    Migrate,
}

fn print_report(report: &ImportReport) {
    println!(
        "run {} {}: processed={} upserts={} skipped={} failed={}",
        report.run_id,
        if report.dry_run { "(dry run)" } else { "" },
        report.total_processed(),
        report.total_upserts(),
        report.total_skipped(),
        report.total_failed()
    );
    for source in &report.sources {
        println!(
            "  {}: fetched={} processed={} upserts={} skipped={} failed={}",
            source.source,
            source.total_fetched,
            source.total_processed,
            source.total_upserts,
            source.total_skipped,
            source.total_failed
        );
        for note in &source.notes {
            println!("    note: {note}");
        }
    }
}

async fn connect_store() -> Result<PgStore> {
    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let store = PgStore::connect(&database_url)
        .await
        .context("connecting to database")?;
    store.ensure_schema().await.context("ensuring schema")?;
    Ok(store)
}

fn fetcher() -> Result<HttpFetcher> {
    let mut config = HttpClientConfig::default();
    config.user_agent = Some(
        std::env::var("CANOPY_USER_AGENT").unwrap_or_else(|_| "canopy-bot/0.1".to_string()),
    );
    HttpFetcher::new(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = SourceConfig::from_env();

    match cli.command {
        Commands::Import {
            source,
            dry_run,
            limit,
        } => {
            let store = connect_store().await?;
            let http = fetcher()?;
            let options = ImportOptions {
                dry_run,
                limit,
                ..ImportOptions::default()
            };
            let report = run_import(&store, &http, &config, source, &options).await?;
            print_report(&report);
        }
        Commands::LinkCoas { limit, dry_run } => {
            let store = connect_store().await?;
            let options = CoaLinkOptions { dry_run, limit };
            let report = link_pending_coas(&store, &options).await?;
            println!(
                "coa linking{}: processed={} upserts={} skipped={}",
                if report.dry_run { " (dry run)" } else { "" },
                report.processed,
                report.upserts,
                report.skipped
            );
            for note in &report.notes {
                println!("  note: {note}");
            }
        }
        Commands::IngestCoaFeed { limit, dry_run } => {
            let store = connect_store().await?;
            let http = fetcher()?;
            let options = CoaLinkOptions { dry_run, limit };
            let report = ingest_coa_feed(&store, &http, &config, &options).await?;
            println!(
                "coa feed: fetched={} processed={} upserts={} skipped={}",
                report.total_fetched,
                report.total_processed,
                report.total_upserts,
                report.total_skipped
            );
            for note in &report.notes {
                println!("  note: {note}");
            }
        }
        Commands::Migrate => {
            connect_store().await?;
            println!("schema is up to date");
        }
    }

    Ok(())
}
