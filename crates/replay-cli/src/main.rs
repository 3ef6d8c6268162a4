use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use replay_catalog::{CatalogClient, TrackSource};
use replay_pipeline::config::{catalog_config_from_env, index_config_from_env, PipelineConfig};
use replay_pipeline::index::IndexLoader;
use replay_pipeline::Pipeline;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "replay")]
#[command(about = "Streaming-history enrichment pipeline")]
struct Cli {
    /// Directory with the raw export files; intermediate tables land here too.
    resources: PathBuf,

    /// Catalog ids per batch request.
    #[arg(long, default_value_t = replay_catalog::MAX_IDS_PER_REQUEST)]
    chunk_size: usize,

    /// Catalog request timeout in seconds.
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,

    /// Sleep between attempts when the catalog asks us to slow down.
    #[arg(long, default_value_t = 60)]
    rate_limit_sleep_secs: u64,

    /// Enriched table from an earlier dataset, seeded before the first run.
    #[arg(long)]
    previous_enriched: Option<PathBuf>,

    /// Name of the search index to bulk-load into.
    #[arg(long, default_value = "replay-history")]
    index_name: String,

    #[arg(long)]
    skip_ingest: bool,
    #[arg(long)]
    skip_enrich: bool,
    #[arg(long)]
    skip_features: bool,
    #[arg(long)]
    skip_metrics: bool,
    #[arg(long)]
    skip_index: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = PipelineConfig::new(&cli.resources);
    config.chunk_size = cli.chunk_size;
    config.previous_enriched_path = cli.previous_enriched.clone();
    config.stages.ingest = !cli.skip_ingest;
    config.stages.enrich = !cli.skip_enrich;
    config.stages.features = !cli.skip_features;
    config.stages.metrics = !cli.skip_metrics;
    config.stages.index = !cli.skip_index;

    let catalog = if config.stages.enrich || config.stages.features {
        let mut catalog_config = catalog_config_from_env()?;
        catalog_config.timeout = Duration::from_secs(cli.timeout_secs);
        catalog_config.rate_limit_sleep = Duration::from_secs(cli.rate_limit_sleep_secs);
        let client = CatalogClient::authenticate(catalog_config)
            .await
            .context("authenticating against the catalog")?;
        Some(client)
    } else {
        None
    };

    let index = if config.stages.index {
        Some(IndexLoader::new(index_config_from_env(&cli.index_name))?)
    } else {
        None
    };

    let summary = Pipeline::new(config)
        .run(
            catalog.as_ref().map(|c| c as &dyn TrackSource),
            index.as_ref(),
        )
        .await?;

    println!(
        "run {} finished in {}s",
        summary.run_id,
        (summary.finished_at - summary.started_at).num_seconds()
    );
    if let Some(rows) = summary.concat_rows {
        println!("  concatenated rows: {rows}");
    }
    if let Some(enrich) = &summary.enrich {
        println!(
            "  enriched rows: {} ({} batches, {} tracks skipped)",
            enrich.enriched_rows, enrich.batches, enrich.skipped_tracks
        );
    }
    if let Some(features) = &summary.features {
        println!(
            "  audio features: {} fetched, {} cached, {} unavailable",
            features.fetched, features.cache_hits, features.unavailable
        );
    }
    if let Some(rows) = summary.metrics_rows {
        println!("  metrics rows: {rows}");
    }
    if let Some(bulk) = &summary.bulk {
        println!("  indexed documents: {} ({} failed)", bulk.indexed, bulk.failed);
    }

    Ok(())
}
