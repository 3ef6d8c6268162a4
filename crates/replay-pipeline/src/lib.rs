//! Stage orchestration for the Replay streaming-history pipeline.
//!
//! A run walks the stages in order, each one reading the table the previous
//! stage wrote: ingest concatenates the raw exports, enrich resolves and
//! fetches track attributes in checkpointed batches, the feature stage fills
//! the audio columns, metrics derives the listening columns, and the index
//! stage bulk-loads the final table. Stages can be toggled off individually;
//! a skipped stage's output is read from disk instead.

pub mod config;
pub mod enrich;
pub mod features;
pub mod filter;
pub mod index;
pub mod ingest;
pub mod library;
pub mod merge;
pub mod metrics;

#[cfg(test)]
pub(crate) mod testutil;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use replay_catalog::TrackSource;
use replay_store::StreamTable;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::enrich::{BatchEnricher, EnrichSummary};
use crate::features::{FeatureCache, FeatureSummary};
use crate::index::{BulkSummary, IndexLoader};

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub concat_rows: Option<usize>,
    pub enrich: Option<EnrichSummary>,
    pub features: Option<FeatureSummary>,
    pub metrics_rows: Option<usize>,
    pub bulk: Option<BulkSummary>,
}

pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Runs every enabled stage in order. `source` is required when the
    /// enrich or feature stage is enabled, `index` when the index stage is.
    pub async fn run(
        &self,
        source: Option<&dyn TrackSource>,
        index: Option<&IndexLoader>,
    ) -> Result<RunSummary> {
        let stages = self.config.stages;
        if (stages.enrich || stages.features) && source.is_none() {
            bail!("the enrich and feature stages need a catalog source");
        }
        if stages.index && index.is_none() {
            bail!("the index stage needs an index loader");
        }

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, resources = %self.config.resources_dir.display(), "pipeline run starting");

        let concat = StreamTable::new(self.config.concat_path());
        let to_enrich = StreamTable::new(self.config.to_enrich_path());
        let enriched = StreamTable::new(self.config.enriched_path());
        let featured = StreamTable::new(self.config.featured_path());
        let metrics = StreamTable::new(self.config.metrics_path());

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            concat_rows: None,
            enrich: None,
            features: None,
            metrics_rows: None,
            bulk: None,
        };

        if stages.ingest {
            let library = library::Library::load(&self.config.library_path())?;
            summary.concat_rows = Some(ingest::run(
                &self.config.resources_dir,
                &concat,
                library.as_ref(),
            )?);
        }

        if let (true, Some(source)) = (stages.enrich, source) {
            self.seed_previous_enriched(&enriched)?;
            let working = filter::run(&concat, &enriched, &to_enrich)?;
            let before = enriched.count_lines()?;
            let outcome = BatchEnricher::new(source, &enriched, self.config.chunk_size)
                .run(working)
                .await?;
            let after = enriched.count_lines()?;
            info!(
                before,
                after,
                appended = after.saturating_sub(before),
                "enriched table grew"
            );
            summary.enrich = Some(outcome);
        }

        if let (true, Some(source)) = (stages.features, source) {
            let mut cache = FeatureCache::load(&self.config.features_cache_path());
            summary.features = Some(
                features::run(source, &enriched, &featured, &mut cache, self.config.chunk_size)
                    .await?,
            );
        }

        if stages.metrics {
            summary.metrics_rows = Some(metrics::run(&featured, &metrics)?);
        }

        if let (true, Some(loader)) = (stages.index, index) {
            summary.bulk = Some(loader.bulk_load(&metrics).await?);
        }

        summary.finished_at = Utc::now();
        info!(
            %run_id,
            elapsed_secs = (summary.finished_at - summary.started_at).num_seconds(),
            "pipeline run finished"
        );
        Ok(summary)
    }

    /// Copies an earlier dataset's enriched table into this run's, so its
    /// rows subtract out in the filter stage. Only a missing table is seeded;
    /// an existing one already is the checkpoint.
    fn seed_previous_enriched(&self, enriched: &StreamTable) -> Result<()> {
        let Some(previous_path) = &self.config.previous_enriched_path else {
            return Ok(());
        };
        if enriched.path().exists() {
            warn!(
                path = %enriched.path().display(),
                "enriched table already exists, ignoring the previous dataset"
            );
            return Ok(());
        }
        let previous = StreamTable::new(previous_path.clone());
        let rows = previous
            .read_all()
            .with_context(|| format!("reading previous dataset {}", previous_path.display()))?;
        enriched.write_all(&rows)?;
        info!(rows = rows.len(), from = %previous_path.display(), "seeded enriched table");
        Ok(())
    }
}
