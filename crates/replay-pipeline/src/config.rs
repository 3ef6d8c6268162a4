//! Run configuration: file layout, stage toggles, and the environment-backed
//! credentials for the catalog and the index.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use replay_catalog::CatalogConfig;

use crate::index::IndexConfig;

/// Which stages a run executes. Skipping a stage means its output table is
/// expected to already exist on disk.
#[derive(Debug, Clone, Copy)]
pub struct StageToggles {
    pub ingest: bool,
    pub enrich: bool,
    pub features: bool,
    pub metrics: bool,
    pub index: bool,
}

impl Default for StageToggles {
    fn default() -> Self {
        Self {
            ingest: true,
            enrich: true,
            features: true,
            metrics: true,
            index: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Directory holding the raw export files and every intermediate table.
    pub resources_dir: PathBuf,
    /// Enriched table from an earlier dataset, seeded into this run so its
    /// rows are not re-fetched.
    pub previous_enriched_path: Option<PathBuf>,
    pub chunk_size: usize,
    pub stages: StageToggles,
}

impl PipelineConfig {
    pub fn new(resources_dir: impl Into<PathBuf>) -> Self {
        Self {
            resources_dir: resources_dir.into(),
            previous_enriched_path: None,
            chunk_size: replay_catalog::MAX_IDS_PER_REQUEST,
            stages: StageToggles::default(),
        }
    }

    pub fn concat_path(&self) -> PathBuf {
        self.resources_dir.join("replay_concat.csv")
    }

    pub fn library_path(&self) -> PathBuf {
        self.resources_dir.join(crate::library::LIBRARY_FILE_NAME)
    }

    pub fn to_enrich_path(&self) -> PathBuf {
        self.resources_dir.join("replay_to_enrich.csv")
    }

    pub fn enriched_path(&self) -> PathBuf {
        self.resources_dir.join("replay_enriched.csv")
    }

    pub fn featured_path(&self) -> PathBuf {
        self.resources_dir.join("replay_featured.csv")
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.resources_dir.join("replay_metrics.csv")
    }

    pub fn features_cache_path(&self) -> PathBuf {
        self.resources_dir.join("replay_audio_features.json")
    }
}

/// Catalog credentials and endpoints from the environment. The client id and
/// secret have no sane default and must be set.
pub fn catalog_config_from_env() -> Result<CatalogConfig> {
    let mut config = CatalogConfig::default();
    config.client_id = env::var("REPLAY_CLIENT_ID").context("REPLAY_CLIENT_ID is not set")?;
    config.client_secret =
        env::var("REPLAY_CLIENT_SECRET").context("REPLAY_CLIENT_SECRET is not set")?;
    if let Ok(url) = env::var("REPLAY_AUTH_URL") {
        config.auth_url = url;
    }
    if let Ok(url) = env::var("REPLAY_BASE_URL") {
        config.base_url = url;
    }
    if let Ok(market) = env::var("REPLAY_MARKET") {
        config.market = market;
    }
    Ok(config)
}

pub fn index_config_from_env(index_name: &str) -> IndexConfig {
    let mut config = IndexConfig {
        index_name: index_name.to_string(),
        ..IndexConfig::default()
    };
    if let Ok(hosts) = env::var("REPLAY_INDEX_HOSTS") {
        config.hosts = hosts
            .split(',')
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect();
    }
    config.username = env::var("REPLAY_INDEX_USER").ok();
    config.password = env::var("REPLAY_INDEX_PASS").ok();
    if let Ok(timeout) = env::var("REPLAY_INDEX_TIMEOUT_SECS") {
        if let Ok(secs) = timeout.parse() {
            config.timeout = Duration::from_secs(secs);
        }
    }
    config
}
