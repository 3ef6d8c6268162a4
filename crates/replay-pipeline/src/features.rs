//! Audio-feature completion for enriched rows.
//!
//! Features are immutable per track, so they are cached in a JSON file keyed
//! by catalog id and only the ids missing from the cache go to the catalog.
//! The cache is flushed after every fetched chunk, so an interrupted run
//! keeps everything it already paid for.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use replay_catalog::{TrackSource, MAX_IDS_PER_REQUEST};
use replay_core::{AudioFeatures, StreamRecord};
use replay_store::StreamTable;
use tracing::{info, warn};

pub struct FeatureCache {
    path: PathBuf,
    entries: HashMap<String, AudioFeatures>,
}

impl FeatureCache {
    /// Loads the cache, treating a missing or unreadable file as empty.
    pub fn load(path: &Path) -> Self {
        let entries = match fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(path = %path.display(), %err, "feature cache unreadable, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self {
            path: path.to_path_buf(),
            entries,
        }
    }

    pub fn get(&self, id: &str) -> Option<&AudioFeatures> {
        self.entries.get(id)
    }

    pub fn insert(&mut self, features: AudioFeatures) {
        self.entries.insert(features.id.clone(), features);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn save(&self) -> Result<()> {
        let text = serde_json::to_string(&self.entries).context("serializing feature cache")?;
        fs::write(&self.path, text)
            .with_context(|| format!("writing feature cache {}", self.path.display()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeatureSummary {
    pub rows: usize,
    pub distinct_tracks: usize,
    pub cache_hits: usize,
    pub fetched: usize,
    pub unavailable: usize,
}

/// Fills the audio-feature columns of every row in `enriched_table` and
/// writes the result to `featured_table`.
pub async fn run<S: TrackSource + ?Sized>(
    source: &S,
    enriched_table: &StreamTable,
    featured_table: &StreamTable,
    cache: &mut FeatureCache,
    chunk_size: usize,
) -> Result<FeatureSummary> {
    // A run where every track was skipped never creates the enriched table;
    // that still counts as "nothing enriched yet".
    let mut rows = enriched_table.read_or_empty()?;
    let mut summary = FeatureSummary {
        rows: rows.len(),
        ..FeatureSummary::default()
    };

    let mut seen = HashSet::new();
    let mut missing = Vec::new();
    for row in &rows {
        let Some(uri) = &row.track_uri else { continue };
        if !seen.insert(uri.clone()) {
            continue;
        }
        if cache.get(uri).is_some() {
            summary.cache_hits += 1;
        } else {
            missing.push(uri.clone());
        }
    }
    summary.distinct_tracks = seen.len();
    info!(
        distinct = summary.distinct_tracks,
        cached = summary.cache_hits,
        missing = missing.len(),
        "audio feature working set"
    );

    let chunk_size = chunk_size.clamp(1, MAX_IDS_PER_REQUEST);
    for chunk in missing.chunks(chunk_size) {
        let results = source
            .audio_features(chunk)
            .await
            .context("fetching audio features from the catalog")?;
        for (id, result) in chunk.iter().zip(results) {
            match result {
                Some(features) => {
                    cache.insert(features);
                    summary.fetched += 1;
                }
                None => {
                    warn!(catalog_id = %id, "no audio features for id");
                    summary.unavailable += 1;
                }
            }
        }
        cache.save()?;
    }

    for row in &mut rows {
        let features = row.track_uri.as_deref().and_then(|uri| cache.get(uri));
        if let Some(features) = features {
            apply_features(row, features);
        }
    }
    featured_table.write_all(&rows)?;
    info!(rows = rows.len(), path = %featured_table.path().display(), "saved featured history");
    Ok(summary)
}

fn apply_features(row: &mut StreamRecord, features: &AudioFeatures) {
    row.danceability = features.danceability.or(row.danceability);
    row.energy = features.energy.or(row.energy);
    row.key = features.key.or(row.key);
    row.loudness = features.loudness.or(row.loudness);
    row.mode = features.mode.or(row.mode);
    row.speechiness = features.speechiness.or(row.speechiness);
    row.acousticness = features.acousticness.or(row.acousticness);
    row.instrumentalness = features.instrumentalness.or(row.instrumentalness);
    row.liveness = features.liveness.or(row.liveness);
    row.valence = features.valence.or(row.valence);
    row.tempo = features.tempo.or(row.tempo);
    row.time_signature = features.time_signature.or(row.time_signature);
}
