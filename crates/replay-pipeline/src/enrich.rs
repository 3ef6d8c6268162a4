//! Checkpointed batch enrichment, the core loop of the pipeline.
//!
//! The working set is reduced to one entry per distinct track identity,
//! unresolved references go through catalog search once, and the resolved
//! identities are fetched in fixed-size batches. Every batch is persisted
//! before the next one starts, so the append-only enriched table doubles as
//! the checkpoint: a crash loses at most one batch, and a re-run converges
//! because the filter stage subtracts whatever already landed on disk.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use replay_catalog::{TrackSource, MAX_IDS_PER_REQUEST};
use replay_core::StreamRecord;
use replay_store::StreamTable;
use tracing::{debug, info, warn};

use crate::merge::{merge_updates, MergeOutcome};

/// Per-track progress through one run. Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Pending,
    InFlight,
    Enriched,
    FailedSkipped,
}

impl TrackState {
    fn is_terminal(self) -> bool {
        matches!(self, TrackState::Enriched | TrackState::FailedSkipped)
    }
}

#[derive(Debug, Default)]
struct StateLedger {
    states: HashMap<String, TrackState>,
}

impl StateLedger {
    fn track(&mut self, key: &str) {
        self.states.insert(key.to_string(), TrackState::Pending);
    }

    fn advance(&mut self, key: &str, next: TrackState) {
        if let Some(state) = self.states.get_mut(key) {
            if !state.is_terminal() {
                *state = next;
            }
        }
    }

    fn count(&self, wanted: TrackState) -> usize {
        self.states.values().filter(|s| **s == wanted).count()
    }
}

/// One distinct track identity in the working set: the merge key its plays
/// carry right now, and the catalog id to fetch it by.
#[derive(Debug, Clone)]
struct WorkItem {
    key: String,
    catalog_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct EnrichSummary {
    pub input_rows: usize,
    pub distinct_tracks: usize,
    pub batches: usize,
    pub enriched_rows: usize,
    pub skipped_tracks: usize,
}

pub struct BatchEnricher<'a, S: TrackSource + ?Sized> {
    source: &'a S,
    enriched_table: &'a StreamTable,
    chunk_size: usize,
}

impl<'a, S: TrackSource + ?Sized> BatchEnricher<'a, S> {
    pub fn new(source: &'a S, enriched_table: &'a StreamTable, chunk_size: usize) -> Self {
        Self {
            source,
            enriched_table,
            chunk_size: chunk_size.clamp(1, MAX_IDS_PER_REQUEST),
        }
    }

    /// Drives the working set to completion, one batch at a time. On a fatal
    /// catalog error everything persisted so far stays persisted; only the
    /// in-flight batch is lost.
    pub async fn run(&self, mut working: Vec<StreamRecord>) -> Result<EnrichSummary> {
        let mut summary = EnrichSummary {
            input_rows: working.len(),
            ..EnrichSummary::default()
        };
        info!(rows = working.len(), "enriching track data");
        if working.is_empty() {
            return Ok(summary);
        }

        let mut ledger = StateLedger::default();
        let items = self.distinct_items(&working, &mut ledger).await?;
        summary.distinct_tracks = ledger.states.len();
        info!(
            distinct = summary.distinct_tracks,
            resolved = items.len(),
            "reduced working set to distinct tracks"
        );

        let bar = progress_bar(items.len() as u64);
        let total = items.len();
        let mut processed = 0usize;

        for chunk in items.chunks(self.chunk_size) {
            for item in chunk {
                ledger.advance(&item.key, TrackState::InFlight);
            }
            let ids: Vec<String> = chunk.iter().map(|i| i.catalog_id.clone()).collect();
            let results = self
                .source
                .tracks(&ids)
                .await
                .context("fetching track batch from the catalog")?;

            let mut updates = HashMap::new();
            for (item, result) in chunk.iter().zip(results) {
                match result {
                    Some(attributes) => {
                        ledger.advance(&item.key, TrackState::Enriched);
                        updates.insert(item.key.clone(), attributes);
                    }
                    None => {
                        warn!(
                            catalog_id = %item.catalog_id,
                            "catalog does not recognize id, skipped for this run"
                        );
                        ledger.advance(&item.key, TrackState::FailedSkipped);
                    }
                }
            }

            let MergeOutcome { enriched, pending } = merge_updates(working, &updates);
            summary.enriched_rows += self
                .enriched_table
                .append_rows(&enriched)
                .context("persisting enriched batch")?;
            working = pending;
            summary.batches += 1;

            processed += chunk.len();
            bar.inc(chunk.len() as u64);
            info!(processed, total, "batch persisted");
        }
        bar.finish_and_clear();

        summary.skipped_tracks = ledger.count(TrackState::FailedSkipped);
        debug!(
            enriched = ledger.count(TrackState::Enriched),
            skipped = summary.skipped_tracks,
            "run ledger settled"
        );
        Ok(summary)
    }

    /// One [`WorkItem`] per distinct track identity, in first-play order.
    /// References without a catalog id go through search once; misses are
    /// dropped from this run's attempt instead of being retried in a loop.
    async fn distinct_items(
        &self,
        working: &[StreamRecord],
        ledger: &mut StateLedger,
    ) -> Result<Vec<WorkItem>> {
        let mut seen = HashSet::new();
        let mut items = Vec::new();
        for row in working {
            let key = row.track_key().to_string();
            if !seen.insert(key.clone()) {
                continue;
            }
            ledger.track(&key);
            match &row.track_uri {
                Some(uri) => items.push(WorkItem {
                    key,
                    catalog_id: uri.clone(),
                }),
                None => {
                    let reference = row.reference();
                    match self
                        .source
                        .search(&reference)
                        .await
                        .context("resolving track reference via search")?
                    {
                        Some(attributes) => {
                            debug!(
                                src_id = %key,
                                catalog_id = %attributes.track_uri,
                                "resolved reference via search"
                            );
                            items.push(WorkItem {
                                key,
                                catalog_id: attributes.track_uri,
                            });
                        }
                        None => {
                            warn!(src_id = %key, "search found no match, skipped for this run");
                            ledger.advance(&key, TrackState::FailedSkipped);
                        }
                    }
                }
            }
        }
        Ok(items)
    }
}

fn progress_bar(total: u64) -> ProgressBar {
    let style = ProgressStyle::with_template("[{bar:60}] {pos}/{len}")
        .expect("static template")
        .progress_chars("-- ");
    ProgressBar::new(total).with_style(style)
}
