//! Selects the rows still waiting for enrichment.
//!
//! Resumability lives here: the enriched table on disk is the source of
//! truth for what is done, so a re-run subtracts its row ids from the
//! concatenated history and hands the remainder to the enricher. Rows with
//! no resolvable track identity at all are dropped.

use std::collections::HashSet;

use anyhow::Result;
use replay_core::StreamRecord;
use replay_store::StreamTable;
use tracing::{info, warn};

pub fn run(
    concat_table: &StreamTable,
    enriched_table: &StreamTable,
    to_enrich_table: &StreamTable,
) -> Result<Vec<StreamRecord>> {
    let history = concat_table.read_all()?;
    let done = enriched_ids(enriched_table)?;

    let total = history.len();
    let mut dropped_unresolvable = 0usize;
    let to_enrich: Vec<StreamRecord> = history
        .into_iter()
        .filter(|row| {
            if !has_identity(row) {
                dropped_unresolvable += 1;
                return false;
            }
            !done.contains(&row.id)
        })
        .collect();

    if dropped_unresolvable > 0 {
        warn!(rows = dropped_unresolvable, "dropped rows without any track identity");
    }
    // Written out for inspection between runs; the enricher works from the
    // in-memory rows.
    to_enrich_table.write_all(&to_enrich)?;
    info!(
        total,
        already_enriched = done.len(),
        to_enrich = to_enrich.len(),
        "filtered history against the enriched table"
    );
    Ok(to_enrich)
}

/// Ids already persisted. A missing or empty enriched table just means a
/// fresh run, not an error.
fn enriched_ids(enriched_table: &StreamTable) -> Result<HashSet<String>> {
    match enriched_table.read_all() {
        Ok(rows) => Ok(rows.into_iter().map(|r| r.id).collect()),
        Err(err) if err.is_recoverable() => {
            warn!(path = %enriched_table.path().display(), %err, "no enriched table yet, keeping everything");
            Ok(HashSet::new())
        }
        Err(err) => Err(err.into()),
    }
}

fn has_identity(row: &StreamRecord) -> bool {
    row.track_uri.is_some() || (!row.artist_name.is_empty() && !row.track_name.is_empty())
}
