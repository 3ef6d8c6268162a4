//! Reconciles catalog results against the working table.
//!
//! The merge is keyed on track identity and fans one update out onto every
//! play of the same track. It never creates or drops rows: every base row
//! lands in exactly one of the two output sets.

use std::collections::HashMap;

use replay_core::{percentage_played, StreamRecord, TrackAttributes};

#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Rows whose track identity matched an update; ready to persist.
    pub enriched: Vec<StreamRecord>,
    /// Rows still waiting for a later batch.
    pub pending: Vec<StreamRecord>,
}

/// Applies per-track `updates` to `base`. `updates` holds each key at most
/// once per call; a key may match many base rows. Update values take
/// precedence over stale base values, but a field the update does not carry
/// never clobbers one the base already has.
pub fn merge_updates(
    base: Vec<StreamRecord>,
    updates: &HashMap<String, TrackAttributes>,
) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();
    for mut row in base {
        match updates.get(row.track_key()) {
            Some(attributes) => {
                apply_attributes(&mut row, attributes);
                outcome.enriched.push(row);
            }
            None => outcome.pending.push(row),
        }
    }
    outcome
}

fn apply_attributes(row: &mut StreamRecord, attributes: &TrackAttributes) {
    row.track_uri = Some(attributes.track_uri.clone());
    row.artist_uri = attributes.artist_uri.clone().or(row.artist_uri.take());
    row.album_uri = attributes.album_uri.clone().or(row.album_uri.take());
    row.track_duration_ms = attributes.track_duration_ms.or(row.track_duration_ms);
    row.track_popularity = attributes.track_popularity.or(row.track_popularity);
    row.percentage_played = percentage_played(row.ms_played, row.track_duration_ms);
}
