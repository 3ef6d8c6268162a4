//! Derived listening metrics, computed after enrichment settles.
//!
//! Everything here is a pure function of the featured table: calendar parts
//! of the end timestamp, first-listen flags in chronological order, the play
//! percentage, and a normalized platform label.

use anyhow::Result;
use chrono::{Datelike, Timelike};
use replay_core::{percentage_played, StreamRecord};
use replay_store::StreamTable;
use std::collections::HashSet;
use tracing::{info, warn};

/// Raw platform strings start with one of these; the label is the canonical
/// form the dashboards group by.
const PLATFORM_LABELS: &[(&str, &str)] = &[
    ("android", "Android"),
    ("ios", "iOS"),
    ("osx", "macOS"),
    ("os x", "macOS"),
    ("macos", "macOS"),
    ("windows", "Windows"),
    ("linux", "Linux"),
    ("web_player", "Web Player"),
    ("webplayer", "Web Player"),
    ("partner", "Partner Device"),
    ("sonos", "Partner Device"),
    ("cast", "Partner Device"),
];

pub fn run(featured_table: &StreamTable, metrics_table: &StreamTable) -> Result<usize> {
    let mut rows = featured_table.read_or_empty()?;
    // First-listen flags depend on scan order.
    rows.sort_by(|a, b| a.end_time.cmp(&b.end_time));

    let mut known_tracks = HashSet::new();
    let mut known_artists = HashSet::new();
    let mut known_albums = HashSet::new();
    for row in &mut rows {
        fill_date_parts(row);
        row.percentage_played = percentage_played(row.ms_played, row.track_duration_ms);
        row.min_played = row.ms_played as f64 / 1000.0 / 60.0;
        // An absent skip marker means the play ran through.
        row.skipped = Some(row.skipped.unwrap_or(false));
        row.normalized_platform = row.platform.as_deref().and_then(normalize_platform);

        row.is_new_track = Some(known_tracks.insert(row.track_key().to_string()));
        row.is_new_artist = Some(known_artists.insert(
            row.artist_uri.clone().unwrap_or_else(|| row.artist_name.clone()),
        ));
        row.is_new_album = Some(match row.album_uri.clone().or_else(|| row.album_name.clone()) {
            Some(album) => known_albums.insert(album),
            None => false,
        });
    }

    let written = metrics_table.write_all(&rows)?;
    info!(rows = written, path = %metrics_table.path().display(), "saved metrics history");
    Ok(written)
}

fn fill_date_parts(row: &mut StreamRecord) {
    let at = row.end_time;
    row.year = Some(format!("{:04}", at.year()));
    row.month = Some(format!("{:02}", at.month()));
    row.month_name = Some(at.format("%B").to_string());
    row.day = Some(format!("{:02}", at.day()));
    row.day_of_week = Some(format!("{:02}", at.weekday().num_days_from_monday()));
    row.day_name = Some(at.format("%A").to_string());
    row.hour = Some(format!("{:02}", at.hour()));
    row.minute = Some(format!("{:02}", at.minute()));
}

/// Maps a raw platform string onto its canonical label. Exactly one label
/// must claim the string; anything else is left unnormalized.
pub fn normalize_platform(raw: &str) -> Option<String> {
    let lowered = raw.to_lowercase();
    let matches: Vec<&str> = PLATFORM_LABELS
        .iter()
        .filter(|(prefix, _)| lowered.contains(prefix))
        .map(|(_, label)| *label)
        .collect();
    match matches.as_slice() {
        [label] => Some(label.to_string()),
        [] => {
            warn!(platform = %raw, "platform matched no label");
            None
        }
        many => {
            // "partner sonos_amp sonos" style strings hit several aliases of
            // the same label; only disagreeing labels are ambiguous.
            let first = many[0];
            if many.iter().all(|label| *label == first) {
                Some(first.to_string())
            } else {
                warn!(platform = %raw, "platform matched several labels");
                None
            }
        }
    }
}
