//! Concatenates raw streaming-history export files into one normalized table.
//!
//! Export field names are renamed to the canonical column set, the catalog
//! track id is pulled out of the export's full URI, exact duplicate events
//! (overlapping export files) are dropped, and the result is sorted
//! chronologically. Podcast episode rows carry no track metadata and are
//! left out.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use replay_catalog::uri_tail;
use replay_core::StreamRecord;
use replay_store::StreamTable;
use serde::Deserialize;
use tracing::{debug, info};

use crate::library::Library;

pub const EXPORT_FILE_PREFIX: &str = "Streaming_History_Audio_";

/// One event as exported. Aliases cover the older account-data export, which
/// used camelCase names and a reduced column set.
#[derive(Debug, Deserialize)]
struct ExportEntry {
    #[serde(alias = "endTime")]
    ts: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    platform: Option<String>,
    #[serde(alias = "msPlayed")]
    ms_played: u64,
    #[serde(default)]
    conn_country: Option<String>,
    #[serde(default)]
    ip_addr_decrypted: Option<String>,
    #[serde(default)]
    user_agent_decrypted: Option<String>,
    #[serde(default, alias = "trackName")]
    master_metadata_track_name: Option<String>,
    #[serde(default, alias = "artistName")]
    master_metadata_album_artist_name: Option<String>,
    #[serde(default)]
    master_metadata_album_album_name: Option<String>,
    #[serde(default)]
    spotify_track_uri: Option<String>,
    #[serde(default)]
    reason_start: Option<String>,
    #[serde(default)]
    reason_end: Option<String>,
    #[serde(default)]
    shuffle: Option<bool>,
    #[serde(default)]
    skipped: Option<bool>,
    #[serde(default)]
    offline: Option<bool>,
    #[serde(default)]
    offline_timestamp: Option<i64>,
    #[serde(default)]
    incognito_mode: Option<bool>,
}

/// Export files under `resources_dir`, sorted so repeated runs see the same
/// concatenation order.
pub fn export_files(resources_dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(resources_dir)
        .with_context(|| format!("reading {}", resources_dir.display()))?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(EXPORT_FILE_PREFIX) && n.ends_with(".json"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();
    Ok(paths)
}

pub fn run(
    resources_dir: &Path,
    concat_table: &StreamTable,
    library: Option<&Library>,
) -> Result<usize> {
    let paths = export_files(resources_dir)?;
    if paths.is_empty() {
        bail!(
            "no {EXPORT_FILE_PREFIX}*.json export files under {}",
            resources_dir.display()
        );
    }

    let mut records = Vec::new();
    let mut seen = HashSet::new();
    let mut raw_rows = 0usize;
    for path in &paths {
        let text =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let entries: Vec<ExportEntry> =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        raw_rows += entries.len();
        for entry in entries {
            if let Some(record) = entry_to_record(entry, library)? {
                // Exact duplicate events show up when export files overlap.
                if seen.insert((record.id.clone(), record.ms_played)) {
                    records.push(record);
                }
            }
        }
    }
    info!(
        files = paths.len(),
        raw_rows,
        kept = records.len(),
        "concatenated export files"
    );

    records.sort_by(|a, b| a.end_time.cmp(&b.end_time));
    let written = concat_table.write_all(&records)?;
    info!(rows = written, path = %concat_table.path().display(), "saved concatenated history");
    Ok(written)
}

/// `None` for rows without track metadata (podcast episodes). The library,
/// when present, backfills URIs the history export lacks and marks saved
/// tracks, before the row id is derived.
fn entry_to_record(entry: ExportEntry, library: Option<&Library>) -> Result<Option<StreamRecord>> {
    let (Some(track_name), Some(artist_name)) = (
        entry.master_metadata_track_name,
        entry.master_metadata_album_artist_name,
    ) else {
        debug!(ts = %entry.ts, "dropping row without track metadata");
        return Ok(None);
    };

    let end_time = parse_end_time(&entry.ts)?;
    let track_src_id = format!("{artist_name}:{track_name}");
    let track_uri = entry
        .spotify_track_uri
        .as_deref()
        .map(|uri| uri_tail(uri).to_string())
        .or_else(|| {
            library
                .and_then(|l| l.resolve(&track_src_id))
                .map(str::to_string)
        });
    let in_library = library.map(|l| {
        track_uri
            .as_deref()
            .is_some_and(|uri| l.contains(uri))
    });
    let id = StreamRecord::derive_id(end_time, track_uri.as_deref(), &track_src_id);

    Ok(Some(StreamRecord {
        id,
        end_time,
        artist_name,
        track_name,
        album_name: entry.master_metadata_album_album_name,
        ms_played: entry.ms_played,
        min_played: entry.ms_played as f64 / 1000.0 / 60.0,
        track_src_id,
        track_uri,
        username: entry.username,
        platform: entry.platform,
        conn_country: entry.conn_country,
        ip_addr: entry.ip_addr_decrypted,
        user_agent: entry.user_agent_decrypted,
        reason_start: entry.reason_start,
        reason_end: entry.reason_end,
        shuffle: entry.shuffle,
        skipped: entry.skipped,
        offline: entry.offline,
        offline_timestamp: entry.offline_timestamp,
        incognito_mode: entry.incognito_mode,
        in_library,
        artist_uri: None,
        album_uri: None,
        track_duration_ms: None,
        track_popularity: None,
        percentage_played: None,
        danceability: None,
        energy: None,
        key: None,
        loudness: None,
        mode: None,
        speechiness: None,
        acousticness: None,
        instrumentalness: None,
        liveness: None,
        valence: None,
        tempo: None,
        time_signature: None,
        year: None,
        month: None,
        month_name: None,
        day: None,
        day_of_week: None,
        day_name: None,
        hour: None,
        minute: None,
        is_new_track: None,
        is_new_artist: None,
        is_new_album: None,
        normalized_platform: None,
    }))
}

/// The extended export uses RFC 3339; the older one used `YYYY-MM-DD HH:MM`.
fn parse_end_time(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M")
        .with_context(|| format!("unparseable end timestamp {raw:?}"))?;
    Ok(naive.and_utc())
}
