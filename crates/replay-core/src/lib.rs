//! Core domain model for the Replay streaming-history pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "replay-core";

/// A (track name, artist name) pair, resolvable to a catalog track id.
///
/// Once a reference has been resolved, the mapping is treated as stable for
/// the life of the dataset; nothing re-resolves an already-known id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackReference {
    pub track_name: String,
    pub artist_name: String,
}

impl TrackReference {
    pub fn new(artist_name: impl Into<String>, track_name: impl Into<String>) -> Self {
        Self {
            track_name: track_name.into(),
            artist_name: artist_name.into(),
        }
    }

    /// Pre-resolution identity key, `"{artist}:{track}"`.
    pub fn src_id(&self) -> String {
        format!("{}:{}", self.artist_name, self.track_name)
    }
}

/// Per-track attributes returned by the catalog, merged onto every play of
/// the same track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackAttributes {
    pub track_uri: String,
    pub artist_uri: Option<String>,
    pub album_uri: Option<String>,
    pub track_duration_ms: Option<u64>,
    pub track_popularity: Option<u32>,
}

/// Audio feature vector for one track, keyed by the catalog track id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFeatures {
    pub id: String,
    pub danceability: Option<f64>,
    pub energy: Option<f64>,
    pub key: Option<i32>,
    pub loudness: Option<f64>,
    pub mode: Option<i32>,
    pub speechiness: Option<f64>,
    pub acousticness: Option<f64>,
    pub instrumentalness: Option<f64>,
    pub liveness: Option<f64>,
    pub valence: Option<f64>,
    pub tempo: Option<f64>,
    pub time_signature: Option<i32>,
}

/// One listening event, carried through every stage as a flat row.
///
/// Identity (`id`) is created once at ingestion and never changes. Enrichment
/// fills the `artist_uri`..`percentage_played` block, the feature stage fills
/// the audio-feature block, and the metrics stage fills the rest. A record is
/// never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub id: String,
    pub end_time: DateTime<Utc>,
    pub artist_name: String,
    pub track_name: String,
    pub album_name: Option<String>,
    pub ms_played: u64,
    pub min_played: f64,
    pub track_src_id: String,
    pub track_uri: Option<String>,

    pub username: Option<String>,
    pub platform: Option<String>,
    pub conn_country: Option<String>,
    pub ip_addr: Option<String>,
    pub user_agent: Option<String>,
    pub reason_start: Option<String>,
    pub reason_end: Option<String>,
    pub shuffle: Option<bool>,
    pub skipped: Option<bool>,
    pub offline: Option<bool>,
    pub offline_timestamp: Option<i64>,
    pub incognito_mode: Option<bool>,
    /// Whether the track sits in the user's saved library; `None` when no
    /// library export was available at ingestion.
    pub in_library: Option<bool>,

    // Filled by enrichment.
    pub artist_uri: Option<String>,
    pub album_uri: Option<String>,
    pub track_duration_ms: Option<u64>,
    pub track_popularity: Option<u32>,
    pub percentage_played: Option<f64>,

    // Filled by the audio-feature stage.
    pub danceability: Option<f64>,
    pub energy: Option<f64>,
    pub key: Option<i32>,
    pub loudness: Option<f64>,
    pub mode: Option<i32>,
    pub speechiness: Option<f64>,
    pub acousticness: Option<f64>,
    pub instrumentalness: Option<f64>,
    pub liveness: Option<f64>,
    pub valence: Option<f64>,
    pub tempo: Option<f64>,
    pub time_signature: Option<i32>,

    // Filled by the metrics stage.
    pub year: Option<String>,
    pub month: Option<String>,
    pub month_name: Option<String>,
    pub day: Option<String>,
    pub day_of_week: Option<String>,
    pub day_name: Option<String>,
    pub hour: Option<String>,
    pub minute: Option<String>,
    pub is_new_track: Option<bool>,
    pub is_new_artist: Option<bool>,
    pub is_new_album: Option<bool>,
    pub normalized_platform: Option<String>,
}

impl StreamRecord {
    /// Canonical merge key: the resolved catalog id when known, the
    /// name+artist fallback before resolution.
    pub fn track_key(&self) -> &str {
        self.track_uri.as_deref().unwrap_or(&self.track_src_id)
    }

    pub fn reference(&self) -> TrackReference {
        TrackReference::new(self.artist_name.clone(), self.track_name.clone())
    }

    /// Stable, deterministic row identity: end timestamp plus the strongest
    /// track reference known at ingestion time.
    pub fn derive_id(end_time: DateTime<Utc>, track_uri: Option<&str>, src_id: &str) -> String {
        format!(
            "{}:{}",
            end_time.to_rfc3339(),
            track_uri.unwrap_or(src_id)
        )
    }
}

/// Share of the track actually played, as a percentage in `[0, 100]`
/// rounded to two decimals. A zero or missing duration yields `None`
/// rather than a divide fault.
pub fn percentage_played(ms_played: u64, duration_ms: Option<u64>) -> Option<f64> {
    let duration = duration_ms.filter(|d| *d > 0)?;
    let pct = ms_played as f64 / duration as f64 * 100.0;
    Some(((pct * 100.0).round() / 100.0).min(100.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn percentage_is_rounded_to_two_decimals() {
        assert_eq!(percentage_played(100_000, Some(300_000)), Some(33.33));
        assert_eq!(percentage_played(200_000, Some(300_000)), Some(66.67));
    }

    #[test]
    fn percentage_is_clamped_to_one_hundred() {
        assert_eq!(percentage_played(400_000, Some(300_000)), Some(100.0));
        assert_eq!(percentage_played(0, Some(300_000)), Some(0.0));
    }

    #[test]
    fn zero_or_missing_duration_is_undefined_not_a_fault() {
        assert_eq!(percentage_played(100_000, Some(0)), None);
        assert_eq!(percentage_played(100_000, None), None);
    }

    #[test]
    fn row_identity_prefers_the_resolved_id() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 18, 30, 0).single().unwrap();
        let with_uri = StreamRecord::derive_id(at, Some("4uLU6hMCjMI75M1A2tKUQC"), "Artist:Track");
        let without = StreamRecord::derive_id(at, None, "Artist:Track");
        assert!(with_uri.ends_with(":4uLU6hMCjMI75M1A2tKUQC"));
        assert!(without.ends_with(":Artist:Track"));
        assert_eq!(with_uri, StreamRecord::derive_id(at, Some("4uLU6hMCjMI75M1A2tKUQC"), "x"));
    }

    #[test]
    fn track_key_falls_back_to_src_id_before_resolution() {
        let reference = TrackReference::new("Nick Drake", "Pink Moon");
        assert_eq!(reference.src_id(), "Nick Drake:Pink Moon");
    }
}
