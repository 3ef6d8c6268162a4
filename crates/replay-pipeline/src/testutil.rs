//! Shared fixtures for the pipeline unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use replay_catalog::{CatalogError, TrackSource};
use replay_core::{AudioFeatures, StreamRecord, TrackAttributes, TrackReference};

/// One play of track `track` (identity `uri`), `seq` minutes into the hour.
pub(crate) fn play(track: &str, uri: &str, seq: u32) -> StreamRecord {
    let end_time = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).single().unwrap()
        + Duration::minutes(seq as i64);
    let artist_name = format!("Artist {track}");
    let track_name = format!("Track {track}");
    let track_src_id = format!("{artist_name}:{track_name}");
    StreamRecord {
        id: StreamRecord::derive_id(end_time, Some(uri), &track_src_id),
        end_time,
        artist_name,
        track_name,
        album_name: Some(format!("Album {track}")),
        ms_played: 120_000,
        min_played: 2.0,
        track_src_id,
        track_uri: Some(uri.to_string()),
        username: None,
        platform: Some("android os".into()),
        conn_country: Some("FR".into()),
        ip_addr: None,
        user_agent: None,
        reason_start: Some("trackdone".into()),
        reason_end: Some("trackdone".into()),
        shuffle: Some(false),
        skipped: Some(false),
        offline: Some(false),
        offline_timestamp: None,
        incognito_mode: Some(false),
        in_library: None,
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
    }
}

pub(crate) fn attributes_for(id: &str) -> TrackAttributes {
    TrackAttributes {
        track_uri: id.to_string(),
        artist_uri: Some(format!("artist-of-{id}")),
        album_uri: Some(format!("album-of-{id}")),
        track_duration_ms: Some(180_000),
        track_popularity: Some(64),
    }
}

pub(crate) fn features_for(id: &str) -> AudioFeatures {
    AudioFeatures {
        id: id.to_string(),
        danceability: Some(0.58),
        energy: Some(0.84),
        key: Some(5),
        loudness: Some(-5.88),
        mode: Some(0),
        speechiness: Some(0.06),
        acousticness: Some(0.01),
        instrumentalness: Some(0.0),
        liveness: Some(0.09),
        valence: Some(0.43),
        tempo: Some(118.2),
        time_signature: Some(4),
    }
}

/// In-process catalog double: recognizes a fixed id set, serves search hits
/// from a small index, and can be armed to fail after N successful batches.
pub(crate) struct FakeCatalog {
    recognized: HashSet<String>,
    search_index: Mutex<HashMap<String, String>>,
    batch_log: Mutex<Vec<Vec<String>>>,
    search_count: AtomicUsize,
    fail_after: Mutex<Option<usize>>,
}

impl FakeCatalog {
    pub(crate) fn recognizing(ids: &[&str]) -> Self {
        Self {
            recognized: ids.iter().map(|s| s.to_string()).collect(),
            search_index: Mutex::new(HashMap::new()),
            batch_log: Mutex::new(Vec::new()),
            search_count: AtomicUsize::new(0),
            fail_after: Mutex::new(None),
        }
    }

    pub(crate) fn index_search(&self, src_id: &str, catalog_id: &str) {
        self.search_index
            .lock()
            .unwrap()
            .insert(src_id.to_string(), catalog_id.to_string());
    }

    pub(crate) fn fail_after_batches(&self, batches: usize) {
        *self.fail_after.lock().unwrap() = Some(batches);
    }

    pub(crate) fn batch_requests(&self) -> Vec<Vec<String>> {
        self.batch_log.lock().unwrap().clone()
    }

    pub(crate) fn search_requests(&self) -> usize {
        self.search_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TrackSource for FakeCatalog {
    async fn tracks(&self, ids: &[String]) -> Result<Vec<Option<TrackAttributes>>, CatalogError> {
        let mut log = self.batch_log.lock().unwrap();
        if let Some(limit) = *self.fail_after.lock().unwrap() {
            if log.len() >= limit {
                return Err(CatalogError::Status {
                    status: 500,
                    url: "fake://tracks".to_string(),
                });
            }
        }
        log.push(ids.to_vec());
        Ok(ids
            .iter()
            .map(|id| {
                self.recognized
                    .contains(id)
                    .then(|| attributes_for(id))
            })
            .collect())
    }

    async fn search(
        &self,
        reference: &TrackReference,
    ) -> Result<Option<TrackAttributes>, CatalogError> {
        self.search_count.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .search_index
            .lock()
            .unwrap()
            .get(&reference.src_id())
            .map(|id| attributes_for(id)))
    }

    async fn audio_features(
        &self,
        ids: &[String],
    ) -> Result<Vec<Option<AudioFeatures>>, CatalogError> {
        Ok(ids
            .iter()
            .map(|id| self.recognized.contains(id).then(|| features_for(id)))
            .collect())
    }
}
