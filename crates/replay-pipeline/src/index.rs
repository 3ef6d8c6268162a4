//! Bulk loading of the final table into a search index.
//!
//! Rows become flat documents keyed by their stable row id, so reloading the
//! same table is idempotent. Per-document failures are counted and reported,
//! not fatal; only transport-level problems abort the load.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use replay_core::StreamRecord;
use replay_store::StreamTable;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub hosts: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub index_name: String,
    pub timeout: Duration,
    pub chunk_size: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["http://localhost:9200".to_string()],
            username: None,
            password: None,
            index_name: "replay-history".to_string(),
            timeout: Duration::from_secs(30),
            chunk_size: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BulkSummary {
    pub indexed: usize,
    pub failed: usize,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    errors: bool,
    items: Vec<BulkItem>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    index: BulkItemStatus,
}

#[derive(Debug, Deserialize)]
struct BulkItemStatus {
    status: u16,
}

pub struct IndexLoader {
    http: Client,
    config: IndexConfig,
}

impl IndexLoader {
    pub fn new(config: IndexConfig) -> Result<Self> {
        if config.hosts.is_empty() {
            bail!("no index hosts configured");
        }
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building the index http client")?;
        Ok(Self { http, config })
    }

    pub async fn bulk_load(&self, table: &StreamTable) -> Result<BulkSummary> {
        let rows = table.read_or_empty()?;
        let mut summary = BulkSummary::default();
        let total = rows.len();
        for chunk in rows.chunks(self.config.chunk_size.max(1)) {
            let outcome = self.bulk_request(chunk).await?;
            summary.indexed += outcome.indexed;
            summary.failed += outcome.failed;
            info!(
                indexed = summary.indexed,
                failed = summary.failed,
                total,
                index = %self.config.index_name,
                "bulk chunk loaded"
            );
        }
        Ok(summary)
    }

    /// Tries each configured host in order and settles on the first that
    /// answers; a host that is down or erroring only costs the failover.
    async fn bulk_request(&self, rows: &[StreamRecord]) -> Result<BulkSummary> {
        let body = bulk_body(&self.config.index_name, rows);
        let mut last_err = None;
        for url in self.bulk_urls() {
            match self.bulk_request_to(&url, body.clone()).await {
                Ok(summary) => return Ok(summary),
                Err(err) => {
                    warn!(%url, %err, "bulk request failed, trying the next host");
                    last_err = Some(err);
                }
            }
        }
        // `new` refuses an empty host list, so at least one attempt ran.
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no index hosts configured")))
    }

    fn bulk_urls(&self) -> Vec<String> {
        self.config
            .hosts
            .iter()
            .map(|host| format!("{}/_bulk", host.trim_end_matches('/')))
            .collect()
    }

    async fn bulk_request_to(&self, url: &str, body: String) -> Result<BulkSummary> {
        let mut request = self
            .http
            .post(url)
            .header("content-type", "application/x-ndjson")
            .body(body);
        if let Some(username) = &self.config.username {
            request = request.basic_auth(username, self.config.password.as_deref());
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("sending bulk request to {url}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("bulk request to {url} failed with status {status}");
        }
        let parsed: BulkResponse = response
            .json()
            .await
            .context("decoding the bulk response")?;

        let mut summary = BulkSummary::default();
        for item in &parsed.items {
            if item.index.status < 300 {
                summary.indexed += 1;
            } else {
                summary.failed += 1;
            }
        }
        if parsed.errors {
            warn!(failed = summary.failed, "bulk response reported document errors");
        }
        Ok(summary)
    }
}

fn bulk_body(index_name: &str, rows: &[StreamRecord]) -> String {
    let mut body = String::new();
    for row in rows {
        let action = json!({ "index": { "_index": index_name, "_id": row.id } });
        body.push_str(&action.to_string());
        body.push('\n');
        body.push_str(&to_document(row).to_string());
        body.push('\n');
    }
    body
}

/// The document keeps the play-level and track-level fields; the calendar
/// parts are left out because the index derives them from the timestamp.
pub fn to_document(row: &StreamRecord) -> Value {
    json!({
        "stream_end_time": row.end_time.to_rfc3339(),
        "stream_username": row.username,
        "stream_platform": row.platform,
        "stream_normalized_platform": row.normalized_platform,
        "stream_conn_country": row.conn_country,
        "stream_ms_played": row.ms_played,
        "stream_min_played": row.min_played,
        "stream_percentage_played": row.percentage_played,
        "stream_reason_start": row.reason_start,
        "stream_reason_end": row.reason_end,
        "stream_shuffle": row.shuffle,
        "stream_skipped": row.skipped,
        "stream_offline": row.offline,
        "stream_incognito_mode": row.incognito_mode,
        "stream_is_new_track": row.is_new_track,
        "stream_is_new_artist": row.is_new_artist,
        "stream_is_new_album": row.is_new_album,
        "track_name": row.track_name,
        "artist_name": row.artist_name,
        "album_name": row.album_name,
        "track_uri": row.track_uri,
        "artist_uri": row.artist_uri,
        "album_uri": row.album_uri,
        "track_duration_ms": row.track_duration_ms,
        "track_popularity": row.track_popularity,
        "in_library": row.in_library,
        "audio_danceability": row.danceability,
        "audio_energy": row.energy,
        "audio_key": row.key,
        "audio_loudness": row.loudness,
        "audio_mode": row.mode,
        "audio_speechiness": row.speechiness,
        "audio_acousticness": row.acousticness,
        "audio_instrumentalness": row.instrumentalness,
        "audio_liveness": row.liveness,
        "audio_valence": row.valence,
        "audio_tempo": row.tempo,
        "audio_time_signature": row.time_signature,
    })
}
