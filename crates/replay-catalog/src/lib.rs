//! Catalog API client: authenticated, rate-limit-aware track metadata access.
//!
//! One client-credentials exchange per process run, then plain bearer GETs.
//! Rate limiting (429) is absorbed by sleeping and retrying the same request
//! for as long as it takes; transport failures get a small bounded number of
//! linearly backed-off retries; a 404 skips the item instead of aborting the
//! batch; everything else fails the run and relies on resumability.

use std::time::Duration;

use async_trait::async_trait;
use replay_core::{AudioFeatures, TrackAttributes, TrackReference};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "replay-catalog";

/// Provider cap on ids per batch request.
pub const MAX_IDS_PER_REQUEST: usize = 50;

#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub auth_url: String,
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub market: String,
    pub timeout: Duration,
    pub rate_limit_sleep: Duration,
    pub transport_retries: usize,
    pub transport_backoff: Duration,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            auth_url: "https://accounts.spotify.com/api/token".to_string(),
            base_url: "https://api.spotify.com/v1".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            market: "FR".to_string(),
            timeout: Duration::from_secs(10),
            rate_limit_sleep: Duration::from_secs(60),
            transport_retries: 3,
            transport_backoff: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("credential exchange failed: {0}")]
    Auth(String),
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("transport error after {attempts} attempts: {source}")]
    Transport {
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected response shape: {0}")]
    Shape(String),
    #[error(transparent)]
    Request(#[from] reqwest::Error),
}

/// Seam between the enrichment loop and the remote catalog, so the loop can
/// be driven by an in-process fake in tests.
#[async_trait]
pub trait TrackSource: Send + Sync {
    /// Attributes for each id, positionally matching `ids`, `None` where the
    /// catalog does not recognize the id. `ids.len()` must not exceed
    /// [`MAX_IDS_PER_REQUEST`].
    async fn tracks(&self, ids: &[String]) -> Result<Vec<Option<TrackAttributes>>, CatalogError>;

    /// Best-ranked match for a name+artist pair, or `None` when the search
    /// yields nothing.
    async fn search(
        &self,
        reference: &TrackReference,
    ) -> Result<Option<TrackAttributes>, CatalogError>;

    /// Feature vector per id, positionally, `None` where unavailable.
    async fn audio_features(
        &self,
        ids: &[String],
    ) -> Result<Vec<Option<AudioFeatures>>, CatalogError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct TracksResponse {
    tracks: Vec<Option<TrackObject>>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    tracks: SearchItems,
}

#[derive(Debug, Deserialize)]
struct SearchItems {
    items: Vec<TrackObject>,
}

#[derive(Debug, Deserialize)]
struct FeaturesResponse {
    audio_features: Vec<Option<AudioFeatures>>,
}

#[derive(Debug, Deserialize)]
struct TrackObject {
    uri: String,
    duration_ms: Option<u64>,
    popularity: Option<u32>,
    #[serde(default)]
    artists: Vec<UriObject>,
    album: Option<UriObject>,
}

#[derive(Debug, Deserialize)]
struct UriObject {
    uri: String,
}

/// Bare id from a `namespace:kind:id` URI; plain ids pass through.
pub fn uri_tail(uri: &str) -> &str {
    uri.rsplit(':').next().unwrap_or(uri)
}

impl TrackObject {
    fn into_attributes(self) -> TrackAttributes {
        TrackAttributes {
            track_uri: uri_tail(&self.uri).to_string(),
            // The export model carries a single artist per play.
            artist_uri: self
                .artists
                .first()
                .map(|a| uri_tail(&a.uri).to_string()),
            album_uri: self.album.map(|a| uri_tail(&a.uri).to_string()),
            // A zero duration is the remote's way of saying "unknown".
            track_duration_ms: self.duration_ms.filter(|d| *d > 0),
            track_popularity: self.popularity,
        }
    }
}

pub struct CatalogClient {
    http: reqwest::Client,
    config: CatalogConfig,
    bearer: String,
}

impl CatalogClient {
    /// Performs the client-credentials exchange. Called once per run; any
    /// failure here is fatal, nothing downstream can proceed without a token.
    pub async fn authenticate(config: CatalogConfig) -> Result<Self, CatalogError> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .build()?;
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.as_str()),
        ];
        let response = http.post(&config.auth_url).form(&form).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::Auth(format!(
                "{} returned {}",
                config.auth_url, status
            )));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| CatalogError::Auth(e.to_string()))?;
        Ok(Self {
            http,
            config,
            bearer: token.access_token,
        })
    }

    /// One logical GET with the full retry taxonomy. Returns `Ok(None)` on
    /// 404 so callers can skip the item without losing the batch.
    async fn request_json(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<Option<serde_json::Value>, CatalogError> {
        let mut transport_attempts = 0usize;
        loop {
            let result = self
                .http
                .get(url)
                .bearer_auth(&self.bearer)
                .query(params)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    debug!(" -> {}", response.url());
                    debug!(" <- {}", status);
                    if status.is_success() {
                        let value = response.json().await?;
                        return Ok(Some(value));
                    }
                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        // Deliberate backpressure: the remote sets the pace,
                        // we wait it out however long it takes.
                        warn!(
                            url,
                            sleep_secs = self.config.rate_limit_sleep.as_secs(),
                            "rate limited, sleeping before retrying"
                        );
                        tokio::time::sleep(self.config.rate_limit_sleep).await;
                        continue;
                    }
                    if status == reqwest::StatusCode::NOT_FOUND {
                        warn!(url, "not found, skipping");
                        return Ok(None);
                    }
                    return Err(CatalogError::Status {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }
                Err(err) if err.is_timeout() || err.is_connect() => {
                    transport_attempts += 1;
                    if transport_attempts > self.config.transport_retries {
                        return Err(CatalogError::Transport {
                            attempts: transport_attempts,
                            source: err,
                        });
                    }
                    let delay = self.config.transport_backoff * transport_attempts as u32;
                    warn!(
                        url,
                        attempt = transport_attempts,
                        delay_secs = delay.as_secs(),
                        "transport error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(CatalogError::Request(err)),
            }
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl TrackSource for CatalogClient {
    async fn tracks(&self, ids: &[String]) -> Result<Vec<Option<TrackAttributes>>, CatalogError> {
        if ids.len() > MAX_IDS_PER_REQUEST {
            return Err(CatalogError::Shape(format!(
                "{} ids exceeds the per-request cap of {}",
                ids.len(),
                MAX_IDS_PER_REQUEST
            )));
        }
        let joined = ids.join(",");
        let url = self.endpoint("tracks");
        let params = [
            ("ids", joined.as_str()),
            ("market", self.config.market.as_str()),
        ];
        let Some(value) = self.request_json(&url, &params).await? else {
            // The whole batch 404ing means every item is unknown.
            return Ok(vec![None; ids.len()]);
        };
        let parsed: TracksResponse =
            serde_json::from_value(value).map_err(|e| CatalogError::Shape(e.to_string()))?;
        if parsed.tracks.len() != ids.len() {
            return Err(CatalogError::Shape(format!(
                "asked for {} tracks, got {}",
                ids.len(),
                parsed.tracks.len()
            )));
        }
        Ok(parsed
            .tracks
            .into_iter()
            .map(|t| t.map(TrackObject::into_attributes))
            .collect())
    }

    async fn search(
        &self,
        reference: &TrackReference,
    ) -> Result<Option<TrackAttributes>, CatalogError> {
        // Apostrophes break the query syntax on the remote side.
        let query = format!(
            "{} track:{}",
            reference.artist_name,
            reference.track_name.replace('\'', " ")
        );
        let url = self.endpoint("search");
        let params = [
            ("q", query.as_str()),
            ("type", "track"),
            ("market", self.config.market.as_str()),
            ("limit", "1"),
            ("offset", "0"),
        ];
        let Some(value) = self.request_json(&url, &params).await? else {
            return Ok(None);
        };
        let parsed: SearchResponse =
            serde_json::from_value(value).map_err(|e| CatalogError::Shape(e.to_string()))?;
        Ok(parsed
            .tracks
            .items
            .into_iter()
            .next()
            .map(TrackObject::into_attributes))
    }

    async fn audio_features(
        &self,
        ids: &[String],
    ) -> Result<Vec<Option<AudioFeatures>>, CatalogError> {
        if ids.len() > MAX_IDS_PER_REQUEST {
            return Err(CatalogError::Shape(format!(
                "{} ids exceeds the per-request cap of {}",
                ids.len(),
                MAX_IDS_PER_REQUEST
            )));
        }
        let joined = ids.join(",");
        let url = self.endpoint("audio-features");
        let params = [("ids", joined.as_str())];
        let Some(value) = self.request_json(&url, &params).await? else {
            return Ok(vec![None; ids.len()]);
        };
        let parsed: FeaturesResponse =
            serde_json::from_value(value).map_err(|e| CatalogError::Shape(e.to_string()))?;
        if parsed.audio_features.len() != ids.len() {
            return Err(CatalogError::Shape(format!(
                "asked for {} feature vectors, got {}",
                ids.len(),
                parsed.audio_features.len()
            )));
        }
        Ok(parsed.audio_features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_tail_strips_the_namespace() {
        assert_eq!(uri_tail("spotify:track:4uLU6hMCjMI75M1A2tKUQC"), "4uLU6hMCjMI75M1A2tKUQC");
        assert_eq!(uri_tail("spotify:artist:3jOstUTkEu2JkjvRdBA5Gu"), "3jOstUTkEu2JkjvRdBA5Gu");
        assert_eq!(uri_tail("4uLU6hMCjMI75M1A2tKUQC"), "4uLU6hMCjMI75M1A2tKUQC");
    }

    #[test]
    fn track_object_conversion_takes_the_first_artist_and_nans_zero_duration() {
        let value = serde_json::json!({
            "uri": "spotify:track:abc123",
            "duration_ms": 0,
            "popularity": 55,
            "artists": [
                { "uri": "spotify:artist:art1" },
                { "uri": "spotify:artist:art2" }
            ],
            "album": { "uri": "spotify:album:alb1" }
        });
        let object: TrackObject = serde_json::from_value(value).expect("parse");
        let attrs = object.into_attributes();
        assert_eq!(attrs.track_uri, "abc123");
        assert_eq!(attrs.artist_uri.as_deref(), Some("art1"));
        assert_eq!(attrs.album_uri.as_deref(), Some("alb1"));
        assert_eq!(attrs.track_duration_ms, None);
        assert_eq!(attrs.track_popularity, Some(55));
    }

    #[test]
    fn batch_response_preserves_positional_nulls() {
        let value = serde_json::json!({
            "tracks": [
                { "uri": "spotify:track:a", "duration_ms": 200_000, "popularity": 10, "artists": [], "album": null },
                null
            ]
        });
        let parsed: TracksResponse = serde_json::from_value(value).expect("parse");
        assert_eq!(parsed.tracks.len(), 2);
        assert!(parsed.tracks[0].is_some());
        assert!(parsed.tracks[1].is_none());
    }

    #[test]
    fn feature_vector_parses_from_catalog_shape() {
        let value = serde_json::json!({
            "audio_features": [{
                "id": "abc123",
                "danceability": 0.58,
                "energy": 0.842,
                "key": 5,
                "loudness": -5.88,
                "mode": 0,
                "speechiness": 0.0556,
                "acousticness": 0.0102,
                "instrumentalness": 0.0,
                "liveness": 0.0866,
                "valence": 0.428,
                "tempo": 118.211,
                "time_signature": 4
            }, null]
        });
        let parsed: FeaturesResponse = serde_json::from_value(value).expect("parse");
        let features = parsed.audio_features[0].as_ref().expect("present");
        assert_eq!(features.id, "abc123");
        assert_eq!(features.key, Some(5));
        assert!(parsed.audio_features[1].is_none());
    }
}
