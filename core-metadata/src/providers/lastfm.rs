//! Last.fm Provider
//!
//! Secondary catalog, queried through `track.getInfo`.
//!
//! ## API Endpoints
//!
//! - **Track Info**: `https://ws.audioscrobbler.com/2.0/?method=track.getInfo&api_key={key}&artist={artist}&track={title}&format=json`
//!
//! ## API Key Requirement
//!
//! Last.fm requires an API key for all requests. Without one the provider is
//! not constructed at all.

use crate::error::{MetadataError, Result};
use crate::providers::{retry_after, MetadataProvider, RateLimiter};
use crate::types::{MetadataQuery, ResolvedMetadata};
use async_trait::async_trait;
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Last.fm API base URL
const LASTFM_API_BASE: &str = "https://ws.audioscrobbler.com/2.0/";

/// Last.fm "track not found" error code.
const ERROR_NOT_FOUND: i32 = 6;

pub const PROVIDER_ID: &str = "lastfm";

pub struct LastFmProvider {
    http_client: Arc<dyn HttpClient>,
    api_key: String,
    request_timeout: Duration,
    rate_limiter: Mutex<RateLimiter>,
}

#[derive(Debug, Deserialize)]
struct TrackResponse {
    track: Option<TrackInfo>,
    error: Option<i32>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TrackInfo {
    name: String,
    artist: Option<TrackArtist>,
    album: Option<TrackAlbum>,
}

#[derive(Debug, Deserialize)]
struct TrackArtist {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TrackAlbum {
    title: String,
    #[serde(default)]
    image: Vec<AlbumImage>,
}

#[derive(Debug, Clone, Deserialize)]
struct AlbumImage {
    #[serde(rename = "#text")]
    url: String,
    size: String,
}

impl LastFmProvider {
    pub fn new(
        http_client: Arc<dyn HttpClient>,
        api_key: String,
        rate_limit_delay_ms: u64,
        request_timeout: Duration,
    ) -> Self {
        Self {
            http_client,
            api_key,
            request_timeout,
            rate_limiter: Mutex::new(RateLimiter::new(rate_limit_delay_ms)),
        }
    }

    /// Largest non-empty image, by Last.fm's size labels.
    fn best_image(images: &[AlbumImage]) -> Option<String> {
        const ORDER: &[&str] = &["mega", "extralarge", "large", "medium", "small"];
        ORDER.iter().find_map(|size| {
            images
                .iter()
                .find(|img| img.size == *size && !img.url.is_empty())
                .map(|img| img.url.clone())
        })
    }
}

#[async_trait]
impl MetadataProvider for LastFmProvider {
    fn id(&self) -> &str {
        PROVIDER_ID
    }

    async fn throttle(&self, query: &MetadataQuery) {
        if query.title().is_some() && query.artist().is_some() {
            self.rate_limiter.lock().await.wait_if_needed().await;
        }
    }

    async fn lookup(&self, query: &MetadataQuery) -> Result<Option<ResolvedMetadata>> {
        let (Some(title), Some(artist)) = (query.title(), query.artist()) else {
            debug!("Last.fm needs both title and artist, skipping");
            return Ok(None);
        };

        let request = HttpRequest::new(HttpMethod::Get, LASTFM_API_BASE)
            .query("method", "track.getInfo")
            .query("api_key", &self.api_key)
            .query("artist", &urlencoding::encode(artist))
            .query("track", &urlencoding::encode(title))
            .query("format", "json")
            .timeout(self.request_timeout);

        let response = self.http_client.execute(request).await.map_err(|e| {
            MetadataError::NetworkError(format!("Last.fm request failed: {}", e))
        })?;

        if response.status == 429 {
            return Err(MetadataError::RateLimited {
                provider: PROVIDER_ID.to_string(),
                retry_after_seconds: retry_after(&response.headers),
            });
        }

        // Last.fm reports most errors in the JSON body, sometimes with a 4xx.
        let parsed: TrackResponse = serde_json::from_slice(&response.body).map_err(|e| {
            if response.is_success() {
                MetadataError::JsonParse(format!("Failed to parse Last.fm response: {}", e))
            } else {
                MetadataError::HttpError {
                    status: response.status,
                    body: String::from_utf8_lossy(&response.body).to_string(),
                }
            }
        })?;

        if let Some(code) = parsed.error {
            if code == ERROR_NOT_FOUND {
                debug!("Last.fm has no track '{}' by '{}'", title, artist);
                return Ok(None);
            }
            return Err(MetadataError::ProviderError(format!(
                "Last.fm error {}: {}",
                code,
                parsed.message.unwrap_or_default()
            )));
        }

        let Some(track) = parsed.track else {
            return Ok(None);
        };

        info!("Last.fm matched '{}'", track.name);
        let artwork_url = track
            .album
            .as_ref()
            .and_then(|album| Self::best_image(&album.image));
        Ok(Some(ResolvedMetadata {
            title: track.name,
            artist: track.artist.map(|a| a.name),
            album: track.album.map(|a| a.title),
            artwork_url,
        }))
    }
}
