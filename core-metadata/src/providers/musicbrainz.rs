//! MusicBrainz Provider
//!
//! Resolves recordings through the MusicBrainz search API and points artwork
//! at the Cover Art Archive.
//!
//! ## API Endpoints
//!
//! - **Search**: `https://musicbrainz.org/ws/2/recording/?query={query}&fmt=json&limit=1`
//! - **Cover Art**: `https://coverartarchive.org/release/{mbid}/front`
//!
//! ## Rate Limiting
//!
//! MusicBrainz allows one request per second per client. The provider spaces
//! its own requests accordingly.
//!
//! ## User Agent Requirement
//!
//! MusicBrainz requires all API clients to identify themselves with a proper User-Agent header:
//! Format: "ApplicationName/Version (ContactEmail)"
//! Example: "Tether/0.1 (ops@example.com)"

use crate::error::{MetadataError, Result};
use crate::providers::{retry_after, MetadataProvider, RateLimiter};
use crate::types::{MetadataQuery, ResolvedMetadata};
use async_trait::async_trait;
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// MusicBrainz API base URL
const MUSICBRAINZ_API_BASE: &str = "https://musicbrainz.org/ws/2";

/// Cover Art Archive base URL
const COVERART_ARCHIVE_BASE: &str = "https://coverartarchive.org";

/// Search hits scoring below this are treated as misses.
const MIN_SCORE: u32 = 80;

pub const PROVIDER_ID: &str = "musicbrainz";

pub struct MusicBrainzProvider {
    http_client: Arc<dyn HttpClient>,
    user_agent: String,
    request_timeout: Duration,
    rate_limiter: Mutex<RateLimiter>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    recordings: Vec<Recording>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Recording {
    title: String,
    #[serde(default)]
    score: Option<u32>,
    #[serde(default)]
    artist_credit: Vec<ArtistCredit>,
    #[serde(default)]
    releases: Vec<Release>,
}

#[derive(Debug, Deserialize)]
struct ArtistCredit {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Release {
    id: String,
    title: String,
}

impl MusicBrainzProvider {
    /// # Arguments
    ///
    /// * `http_client` - HTTP client for making requests
    /// * `user_agent` - User agent string (format: "AppName/Version (Contact)")
    /// * `rate_limit_delay_ms` - Minimum delay between requests in milliseconds
    /// * `request_timeout` - Transport-level timeout per request
    pub fn new(
        http_client: Arc<dyn HttpClient>,
        user_agent: String,
        rate_limit_delay_ms: u64,
        request_timeout: Duration,
    ) -> Self {
        Self {
            http_client,
            user_agent,
            request_timeout,
            rate_limiter: Mutex::new(RateLimiter::new(rate_limit_delay_ms)),
        }
    }

    fn search_url(title: &str, artist: Option<&str>) -> String {
        let mut query = format!("recording:\"{}\"", Self::escape_query(title));
        if let Some(artist) = artist {
            query.push_str(&format!(" AND artist:\"{}\"", Self::escape_query(artist)));
        }
        format!(
            "{}/recording/?query={}&fmt=json&limit=1",
            MUSICBRAINZ_API_BASE,
            urlencoding::encode(&query)
        )
    }

    /// Escapes special characters in Lucene query syntax
    fn escape_query(s: &str) -> String {
        const SPECIAL: &[char] = &[
            '\\', '"', '+', '-', '!', '(', ')', '{', '}', '[', ']', '^', '~', '*', '?', ':', '/',
        ];
        let mut escaped = String::with_capacity(s.len());
        for c in s.chars() {
            if SPECIAL.contains(&c) {
                escaped.push('\\');
            }
            escaped.push(c);
        }
        escaped
    }

    fn into_metadata(recording: Recording) -> ResolvedMetadata {
        let artist = if recording.artist_credit.is_empty() {
            None
        } else {
            Some(
                recording
                    .artist_credit
                    .iter()
                    .map(|credit| credit.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            )
        };
        let release = recording.releases.into_iter().next();

        ResolvedMetadata {
            title: recording.title,
            artist,
            artwork_url: release
                .as_ref()
                .map(|r| format!("{}/release/{}/front", COVERART_ARCHIVE_BASE, r.id)),
            album: release.map(|r| r.title),
        }
    }
}

#[async_trait]
impl MetadataProvider for MusicBrainzProvider {
    fn id(&self) -> &str {
        PROVIDER_ID
    }

    async fn throttle(&self, query: &MetadataQuery) {
        if query.title().is_some() {
            self.rate_limiter.lock().await.wait_if_needed().await;
        }
    }

    async fn lookup(&self, query: &MetadataQuery) -> Result<Option<ResolvedMetadata>> {
        let Some(title) = query.title() else {
            debug!("MusicBrainz needs a title, skipping");
            return Ok(None);
        };

        let url = Self::search_url(title, query.artist());
        debug!("Searching MusicBrainz: {}", url);

        let request = HttpRequest::new(HttpMethod::Get, url)
            .header("User-Agent", &self.user_agent)
            .header("Accept", "application/json")
            .timeout(self.request_timeout);

        let response = self.http_client.execute(request).await.map_err(|e| {
            MetadataError::NetworkError(format!("MusicBrainz search failed: {}", e))
        })?;

        match response.status {
            200..=299 => {}
            429 | 503 => {
                warn!(status = response.status, "MusicBrainz throttled the request");
                return Err(MetadataError::RateLimited {
                    provider: PROVIDER_ID.to_string(),
                    retry_after_seconds: retry_after(&response.headers),
                });
            }
            status => {
                return Err(MetadataError::HttpError {
                    status,
                    body: String::from_utf8_lossy(&response.body).to_string(),
                })
            }
        }

        let search: SearchResponse = serde_json::from_slice(&response.body).map_err(|e| {
            MetadataError::JsonParse(format!("Failed to parse MusicBrainz results: {}", e))
        })?;

        let best = search
            .recordings
            .into_iter()
            .find(|r| r.score.map_or(true, |score| score >= MIN_SCORE));

        match best {
            Some(recording) => {
                info!("MusicBrainz matched '{}'", recording.title);
                Ok(Some(Self::into_metadata(recording)))
            }
            None => {
                debug!("No MusicBrainz recording for '{}'", title);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::error::BridgeError;
    use bridge_traits::http::HttpResponse;
    use bytes::Bytes;
    use mockall::mock;
    use std::collections::HashMap;

    mock! {
        pub Http {}

        #[async_trait]
        impl HttpClient for Http {
            async fn execute(&self, request: HttpRequest) -> bridge_traits::error::Result<HttpResponse>;
        }
    }

    fn response(status: u16, body: &str) -> HttpResponse {
        HttpResponse {
            status,
            headers: HashMap::new(),
            body: Bytes::from(body.to_string()),
        }
    }

    fn provider(http: MockHttp) -> MusicBrainzProvider {
        MusicBrainzProvider::new(
            Arc::new(http),
            "Tether/0.1 (ops@example.com)".to_string(),
            0,
            Duration::from_secs(5),
        )
    }

    const HIT: &str = r#"{
        "recordings": [{
            "id": "rec-1",
            "score": 100,
            "title": "Hey Jude",
            "artist-credit": [{"name": "The Beatles"}],
            "releases": [{"id": "rel-9", "title": "Hey Jude"}]
        }]
    }"#;

    #[test]
    fn test_escape_query() {
        assert_eq!(MusicBrainzProvider::escape_query("AC/DC"), "AC\\/DC");
        assert_eq!(
            MusicBrainzProvider::escape_query("Song (Live): Take 2"),
            "Song \\(Live\\)\\: Take 2"
        );
    }

    #[tokio::test]
    async fn test_lookup_parses_recording_and_artwork() {
        let mut http = MockHttp::new();
        http.expect_execute()
            .withf(|req| {
                req.url.contains("/ws/2/recording/")
                    && req.url.contains("fmt=json")
                    && req.headers.get("User-Agent").map(String::as_str)
                        == Some("Tether/0.1 (ops@example.com)")
            })
            .times(1)
            .returning(|_| Ok(response(200, HIT)));

        let query = MetadataQuery::new("fp").with_title("Hey Jude").with_artist("The Beatles");
        let metadata = provider(http).lookup(&query).await.unwrap().unwrap();

        assert_eq!(metadata.title, "Hey Jude");
        assert_eq!(metadata.artist.as_deref(), Some("The Beatles"));
        assert_eq!(metadata.album.as_deref(), Some("Hey Jude"));
        assert_eq!(
            metadata.artwork_url.as_deref(),
            Some("https://coverartarchive.org/release/rel-9/front")
        );
    }

    #[tokio::test]
    async fn test_low_score_is_a_miss() {
        let mut http = MockHttp::new();
        http.expect_execute().returning(|_| {
            Ok(response(
                200,
                r#"{"recordings":[{"title":"Hey Dude","score":42}]}"#,
            ))
        });

        let query = MetadataQuery::new("fp").with_title("Hey Jude");
        assert!(provider(http).lookup(&query).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_query_without_title_skips_network() {
        let mut http = MockHttp::new();
        http.expect_execute().never();

        let query = MetadataQuery::new("fp").with_artist("Someone");
        assert!(provider(http).lookup(&query).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_service_unavailable_is_rate_limited() {
        let mut http = MockHttp::new();
        http.expect_execute().returning(|_| Ok(response(503, "")));

        let query = MetadataQuery::new("fp").with_title("Hey Jude");
        let err = provider(http).lookup(&query).await.unwrap_err();

        assert!(matches!(err, MetadataError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_transport_failure_is_network_error() {
        let mut http = MockHttp::new();
        http.expect_execute()
            .returning(|_| Err(BridgeError::OperationFailed("connection reset".into())));

        let query = MetadataQuery::new("fp").with_title("Hey Jude");
        let err = provider(http).lookup(&query).await.unwrap_err();

        assert!(matches!(err, MetadataError::NetworkError(_)));
    }
}
