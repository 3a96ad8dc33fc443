//! External Metadata Providers
//!
//! This module contains clients for external metadata services:
//! - MusicBrainz - Music metadata database and Cover Art Archive
//! - Last.fm - Music streaming and metadata service
//!
//! Each provider implements rate limiting and error handling to comply
//! with API terms of service.

pub mod lastfm;
pub mod musicbrainz;

pub use lastfm::LastFmProvider;
pub use musicbrainz::MusicBrainzProvider;

use crate::error::Result;
use crate::types::{MetadataQuery, ResolvedMetadata};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// A catalog that can answer metadata queries.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Stable identifier recorded as result provenance.
    fn id(&self) -> &str;

    /// Look up `query`.
    ///
    /// `Ok(None)` means the catalog has no match. Errors are reserved for
    /// transport and protocol failures.
    async fn lookup(&self, query: &MetadataQuery) -> Result<Option<ResolvedMetadata>>;

    /// Wait until the provider may send a request for `query`.
    ///
    /// The resolver calls this before `lookup` and outside the lookup timeout,
    /// so local request pacing never counts against the provider.
    async fn throttle(&self, _query: &MetadataQuery) {}
}

/// Enforces a minimum delay between requests to one provider.
pub(crate) struct RateLimiter {
    last_request: Option<Instant>,
    min_delay: Duration,
}

impl RateLimiter {
    pub(crate) fn new(delay_ms: u64) -> Self {
        Self {
            last_request: None,
            min_delay: Duration::from_millis(delay_ms),
        }
    }

    pub(crate) async fn wait_if_needed(&mut self) {
        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.min_delay {
                let wait_time = self.min_delay - elapsed;
                debug!("Rate limiting: waiting {:?}", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }
        self.last_request = Some(Instant::now());
    }
}

/// Parse `Retry-After` seconds, defaulting to one minute.
pub(crate) fn retry_after(headers: &std::collections::HashMap<String, String>) -> u64 {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("retry-after"))
        .and_then(|(_, value)| value.trim().parse::<u64>().ok())
        .unwrap_or(60)
}
