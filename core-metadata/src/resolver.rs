//! Metadata resolution with provider fallback

use crate::cache::MetadataCache;
use crate::providers::{LastFmProvider, MetadataProvider, MusicBrainzProvider};
use crate::types::{MetadataQuery, MetadataQueryResult};
use bridge_traits::http::HttpClient;
use bridge_traits::time::Clock;
use core_runtime::config::MetadataApiConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Resolves display metadata by asking providers in priority order.
///
/// Resolution never fails. A provider that errors or exceeds its timeout is
/// skipped, and when nobody has a match the result is "not found". Hits and
/// clean misses are cached; a miss caused by a provider failure is not, so
/// the query is retried on the next call.
pub struct MetadataResolver {
    providers: Vec<Arc<dyn MetadataProvider>>,
    cache: MetadataCache,
    provider_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl MetadataResolver {
    pub fn new(
        providers: Vec<Arc<dyn MetadataProvider>>,
        config: &MetadataApiConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            providers,
            cache: MetadataCache::new(
                config.cache_capacity,
                Duration::from_secs(config.cache_ttl_secs),
                Arc::clone(&clock),
            ),
            provider_timeout: Duration::from_millis(config.provider_timeout_ms),
            clock,
        }
    }

    /// Build the standard provider chain: MusicBrainz first, then Last.fm.
    ///
    /// Providers lacking credentials, or all of them when there is no HTTP
    /// client, are left out. An empty chain resolves everything to "not found".
    pub fn from_config(
        http_client: Option<Arc<dyn HttpClient>>,
        config: &MetadataApiConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut providers: Vec<Arc<dyn MetadataProvider>> = Vec::new();
        let request_timeout = Duration::from_millis(config.provider_timeout_ms);

        match http_client {
            Some(http) => {
                if let Some(user_agent) = &config.musicbrainz_user_agent {
                    providers.push(Arc::new(MusicBrainzProvider::new(
                        Arc::clone(&http),
                        user_agent.clone(),
                        config.rate_limit_delay_ms,
                        request_timeout,
                    )));
                }
                if let Some(api_key) = &config.lastfm_api_key {
                    providers.push(Arc::new(LastFmProvider::new(
                        http,
                        api_key.clone(),
                        config.rate_limit_delay_ms,
                        request_timeout,
                    )));
                }
            }
            None => warn!("No HTTP client available, metadata resolution disabled"),
        }

        info!(
            providers = providers.len(),
            "Metadata resolver configured"
        );
        Self::new(providers, config, clock)
    }

    pub fn provider_ids(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.id()).collect()
    }

    #[instrument(skip(self, query), fields(key = %query.cache_key()))]
    pub async fn resolve(&self, query: &MetadataQuery) -> MetadataQueryResult {
        let key = query.cache_key();
        if let Some(cached) = self.cache.get(&key).await {
            debug!(found = cached.is_found(), "Metadata cache hit");
            return cached;
        }

        let mut clean_miss = true;
        for provider in &self.providers {
            provider.throttle(query).await;
            match tokio::time::timeout(self.provider_timeout, provider.lookup(query)).await {
                Ok(Ok(Some(metadata))) => {
                    info!(provider = provider.id(), title = %metadata.title, "Metadata resolved");
                    let result = MetadataQueryResult {
                        key,
                        metadata: Some(metadata),
                        provider: Some(provider.id().to_string()),
                        fetched_at: self.clock.now(),
                    };
                    self.cache.insert(result.clone()).await;
                    return result;
                }
                Ok(Ok(None)) => {
                    debug!(provider = provider.id(), "Provider has no match");
                }
                Ok(Err(e)) => {
                    clean_miss = false;
                    warn!(provider = provider.id(), error = %e, "Provider failed, trying next");
                }
                Err(_) => {
                    clean_miss = false;
                    warn!(
                        provider = provider.id(),
                        timeout_ms = self.provider_timeout.as_millis() as u64,
                        "Provider timed out, trying next"
                    );
                }
            }
        }

        let result = MetadataQueryResult::not_found(key, self.clock.now());
        if clean_miss {
            self.cache.insert(result.clone()).await;
        }
        debug!(cached = clean_miss, "No provider had metadata");
        result
    }

    /// Drop the cached result for `query`, if any.
    pub async fn invalidate(&self, query: &MetadataQuery) -> bool {
        self.cache.invalidate(&query.cache_key()).await
    }

    pub async fn clear(&self) {
        self.cache.clear().await;
    }

    pub async fn cached_entries(&self) -> usize {
        self.cache.len().await
    }
}
