//! # Core Configuration Module
//!
//! Provides configuration management for the pairing and injection core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a `CoreConfig`
//! instance that holds all bridge dependencies and policy values. It enforces
//! fail-fast validation so a misconfigured engine never starts.
//!
//! ## Required Dependencies
//!
//! - `DeviceTransport` - Wraps the external device protocol library
//! - `SecureStore` - Pairing credential persistence
//!
//! ## Optional Dependencies
//!
//! - `HttpClient` - Metadata provider calls. Without one, metadata resolution
//!   always yields "not found" and jobs fall back to filename-derived titles.
//! - `Clock` - Defaults to the system clock
//!
//! When the `desktop-shims` feature is enabled, desktop defaults for
//! `SecureStore` and `HttpClient` are injected automatically if not provided.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::{CoreConfig, MetadataApiConfig};
//! use std::sync::Arc;
//!
//! let config = CoreConfig::builder()
//!     .device_transport(Arc::new(MyTransport::new()))
//!     .secure_store(Arc::new(MySecureStore))
//!     .heartbeat_interval(Duration::from_secs(5))
//!     .metadata_api_config(
//!         MetadataApiConfig::new().with_musicbrainz_user_agent("Tether/0.1 (ops@example.com)"),
//!     )
//!     .build()?;
//! ```

use crate::backoff::BackoffPolicy;
use crate::error::{Error, Result};
use crate::logging::LoggingConfig;
use bridge_traits::{Clock, DeviceTransport, HttpClient, SecureStore, SystemClock};
use std::sync::Arc;
use std::time::Duration;

/// Session supervision policy.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Interval between heartbeat probes.
    pub heartbeat_interval: Duration,
    /// Consecutive missed probes before the session is closed.
    pub miss_threshold: u32,
    /// Upper bound on `open_session` at the transport.
    pub open_timeout: Duration,
    /// A probe not acknowledged within this bound counts as a miss.
    pub probe_timeout: Duration,
    /// Backoff between automatic reconnect attempts.
    pub reconnect_backoff: BackoffPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            miss_threshold: 3,
            open_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(3),
            reconnect_backoff: BackoffPolicy::new(
                Duration::from_secs(1),
                Duration::from_secs(60),
                0.2,
            ),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(Error::Config(
                "Heartbeat interval must be greater than 0".to_string(),
            ));
        }
        if self.miss_threshold == 0 {
            return Err(Error::Config(
                "Heartbeat miss threshold must be at least 1".to_string(),
            ));
        }
        if self.open_timeout.is_zero() || self.probe_timeout.is_zero() {
            return Err(Error::Config(
                "Session open and probe timeouts must be greater than 0".to_string(),
            ));
        }
        if self.probe_timeout > self.heartbeat_interval {
            return Err(Error::Config(format!(
                "Probe timeout ({:?}) must not exceed the heartbeat interval ({:?}); \
                 probes would overlap",
                self.probe_timeout, self.heartbeat_interval
            )));
        }
        self.reconnect_backoff.validate("Reconnect backoff")
    }
}

/// Injection pipeline policy.
#[derive(Debug, Clone, PartialEq)]
pub struct InjectionConfig {
    /// Jobs converting or resolving metadata concurrently.
    pub max_workers: usize,
    /// Commit attempts per job before giving up on transient faults.
    pub commit_attempts: u32,
    /// Backoff between commit attempts.
    pub commit_backoff: BackoffPolicy,
    /// Longest ringtone the device accepts.
    pub ringtone_max_duration: Duration,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            commit_attempts: 3,
            commit_backoff: BackoffPolicy::new(
                Duration::from_millis(200),
                Duration::from_secs(5),
                0.1,
            ),
            ringtone_max_duration: Duration::from_secs(40),
        }
    }
}

impl InjectionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::Config(
                "Injection worker count must be at least 1".to_string(),
            ));
        }
        if self.max_workers > 64 {
            return Err(Error::Config(
                "Injection worker count exceeds maximum of 64".to_string(),
            ));
        }
        if self.commit_attempts == 0 {
            return Err(Error::Config(
                "Commit attempts must be at least 1".to_string(),
            ));
        }
        if self.ringtone_max_duration.is_zero() {
            return Err(Error::Config(
                "Ringtone maximum duration must be greater than 0".to_string(),
            ));
        }
        self.commit_backoff.validate("Commit backoff")
    }
}

/// Configuration for external metadata API services.
///
/// # Security Note
///
/// API keys should never be hardcoded in the binary. Load them from the
/// environment or the host's secure configuration system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataApiConfig {
    /// MusicBrainz user agent string (format: "AppName/Version (Contact)")
    ///
    /// MusicBrainz rejects anonymous clients; when unset the provider is skipped.
    pub musicbrainz_user_agent: Option<String>,

    /// Last.fm API key. When unset the secondary provider is skipped.
    pub lastfm_api_key: Option<String>,

    /// Per-provider call timeout.
    pub provider_timeout_ms: u64,

    /// Minimum spacing between requests to the same provider.
    pub rate_limit_delay_ms: u64,

    /// How long resolved and "not found" results stay cached.
    pub cache_ttl_secs: u64,

    /// Maximum number of cached query results.
    pub cache_capacity: usize,
}

impl Default for MetadataApiConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataApiConfig {
    pub fn new() -> Self {
        Self {
            musicbrainz_user_agent: None,
            lastfm_api_key: None,
            provider_timeout_ms: 5_000,
            rate_limit_delay_ms: 1_000,
            cache_ttl_secs: 24 * 60 * 60,
            cache_capacity: 512,
        }
    }

    pub fn with_musicbrainz_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.musicbrainz_user_agent = Some(user_agent.into());
        self
    }

    pub fn with_lastfm_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.lastfm_api_key = Some(api_key.into());
        self
    }

    pub fn with_provider_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.provider_timeout_ms = timeout_ms;
        self
    }

    pub fn with_rate_limit_delay_ms(mut self, delay_ms: u64) -> Self {
        self.rate_limit_delay_ms = delay_ms;
        self
    }

    pub fn with_cache_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.cache_ttl_secs = ttl_secs;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(ref ua) = self.musicbrainz_user_agent {
            if ua.trim().is_empty() {
                return Err(Error::Config(
                    "MusicBrainz user agent cannot be empty".to_string(),
                ));
            }
            if !ua.contains('/') || !ua.contains('(') || !ua.contains(')') {
                return Err(Error::Config(
                    "MusicBrainz user agent must follow format: 'AppName/Version (Contact)'"
                        .to_string(),
                ));
            }
        }

        if let Some(ref key) = self.lastfm_api_key {
            if key.trim().is_empty() {
                return Err(Error::Config("Last.fm API key cannot be empty".to_string()));
            }
        }

        if self.provider_timeout_ms == 0 {
            return Err(Error::Config(
                "Metadata provider timeout must be greater than 0ms".to_string(),
            ));
        }

        if self.rate_limit_delay_ms > 60_000 {
            return Err(Error::Config(
                "Rate limit delay exceeds maximum of 60 seconds (60,000ms)".to_string(),
            ));
        }

        if self.cache_capacity == 0 {
            return Err(Error::Config(
                "Metadata cache capacity must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn has_musicbrainz(&self) -> bool {
        self.musicbrainz_user_agent.is_some()
    }

    pub fn has_lastfm(&self) -> bool {
        self.lastfm_api_key.is_some()
    }
}

/// Core configuration for the pairing and injection engine.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// Device transport service (required)
    pub device_transport: Arc<dyn DeviceTransport>,

    /// Pairing credential storage (required)
    pub secure_store: Arc<dyn SecureStore>,

    /// HTTP client for metadata providers (optional)
    pub http_client: Option<Arc<dyn HttpClient>>,

    /// Time source
    pub clock: Arc<dyn Clock>,

    pub session: SessionConfig,

    pub injection: InjectionConfig,

    /// External metadata API configuration (MusicBrainz, Last.fm)
    pub metadata_api_config: MetadataApiConfig,

    /// Per-subscriber buffer of the event bus
    pub event_buffer_size: usize,

    /// Subscriber installed by `CoreService::new`; `None` leaves tracing to the host.
    pub logging: Option<LoggingConfig>,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("device_transport", &"DeviceTransport { ... }")
            .field("secure_store", &"SecureStore { ... }")
            .field(
                "http_client",
                &self.http_client.as_ref().map(|_| "HttpClient { ... }"),
            )
            .field("session", &self.session)
            .field("injection", &self.injection)
            .field("metadata_api_config", &self.metadata_api_config)
            .field("event_buffer_size", &self.event_buffer_size)
            .field("logging", &self.logging)
            .finish()
    }
}

impl CoreConfig {
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Validates every policy section.
    pub fn validate(&self) -> Result<()> {
        self.session.validate()?;
        self.injection.validate()?;
        self.metadata_api_config.validate()?;
        if let Some(logging) = &self.logging {
            logging.validate()?;
        }

        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

fn device_transport_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "DeviceTransport".to_string(),
        message: "A DeviceTransport implementation is required to talk to the device. \
                 Inject the adapter around the host's device protocol library; \
                 there is no portable default."
            .to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_secure_store() -> Result<Arc<dyn SecureStore>> {
    use bridge_desktop::FileSecureStore;

    let store = FileSecureStore::in_default_location()
        .map_err(|e| Error::Internal(format!("Failed to locate credential directory: {}", e)))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_secure_store() -> Result<Arc<dyn SecureStore>> {
    Err(Error::CapabilityMissing {
        capability: "SecureStore".to_string(),
        message: "SecureStore implementation is required for pairing credential persistence. \
                 Desktop: enable the 'desktop-shims' feature to use the default FileSecureStore. \
                 Mobile: inject platform-native secure storage (Keychain/Keystore)."
            .to_string(),
    })
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client() -> Option<Arc<dyn HttpClient>> {
    use bridge_desktop::ReqwestHttpClient;

    match ReqwestHttpClient::new() {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            tracing::warn!(error = %e, "Default HTTP client unavailable; metadata lookups disabled");
            None
        }
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client() -> Option<Arc<dyn HttpClient>> {
    None
}

/// Builder for constructing [`CoreConfig`] instances.
#[derive(Default)]
pub struct CoreConfigBuilder {
    device_transport: Option<Arc<dyn DeviceTransport>>,
    secure_store: Option<Arc<dyn SecureStore>>,
    http_client: Option<Arc<dyn HttpClient>>,
    clock: Option<Arc<dyn Clock>>,
    session: Option<SessionConfig>,
    injection: Option<InjectionConfig>,
    metadata_api_config: Option<MetadataApiConfig>,
    event_buffer_size: Option<usize>,
    logging: Option<LoggingConfig>,
}

impl CoreConfigBuilder {
    /// Sets the device transport implementation (required).
    pub fn device_transport(mut self, transport: Arc<dyn DeviceTransport>) -> Self {
        self.device_transport = Some(transport);
        self
    }

    /// Sets the secure store implementation (required unless `desktop-shims`).
    ///
    /// The store must replace values atomically; the pairing credential is
    /// overwritten on every re-import.
    pub fn secure_store(mut self, store: Arc<dyn SecureStore>) -> Self {
        self.secure_store = Some(store);
        self
    }

    /// Sets the HTTP client used by metadata providers.
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session = Some(config);
        self
    }

    /// Shorthand for overriding only the heartbeat interval.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.session.get_or_insert_with(SessionConfig::default).heartbeat_interval = interval;
        self
    }

    /// Shorthand for overriding only the heartbeat miss threshold.
    pub fn miss_threshold(mut self, threshold: u32) -> Self {
        self.session.get_or_insert_with(SessionConfig::default).miss_threshold = threshold;
        self
    }

    pub fn injection_config(mut self, config: InjectionConfig) -> Self {
        self.injection = Some(config);
        self
    }

    /// Shorthand for overriding only the ringtone duration limit.
    pub fn ringtone_max_duration(mut self, duration: Duration) -> Self {
        self.injection
            .get_or_insert_with(InjectionConfig::default)
            .ringtone_max_duration = duration;
        self
    }

    /// Sets the metadata API configuration (MusicBrainz user agent, Last.fm key,
    /// timeouts and cache policy).
    pub fn metadata_api_config(mut self, config: MetadataApiConfig) -> Self {
        self.metadata_api_config = Some(config);
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Has `CoreService::new` install the global tracing subscriber.
    pub fn logging(mut self, config: LoggingConfig) -> Self {
        self.logging = Some(config);
        self
    }

    /// Builds the final `CoreConfig` instance.
    ///
    /// # Errors
    ///
    /// - `CapabilityMissing` when a required bridge is absent and has no default
    /// - `Config` when a policy value is invalid
    pub fn build(self) -> Result<CoreConfig> {
        let device_transport = self
            .device_transport
            .ok_or_else(device_transport_missing_error)?;

        let secure_store = match self.secure_store {
            Some(store) => store,
            None => provide_default_secure_store()?,
        };

        let http_client = self.http_client.or_else(provide_default_http_client);

        let config = CoreConfig {
            device_transport,
            secure_store,
            http_client,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            session: self.session.unwrap_or_default(),
            injection: self.injection.unwrap_or_default(),
            metadata_api_config: self.metadata_api_config.unwrap_or_default(),
            event_buffer_size: self
                .event_buffer_size
                .unwrap_or(crate::events::DEFAULT_EVENT_BUFFER_SIZE),
            logging: self.logging,
        };

        config.validate()?;

        Ok(config)
    }
}
