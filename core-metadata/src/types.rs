//! Query and result types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What is known about an item before resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetadataQuery {
    pub title: Option<String>,
    pub artist: Option<String>,
    /// Content fingerprint of the normalized payload.
    pub fingerprint: String,
}

impl MetadataQuery {
    pub fn new(fingerprint: impl Into<String>) -> Self {
        Self {
            title: None,
            artist: None,
            fingerprint: fingerprint.into(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_artist(mut self, artist: impl Into<String>) -> Self {
        self.artist = Some(artist.into());
        self
    }

    /// Trimmed, non-empty title.
    pub fn title(&self) -> Option<&str> {
        non_blank(self.title.as_deref())
    }

    /// Trimmed, non-empty artist.
    pub fn artist(&self) -> Option<&str> {
        non_blank(self.artist.as_deref())
    }

    /// Normalized cache key.
    ///
    /// Text queries are keyed by `title|artist` in lowercase (a `|` inside
    /// either part is escaped), so the same
    /// song submitted twice under different fingerprints resolves once.
    /// Queries without text fall back to the fingerprint.
    pub fn cache_key(&self) -> String {
        match (self.title(), self.artist()) {
            (None, None) => format!("fp:{}", self.fingerprint),
            (title, artist) => format!(
                "{}|{}",
                key_part(title.unwrap_or_default()),
                key_part(artist.unwrap_or_default())
            ),
        }
    }
}

/// Lowercase with the `|` separator escaped, so parts cannot run together.
fn key_part(value: &str) -> String {
    value
        .to_lowercase()
        .replace('\\', "\\\\")
        .replace('|', "\\|")
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Metadata returned by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedMetadata {
    pub title: String,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub artwork_url: Option<String>,
}

/// Outcome of a resolution, as cached.
///
/// `metadata` is `None` when every provider missed; that is a normal result,
/// not a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataQueryResult {
    pub key: String,
    pub metadata: Option<ResolvedMetadata>,
    /// Id of the provider that answered.
    pub provider: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl MetadataQueryResult {
    pub fn not_found(key: String, fetched_at: DateTime<Utc>) -> Self {
        Self {
            key,
            metadata: None,
            provider: None,
            fetched_at,
        }
    }

    pub fn is_found(&self) -> bool {
        self.metadata.is_some()
    }
}
