use thiserror::Error;

/// Failure of a single provider lookup.
///
/// These never escape [`MetadataResolver::resolve`](crate::MetadataResolver::resolve);
/// a failing provider only makes the resolver fall through to the next one.
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    #[error("Rate limited by {provider}, retry after {retry_after_seconds}s")]
    RateLimited {
        provider: String,
        retry_after_seconds: u64,
    },

    #[error("Failed to parse provider response: {0}")]
    JsonParse(String),

    #[error("Provider {provider} did not answer within {timeout_ms} ms")]
    Timeout { provider: String, timeout_ms: u64 },

    #[error("Provider rejected the request: {0}")]
    ProviderError(String),

    #[error("Bridge error: {0}")]
    Bridge(#[from] bridge_traits::error::BridgeError),
}

pub type Result<T> = std::result::Result<T, MetadataError>;
