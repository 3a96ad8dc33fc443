use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Ringtone is {actual:?} long; the device accepts at most {max:?}")]
    DurationExceeded { actual: Duration, max: Duration },

    #[error("Corrupt audio payload: {0}")]
    CorruptPayload(String),

    #[error("Conversion task failed: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ConversionError>;
