use bridge_traits::error::TransportError;
use core_media::ConversionError;
use thiserror::Error;

/// Why an injection job failed.
///
/// Carried inside [`JobOutcome`](crate::job::JobOutcome), hence `Clone`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InjectionError {
    #[error("Conversion failed: {0}")]
    Conversion(#[from] ConversionError),

    #[error("Session lost: {0}")]
    SessionLost(String),

    #[error("Commit failed after {attempts} attempts: {message}")]
    CommitFailed { attempts: u32, message: String },

    #[error("Write rolled back after device error: {0}")]
    PartialWriteRolledBack(String),

    #[error("Device rejected the write: {0}")]
    DeviceRejected(String),

    #[error("Job cancelled")]
    Cancelled,

    #[error("Job {0} not found")]
    UnknownJob(String),

    #[error("Job {0} has not finished")]
    JobNotFinished(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl InjectionError {
    /// Short machine-readable reason.
    pub fn code(&self) -> &'static str {
        match self {
            InjectionError::Conversion(ConversionError::UnsupportedFormat(_)) => {
                "unsupported_format"
            }
            InjectionError::Conversion(ConversionError::DurationExceeded { .. }) => {
                "duration_exceeded"
            }
            InjectionError::Conversion(ConversionError::CorruptPayload(_)) => "corrupt_payload",
            InjectionError::Conversion(ConversionError::Internal(_)) => "conversion_failed",
            InjectionError::SessionLost(_) => "session_lost",
            InjectionError::CommitFailed { .. } => "commit_failed",
            InjectionError::PartialWriteRolledBack(_) => "partial_write_rolled_back",
            InjectionError::DeviceRejected(_) => "device_rejected",
            InjectionError::Cancelled => "cancelled",
            InjectionError::UnknownJob(_) => "unknown_job",
            InjectionError::JobNotFinished(_) => "job_not_finished",
            InjectionError::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, InjectionError>;

/// Playlist reconciliation failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Invalid playlist definition: {0}")]
    InvalidDefinition(String),

    #[error("Playlist {playlist} revision {revision} is older than reconciled revision {current}")]
    StaleDefinition {
        playlist: String,
        revision: u64,
        current: u64,
    },

    /// Applied partially; the listed members are not in the device library
    /// yet and are added automatically once their injection completes.
    #[error("Playlist {playlist} waits for {} member(s) not yet on the device", .fingerprints.len())]
    DependencyPending {
        playlist: String,
        fingerprints: Vec<String>,
    },

    #[error("Device rejected an operation on playlist {playlist}: {message}")]
    DeviceRejectedOperation { playlist: String, message: String },

    #[error("Device transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Playlist job failed: {0}")]
    Injection(InjectionError),
}

impl SyncError {
    pub fn is_pending(&self) -> bool {
        matches!(self, SyncError::DependencyPending { .. })
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
