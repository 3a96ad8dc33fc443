use crate::types::SessionState;
use bridge_traits::error::BridgeError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PairingError {
    #[error("Malformed pairing credential: {0}")]
    MalformedCredential(String),

    #[error("Device unreachable: {0}")]
    DeviceUnreachable(String),

    #[error("Device rejected the pairing credential: {0}")]
    TrustRejected(String),

    #[error("No pairing credential has been imported")]
    NoCredential,

    #[error("Credential storage failed: {0}")]
    StorageError(String),

    #[error("Invalid session state transition from {from} to {to}")]
    InvalidStateTransition { from: SessionState, to: SessionState },
}

impl PairingError {
    /// Errors that a later retry cannot fix without user action.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            PairingError::TrustRejected(_)
                | PairingError::NoCredential
                | PairingError::MalformedCredential(_)
        )
    }
}

impl From<BridgeError> for PairingError {
    fn from(err: BridgeError) -> Self {
        PairingError::StorageError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PairingError>;
