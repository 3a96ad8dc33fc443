use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge capability not available: {0}")]
    NotAvailable(String),

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Failure reported by the device transport service.
///
/// The transport owns the wire protocol; the core only needs to know whether a
/// failure is worth retrying and whether the session survived it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Device unreachable: {0}")]
    Unreachable(String),

    #[error("Device rejected the pairing credential: {0}")]
    TrustRejected(String),

    #[error("Session closed by device")]
    SessionClosed,

    #[error("Device did not answer in time")]
    Timeout,

    #[error("Device busy: {0}")]
    Busy(String),

    #[error("Device rejected operation: {0}")]
    Rejected(String),

    #[error("Unknown transaction: {0}")]
    UnknownTransaction(String),
}

impl TransportError {
    /// Faults that may clear up on their own and are worth retrying locally.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Unreachable(_) | TransportError::Timeout | TransportError::Busy(_)
        )
    }

    /// Faults after which the session can no longer be used.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::TrustRejected(_) | TransportError::SessionClosed
        )
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_classification() {
        assert!(TransportError::Timeout.is_transient());
        assert!(TransportError::Busy("writer active".into()).is_transient());
        assert!(TransportError::Unreachable("usbmux gone".into()).is_transient());

        assert!(!TransportError::SessionClosed.is_transient());
        assert!(TransportError::SessionClosed.is_session_fatal());
        assert!(TransportError::TrustRejected("revoked".into()).is_session_fatal());

        let rejected = TransportError::Rejected("bad record".into());
        assert!(!rejected.is_transient());
        assert!(!rejected.is_session_fatal());
    }
}
