use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Core initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Configuration error: {0}")]
    Config(#[from] core_runtime::error::Error),

    #[error("Pairing error: {0}")]
    Pairing(#[from] core_pairing::PairingError),

    #[error("Injection error: {0}")]
    Injection(#[from] core_injection::InjectionError),

    #[error("Playlist error: {0}")]
    Sync(#[from] core_injection::SyncError),
}

pub type Result<T> = std::result::Result<T, CoreError>;
