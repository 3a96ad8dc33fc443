//! # Pairing Module
//!
//! Trusted device pairing and session supervision.
//!
//! ## Overview
//!
//! This crate owns the pairing credential and the single device session:
//!
//! - [`PairingCredential`] parses and validates imported trust material
//! - [`CredentialStore`] persists it through the host `SecureStore`
//! - [`PairingSessionManager`] opens sessions and drives the state machine
//! - [`HeartbeatMonitor`] probes the session and reconnects with backoff
//!
//! Session state is observable through [`PairingSessionManager::subscribe`]
//! and as `SessionEvent`s on the core event bus.

pub mod credential;
pub mod credential_store;
pub mod error;
pub mod heartbeat;
pub mod manager;
pub mod types;

pub use credential::PairingCredential;
pub use credential_store::CredentialStore;
pub use error::{PairingError, Result};
pub use heartbeat::HeartbeatMonitor;
pub use manager::PairingSessionManager;
pub use types::{DeviceSession, ProbeVerdict, SessionSnapshot, SessionState};
