//! # Host Bridge Traits
//!
//! Platform abstraction traits that must be implemented by each host platform.
//!
//! ## Overview
//!
//! This crate defines the contract between the pairing/injection core and the
//! services it does not own. Each trait represents a capability that the core
//! requires but that is implemented outside of it.
//!
//! ## Traits
//!
//! ### Device
//! - [`DeviceTransport`](device::DeviceTransport) - Session, file-transfer and
//!   media database primitives exposed by the device transport service
//!
//! ### Networking
//! - [`HttpClient`](http::HttpClient) - Async HTTP operations used by metadata providers
//!
//! ### Security & Storage
//! - [`SecureStore`](storage::SecureStore) - Pairing credential persistence
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Fail-Fast Strategy
//!
//! The core fails fast with descriptive errors when a required capability is missing:
//!
//! ```ignore
//! use core_runtime::error::Error;
//!
//! let transport = config.device_transport
//!     .ok_or_else(|| Error::CapabilityMissing {
//!         capability: "DeviceTransport".to_string(),
//!         message: "No device transport provided. \
//!                  Inject the host's transport service adapter.".to_string()
//!     })?;
//! ```
//!
//! ## Error Handling
//!
//! Host services report failures through [`BridgeError`](error::BridgeError).
//! The device transport uses [`TransportError`](error::TransportError), which
//! additionally classifies faults as transient or session-fatal.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` bounds to support safe concurrent usage
//! across async tasks. Implementations must ensure thread safety.
//!
//! ## Testing
//!
//! The `test-support` feature exposes [`testing::MemoryDevice`], an in-memory
//! device with fault injection used by the core crates' integration tests.

pub mod device;
pub mod error;
pub mod http;
pub mod storage;
pub mod time;

#[cfg(feature = "test-support")]
pub mod testing;

pub use error::{BridgeError, TransportError};

// Re-export commonly used types
pub use device::{
    Ack, DeviceCapabilities, DevicePlaylist, DeviceTransport, MediaKind, MediaRecord,
    PairingMaterial, PlaylistOperation, RecordMetadata, SessionHandle, TransactionHandle,
};
pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
pub use storage::SecureStore;
pub use time::{Clock, LogEntry, LogLevel, LoggerSink, SystemClock};
