//! # Event Bus System
//!
//! Provides an event-driven architecture for the pairing and injection core using
//! `tokio::sync::broadcast`. Modules publish typed events; the UI layer and other
//! modules subscribe independently.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐   emit    ┌───────────┐
//! │ Pairing/Session ├──────────>│           │
//! └─────────────────┘           │           │   subscribe   ┌────────────┐
//! ┌─────────────────┐   emit    │ EventBus  ├──────────────>│ UI layer   │
//! │ Injection jobs  ├──────────>│ (broadcast│               └────────────┘
//! └─────────────────┘           │  channel) │   subscribe   ┌────────────┐
//! ┌─────────────────┐   emit    │           ├──────────────>│ Playlist   │
//! │ Playlist sync   ├──────────>│           │               │ sync       │
//! └─────────────────┘           └───────────┘               └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, SessionEvent};
//!
//! let event_bus = EventBus::new(100);
//! let mut subscriber = event_bus.subscribe();
//!
//! event_bus
//!     .emit(CoreEvent::Session(SessionEvent::CredentialImported {
//!         device_id: "00008030-001A".to_string(),
//!     }))
//!     .ok();
//!
//! assert!(subscriber.try_recv().is_ok());
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: Subscriber was too slow and missed `n` events.
//!   This is non-fatal; the subscriber can continue receiving new events.
//! - **`RecvError::Closed`**: All senders have been dropped. This indicates shutdown.
//!
//! Emitting with no subscribers returns an error; publishers ignore it with `.ok()`.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

// Re-export commonly used types
pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
///
/// This value balances memory usage with the ability to handle bursts of events.
/// Subscribers that can't keep up will receive `RecvError::Lagged`.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum encompassing all event categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Pairing and session supervision events
    Session(SessionEvent),
    /// Injection job lifecycle events
    Injection(InjectionEvent),
    /// Playlist reconciliation events
    Playlist(PlaylistEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Session(e) => e.description(),
            CoreEvent::Injection(e) => e.description(),
            CoreEvent::Playlist(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Session(SessionEvent::TrustRejected { .. }) => EventSeverity::Error,
            CoreEvent::Injection(InjectionEvent::JobFailed {
                unsafe_state: true, ..
            }) => EventSeverity::Error,
            CoreEvent::Injection(InjectionEvent::JobFailed { .. }) => EventSeverity::Warning,
            CoreEvent::Session(SessionEvent::HeartbeatMissed { .. }) => EventSeverity::Warning,
            CoreEvent::Playlist(PlaylistEvent::ReconcileFailed { .. }) => EventSeverity::Warning,
            CoreEvent::Session(SessionEvent::StateChanged { .. }) => EventSeverity::Info,
            CoreEvent::Injection(InjectionEvent::JobCompleted { .. }) => EventSeverity::Info,
            CoreEvent::Playlist(PlaylistEvent::Reconciled { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Session Events
// ============================================================================

/// Pairing credential and session state events.
///
/// States are carried as their display strings (`"active"`, `"degraded"`, ...)
/// so this crate does not depend on the pairing crate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SessionEvent {
    CredentialImported {
        device_id: String,
    },
    CredentialForgotten {
        device_id: String,
    },
    StateChanged {
        device_id: Option<String>,
        from: String,
        to: String,
        status: String,
    },
    HeartbeatMissed {
        device_id: String,
        consecutive_misses: u32,
        threshold: u32,
    },
    ReconnectScheduled {
        device_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    TrustRejected {
        device_id: String,
        message: String,
    },
}

impl SessionEvent {
    fn description(&self) -> &str {
        match self {
            SessionEvent::CredentialImported { .. } => "Pairing credential imported",
            SessionEvent::CredentialForgotten { .. } => "Pairing credential removed",
            SessionEvent::StateChanged { .. } => "Session state changed",
            SessionEvent::HeartbeatMissed { .. } => "Heartbeat missed",
            SessionEvent::ReconnectScheduled { .. } => "Reconnect scheduled",
            SessionEvent::TrustRejected { .. } => "Device rejected pairing trust",
        }
    }
}

// ============================================================================
// Injection Events
// ============================================================================

/// Injection job lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum InjectionEvent {
    JobQueued {
        job_id: String,
        kind: String,
    },
    JobStatusChanged {
        job_id: String,
        status: String,
        message: String,
    },
    /// Terminal success. `fingerprint` is `None` for playlist operations.
    JobCompleted {
        job_id: String,
        fingerprint: Option<String>,
        duplicate: bool,
        message: String,
    },
    JobFailed {
        job_id: String,
        message: String,
        unsafe_state: bool,
    },
}

impl InjectionEvent {
    fn description(&self) -> &str {
        match self {
            InjectionEvent::JobQueued { .. } => "Injection job queued",
            InjectionEvent::JobStatusChanged { .. } => "Injection job progressed",
            InjectionEvent::JobCompleted { duplicate: true, .. } => {
                "Injection skipped, item already present"
            }
            InjectionEvent::JobCompleted { .. } => "Injection job completed",
            InjectionEvent::JobFailed { .. } => "Injection job failed",
        }
    }
}

// ============================================================================
// Playlist Events
// ============================================================================

/// Playlist reconciliation events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum PlaylistEvent {
    ReconcileStarted {
        playlist: String,
        revision: u64,
    },
    Reconciled {
        playlist: String,
        revision: u64,
        operations: u32,
        deferred: u32,
    },
    MembersDeferred {
        playlist: String,
        fingerprints: Vec<String>,
    },
    ReconcileFailed {
        playlist: String,
        message: String,
    },
}

impl PlaylistEvent {
    fn description(&self) -> &str {
        match self {
            PlaylistEvent::ReconcileStarted { .. } => "Playlist reconciliation started",
            PlaylistEvent::Reconciled { .. } => "Playlist reconciled",
            PlaylistEvent::MembersDeferred { .. } => "Playlist members deferred",
            PlaylistEvent::ReconcileFailed { .. } => "Playlist reconciliation failed",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to events.
///
/// Clone the bus to get another producer; every `subscribe()` creates an
/// independent receiver that sees all events emitted after it was created.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an error
    /// if there are none.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Subscribe and wrap the receiver in an [`EventStream`].
    pub fn stream(&self) -> EventStream {
        EventStream::new(self.subscribe())
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with optional filtering.
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus};
///
/// let event_bus = EventBus::new(100);
/// let injection_only = event_bus
///     .stream()
///     .filter(|event| matches!(event, CoreEvent::Injection(_)));
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` are returned by `recv()`/`try_recv()`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Receives the next event that passes the filter.
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive an event without waiting.
    ///
    /// Returns `None` if no matching event is currently available.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
