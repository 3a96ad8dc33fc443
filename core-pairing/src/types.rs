//! Session state machine and runtime session handle

use crate::error::{PairingError, Result};
use bridge_traits::{DeviceCapabilities, SessionHandle};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Connection state of the paired device.
///
/// ```text
/// Disconnected ──> Connecting ──> Active <──> Degraded
///      ^               │            │            │
///      └───────────────┴────────────┴────────────┘
///
/// Connecting | Active | Degraded ──> TrustRejected ──(new credential)──> Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Active,
    Degraded,
    /// Terminal until a new credential is imported.
    TrustRejected,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Degraded => "degraded",
            SessionState::TrustRejected => "trust_rejected",
        }
    }

    /// Whether a session is open in this state.
    pub fn has_session(&self) -> bool {
        matches!(self, SessionState::Active | SessionState::Degraded)
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Active)
                | (Connecting, Disconnected)
                | (Connecting, TrustRejected)
                | (Active, Degraded)
                | (Active, Disconnected)
                | (Active, TrustRejected)
                | (Degraded, Active)
                | (Degraded, Disconnected)
                | (Degraded, TrustRejected)
                | (TrustRejected, Disconnected)
        )
    }

    pub fn validate_transition(&self, next: SessionState) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(PairingError::InvalidStateTransition {
                from: *self,
                to: next,
            })
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "disconnected" => Ok(SessionState::Disconnected),
            "connecting" => Ok(SessionState::Connecting),
            "active" => Ok(SessionState::Active),
            "degraded" => Ok(SessionState::Degraded),
            "trust_rejected" => Ok(SessionState::TrustRejected),
            other => Err(format!("Unknown session state: {}", other)),
        }
    }
}

/// Observable view of the session, published on every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    /// Most recent human-readable status line.
    pub status: String,
    pub device_id: Option<String>,
    pub consecutive_misses: u32,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub capabilities: Option<DeviceCapabilities>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: SessionState::Disconnected,
            status: "No device paired".to_string(),
            device_id: None,
            consecutive_misses: 0,
            last_heartbeat: None,
            capabilities: None,
        }
    }
}

/// One open transport session.
///
/// Owned by the session manager and shared by reference with the heartbeat
/// monitor and the injection pipeline. The commit lock serializes device
/// writes with each other and with heartbeat probes. The cancellation token
/// fires when the session is closed for any reason.
#[derive(Debug)]
pub struct DeviceSession {
    handle: SessionHandle,
    commit_lock: Mutex<()>,
    cancel: CancellationToken,
    misses: AtomicU32,
}

impl DeviceSession {
    pub(crate) fn new(handle: SessionHandle) -> Self {
        Self {
            handle,
            commit_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
            misses: AtomicU32::new(0),
        }
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn id(&self) -> &str {
        &self.handle.id
    }

    pub fn device_id(&self) -> &str {
        &self.handle.device_id
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.handle.capabilities
    }

    /// Wait for exclusive write access to the device.
    pub async fn lock_commit(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock().await
    }

    /// Exclusive write access if nothing else holds it.
    pub fn try_lock_commit(&self) -> Option<MutexGuard<'_, ()>> {
        self.commit_lock.try_lock().ok()
    }

    /// Resolves once the session has been closed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn consecutive_misses(&self) -> u32 {
        self.misses.load(Ordering::SeqCst)
    }

    pub(crate) fn close(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn record_miss(&self) -> u32 {
        self.misses.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn reset_misses(&self) {
        self.misses.store(0, Ordering::SeqCst);
    }
}

/// How the manager classified a failed probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// Miss recorded, session kept in `Degraded`.
    Degraded,
    /// Miss threshold reached; the session was closed.
    Lost,
    /// The transport reported the session closed.
    Closed,
    /// The device no longer trusts this host.
    TrustRejected,
    /// The probe belonged to a session that is no longer current.
    Stale,
}

impl ProbeVerdict {
    /// Whether the heartbeat should try to open a new session.
    pub fn should_reconnect(&self) -> bool {
        matches!(self, ProbeVerdict::Lost | ProbeVerdict::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        use SessionState::*;

        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Active));
        assert!(Active.can_transition_to(Degraded));
        assert!(Degraded.can_transition_to(Active));
        assert!(Degraded.can_transition_to(Disconnected));
        assert!(Active.can_transition_to(TrustRejected));
        assert!(TrustRejected.can_transition_to(Disconnected));
    }

    #[test]
    fn test_trust_rejected_never_reconnects_directly() {
        use SessionState::*;

        assert!(!TrustRejected.can_transition_to(Connecting));
        assert!(!TrustRejected.can_transition_to(Active));
        let err = TrustRejected.validate_transition(Connecting).unwrap_err();
        assert_eq!(
            err,
            PairingError::InvalidStateTransition {
                from: TrustRejected,
                to: Connecting
            }
        );
    }

    #[test]
    fn test_connecting_only_from_disconnected() {
        use SessionState::*;

        for from in [Connecting, Active, Degraded, TrustRejected] {
            assert!(!from.can_transition_to(Connecting), "{} -> connecting", from);
        }
        assert!(!Disconnected.can_transition_to(Active));
        assert!(!Disconnected.can_transition_to(Degraded));
    }

    #[test]
    fn test_state_string_round_trip() {
        for state in [
            SessionState::Disconnected,
            SessionState::Connecting,
            SessionState::Active,
            SessionState::Degraded,
            SessionState::TrustRejected,
        ] {
            assert_eq!(state.as_str().parse::<SessionState>().unwrap(), state);
        }
        assert!("paired".parse::<SessionState>().is_err());
    }

    #[test]
    fn test_session_miss_counter_and_close() {
        let session = DeviceSession::new(SessionHandle {
            id: "s1".into(),
            device_id: "D1".into(),
            capabilities: DeviceCapabilities::default(),
        });

        assert_eq!(session.record_miss(), 1);
        assert_eq!(session.record_miss(), 2);
        session.reset_misses();
        assert_eq!(session.consecutive_misses(), 0);

        assert!(!session.is_closed());
        session.close();
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_try_lock_commit_reports_contention() {
        let session = DeviceSession::new(SessionHandle {
            id: "s1".into(),
            device_id: "D1".into(),
            capabilities: DeviceCapabilities::default(),
        });

        let guard = session.lock_commit().await;
        assert!(session.try_lock_commit().is_none());
        drop(guard);
        assert!(session.try_lock_commit().is_some());
    }
}
