//! # Pairing Session Manager
//!
//! Owns the pairing credential and the single device session.
//!
//! ## Overview
//!
//! `PairingSessionManager` validates and persists imported credentials, opens
//! sessions through the host's `DeviceTransport`, and drives the session state
//! machine. Every state change is published twice: as a [`SessionSnapshot`]
//! on a `watch` channel (latest value, for display) and as a
//! `SessionEvent::StateChanged` on the event bus (history, for consumers that
//! need every transition).
//!
//! ## Invariants
//!
//! - At most one session is open. Concurrent `open_session` calls are
//!   serialized and return the already-open session.
//! - `Connecting` is entered only from `Disconnected` and only when a
//!   credential is present.
//! - `Active` is reached only after the device acknowledged one probe.
//! - `TrustRejected` is left only by importing or forgetting a credential.
//!
//! ## Usage
//!
//! ```ignore
//! let manager = Arc::new(PairingSessionManager::new(
//!     secure_store, transport, event_bus, clock, SessionConfig::default(),
//! ));
//!
//! manager.import_credential(&raw_bytes).await?;
//! let session = manager.open_session().await?;
//! assert_eq!(manager.current_state(), SessionState::Active);
//! ```

use crate::credential::PairingCredential;
use crate::credential_store::CredentialStore;
use crate::error::{PairingError, Result};
use crate::types::{DeviceSession, ProbeVerdict, SessionSnapshot, SessionState};
use bridge_traits::error::TransportError;
use bridge_traits::{Ack, Clock, DeviceTransport, SecureStore, SessionHandle};
use core_runtime::config::SessionConfig;
use core_runtime::events::{CoreEvent, EventBus, SessionEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

pub struct PairingSessionManager {
    store: CredentialStore,
    transport: Arc<dyn DeviceTransport>,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    credential: RwLock<Option<PairingCredential>>,
    session: RwLock<Option<Arc<DeviceSession>>>,
    snapshot: watch::Sender<SessionSnapshot>,
    /// Serializes open, close and credential replacement.
    open_lock: Mutex<()>,
    /// Cleared by explicit close, trust rejection and credential changes.
    auto_reconnect: AtomicBool,
}

impl PairingSessionManager {
    pub fn new(
        secure_store: Arc<dyn SecureStore>,
        transport: Arc<dyn DeviceTransport>,
        event_bus: EventBus,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Self {
        let (snapshot, _) = watch::channel(SessionSnapshot::default());
        Self {
            store: CredentialStore::new(secure_store),
            transport,
            event_bus,
            clock,
            config,
            credential: RwLock::new(None),
            session: RwLock::new(None),
            snapshot,
            open_lock: Mutex::new(()),
            auto_reconnect: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transport(&self) -> Arc<dyn DeviceTransport> {
        Arc::clone(&self.transport)
    }

    pub fn current_state(&self) -> SessionState {
        self.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Latest-value stream of session snapshots.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    pub async fn credential(&self) -> Option<PairingCredential> {
        self.credential.read().await.clone()
    }

    pub async fn current_session(&self) -> Option<Arc<DeviceSession>> {
        self.session.read().await.clone()
    }

    /// Restore the credential persisted by a previous run.
    pub async fn load_stored_credential(&self) -> Result<Option<PairingCredential>> {
        let _open = self.open_lock.lock().await;
        let stored = self.store.load_active().await?;

        if let Some(ref credential) = stored {
            let device_id = credential.device_id().to_string();
            *self.credential.write().await = Some(credential.clone());
            self.snapshot.send_if_modified(|snapshot| {
                if snapshot.state != SessionState::Disconnected {
                    return false;
                }
                snapshot.status = format!("Paired with {}", device_id);
                snapshot.device_id = Some(device_id.clone());
                true
            });
            info!(device_id = %device_id, "Restored stored pairing credential");
        }

        Ok(stored)
    }

    /// Validate, persist and adopt a new pairing credential.
    ///
    /// Replaces any previous credential wholesale and closes a session opened
    /// with it. Clears `TrustRejected`.
    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    pub async fn import_credential(&self, bytes: &[u8]) -> Result<PairingCredential> {
        let credential = PairingCredential::parse(bytes).map_err(|e| {
            warn!(error = %e, "Rejected pairing credential");
            e
        })?;

        let _open = self.open_lock.lock().await;
        self.store.save(&credential).await?;

        self.auto_reconnect.store(false, Ordering::SeqCst);
        if let Some(session) = self.take_session().await {
            info!(session_id = session.id(), "Closing session opened with the replaced credential");
            self.close_transport(session.handle()).await;
        }
        *self.credential.write().await = Some(credential.clone());

        let device_id = credential.device_id().to_string();
        self.publish(
            SessionState::Disconnected,
            format!("Paired with {}", device_id),
            |snapshot| {
                snapshot.device_id = Some(device_id.clone());
                snapshot.consecutive_misses = 0;
                snapshot.capabilities = None;
            },
        )?;

        self.emit(SessionEvent::CredentialImported {
            device_id: device_id.clone(),
        });
        info!(device_id = %device_id, "Pairing credential imported");

        Ok(credential)
    }

    /// Drop the stored credential and any session opened with it.
    #[instrument(skip(self))]
    pub async fn forget_credential(&self) -> Result<()> {
        let _open = self.open_lock.lock().await;
        self.auto_reconnect.store(false, Ordering::SeqCst);

        if let Some(session) = self.take_session().await {
            self.close_transport(session.handle()).await;
        }

        let Some(credential) = self.credential.write().await.take() else {
            return Ok(());
        };
        self.store.delete(credential.device_id()).await?;

        self.publish(SessionState::Disconnected, "No device paired", |snapshot| {
            snapshot.device_id = None;
            snapshot.consecutive_misses = 0;
            snapshot.last_heartbeat = None;
            snapshot.capabilities = None;
        })?;

        self.emit(SessionEvent::CredentialForgotten {
            device_id: credential.device_id().to_string(),
        });
        Ok(())
    }

    /// Open a session with the stored credential.
    ///
    /// Returns the current session if one is already open.
    ///
    /// # Errors
    ///
    /// - `NoCredential` when nothing has been imported
    /// - `TrustRejected` when the device refused the credential, now or earlier
    /// - `DeviceUnreachable` when the device did not answer
    #[instrument(skip(self))]
    pub async fn open_session(&self) -> Result<Arc<DeviceSession>> {
        let _open = self.open_lock.lock().await;

        match self.current_state() {
            state if state.has_session() => {
                if let Some(session) = self.current_session().await {
                    debug!(session_id = session.id(), "Session already open");
                    return Ok(session);
                }
            }
            SessionState::TrustRejected => {
                return Err(PairingError::TrustRejected(
                    "device rejected the stored credential; import a new one".to_string(),
                ));
            }
            _ => {}
        }

        let credential = self
            .credential
            .read()
            .await
            .clone()
            .ok_or(PairingError::NoCredential)?;
        let device_id = credential.device_id().to_string();
        let material = credential.material()?;

        self.publish(
            SessionState::Connecting,
            format!("Connecting to {}", device_id),
            |snapshot| {
                snapshot.device_id = Some(device_id.clone());
                snapshot.consecutive_misses = 0;
            },
        )?;

        let handle = match timeout(self.config.open_timeout, self.transport.open_session(&material)).await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(self.fail_open(&device_id, e)),
            Err(_) => return Err(self.fail_open(&device_id, TransportError::Timeout)),
        };

        let ack = match timeout(self.config.probe_timeout, self.transport.probe(&handle)).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(e)) => {
                self.close_transport(&handle).await;
                return Err(self.fail_open(&device_id, e));
            }
            Err(_) => {
                self.close_transport(&handle).await;
                return Err(self.fail_open(&device_id, TransportError::Timeout));
            }
        };

        let session = Arc::new(DeviceSession::new(handle));
        *self.session.write().await = Some(Arc::clone(&session));
        self.auto_reconnect.store(true, Ordering::SeqCst);

        let now = self.clock.now();
        let capabilities = session.capabilities().clone();
        self.publish(
            SessionState::Active,
            format!("Connected to {}", device_id),
            |snapshot| {
                snapshot.last_heartbeat = Some(now);
                snapshot.capabilities = Some(capabilities);
                snapshot.consecutive_misses = 0;
            },
        )?;

        info!(
            session_id = session.id(),
            sequence = ack.sequence,
            product_version = %session.capabilities().product_version,
            "Session active"
        );
        Ok(session)
    }

    /// Close the current session at the caller's request.
    ///
    /// Cancels in-flight probes and commits and disables automatic reconnect.
    #[instrument(skip(self))]
    pub async fn close_session(&self, reason: &str) -> Result<()> {
        let _open = self.open_lock.lock().await;
        self.auto_reconnect.store(false, Ordering::SeqCst);

        let Some(session) = self.take_session().await else {
            debug!("No session to close");
            return Ok(());
        };
        self.close_transport(session.handle()).await;

        self.publish(
            SessionState::Disconnected,
            format!("Session closed: {}", reason),
            |snapshot| {
                snapshot.capabilities = None;
                snapshot.consecutive_misses = 0;
            },
        )?;
        Ok(())
    }

    /// Park until a session is `Active` and return it.
    pub async fn wait_for_active(&self) -> Arc<DeviceSession> {
        let mut states = self.snapshot.subscribe();
        loop {
            let state = states.borrow_and_update().state;
            if state == SessionState::Active {
                if let Some(session) = self.current_session().await {
                    if !session.is_closed() {
                        return session;
                    }
                }
            }
            if states.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Whether a lost session should be re-opened automatically.
    pub async fn should_reconnect(&self) -> bool {
        self.auto_reconnect.load(Ordering::SeqCst)
            && self.current_state() == SessionState::Disconnected
            && self.credential.read().await.is_some()
    }

    /// Record an acknowledged heartbeat.
    pub async fn record_probe_success(&self, session: &Arc<DeviceSession>, ack: Ack) {
        if !self.is_current(session).await {
            return;
        }

        let recovered = session.consecutive_misses() > 0;
        session.reset_misses();
        let now = self.clock.now();
        let status = if recovered {
            format!("Connection to {} restored", session.device_id())
        } else {
            format!("Connected to {}", session.device_id())
        };

        if let Err(e) = self.publish(SessionState::Active, status, |snapshot| {
            snapshot.last_heartbeat = Some(now);
            snapshot.consecutive_misses = 0;
        }) {
            debug!(error = %e, "Ignoring heartbeat for a session that is closing");
            return;
        }

        debug!(session_id = session.id(), sequence = ack.sequence, "Heartbeat acknowledged");
    }

    /// Record a failed heartbeat and decide what happens to the session.
    pub async fn record_probe_failure(
        &self,
        session: &Arc<DeviceSession>,
        error: &TransportError,
    ) -> ProbeVerdict {
        if !self.is_current(session).await {
            return ProbeVerdict::Stale;
        }

        if error.is_session_fatal() {
            return self.end_after_fatal(session, error).await;
        }

        let threshold = self.config.miss_threshold;
        let misses = session.record_miss();
        warn!(
            session_id = session.id(),
            consecutive_misses = misses,
            threshold = threshold,
            error = %error,
            "Heartbeat missed"
        );
        self.emit(SessionEvent::HeartbeatMissed {
            device_id: session.device_id().to_string(),
            consecutive_misses: misses,
            threshold,
        });

        if misses >= threshold {
            if self.detach(session).await {
                self.close_transport(session.handle()).await;
                self.publish(
                    SessionState::Disconnected,
                    format!(
                        "Lost contact with {} after {} missed heartbeats",
                        session.device_id(),
                        misses
                    ),
                    |snapshot| {
                        snapshot.consecutive_misses = misses;
                        snapshot.capabilities = None;
                    },
                )
                .ok();
            }
            return ProbeVerdict::Lost;
        }

        self.publish(
            SessionState::Degraded,
            format!("Heartbeat missed ({}/{}): {}", misses, threshold, error),
            |snapshot| snapshot.consecutive_misses = misses,
        )
        .ok();
        ProbeVerdict::Degraded
    }

    /// Report a transport failure seen outside the heartbeat.
    ///
    /// Only session-fatal errors change state; anything else returns `None`.
    pub async fn report_session_fault(
        &self,
        session: &Arc<DeviceSession>,
        error: &TransportError,
    ) -> Option<ProbeVerdict> {
        if !error.is_session_fatal() || !self.is_current(session).await {
            return None;
        }
        Some(self.end_after_fatal(session, error).await)
    }

    pub(crate) fn note_reconnect(&self, device_id: &str, attempt: u32, delay: Duration) {
        let status = format!(
            "Reconnecting to {} in {:.1}s (attempt {})",
            device_id,
            delay.as_secs_f64(),
            attempt
        );
        self.snapshot.send_modify(|snapshot| snapshot.status = status);
        self.emit(SessionEvent::ReconnectScheduled {
            device_id: device_id.to_string(),
            attempt,
            delay_ms: delay.as_millis() as u64,
        });
    }

    async fn end_after_fatal(
        &self,
        session: &Arc<DeviceSession>,
        error: &TransportError,
    ) -> ProbeVerdict {
        let device_id = session.device_id().to_string();
        if !self.detach(session).await {
            return ProbeVerdict::Stale;
        }

        match error {
            TransportError::TrustRejected(message) => {
                self.auto_reconnect.store(false, Ordering::SeqCst);
                self.close_transport(session.handle()).await;
                self.reject_trust(&device_id, message);
                ProbeVerdict::TrustRejected
            }
            _ => {
                warn!(session_id = session.id(), "Device closed the session");
                self.publish(
                    SessionState::Disconnected,
                    format!("{} closed the session", device_id),
                    |snapshot| {
                        snapshot.capabilities = None;
                        snapshot.consecutive_misses = 0;
                    },
                )
                .ok();
                ProbeVerdict::Closed
            }
        }
    }

    fn fail_open(&self, device_id: &str, error: TransportError) -> PairingError {
        match error {
            TransportError::TrustRejected(message) => {
                self.auto_reconnect.store(false, Ordering::SeqCst);
                self.reject_trust(device_id, &message);
                PairingError::TrustRejected(message)
            }
            other => {
                warn!(device_id = device_id, error = %other, "Failed to open session");
                self.publish(
                    SessionState::Disconnected,
                    format!("{} unreachable: {}", device_id, other),
                    |snapshot| snapshot.capabilities = None,
                )
                .ok();
                PairingError::DeviceUnreachable(other.to_string())
            }
        }
    }

    fn reject_trust(&self, device_id: &str, message: &str) {
        warn!(device_id = device_id, reason = message, "Device rejected pairing trust");
        self.publish(
            SessionState::TrustRejected,
            format!(
                "{} no longer trusts this host; import a new pairing credential",
                device_id
            ),
            |snapshot| snapshot.capabilities = None,
        )
        .ok();
        self.emit(SessionEvent::TrustRejected {
            device_id: device_id.to_string(),
            message: message.to_string(),
        });
    }

    async fn is_current(&self, session: &Arc<DeviceSession>) -> bool {
        matches!(self.session.read().await.as_ref(), Some(current) if Arc::ptr_eq(current, session))
    }

    /// Remove `session` if it is still the current one.
    async fn detach(&self, session: &Arc<DeviceSession>) -> bool {
        let mut current = self.session.write().await;
        match current.as_ref() {
            Some(existing) if Arc::ptr_eq(existing, session) => {
                current.take();
                session.close();
                true
            }
            _ => false,
        }
    }

    async fn take_session(&self) -> Option<Arc<DeviceSession>> {
        let session = self.session.write().await.take()?;
        session.close();
        Some(session)
    }

    async fn close_transport(&self, handle: &SessionHandle) {
        if let Err(e) = self.transport.close_session(handle).await {
            debug!(session_id = %handle.id, error = %e, "Transport close failed");
        }
    }

    /// Apply a validated state change and publish it.
    ///
    /// Re-entering the current state only refreshes the snapshot.
    fn publish(
        &self,
        to: SessionState,
        status: impl Into<String>,
        update: impl FnOnce(&mut SessionSnapshot),
    ) -> Result<SessionState> {
        let status = status.into();
        let mut outcome = Ok(to);

        self.snapshot.send_if_modified(|snapshot| {
            let from = snapshot.state;
            if from != to {
                if let Err(e) = from.validate_transition(to) {
                    outcome = Err(e);
                    return false;
                }
            }
            outcome = Ok(from);
            snapshot.state = to;
            snapshot.status = status.clone();
            update(snapshot);
            true
        });

        let from = outcome?;
        if from != to {
            info!(from = %from, to = %to, status = %status, "Session state changed");
            let device_id = self.snapshot.borrow().device_id.clone();
            self.emit(SessionEvent::StateChanged {
                device_id,
                from: from.to_string(),
                to: to.to_string(),
                status,
            });
        }
        Ok(from)
    }

    fn emit(&self, event: SessionEvent) {
        self.event_bus.emit(CoreEvent::Session(event)).ok();
    }
}

impl std::fmt::Debug for PairingSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingSessionManager")
            .field("snapshot", &*self.snapshot.borrow())
            .field("config", &self.config)
            .finish()
    }
}
