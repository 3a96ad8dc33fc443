//! Heartbeat supervision and automatic reconnect
//!
//! The monitor probes the open session at a fixed interval. Probes are
//! strictly sequential and never overlap a device write: when a commit holds
//! the session's commit lock the scheduled probe is skipped and issued as soon
//! as the lock is released.
//!
//! After the session is lost (miss threshold reached, or closed by the device)
//! the monitor reopens it with capped exponential backoff and jitter. It stops
//! trying on trust rejection, when no credential is left, or when the user
//! closed the session.

use crate::manager::PairingSessionManager;
use crate::types::{DeviceSession, ProbeVerdict};
use bridge_traits::error::{TransportError, TransportResult};
use bridge_traits::Ack;
use core_runtime::config::SessionConfig;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct HeartbeatMonitor {
    manager: Arc<PairingSessionManager>,
    config: SessionConfig,
    shutdown: CancellationToken,
}

impl HeartbeatMonitor {
    pub fn new(manager: Arc<PairingSessionManager>) -> Self {
        let config = manager.config().clone();
        Self {
            manager,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawn the supervision loop on the current runtime.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move { monitor.run().await })
    }

    /// Stop the loop. In-flight probes are abandoned.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    async fn run(&self) {
        info!(
            interval_ms = self.config.heartbeat_interval.as_millis() as u64,
            miss_threshold = self.config.miss_threshold,
            "Heartbeat monitor started"
        );
        let mut snapshots = self.manager.subscribe();

        loop {
            let session = match self.manager.current_session().await {
                Some(session) => session,
                None => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        changed = snapshots.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                    continue;
                }
            };

            if !self.supervise(&session).await {
                break;
            }

            if self.manager.should_reconnect().await && !self.reconnect(session.device_id()).await {
                break;
            }
        }

        info!("Heartbeat monitor stopped");
    }

    /// Probe `session` until it ends. Returns `false` on shutdown.
    async fn supervise(&self, session: &Arc<DeviceSession>) -> bool {
        let interval = self.config.heartbeat_interval;
        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = session.closed() => return true,
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = session.closed() => return true,
                outcome = self.probe(session) => outcome,
            };
            // Space probes from the end of the previous one, not from the schedule.
            ticker.reset();

            match outcome {
                Ok(ack) => self.manager.record_probe_success(session, ack).await,
                Err(error) => {
                    let verdict = self.manager.record_probe_failure(session, &error).await;
                    if verdict != ProbeVerdict::Degraded {
                        debug!(verdict = ?verdict, "Session supervision ended");
                        return true;
                    }
                }
            }
        }
    }

    async fn probe(&self, session: &DeviceSession) -> TransportResult<Ack> {
        let _write_guard = match session.try_lock_commit() {
            Some(guard) => guard,
            None => {
                debug!(session_id = session.id(), "Commit in flight, deferring heartbeat probe");
                let guard = session.lock_commit().await;
                debug!(session_id = session.id(), "Commit finished, resuming heartbeat");
                guard
            }
        };

        let transport = self.manager.transport();
        match time::timeout(self.config.probe_timeout, transport.probe(session.handle())).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    /// Reopen the session with backoff. Returns `false` on shutdown.
    async fn reconnect(&self, device_id: &str) -> bool {
        let backoff = self.config.reconnect_backoff;
        let mut attempt = 0u32;

        while self.manager.should_reconnect().await {
            attempt += 1;
            let delay = backoff.delay_for(attempt);
            self.manager.note_reconnect(device_id, attempt, delay);
            debug!(attempt = attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");

            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = time::sleep(delay) => {}
            }

            match self.manager.open_session().await {
                Ok(session) => {
                    info!(attempt = attempt, session_id = session.id(), "Reconnected");
                    return true;
                }
                Err(e) if e.is_permanent() => {
                    warn!(attempt = attempt, error = %e, "Giving up on reconnect");
                    return true;
                }
                Err(e) => {
                    debug!(attempt = attempt, error = %e, "Reconnect attempt failed");
                }
            }
        }

        true
    }
}
