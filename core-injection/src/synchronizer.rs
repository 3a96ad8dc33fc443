//! # Playlist Synchronizer
//!
//! Brings device playlists in line with caller-supplied definitions.
//!
//! `reconcile` diffs the definition against the device copy and applies the
//! operations as a single `PlaylistOp` job through the injection pipeline, so
//! playlist writes share the commit lock and rollback path with media writes.
//!
//! Members whose fingerprint is not in the device library yet are deferred.
//! The rest of the playlist is still applied, the call returns
//! [`SyncError::DependencyPending`], and once a job completes with one of the
//! missing fingerprints the synchronizer reconciles that playlist again on its
//! own (see [`PlaylistSynchronizer::start`]).

use crate::error::{InjectionError, SyncError, SyncResult};
use crate::job::{InjectionRequest, JobOutcome};
use crate::pipeline::MediaInjectionPipeline;
use crate::playlist::{diff, PlaylistDefinition};
use bridge_traits::error::TransportError;
use bridge_traits::PlaylistOperation;
use core_pairing::{DeviceSession, PairingSessionManager};
use core_runtime::events::{CoreEvent, EventBus, InjectionEvent, PlaylistEvent, RecvError};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Summary of a reconciliation that left the playlist fully in sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub playlist: String,
    pub revision: u64,
    pub operations: Vec<PlaylistOperation>,
}

struct Deferred {
    definition: PlaylistDefinition,
    waiting_for: HashSet<String>,
}

pub struct PlaylistSynchronizer {
    manager: Arc<PairingSessionManager>,
    pipeline: Arc<MediaInjectionPipeline>,
    event_bus: EventBus,
    /// Last reconciled revision per playlist name.
    revisions: Mutex<HashMap<String, u64>>,
    deferred: Mutex<HashMap<String, Deferred>>,
    /// One reconciliation at a time keeps diffs from racing each other.
    reconcile_lock: Mutex<()>,
    shutdown: CancellationToken,
}

impl PlaylistSynchronizer {
    pub fn new(
        manager: Arc<PairingSessionManager>,
        pipeline: Arc<MediaInjectionPipeline>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            manager,
            pipeline,
            event_bus,
            revisions: Mutex::new(HashMap::new()),
            deferred: Mutex::new(HashMap::new()),
            reconcile_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Reconcile one playlist. Waits for an `Active` session.
    #[instrument(skip(self, definition), fields(playlist = %definition.name, revision = definition.revision))]
    pub async fn reconcile(&self, definition: PlaylistDefinition) -> SyncResult<ReconcileReport> {
        definition.validate()?;
        let _serial = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(SyncError::Injection(InjectionError::Cancelled)),
            serial = self.reconcile_lock.lock() => serial,
        };

        if let Some(current) = self.revisions.lock().await.get(&definition.name).copied() {
            if definition.revision < current {
                return Err(SyncError::StaleDefinition {
                    playlist: definition.name.clone(),
                    revision: definition.revision,
                    current,
                });
            }
        }

        self.emit(PlaylistEvent::ReconcileStarted {
            playlist: definition.name.clone(),
            revision: definition.revision,
        });

        let result = self.apply(&definition).await;
        match &result {
            Ok(report) => {
                info!(operations = report.operations.len(), "Playlist in sync");
                self.emit(PlaylistEvent::Reconciled {
                    playlist: definition.name.clone(),
                    revision: definition.revision,
                    operations: report.operations.len() as u32,
                    deferred: 0,
                });
            }
            Err(SyncError::DependencyPending { fingerprints, .. }) => {
                info!(deferred = fingerprints.len(), "Playlist partially applied");
            }
            Err(e) => {
                warn!(error = %e, "Playlist reconciliation failed");
                self.emit(PlaylistEvent::ReconcileFailed {
                    playlist: definition.name.clone(),
                    message: e.to_string(),
                });
            }
        }
        result
    }

    async fn apply(&self, definition: &PlaylistDefinition) -> SyncResult<ReconcileReport> {
        let session = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(SyncError::Injection(InjectionError::Cancelled)),
            session = self.manager.wait_for_active() => session,
        };
        let transport = self.manager.transport();

        let library = match transport.list_library_fingerprints(session.handle()).await {
            Ok(library) => library,
            Err(e) => return Err(self.transport_failure(&session, e).await),
        };
        let current = match transport.fetch_playlist(session.handle(), &definition.name).await {
            Ok(current) => current,
            Err(e) => return Err(self.transport_failure(&session, e).await),
        };
        drop(session);

        let plan = diff(
            current.as_ref().map(|p| p.members.as_slice()),
            &definition.members,
            &library,
        );
        debug!(
            operations = plan.operations.len(),
            deferred = plan.deferred.len(),
            "Computed playlist diff"
        );

        if !plan.operations.is_empty() {
            self.run_job(&definition.name, plan.operations.clone()).await?;
        }

        self.revisions
            .lock()
            .await
            .insert(definition.name.clone(), definition.revision);

        let mut deferred = self.deferred.lock().await;
        if plan.deferred.is_empty() {
            deferred.remove(&definition.name);
            return Ok(ReconcileReport {
                playlist: definition.name.clone(),
                revision: definition.revision,
                operations: plan.operations,
            });
        }

        deferred.insert(
            definition.name.clone(),
            Deferred {
                definition: definition.clone(),
                waiting_for: plan.deferred.iter().cloned().collect(),
            },
        );
        self.emit(PlaylistEvent::Reconciled {
            playlist: definition.name.clone(),
            revision: definition.revision,
            operations: plan.operations.len() as u32,
            deferred: plan.deferred.len() as u32,
        });
        self.emit(PlaylistEvent::MembersDeferred {
            playlist: definition.name.clone(),
            fingerprints: plan.deferred.clone(),
        });
        Err(SyncError::DependencyPending {
            playlist: definition.name.clone(),
            fingerprints: plan.deferred,
        })
    }

    async fn run_job(&self, playlist: &str, operations: Vec<PlaylistOperation>) -> SyncResult<()> {
        let handle = self
            .pipeline
            .submit(InjectionRequest::playlist(playlist, operations))
            .await;
        let outcome = self
            .pipeline
            .wait(&handle)
            .await
            .map_err(SyncError::Injection)?;
        self.pipeline.acknowledge(&handle).await.ok();

        match outcome {
            JobOutcome::Failed {
                error: InjectionError::DeviceRejected(message),
                ..
            }
            | JobOutcome::Failed {
                error: InjectionError::PartialWriteRolledBack(message),
                ..
            } => Err(SyncError::DeviceRejectedOperation {
                playlist: playlist.to_string(),
                message,
            }),
            JobOutcome::Failed { error, .. } => Err(SyncError::Injection(error)),
            _ => Ok(()),
        }
    }

    async fn transport_failure(&self, session: &Arc<DeviceSession>, error: TransportError) -> SyncError {
        if error.is_session_fatal() {
            self.manager.report_session_fault(session, &error).await;
            return SyncError::Injection(InjectionError::SessionLost(error.to_string()));
        }
        SyncError::Transport(error)
    }

    /// Playlists waiting for members, with the fingerprints they wait for.
    pub async fn pending(&self) -> HashMap<String, Vec<String>> {
        let deferred = self.deferred.lock().await;
        deferred
            .iter()
            .map(|(name, entry)| {
                let mut waiting: Vec<String> = entry.waiting_for.iter().cloned().collect();
                waiting.sort();
                (name.clone(), waiting)
            })
            .collect()
    }

    /// Forget a deferred playlist; it is no longer re-reconciled automatically.
    pub async fn cancel_pending(&self, playlist: &str) -> bool {
        self.deferred.lock().await.remove(playlist).is_some()
    }

    /// Spawn the listener that re-reconciles deferred playlists when the
    /// members they wait for land on the device.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let synchronizer = Arc::clone(self);
        let mut events = self.event_bus.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = synchronizer.shutdown.cancelled() => break,
                    event = events.recv() => event,
                };

                let ready = match event {
                    Ok(CoreEvent::Injection(InjectionEvent::JobCompleted {
                        fingerprint: Some(fingerprint),
                        ..
                    })) => synchronizer.waiting_on(Some(&fingerprint)).await,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(missed)) => {
                        debug!(missed = missed, "Listener lagged; retrying every deferred playlist");
                        synchronizer.waiting_on(None).await
                    }
                    Err(RecvError::Closed) => break,
                };

                for definition in ready {
                    let name = definition.name.clone();
                    tokio::select! {
                        _ = synchronizer.shutdown.cancelled() => return,
                        result = synchronizer.reconcile(definition) => match result {
                            Ok(_) => info!(playlist = %name, "Deferred playlist completed"),
                            Err(e) if e.is_pending() => debug!(playlist = %name, "Playlist still waiting for members"),
                            Err(e) => warn!(playlist = %name, error = %e, "Deferred reconciliation failed"),
                        },
                    }
                }
            }
            debug!("Playlist listener stopped");
        })
    }

    /// Stop the listener and cancel reconciliations still waiting for a session.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Definitions waiting on `fingerprint`, or all deferred ones for `None`.
    async fn waiting_on(&self, fingerprint: Option<&str>) -> Vec<PlaylistDefinition> {
        let deferred = self.deferred.lock().await;
        deferred
            .values()
            .filter(|entry| fingerprint.map_or(true, |fp| entry.waiting_for.contains(fp)))
            .map(|entry| entry.definition.clone())
            .collect()
    }

    fn emit(&self, event: PlaylistEvent) {
        self.event_bus.emit(CoreEvent::Playlist(event)).ok();
    }
}
