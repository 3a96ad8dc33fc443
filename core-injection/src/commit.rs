//! Serialized device commits.
//!
//! A commit runs entirely under the session's commit lock, so writes never
//! interleave with each other or with heartbeat probes. Steps that took effect
//! are tracked in a [`WriteAheadLog`] and compensated when a later step fails.
//!
//! Failure handling per attempt:
//!
//! | Fault                      | Rollback ok            | Rollback failed          |
//! |----------------------------|------------------------|--------------------------|
//! | transient                  | retry with backoff     | fail, unsafe state       |
//! | session-fatal              | fail `SessionLost`     | `SessionLost`, unsafe    |
//! | rejected, nothing applied  | fail `DeviceRejected`  | n/a                      |
//! | rejected, steps applied    | fail `PartialWriteRolledBack` | fail, unsafe state |
//!
//! Logs whose rollback failed because the session went away are kept and
//! replayed at the start of the next commit.
//!
//! A job that reached `Committing` stays bound to that session. If the
//! session closes while the job waits between attempts it fails with
//! `SessionLost`. Shutdown ends such a job unless it holds the commit lock.

use crate::error::InjectionError;
use crate::job::{JobId, JobOutcome, JobStatus};
use crate::journal::{inverse_of, AppliedStep, WriteAheadLog};
use crate::registry::JobRegistry;
use bridge_traits::error::{TransportError, TransportResult};
use bridge_traits::{DeviceTransport, MediaKind, MediaRecord, PlaylistOperation};
use bytes::Bytes;
use core_pairing::{DeviceSession, PairingSessionManager};
use core_runtime::backoff::BackoffPolicy;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Device-side work of one job.
#[derive(Debug, Clone)]
pub(crate) enum CommitPlan {
    Media { record: MediaRecord, bytes: Bytes },
    Playlist {
        playlist: String,
        operations: Vec<PlaylistOperation>,
    },
}

impl CommitPlan {
    fn describe(&self) -> String {
        match self {
            CommitPlan::Media { record, .. } => {
                format!("Writing {} \"{}\" to the device", record.kind, record.metadata.title)
            }
            CommitPlan::Playlist {
                playlist,
                operations,
            } => format!(
                "Applying {} change(s) to playlist {}",
                operations.len(),
                playlist
            ),
        }
    }
}

/// How one attempt ended.
struct AttemptFailure {
    error: TransportError,
    applied: usize,
}

pub(crate) struct Committer {
    manager: Arc<PairingSessionManager>,
    transport: Arc<dyn DeviceTransport>,
    registry: Arc<JobRegistry>,
    attempts: u32,
    backoff: BackoffPolicy,
    shutdown: CancellationToken,
    orphans: Mutex<Vec<WriteAheadLog>>,
}

impl Committer {
    pub fn new(
        manager: Arc<PairingSessionManager>,
        registry: Arc<JobRegistry>,
        attempts: u32,
        backoff: BackoffPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        let transport = manager.transport();
        Self {
            manager,
            transport,
            registry,
            attempts,
            backoff,
            shutdown,
            orphans: Mutex::new(Vec::new()),
        }
    }

    /// Logs still waiting for compensation.
    pub async fn orphaned_logs(&self) -> usize {
        self.orphans.lock().await.len()
    }

    #[instrument(skip(self, plan), fields(job_id = %job_id))]
    pub async fn commit(&self, job_id: JobId, plan: CommitPlan) -> JobOutcome {
        // Session the job entered `Committing` on. Once set, the job never
        // moves to another session.
        let mut bound: Option<Arc<DeviceSession>> = None;
        let mut attempt = 0u32;

        loop {
            let session = match &bound {
                None => tokio::select! {
                    _ = self.shutdown.cancelled() => return cancelled(),
                    session = self.manager.wait_for_active() => session,
                },
                Some(original) => {
                    let next = tokio::select! {
                        _ = self.shutdown.cancelled() => return cancelled(),
                        _ = original.closed() => {
                            return session_lost("session closed before the write could resume")
                        }
                        session = self.manager.wait_for_active() => session,
                    };
                    if !Arc::ptr_eq(original, &next) {
                        return session_lost("session replaced before the write could resume");
                    }
                    next
                }
            };

            let guard = tokio::select! {
                _ = self.shutdown.cancelled() => return cancelled(),
                _ = session.closed() => None,
                guard = session.lock_commit() => Some(guard),
            };
            let Some(guard) = guard.filter(|_| !session.is_closed()) else {
                if bound.is_some() {
                    return session_lost("session closed before the write could resume");
                }
                debug!("Session closed while waiting for the commit lock; pausing job");
                continue;
            };

            self.replay_orphans(&session).await;

            if bound.is_none() {
                bound = Some(Arc::clone(&session));
                self.registry
                    .advance(job_id, JobStatus::Committing, plan.describe())
                    .await;
            }

            if let CommitPlan::Media { record, .. } = &plan {
                if record.kind == MediaKind::Ringtone && !session.capabilities().supports_ringtones {
                    return JobOutcome::Failed {
                        error: InjectionError::DeviceRejected(
                            "device does not accept ringtones".to_string(),
                        ),
                        unsafe_state: false,
                    };
                }
            }

            attempt += 1;
            let mut log = WriteAheadLog::new();
            let failure = match self.attempt(&session, &plan, &mut log).await {
                Ok(outcome) => {
                    info!(attempt = attempt, outcome = %outcome.reason(), "Commit finished");
                    return outcome;
                }
                Err(failure) => failure,
            };
            let error = failure.error;
            warn!(attempt = attempt, applied = failure.applied, error = %error, "Commit attempt failed");

            if !log.is_empty() {
                if let Err(rollback) = log.rollback(self.transport.as_ref(), session.handle()).await {
                    warn!(error = %rollback, remaining = log.len(), "Rollback failed; device state unverified");
                    self.orphans.lock().await.push(log);
                    if error.is_session_fatal() || rollback.is_session_fatal() {
                        let fatal = if error.is_session_fatal() { &error } else { &rollback };
                        self.manager.report_session_fault(&session, fatal).await;
                    }
                    let message = format!("{}; rollback failed: {}", error, rollback);
                    let error = if error.is_session_fatal() {
                        InjectionError::SessionLost(message)
                    } else {
                        InjectionError::CommitFailed {
                            attempts: attempt,
                            message,
                        }
                    };
                    return JobOutcome::Failed {
                        error,
                        unsafe_state: true,
                    };
                }
            }

            if error.is_session_fatal() {
                self.manager.report_session_fault(&session, &error).await;
                return session_lost(&error.to_string());
            }

            if !error.is_transient() {
                let error = if failure.applied == 0 {
                    InjectionError::DeviceRejected(error.to_string())
                } else {
                    InjectionError::PartialWriteRolledBack(error.to_string())
                };
                return JobOutcome::Failed {
                    error,
                    unsafe_state: false,
                };
            }

            if attempt >= self.attempts {
                return JobOutcome::Failed {
                    error: InjectionError::CommitFailed {
                        attempts: attempt,
                        message: error.to_string(),
                    },
                    unsafe_state: false,
                };
            }

            drop(guard);
            let delay = self.backoff.delay_for(attempt);
            debug!(attempt = attempt, delay_ms = delay.as_millis() as u64, "Retrying commit");
            tokio::select! {
                _ = self.shutdown.cancelled() => return cancelled(),
                _ = session.closed() => return session_lost("session closed between commit attempts"),
                _ = time::sleep(delay) => {}
            }
        }
    }

    async fn attempt(
        &self,
        session: &DeviceSession,
        plan: &CommitPlan,
        log: &mut WriteAheadLog,
    ) -> std::result::Result<JobOutcome, AttemptFailure> {
        let fail = |error: TransportError, log: &WriteAheadLog| AttemptFailure {
            error,
            applied: log.len(),
        };
        let handle = session.handle();

        if let CommitPlan::Media { record, .. } = plan {
            let library = self
                .transport
                .list_library_fingerprints(handle)
                .await
                .map_err(|e| fail(e, &*log))?;
            if library.contains(&record.fingerprint) {
                return Ok(JobOutcome::Duplicate {
                    fingerprint: record.fingerprint.clone(),
                });
            }
        }

        ensure_open(session).map_err(|e| fail(e, &*log))?;
        let tx = self
            .transport
            .begin_write(handle)
            .await
            .map_err(|e| fail(e, &*log))?;

        let written = match plan {
            CommitPlan::Media { record, bytes } => self.write_media(session, &tx, record, bytes, log).await,
            CommitPlan::Playlist {
                playlist,
                operations,
            } => self.write_playlist(session, &tx, playlist, operations, log).await,
        };
        let committed = match written {
            Ok(()) => match ensure_open(session) {
                Ok(()) => self.transport.commit(&tx).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match committed {
            Ok(()) => Ok(match plan {
                CommitPlan::Media { record, .. } => JobOutcome::Committed(record.clone()),
                CommitPlan::Playlist {
                    playlist,
                    operations,
                } => JobOutcome::PlaylistUpdated {
                    playlist: playlist.clone(),
                    operations: operations.len(),
                },
            }),
            Err(error) => {
                if let Err(abort) = self.transport.abort(&tx).await {
                    debug!(error = %abort, "Abort after failed write returned an error");
                }
                Err(fail(error, &*log))
            }
        }
    }

    async fn write_media(
        &self,
        session: &DeviceSession,
        tx: &bridge_traits::TransactionHandle,
        record: &MediaRecord,
        bytes: &Bytes,
        log: &mut WriteAheadLog,
    ) -> TransportResult<()> {
        ensure_open(session)?;
        // Logged first: a failed upload may still leave a partial file behind.
        log.record(AppliedStep::Uploaded {
            locator: record.locator.clone(),
        });
        self.transport
            .upload_file(tx, &record.locator, bytes.clone())
            .await?;

        ensure_open(session)?;
        self.transport.write_record(tx, record).await?;
        log.record(AppliedStep::RecordWritten {
            fingerprint: record.fingerprint.clone(),
        });
        Ok(())
    }

    async fn write_playlist(
        &self,
        session: &DeviceSession,
        tx: &bridge_traits::TransactionHandle,
        playlist: &str,
        operations: &[PlaylistOperation],
        log: &mut WriteAheadLog,
    ) -> TransportResult<()> {
        let mut shadow = self
            .transport
            .fetch_playlist(session.handle(), playlist)
            .await?
            .map(|p| p.members);

        for op in operations {
            ensure_open(session)?;
            let inverse = inverse_of(op, shadow.as_deref());
            self.transport.apply_playlist_op(tx, playlist, op).await?;
            log.record(AppliedStep::PlaylistOp {
                playlist: playlist.to_string(),
                inverse,
            });

            shadow = match op {
                PlaylistOperation::Create => Some(Vec::new()),
                PlaylistOperation::Delete => None,
                other => {
                    let mut members = shadow.unwrap_or_default();
                    other
                        .apply_to(&mut members)
                        .map_err(TransportError::Rejected)?;
                    Some(members)
                }
            };
        }
        Ok(())
    }

    /// Compensate logs left behind by a session that went away mid-rollback.
    async fn replay_orphans(&self, session: &DeviceSession) {
        let mut orphans = self.orphans.lock().await;
        if orphans.is_empty() {
            return;
        }

        let mut remaining = Vec::new();
        for mut log in orphans.drain(..) {
            match log.rollback(self.transport.as_ref(), session.handle()).await {
                Ok(()) => info!("Compensated steps left by an interrupted commit"),
                Err(e) => {
                    warn!(error = %e, remaining = log.len(), "Orphaned steps still not compensated");
                    remaining.push(log);
                }
            }
        }
        *orphans = remaining;
    }
}

fn ensure_open(session: &DeviceSession) -> TransportResult<()> {
    if session.is_closed() {
        Err(TransportError::SessionClosed)
    } else {
        Ok(())
    }
}

fn cancelled() -> JobOutcome {
    JobOutcome::Failed {
        error: InjectionError::Cancelled,
        unsafe_state: false,
    }
}

fn session_lost(message: &str) -> JobOutcome {
    JobOutcome::Failed {
        error: InjectionError::SessionLost(message.to_string()),
        unsafe_state: false,
    }
}
