//! In-memory job table.
//!
//! Every job keeps its full update history in a `watch` channel so that
//! observers attaching late still see the sequence from `Queued` onward.
//! Lifecycle events are mirrored onto the core event bus as jobs move.

use crate::error::{InjectionError, Result};
use crate::job::{JobHandle, JobId, JobKind, JobOutcome, JobStatus, JobUpdate};
use core_runtime::events::{CoreEvent, EventBus, InjectionEvent};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use tokio::sync::{watch, RwLock};
use tracing::{debug, warn};

struct JobEntry {
    kind: JobKind,
    history: watch::Sender<Vec<JobUpdate>>,
}

impl JobEntry {
    fn latest(&self) -> Option<JobUpdate> {
        self.history.borrow().last().cloned()
    }
}

pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, JobEntry>>,
    event_bus: EventBus,
}

impl JobRegistry {
    pub fn new(event_bus: EventBus) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            event_bus,
        }
    }

    /// Create a job in `Queued`.
    pub async fn register(&self, kind: JobKind) -> JobHandle {
        let handle = JobHandle {
            id: JobId::new(),
            kind,
        };
        let queued = JobUpdate {
            job_id: handle.id,
            status: JobStatus::Queued,
            message: format!("Queued {}", kind),
            at: chrono::Utc::now(),
            outcome: None,
        };
        let (history, _) = watch::channel(vec![queued]);
        self.jobs
            .write()
            .await
            .insert(handle.id, JobEntry { kind, history });

        self.event_bus
            .emit(CoreEvent::Injection(InjectionEvent::JobQueued {
                job_id: handle.id.to_string(),
                kind: kind.as_str().to_string(),
            }))
            .ok();
        handle
    }

    /// Move a job to a non-terminal status.
    ///
    /// Transitions the state machine does not allow are logged and dropped.
    pub async fn advance(&self, id: JobId, status: JobStatus, message: impl Into<String>) {
        debug_assert!(!status.is_terminal());
        let message = message.into();
        if self.push(id, status, message.clone(), None).await {
            self.event_bus
                .emit(CoreEvent::Injection(InjectionEvent::JobStatusChanged {
                    job_id: id.to_string(),
                    status: status.as_str().to_string(),
                    message,
                }))
                .ok();
        }
    }

    /// Record the terminal outcome of a job.
    pub async fn finish(&self, id: JobId, outcome: JobOutcome) {
        let status = if outcome.is_success() {
            JobStatus::Done
        } else {
            JobStatus::Failed
        };
        let message = outcome.reason();
        if !self
            .push(id, status, message.clone(), Some(outcome.clone()))
            .await
        {
            return;
        }

        let event = match &outcome {
            JobOutcome::Failed { unsafe_state, .. } => InjectionEvent::JobFailed {
                job_id: id.to_string(),
                message,
                unsafe_state: *unsafe_state,
            },
            other => InjectionEvent::JobCompleted {
                job_id: id.to_string(),
                fingerprint: other.fingerprint().map(str::to_string),
                duplicate: other.is_duplicate(),
                message,
            },
        };
        self.event_bus.emit(CoreEvent::Injection(event)).ok();
    }

    async fn push(
        &self,
        id: JobId,
        status: JobStatus,
        message: String,
        outcome: Option<JobOutcome>,
    ) -> bool {
        let jobs = self.jobs.read().await;
        let Some(entry) = jobs.get(&id) else {
            warn!(job_id = %id, status = %status, "Update for unknown job dropped");
            return false;
        };

        let mut accepted = false;
        entry.history.send_modify(|history| {
            let current = history.last().map(|u| u.status).unwrap_or(JobStatus::Queued);
            if !current.can_transition_to(status) {
                return;
            }
            history.push(JobUpdate {
                job_id: id,
                status,
                message,
                at: chrono::Utc::now(),
                outcome,
            });
            accepted = true;
        });

        if accepted {
            debug!(job_id = %id, status = %status, "Job status changed");
        } else {
            warn!(job_id = %id, status = %status, "Rejected job status transition");
        }
        accepted
    }

    pub async fn status(&self, id: JobId) -> Option<JobStatus> {
        let jobs = self.jobs.read().await;
        jobs.get(&id).and_then(|e| e.latest()).map(|u| u.status)
    }

    pub async fn kind(&self, id: JobId) -> Option<JobKind> {
        self.jobs.read().await.get(&id).map(|e| e.kind)
    }

    /// Full update history so far.
    pub async fn history(&self, id: JobId) -> Option<Vec<JobUpdate>> {
        let jobs = self.jobs.read().await;
        jobs.get(&id).map(|e| e.history.borrow().clone())
    }

    /// Ids of jobs that have not reached a terminal status.
    pub async fn active_jobs(&self) -> Vec<JobId> {
        let jobs = self.jobs.read().await;
        jobs.iter()
            .filter(|(_, entry)| entry.latest().map_or(false, |u| !u.is_terminal()))
            .map(|(id, _)| *id)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Finite stream of every update for the job, ending after the terminal one.
    pub async fn observe(&self, handle: &JobHandle) -> Result<BoxStream<'static, JobUpdate>> {
        let receiver = {
            let jobs = self.jobs.read().await;
            jobs.get(&handle.id)
                .map(|e| e.history.subscribe())
                .ok_or_else(|| InjectionError::UnknownJob(handle.id.to_string()))?
        };

        let updates = stream::unfold(
            (receiver, 0usize, false),
            |(mut receiver, next, finished)| async move {
                if finished {
                    return None;
                }
                loop {
                    let pending = receiver.borrow_and_update().get(next).cloned();
                    if let Some(update) = pending {
                        let terminal = update.is_terminal();
                        return Some((update, (receiver, next + 1, terminal)));
                    }
                    if receiver.changed().await.is_err() {
                        // Acknowledged while observed; drain what was recorded.
                        let last = receiver.borrow().get(next).cloned();
                        return last.map(|update| {
                            let terminal = update.is_terminal();
                            (update, (receiver, next + 1, terminal))
                        });
                    }
                }
            },
        );
        Ok(updates.boxed())
    }

    /// Wait for the job to finish and return its outcome.
    pub async fn wait(&self, handle: &JobHandle) -> Result<JobOutcome> {
        let mut updates = self.observe(handle).await?;
        let mut outcome = None;
        while let Some(update) = updates.next().await {
            if update.outcome.is_some() {
                outcome = update.outcome;
            }
        }
        outcome.ok_or_else(|| InjectionError::Internal(format!("job {} ended without outcome", handle.id)))
    }

    /// Remove a finished job and return its outcome.
    pub async fn acknowledge(&self, handle: &JobHandle) -> Result<JobOutcome> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs
            .get(&handle.id)
            .ok_or_else(|| InjectionError::UnknownJob(handle.id.to_string()))?;

        let outcome = entry
            .latest()
            .and_then(|u| u.outcome)
            .ok_or_else(|| InjectionError::JobNotFinished(handle.id.to_string()))?;
        jobs.remove(&handle.id);
        Ok(outcome)
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_runtime::events::EventBus;
    use std::sync::Arc;

    fn registry() -> (JobRegistry, EventBus) {
        let bus = EventBus::new(32);
        (JobRegistry::new(bus.clone()), bus)
    }

    #[tokio::test]
    async fn test_observe_replays_history_and_ends() {
        let (registry, _bus) = registry();
        let handle = registry.register(JobKind::PlaylistOp).await;
        registry.advance(handle.id, JobStatus::Committing, "Writing").await;
        registry
            .finish(
                handle.id,
                JobOutcome::PlaylistUpdated {
                    playlist: "Road".into(),
                    operations: 2,
                },
            )
            .await;

        let statuses: Vec<JobStatus> = registry
            .observe(&handle)
            .await
            .unwrap()
            .map(|u| u.status)
            .collect()
            .await;
        assert_eq!(
            statuses,
            vec![JobStatus::Queued, JobStatus::Committing, JobStatus::Done]
        );
    }

    #[tokio::test]
    async fn test_invalid_transition_is_dropped() {
        let (registry, _bus) = registry();
        let handle = registry.register(JobKind::Song).await;

        registry.advance(handle.id, JobStatus::ResolvingMetadata, "skip").await;

        assert_eq!(registry.status(handle.id).await, Some(JobStatus::Queued));
        assert_eq!(registry.history(handle.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_acknowledge_requires_terminal_status() {
        let (registry, _bus) = registry();
        let handle = registry.register(JobKind::Song).await;

        let err = registry.acknowledge(&handle).await.unwrap_err();
        assert!(matches!(err, InjectionError::JobNotFinished(_)));

        registry
            .finish(
                handle.id,
                JobOutcome::Failed {
                    error: InjectionError::Cancelled,
                    unsafe_state: false,
                },
            )
            .await;
        let outcome = registry.acknowledge(&handle).await.unwrap();
        assert_eq!(outcome.error(), Some(&InjectionError::Cancelled));
        assert!(registry.is_empty().await);

        let err = registry.acknowledge(&handle).await.unwrap_err();
        assert!(matches!(err, InjectionError::UnknownJob(_)));
    }

    #[tokio::test]
    async fn test_finish_emits_completion_event() {
        let (registry, bus) = registry();
        let mut rx = bus.subscribe();
        let handle = registry.register(JobKind::Song).await;
        registry.advance(handle.id, JobStatus::Converting, "Converting").await;
        registry
            .finish(
                handle.id,
                JobOutcome::Duplicate {
                    fingerprint: "ff00".into(),
                },
            )
            .await;

        let mut events = Vec::new();
        while let Ok(CoreEvent::Injection(event)) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events[0], InjectionEvent::JobQueued { .. }));
        assert!(matches!(
            &events[2],
            InjectionEvent::JobCompleted { fingerprint: Some(fp), duplicate: true, .. } if fp == "ff00"
        ));
        assert!(registry.active_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_wait_resolves_when_job_finishes() {
        let (registry, _bus) = registry();
        let registry = Arc::new(registry);
        let handle = registry.register(JobKind::PlaylistOp).await;

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait(&handle).await })
        };
        tokio::task::yield_now().await;
        registry.advance(handle.id, JobStatus::Committing, "Writing").await;
        registry
            .finish(
                handle.id,
                JobOutcome::PlaylistUpdated {
                    playlist: "A".into(),
                    operations: 0,
                },
            )
            .await;

        let outcome = waiter.await.unwrap().unwrap();
        assert!(outcome.is_success());
    }
}
