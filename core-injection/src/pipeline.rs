//! # Media Injection Pipeline
//!
//! Accepts song, ringtone and playlist jobs and drives each one to a terminal
//! state without blocking the caller.
//!
//! ## Stages
//!
//! 1. **Converting**: normalize the payload and compute its fingerprint.
//!    A quick library check marks already-present items as duplicates.
//! 2. **ResolvingMetadata**: best-effort lookup; a miss falls back to the
//!    submitted title or the file name.
//! 3. **Committing**: serialized device write with rollback (see `commit`).
//!
//! Stages 1 and 2 run on at most `max_workers` jobs at once. Commits wait for
//! an `Active` session; a job that has not started committing when the session
//! drops is parked until the session comes back.

use crate::commit::{CommitPlan, Committer};
use crate::error::{InjectionError, Result};
use crate::job::{
    InjectionRequest, JobHandle, JobId, JobOutcome, JobStatus, JobUpdate, MediaSubmission,
};
use crate::registry::JobRegistry;
use bridge_traits::{MediaRecord, RecordMetadata};
use core_media::{FormatConverter, NormalizedPayload};
use core_metadata::{MetadataQuery, MetadataResolver};
use core_pairing::PairingSessionManager;
use core_runtime::config::InjectionConfig;
use core_runtime::events::EventBus;
use futures::stream::BoxStream;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

const UNTITLED: &str = "Untitled";

struct Stages {
    manager: Arc<PairingSessionManager>,
    converter: Arc<FormatConverter>,
    resolver: Arc<MetadataResolver>,
    registry: Arc<JobRegistry>,
    committer: Committer,
    workers: Arc<Semaphore>,
    shutdown: CancellationToken,
}

pub struct MediaInjectionPipeline {
    stages: Arc<Stages>,
    tasks: TaskTracker,
}

impl MediaInjectionPipeline {
    pub fn new(
        manager: Arc<PairingSessionManager>,
        converter: Arc<FormatConverter>,
        resolver: Arc<MetadataResolver>,
        event_bus: EventBus,
        config: &InjectionConfig,
    ) -> Self {
        let registry = Arc::new(JobRegistry::new(event_bus));
        let shutdown = CancellationToken::new();
        let committer = Committer::new(
            Arc::clone(&manager),
            Arc::clone(&registry),
            config.commit_attempts,
            config.commit_backoff,
            shutdown.clone(),
        );

        Self {
            stages: Arc::new(Stages {
                manager,
                converter,
                resolver,
                registry,
                committer,
                workers: Arc::new(Semaphore::new(config.max_workers)),
                shutdown,
            }),
            tasks: TaskTracker::new(),
        }
    }

    /// Enqueue a job and return immediately.
    ///
    /// After `shutdown` the job is registered and failed with `Cancelled`.
    pub async fn submit(&self, request: InjectionRequest) -> JobHandle {
        let handle = self.stages.registry.register(request.kind()).await;
        debug!(job_id = %handle.id, kind = %handle.kind, "Job submitted");

        if self.stages.shutdown.is_cancelled() {
            self.stages
                .registry
                .finish(
                    handle.id,
                    JobOutcome::Failed {
                        error: InjectionError::Cancelled,
                        unsafe_state: false,
                    },
                )
                .await;
            return handle;
        }

        let stages = Arc::clone(&self.stages);
        self.tasks.spawn(async move {
            let outcome = stages.run(handle.id, request).await;
            stages.registry.finish(handle.id, outcome).await;
        });
        handle
    }

    /// Stream of status transitions for the job, ending at `Done` or `Failed`.
    pub async fn observe(&self, handle: &JobHandle) -> Result<BoxStream<'static, JobUpdate>> {
        self.stages.registry.observe(handle).await
    }

    pub async fn wait(&self, handle: &JobHandle) -> Result<JobOutcome> {
        self.stages.registry.wait(handle).await
    }

    /// Release a finished job from the registry.
    pub async fn acknowledge(&self, handle: &JobHandle) -> Result<JobOutcome> {
        self.stages.registry.acknowledge(handle).await
    }

    pub async fn status(&self, handle: &JobHandle) -> Option<JobStatus> {
        self.stages.registry.status(handle.id).await
    }

    pub async fn active_jobs(&self) -> Vec<JobId> {
        self.stages.registry.active_jobs().await
    }

    /// Number of interrupted writes still awaiting compensation on the device.
    pub async fn pending_compensations(&self) -> usize {
        self.stages.committer.orphaned_logs().await
    }

    /// Stop accepting work and wait for running jobs to settle.
    ///
    /// Jobs that are queued or waiting for a session fail with `Cancelled`.
    /// A write already under way is finished or rolled back first.
    pub async fn shutdown(&self) {
        info!("Shutting down injection pipeline");
        self.stages.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

impl Stages {
    async fn run(&self, id: JobId, request: InjectionRequest) -> JobOutcome {
        match request {
            InjectionRequest::Media(media) => self.run_media(id, media).await,
            InjectionRequest::Playlist {
                playlist,
                operations,
            } => {
                self.committer
                    .commit(
                        id,
                        CommitPlan::Playlist {
                            playlist,
                            operations,
                        },
                    )
                    .await
            }
        }
    }

    #[instrument(skip(self, media), fields(job_id = %id, kind = %media.kind))]
    async fn run_media(&self, id: JobId, media: MediaSubmission) -> JobOutcome {
        let permit = tokio::select! {
            _ = self.shutdown.cancelled() => return failed(InjectionError::Cancelled),
            permit = Arc::clone(&self.workers).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(e) => return failed(InjectionError::Internal(e.to_string())),
            },
        };

        self.registry
            .advance(id, JobStatus::Converting, "Converting audio")
            .await;
        let normalized = match self
            .converter
            .convert(media.payload.clone(), media.file_name.clone(), media.kind)
            .await
        {
            Ok(normalized) => normalized,
            Err(e) => {
                warn!(error = %e, "Conversion failed");
                return failed(e.into());
            }
        };

        if self.already_on_device(&normalized.fingerprint).await {
            return JobOutcome::Duplicate {
                fingerprint: normalized.fingerprint,
            };
        }

        self.registry
            .advance(id, JobStatus::ResolvingMetadata, "Looking up track details")
            .await;
        let metadata = self.resolve_metadata(&media, &normalized).await;
        drop(permit);

        let record = MediaRecord {
            fingerprint: normalized.fingerprint.clone(),
            kind: normalized.kind,
            metadata,
            locator: normalized.locator(),
            duration_ms: normalized.duration_ms(),
        };
        self.committer
            .commit(
                id,
                CommitPlan::Media {
                    record,
                    bytes: normalized.bytes,
                },
            )
            .await
    }

    /// Opportunistic duplicate check; the commit re-checks under the lock.
    async fn already_on_device(&self, fingerprint: &str) -> bool {
        let Some(session) = self.manager.current_session().await else {
            return false;
        };
        if session.is_closed() {
            return false;
        }
        match self
            .manager
            .transport()
            .list_library_fingerprints(session.handle())
            .await
        {
            Ok(library) => library.contains(fingerprint),
            Err(e) => {
                debug!(error = %e, "Early duplicate check skipped");
                false
            }
        }
    }

    async fn resolve_metadata(
        &self,
        media: &MediaSubmission,
        normalized: &NormalizedPayload,
    ) -> RecordMetadata {
        let mut query = MetadataQuery::new(normalized.fingerprint.clone());
        if let Some(title) = &media.title {
            query = query.with_title(title.clone());
        }
        if let Some(artist) = &media.artist {
            query = query.with_artist(artist.clone());
        }

        let result = self.resolver.resolve(&query).await;
        match result.metadata {
            Some(found) => RecordMetadata {
                title: found.title,
                artist: found.artist.or_else(|| query.artist().map(str::to_string)),
                album: found.album,
                artwork_url: found.artwork_url,
            },
            None => RecordMetadata {
                title: fallback_title(media),
                artist: query.artist().map(str::to_string),
                album: None,
                artwork_url: None,
            },
        }
    }
}

/// Submitted title, else the file stem, else a placeholder.
fn fallback_title(media: &MediaSubmission) -> String {
    media
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .or_else(|| {
            media
                .file_name
                .as_deref()
                .and_then(|name| Path::new(name).file_stem())
                .and_then(|stem| stem.to_str())
                .map(str::trim)
                .filter(|stem| !stem.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| UNTITLED.to_string())
}

fn failed(error: InjectionError) -> JobOutcome {
    JobOutcome::Failed {
        error,
        unsafe_state: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::MediaKind;
    use bytes::Bytes;

    fn submission(file_name: Option<&str>, title: Option<&str>) -> MediaSubmission {
        MediaSubmission {
            kind: MediaKind::Song,
            payload: Bytes::new(),
            file_name: file_name.map(str::to_string),
            title: title.map(str::to_string),
            artist: None,
        }
    }

    #[test]
    fn test_fallback_title_prefers_submitted_title() {
        assert_eq!(
            fallback_title(&submission(Some("track01.mp3"), Some(" Intro "))),
            "Intro"
        );
    }

    #[test]
    fn test_fallback_title_uses_file_stem() {
        assert_eq!(
            fallback_title(&submission(Some("/tmp/Summer Mix.flac"), None)),
            "Summer Mix"
        );
        assert_eq!(fallback_title(&submission(Some("  "), Some(""))), UNTITLED);
        assert_eq!(fallback_title(&submission(None, None)), UNTITLED);
    }
}
