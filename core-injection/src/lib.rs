//! # Injection Module
//!
//! Moves songs, ringtones and playlist changes onto the paired device.
//!
//! ## Overview
//!
//! - [`MediaInjectionPipeline`] converts, deduplicates, enriches and commits
//!   submitted media as asynchronous jobs
//! - [`PlaylistSynchronizer`] reconciles playlist definitions with the device
//!   through the same pipeline
//!
//! Device writes are serialized on the session's commit lock and made atomic
//! with a write-ahead list of applied steps plus compensating rollback.
//!
//! ## Observing jobs
//!
//! ```ignore
//! let handle = pipeline.submit(InjectionRequest::song(bytes, Some("intro.mp3"))).await;
//! let mut updates = pipeline.observe(&handle).await?;
//! while let Some(update) = updates.next().await {
//!     println!("{}: {}", update.status, update.message);
//! }
//! ```

mod commit;
pub mod error;
pub mod job;
mod journal;
pub mod pipeline;
pub mod playlist;
pub mod registry;
pub mod synchronizer;

pub use error::{InjectionError, Result, SyncError, SyncResult};
pub use job::{
    InjectionRequest, JobHandle, JobId, JobKind, JobOutcome, JobStatus, JobUpdate,
    MediaSubmission,
};
pub use pipeline::MediaInjectionPipeline;
pub use playlist::{diff, PlaylistDefinition, PlaylistDiff};
pub use registry::JobRegistry;
pub use synchronizer::{PlaylistSynchronizer, ReconcileReport};
