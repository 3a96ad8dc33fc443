//! # Injection Job Model
//!
//! ## State Machine
//!
//! ```text
//! Queued ──> Converting ──> ResolvingMetadata ──> Committing ──> Done
//!   │            │  └──(already on device)──────────────────────> Done
//!   │            │               │                    │
//!   └────────────┴───────────────┴────────────────────┴────────> Failed
//!
//! Playlist jobs skip straight from Queued to Committing.
//! ```

use crate::error::InjectionError;
use bridge_traits::{MediaKind, MediaRecord, PlaylistOperation};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// ID Types
// ============================================================================

/// Unique identifier for an injection job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, InjectionError> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| InjectionError::UnknownJob(s.to_string()))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Kind and Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Song,
    Ringtone,
    PlaylistOp,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Song => "song",
            JobKind::Ringtone => "ringtone",
            JobKind::PlaylistOp => "playlist_op",
        }
    }

    pub fn media_kind(&self) -> Option<MediaKind> {
        match self {
            JobKind::Song => Some(MediaKind::Song),
            JobKind::Ringtone => Some(MediaKind::Ringtone),
            JobKind::PlaylistOp => None,
        }
    }
}

impl From<MediaKind> for JobKind {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Song => JobKind::Song,
            MediaKind::Ringtone => JobKind::Ringtone,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Converting,
    ResolvingMetadata,
    Committing,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Converting => "converting",
            JobStatus::ResolvingMetadata => "resolving_metadata",
            JobStatus::Committing => "committing",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (_, Failed) => !self.is_terminal(),
            (Queued, Converting) | (Queued, Committing) => true,
            (Converting, ResolvingMetadata) | (Converting, Done) => true,
            (ResolvingMetadata, Committing) => true,
            (Committing, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "converting" => Ok(JobStatus::Converting),
            "resolving_metadata" => Ok(JobStatus::ResolvingMetadata),
            "committing" => Ok(JobStatus::Committing),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("Unknown job status: {}", other)),
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

/// A song or ringtone to inject.
#[derive(Clone)]
pub struct MediaSubmission {
    pub kind: MediaKind,
    pub payload: Bytes,
    /// Submitted file name; its extension is a container hint and its stem
    /// the fallback title.
    pub file_name: Option<String>,
    pub title: Option<String>,
    pub artist: Option<String>,
}

impl fmt::Debug for MediaSubmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaSubmission")
            .field("kind", &self.kind)
            .field("payload", &format_args!("{} bytes", self.payload.len()))
            .field("file_name", &self.file_name)
            .field("title", &self.title)
            .field("artist", &self.artist)
            .finish()
    }
}

/// Work submitted to the pipeline.
#[derive(Debug, Clone)]
pub enum InjectionRequest {
    Media(MediaSubmission),
    Playlist {
        playlist: String,
        operations: Vec<PlaylistOperation>,
    },
}

impl InjectionRequest {
    pub fn song(payload: impl Into<Bytes>, file_name: Option<&str>) -> Self {
        Self::media(MediaKind::Song, payload, file_name)
    }

    pub fn ringtone(payload: impl Into<Bytes>, file_name: Option<&str>) -> Self {
        Self::media(MediaKind::Ringtone, payload, file_name)
    }

    pub fn media(kind: MediaKind, payload: impl Into<Bytes>, file_name: Option<&str>) -> Self {
        InjectionRequest::Media(MediaSubmission {
            kind,
            payload: payload.into(),
            file_name: file_name.map(str::to_string),
            title: None,
            artist: None,
        })
    }

    pub fn playlist(playlist: impl Into<String>, operations: Vec<PlaylistOperation>) -> Self {
        InjectionRequest::Playlist {
            playlist: playlist.into(),
            operations,
        }
    }

    /// Title hint for metadata resolution. Ignored for playlist requests.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        if let InjectionRequest::Media(media) = &mut self {
            media.title = Some(title.into());
        }
        self
    }

    /// Artist hint for metadata resolution. Ignored for playlist requests.
    pub fn with_artist(mut self, artist: impl Into<String>) -> Self {
        if let InjectionRequest::Media(media) = &mut self {
            media.artist = Some(artist.into());
        }
        self
    }

    pub fn kind(&self) -> JobKind {
        match self {
            InjectionRequest::Media(media) => media.kind.into(),
            InjectionRequest::Playlist { .. } => JobKind::PlaylistOp,
        }
    }
}

/// Returned by `submit`; identifies the job for observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobHandle {
    pub id: JobId,
    pub kind: JobKind,
}

// ============================================================================
// Progress and Outcome
// ============================================================================

/// Terminal result of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// A new record was written to the device library.
    Committed(MediaRecord),
    /// The device already had a record with this fingerprint.
    Duplicate { fingerprint: String },
    PlaylistUpdated { playlist: String, operations: usize },
    /// `unsafe_state` is set when rollback could not be confirmed and the
    /// device library may need manual verification.
    Failed {
        error: InjectionError,
        unsafe_state: bool,
    },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, JobOutcome::Failed { .. })
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, JobOutcome::Duplicate { .. })
    }

    pub fn fingerprint(&self) -> Option<&str> {
        match self {
            JobOutcome::Committed(record) => Some(&record.fingerprint),
            JobOutcome::Duplicate { fingerprint } => Some(fingerprint),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&InjectionError> {
        match self {
            JobOutcome::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Human-readable reason shown for the terminal state.
    pub fn reason(&self) -> String {
        match self {
            JobOutcome::Committed(record) => {
                format!("Added \"{}\" to the device library", record.metadata.title)
            }
            JobOutcome::Duplicate { .. } => "Duplicate, skipped: already on the device".to_string(),
            JobOutcome::PlaylistUpdated {
                playlist,
                operations,
            } => format!("Applied {} change(s) to playlist {}", operations, playlist),
            JobOutcome::Failed {
                error,
                unsafe_state: true,
            } => format!(
                "{}. The device library could not be verified; check it manually",
                error
            ),
            JobOutcome::Failed { error, .. } => error.to_string(),
        }
    }
}

/// One observed status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobUpdate {
    pub job_id: JobId,
    pub status: JobStatus,
    pub message: String,
    pub at: DateTime<Utc>,
    /// Set on the terminal update only.
    pub outcome: Option<JobOutcome>,
}

impl JobUpdate {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
