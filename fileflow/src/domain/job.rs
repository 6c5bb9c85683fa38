//! Job lifecycle types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::ErrorKind;

pub type JobId = String;
pub type UserId = i64;

/// Lifecycle status of a job.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Admitted and waiting for a slot.
    Queued,
    /// A pipeline execution is in flight.
    Running,
    Succeeded,
    Failed,
    /// Cancelled by the caller. Terminal, never retried.
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Forward transitions plus the explicit `failed -> queued` retry path.
    ///
    /// Crash recovery moves `running` back to `queued` outside of this table.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Cancelled)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
                | (Self::Failed, Self::Queued)
        )
    }
}

/// One ordered phase of the job pipeline.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Fetch,
    Extract,
    Name,
    Thumbnail,
    Deliver,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Fetch,
        Stage::Extract,
        Stage::Name,
        Stage::Thumbnail,
        Stage::Deliver,
    ];

    /// Phase label shown to users.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Fetch => "Downloading",
            Self::Extract => "Reading metadata",
            Self::Name => "Renaming",
            Self::Thumbnail => "Preparing thumbnail",
            Self::Deliver => "Uploading",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Extract => "extract",
            Self::Name => "name",
            Self::Thumbnail => "thumbnail",
            Self::Deliver => "deliver",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|stage| stage.as_str() == s)
    }
}

/// Where the job's content comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceRef {
    /// A file already staged by the transport layer, addressed by handle.
    Upload { handle: String },
    /// A remote HTTP(S) resource.
    Url { url: String },
}

impl SourceRef {
    pub fn upload(handle: impl Into<String>) -> Self {
        Self::Upload {
            handle: handle.into(),
        }
    }

    pub fn url(url: impl Into<String>) -> Self {
        Self::Url { url: url.into() }
    }

    /// Best-effort file name taken from the reference itself.
    pub fn name_hint(&self) -> Option<String> {
        match self {
            Self::Upload { handle } => handle
                .rsplit(['/', '\\'])
                .next()
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            Self::Url { url } => url::Url::parse(url).ok().and_then(|u| {
                u.path_segments()
                    .and_then(|segments| segments.last().map(str::to_string))
                    .filter(|s| !s.is_empty())
            }),
        }
    }
}

impl std::fmt::Display for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upload { handle } => write!(f, "upload:{handle}"),
            Self::Url { url } => write!(f, "{url}"),
        }
    }
}

/// What a collaborator submits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub user_id: UserId,
    pub source: SourceRef,
    /// Name the user's client declared for the file.
    #[serde(default)]
    pub original_name: Option<String>,
    #[serde(default)]
    pub mime_hint: Option<String>,
    /// Per-job pattern, overriding the user's saved one.
    #[serde(default)]
    pub pattern: Option<String>,
    /// One-shot thumbnail for this job only.
    #[serde(default)]
    pub thumbnail: Option<PathBuf>,
    /// Destination chat or folder. Interpreted by the delivery sink.
    #[serde(default)]
    pub destination: String,
}

impl JobSpec {
    pub fn new(user_id: UserId, source: SourceRef) -> Self {
        Self {
            user_id,
            source,
            original_name: None,
            mime_hint: None,
            pattern: None,
            thumbnail: None,
            destination: String::new(),
        }
    }

    pub fn with_original_name(mut self, name: impl Into<String>) -> Self {
        self.original_name = Some(name.into());
        self
    }

    pub fn with_mime_hint(mut self, mime: impl Into<String>) -> Self {
        self.mime_hint = Some(mime.into());
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn with_thumbnail(mut self, path: impl Into<PathBuf>) -> Self {
        self.thumbnail = Some(path.into());
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = destination.into();
        self
    }

    /// Declared name, else one derived from the source reference.
    pub fn display_name(&self) -> String {
        self.original_name
            .clone()
            .or_else(|| self.source.name_hint())
            .unwrap_or_else(|| "file".to_string())
    }
}

/// Error detail attached to a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

/// One requested file transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub user_id: UserId,
    pub spec: JobSpec,
    pub stage: Option<Stage>,
    pub status: JobStatus,
    pub retry_count: u32,
    /// Position in the global dispatch order, set when the job starts.
    pub dispatch_seq: Option<u64>,
    pub filename: Option<String>,
    pub remote_ref: Option<String>,
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(spec: JobSpec) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: spec.user_id,
            spec,
            stage: None,
            status: JobStatus::Queued,
            retry_count: 0,
            dispatch_seq: None,
            filename: None,
            remote_ref: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Queued or running.
    pub fn is_outstanding(&self) -> bool {
        !self.is_terminal()
    }
}
