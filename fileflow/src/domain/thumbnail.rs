use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How long a thumbnail stays attached to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ThumbnailScope {
    /// Stored in the user's preferences, reused for every job.
    Permanent,
    /// Valid for a single job.
    Ephemeral,
}

/// A stored thumbnail image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailRef {
    pub path: PathBuf,
    pub scope: ThumbnailScope,
}

impl ThumbnailRef {
    pub fn permanent(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            scope: ThumbnailScope::Permanent,
        }
    }

    pub fn ephemeral(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            scope: ThumbnailScope::Ephemeral,
        }
    }
}
