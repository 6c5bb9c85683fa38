//! User preference models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Per-user preferences read by the naming engine and thumbnail resolver.
#[derive(Debug, Clone, Default, FromRow, Serialize, Deserialize)]
pub struct UserPreferencesDbModel {
    pub user_id: i64,
    pub username: Option<String>,
    pub display_name: Option<String>,
    /// Template text of the pattern currently in use
    pub active_pattern: Option<String>,
    /// Saved pattern the active template came from, if any
    pub active_pattern_name: Option<String>,
    /// Path of the stored permanent thumbnail
    pub permanent_thumbnail: Option<String>,
    /// One-shot thumbnail for the next job, and when it was set
    pub next_thumbnail: Option<String>,
    pub next_thumbnail_set_at: Option<String>,
    pub updated_at: String,
}

/// A named pattern saved by a user.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct RenamePatternDbModel {
    pub user_id: i64,
    pub name: String,
    pub template: String,
    /// Times a job was named with this pattern.
    pub usage_count: i64,
    pub last_used_at: Option<String>,
    pub created_at: String,
}

impl RenamePatternDbModel {
    pub fn new(user_id: i64, name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            user_id,
            name: name.into(),
            template: template.into(),
            usage_count: 0,
            last_used_at: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}
