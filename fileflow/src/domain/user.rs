use serde::{Deserialize, Serialize};

use super::UserId;

/// Identity of a user as known to the preference store.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub username: Option<String>,
    pub display_name: Option<String>,
}

impl UserProfile {
    pub fn anonymous(user_id: UserId) -> Self {
        Self {
            user_id,
            ..Default::default()
        }
    }

    /// Display name, else username, else the numeric id.
    pub fn display(&self) -> String {
        self.display_name
            .as_deref()
            .or(self.username.as_deref())
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.user_id.to_string())
    }
}
