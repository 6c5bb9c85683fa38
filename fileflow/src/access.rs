//! Authorization check consulted before a job is admitted.

use async_trait::async_trait;
use std::collections::HashSet;

use crate::domain::UserId;

#[async_trait]
pub trait AccessGate: Send + Sync {
    async fn is_allowed(&self, user_id: UserId) -> bool;
}

/// Gate configured up front: everyone, or a fixed allow list.
#[derive(Debug, Clone, Default)]
pub struct StaticAccessGate {
    allowed: Option<HashSet<UserId>>,
}

impl StaticAccessGate {
    pub fn allow_all() -> Self {
        Self { allowed: None }
    }

    pub fn allow_only(users: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            allowed: Some(users.into_iter().collect()),
        }
    }
}

#[async_trait]
impl AccessGate for StaticAccessGate {
    async fn is_allowed(&self, user_id: UserId) -> bool {
        self.allowed
            .as_ref()
            .is_none_or(|allowed| allowed.contains(&user_id))
    }
}
