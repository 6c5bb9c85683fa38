//! Execution capacity: a global semaphore plus per-user counts.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use crate::domain::UserId;

/// Snapshot of slot usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SlotUsage {
    pub global: usize,
    pub global_limit: usize,
    pub per_user: HashMap<UserId, usize>,
}

pub struct SlotPool {
    global: Arc<Semaphore>,
    global_limit: usize,
    per_user_limit: usize,
    per_user: Arc<Mutex<HashMap<UserId, usize>>>,
    /// Woken whenever a slot is released.
    notify: Arc<Notify>,
}

impl SlotPool {
    pub fn new(global_limit: usize, per_user_limit: usize, notify: Arc<Notify>) -> Self {
        Self {
            global: Arc::new(Semaphore::new(global_limit)),
            global_limit,
            per_user_limit,
            per_user: Arc::new(Mutex::new(HashMap::new())),
            notify,
        }
    }

    pub fn global_available(&self) -> bool {
        self.global.available_permits() > 0
    }

    pub fn user_has_capacity(&self, user_id: UserId) -> bool {
        self.per_user.lock().get(&user_id).copied().unwrap_or(0) < self.per_user_limit
    }

    /// Take one global and one per-user slot, or neither.
    pub fn try_acquire(&self, user_id: UserId) -> Option<QueueSlot> {
        let mut per_user = self.per_user.lock();
        let used = per_user.get(&user_id).copied().unwrap_or(0);
        if used >= self.per_user_limit {
            return None;
        }
        let permit = self.global.clone().try_acquire_owned().ok()?;
        per_user.insert(user_id, used + 1);

        Some(QueueSlot {
            user_id,
            permit: Some(permit),
            per_user: self.per_user.clone(),
            notify: self.notify.clone(),
        })
    }

    pub fn usage(&self) -> SlotUsage {
        SlotUsage {
            global: self.global_limit - self.global.available_permits(),
            global_limit: self.global_limit,
            per_user: self.per_user.lock().clone(),
        }
    }
}

/// RAII guard for one execution slot. Dropping it releases both levels.
pub struct QueueSlot {
    user_id: UserId,
    permit: Option<OwnedSemaphorePermit>,
    per_user: Arc<Mutex<HashMap<UserId, usize>>>,
    notify: Arc<Notify>,
}

impl QueueSlot {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }
}

impl std::fmt::Debug for QueueSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueSlot")
            .field("user_id", &self.user_id)
            .finish()
    }
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        {
            let mut per_user = self.per_user.lock();
            if let Some(used) = per_user.get_mut(&self.user_id) {
                *used = used.saturating_sub(1);
                if *used == 0 {
                    per_user.remove(&self.user_id);
                }
            }
        }
        drop(self.permit.take());
        self.notify.notify_one();
    }
}
