//! Job progress events.
//!
//! Every stage transition is published. Within one stage, events are
//! throttled to one per `min_interval` so chunk loops can report freely.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use crate::domain::{JobId, Stage, UserId};

const PROGRESS_CHANNEL_CAPACITY: usize = 256;

/// One progress update for a running job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub user_id: UserId,
    pub phase: Stage,
    /// Completion of the current phase in `[0, 1]`.
    pub fraction: f64,
    pub label: String,
}

/// Fan-out point for progress events plus the latest snapshot per job.
pub struct ProgressHub {
    tx: broadcast::Sender<ProgressEvent>,
    latest: DashMap<JobId, ProgressEvent>,
    min_interval: Duration,
}

impl ProgressHub {
    pub fn new(min_interval: Duration) -> Self {
        let (tx, _rx) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        Self {
            tx,
            latest: DashMap::new(),
            min_interval,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    /// Last event published for a job, if it is still running.
    pub fn latest(&self, job_id: &str) -> Option<ProgressEvent> {
        self.latest.get(job_id).map(|e| e.value().clone())
    }

    /// Forget a job's snapshot once it has finished.
    pub fn clear(&self, job_id: &str) {
        self.latest.remove(job_id);
    }

    pub fn reporter(self: &Arc<Self>, job_id: impl Into<JobId>, user_id: UserId) -> ProgressReporter {
        ProgressReporter {
            job_id: job_id.into(),
            user_id,
            hub: Some(self.clone()),
            state: Mutex::new(ReporterState::default()),
        }
    }

    fn publish(&self, event: ProgressEvent) {
        self.latest.insert(event.job_id.clone(), event.clone());
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

#[derive(Debug, Default)]
struct ReporterState {
    stage: Option<Stage>,
    last_emit: Option<Instant>,
}

/// Per-job handle the pipeline reports through.
pub struct ProgressReporter {
    job_id: JobId,
    user_id: UserId,
    hub: Option<Arc<ProgressHub>>,
    state: Mutex<ReporterState>,
}

impl ProgressReporter {
    /// A reporter that drops everything.
    pub fn noop(job_id: impl Into<JobId>) -> Self {
        Self {
            job_id: job_id.into(),
            user_id: 0,
            hub: None,
            state: Mutex::new(ReporterState::default()),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Announce entry into `stage`. Always published.
    pub fn stage(&self, stage: Stage) {
        self.report(stage, 0.0);
    }

    /// Report `fraction` of `stage` done.
    pub fn report(&self, stage: Stage, fraction: f64) {
        let Some(hub) = &self.hub else {
            return;
        };

        let now = Instant::now();
        {
            let mut state = self.state.lock();
            let transition = state.stage != Some(stage);
            let due = state
                .last_emit
                .is_none_or(|last| now.duration_since(last) >= hub.min_interval);
            if !transition && !due {
                return;
            }
            state.stage = Some(stage);
            state.last_emit = Some(now);
        }

        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        hub.publish(ProgressEvent {
            job_id: self.job_id.clone(),
            user_id: self.user_id,
            phase: stage,
            fraction,
            label: format!("{} {:.0}%", stage.label(), fraction * 100.0),
        });
    }

    /// Byte-level progress. An unknown total reports zero.
    pub fn bytes(&self, stage: Stage, done: u64, total: Option<u64>) {
        let fraction = match total {
            Some(total) if total > 0 => done as f64 / total as f64,
            _ => 0.0,
        };
        self.report(stage, fraction);
    }
}
