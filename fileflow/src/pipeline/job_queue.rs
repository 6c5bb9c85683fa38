//! Queue scheduler.
//!
//! The scheduler owns every job lifecycle transition. In-memory state (the
//! job table, per-user FIFO queues and the round-robin ring of users with
//! queued work) sits behind one mutex that is never held across an await.
//! Each change is then written through to SQLite with a conditional update,
//! so a row that reached a terminal status is never reopened by a late write.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::progress::{ProgressEvent, ProgressHub};
use super::runner::{JobStateSink, PipelineOutcome};
use super::slots::{QueueSlot, SlotPool, SlotUsage};
use crate::access::AccessGate;
use crate::database::models::{JobAttributesDbModel, JobDbModel};
use crate::database::repositories::{CounterRepository, JobRepository};
use crate::domain::{Job, JobAttributes, JobError, JobId, JobSpec, JobStatus, Stage, UserId};
use crate::error::ErrorKind;
use crate::naming::validate_pattern;
use crate::utils::fs::{clear_dir, remove_file_quiet};
use crate::{Error, Result};

const OUTCOME_CHANNEL_CAPACITY: usize = 256;
/// Write attempts for a terminal job state.
const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Configuration for the job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobQueueConfig {
    /// Jobs running at once across all users.
    pub global_slots: usize,
    /// Jobs running at once for a single user.
    pub per_user_slots: usize,
    /// Queued plus running jobs a single user may have.
    pub max_outstanding_per_user: usize,
    /// Upper bound on a job's retry count when it is retried explicitly.
    /// Crash recovery always requeues.
    pub max_job_retries: u32,
    /// Warning threshold for queue depth.
    pub warning_threshold: usize,
    /// Critical threshold for queue depth.
    pub critical_threshold: usize,
    /// Poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Minimum gap between progress events within one stage.
    pub progress_interval_ms: u64,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            global_slots: 3,
            per_user_slots: 1,
            max_outstanding_per_user: 100,
            max_job_retries: 3,
            warning_threshold: 100,
            critical_threshold: 500,
            poll_interval_ms: 100,
            progress_interval_ms: 2000,
        }
    }
}

/// Status of queue depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueDepthStatus {
    /// Queue depth is normal.
    Normal,
    /// Queue depth is at warning level.
    Warning,
    /// Queue depth is at critical level.
    Critical,
}

/// Queue statistics.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queued: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Jobs waiting for a slot.
    pub depth: usize,
    pub depth_status: QueueDepthStatus,
    pub slots: SlotUsage,
}

/// Terminal result published to outcome subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub user_id: UserId,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JobOutcome {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            user_id: job.user_id,
            status: job.status,
            filename: job.filename.clone(),
            remote_ref: job.remote_ref.clone(),
            error_kind: job.error.as_ref().map(|e| e.kind),
            message: job.error.as_ref().map(|e| e.message.clone()),
        }
    }
}

/// What [`JobQueue::recover`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Interrupted jobs put back in the queue.
    pub requeued: u64,
    /// Queued jobs loaded into memory, requeued ones included.
    pub reloaded: usize,
    pub temp_entries_removed: usize,
    /// Unfinished deliveries removed from sink staging directories.
    pub partial_deliveries_removed: usize,
}

/// A job handed to a worker together with its slot and cancellation token.
#[derive(Debug)]
pub struct Dispatch {
    pub job: Job,
    pub slot: QueueSlot,
    pub cancel: CancellationToken,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<JobId, Job>,
    queues: HashMap<UserId, VecDeque<JobId>>,
    /// Users with queued work, in service order.
    ring: VecDeque<UserId>,
    tokens: HashMap<JobId, CancellationToken>,
    /// Admissions counted against the cap while their row is being written.
    reserved: HashMap<UserId, usize>,
    last_seq: u64,
}

impl QueueState {
    fn outstanding(&self, user_id: UserId) -> usize {
        let live = self
            .jobs
            .values()
            .filter(|j| j.user_id == user_id && j.is_outstanding())
            .count();
        live + self.reserved.get(&user_id).copied().unwrap_or(0)
    }

    fn release_reservation(&mut self, user_id: UserId) {
        if let Some(n) = self.reserved.get_mut(&user_id) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                self.reserved.remove(&user_id);
            }
        }
    }

    fn enqueue(&mut self, job: Job) {
        let user_id = job.user_id;
        let job_id = job.id.clone();
        self.jobs.insert(job_id.clone(), job);
        self.queues.entry(user_id).or_default().push_back(job_id);
        if !self.ring.contains(&user_id) {
            self.ring.push_back(user_id);
        }
    }

    fn unqueue(&mut self, user_id: UserId, job_id: &str) {
        let Some(queue) = self.queues.get_mut(&user_id) else {
            return;
        };
        queue.retain(|id| id != job_id);
        if queue.is_empty() {
            self.queues.remove(&user_id);
            self.ring.retain(|u| *u != user_id);
        }
    }

    fn depth(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }
}

/// The queue scheduler.
pub struct JobQueue {
    config: JobQueueConfig,
    state: Mutex<QueueState>,
    slots: SlotPool,
    /// Wakes workers when work is queued or a slot frees up.
    notify: Arc<Notify>,
    /// Write-once attributes by job id.
    attributes: DashMap<JobId, JobAttributes>,
    progress: Arc<ProgressHub>,
    outcomes: broadcast::Sender<JobOutcome>,
    /// Parent of every job token; cancelled on shutdown.
    shutdown: CancellationToken,
    repo: Arc<dyn JobRepository>,
    counters: Arc<dyn CounterRepository>,
    gate: Arc<dyn AccessGate>,
    temp_root: PathBuf,
    /// Sink directories holding unfinished deliveries.
    staging_dirs: Vec<PathBuf>,
}

impl JobQueue {
    pub fn new(
        config: JobQueueConfig,
        repo: Arc<dyn JobRepository>,
        counters: Arc<dyn CounterRepository>,
        gate: Arc<dyn AccessGate>,
        temp_root: impl Into<PathBuf>,
    ) -> Self {
        let notify = Arc::new(Notify::new());
        let (outcomes, _rx) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        Self {
            slots: SlotPool::new(config.global_slots, config.per_user_slots, notify.clone()),
            progress: Arc::new(ProgressHub::new(Duration::from_millis(
                config.progress_interval_ms,
            ))),
            config,
            state: Mutex::new(QueueState::default()),
            notify,
            attributes: DashMap::new(),
            outcomes,
            shutdown: CancellationToken::new(),
            repo,
            counters,
            gate,
            temp_root: temp_root.into(),
            staging_dirs: Vec::new(),
        }
    }

    /// Register a delivery staging directory to be emptied by
    /// [`recover`](Self::recover).
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dirs.push(dir.into());
        self
    }

    pub fn config(&self) -> &JobQueueConfig {
        &self.config
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    /// Get a notifier for new jobs and released slots.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub fn progress_hub(&self) -> Arc<ProgressHub> {
        self.progress.clone()
    }

    /// Admit a job.
    ///
    /// Fails with [`Error::AccessDenied`] when the gate refuses the user and
    /// with [`Error::CapacityExceeded`] when the user already has
    /// `max_outstanding_per_user` jobs queued or running. Neither creates a
    /// job.
    pub async fn submit(&self, spec: JobSpec) -> Result<JobId> {
        let user_id = spec.user_id;
        if !self.gate.is_allowed(user_id).await {
            info!(user_id, "Submission refused by access gate");
            return Err(Error::AccessDenied { user_id });
        }
        if let Some(pattern) = &spec.pattern {
            validate_pattern(pattern)?;
        }

        {
            let mut state = self.state.lock();
            if state.outstanding(user_id) >= self.config.max_outstanding_per_user {
                debug!(user_id, "Submission refused, too many outstanding jobs");
                return Err(Error::CapacityExceeded {
                    user_id,
                    limit: self.config.max_outstanding_per_user,
                });
            }
            *state.reserved.entry(user_id).or_insert(0) += 1;
        }

        let job = Job::new(spec);
        let persisted = async {
            let model = JobDbModel::from_job(&job)?;
            self.repo.create_job(&model).await
        }
        .await;

        let depth = {
            let mut state = self.state.lock();
            state.release_reservation(user_id);
            if persisted.is_ok() {
                state.enqueue(job.clone());
            }
            state.depth()
        };
        persisted?;

        info!(
            job_id = %job.id,
            user_id,
            source = %job.spec.source,
            depth,
            "Job queued"
        );
        self.notify.notify_one();
        Ok(job.id)
    }

    /// Hand the next eligible job to a worker.
    ///
    /// Users are served round-robin; within a user, jobs leave in submission
    /// order. Returns `None` when nothing is queued or no slot is free.
    pub async fn try_dispatch(&self) -> Option<Dispatch> {
        let dispatch = {
            let mut state = self.state.lock();
            self.pick_next(&mut state)?
        };
        self.persist(&dispatch.job).await;
        debug!(
            job_id = %dispatch.job.id,
            user_id = dispatch.job.user_id,
            seq = dispatch.job.dispatch_seq,
            "Job dispatched"
        );
        Some(dispatch)
    }

    fn pick_next(&self, state: &mut QueueState) -> Option<Dispatch> {
        if !self.slots.global_available() {
            return None;
        }
        let position = state
            .ring
            .iter()
            .position(|user_id| self.slots.user_has_capacity(*user_id))?;
        let user_id = state.ring.remove(position)?;
        let Some(slot) = self.slots.try_acquire(user_id) else {
            state.ring.insert(position, user_id);
            return None;
        };

        let queue = state.queues.get_mut(&user_id)?;
        let job_id = queue.pop_front()?;
        if queue.is_empty() {
            state.queues.remove(&user_id);
        } else {
            state.ring.push_back(user_id);
        }

        state.last_seq += 1;
        let seq = state.last_seq;
        let cancel = self.shutdown.child_token();
        state.tokens.insert(job_id.clone(), cancel.clone());

        let job = state.jobs.get_mut(&job_id)?;
        job.status = JobStatus::Running;
        job.stage = None;
        job.dispatch_seq = Some(seq);
        job.updated_at = Utc::now();

        Some(Dispatch {
            job: job.clone(),
            slot,
            cancel,
        })
    }

    /// Record a pipeline result. Ignored when the job is no longer running,
    /// which is the case after a cancel.
    pub async fn finish(&self, job_id: &str, outcome: PipelineOutcome) {
        let job = {
            let mut state = self.state.lock();
            state.tokens.remove(job_id);
            let Some(job) = state.jobs.get_mut(job_id) else {
                warn!(job_id, "Pipeline finished for an unknown job");
                return;
            };
            if job.status != JobStatus::Running {
                debug!(job_id, status = %job.status, "Ignoring late pipeline result");
                return;
            }

            match outcome {
                PipelineOutcome::Succeeded {
                    filename,
                    remote_ref,
                } => {
                    job.status = JobStatus::Succeeded;
                    job.filename = Some(filename);
                    job.remote_ref = Some(remote_ref.0);
                    job.error = None;
                }
                PipelineOutcome::Failed(err) if err.is_cancelled() => {
                    job.status = JobStatus::Cancelled;
                }
                PipelineOutcome::Failed(err) => {
                    job.status = JobStatus::Failed;
                    job.error = Some(JobError {
                        kind: err.kind,
                        message: err.message,
                    });
                }
                PipelineOutcome::Cancelled => {
                    job.status = JobStatus::Cancelled;
                }
            }
            job.updated_at = Utc::now();
            job.clone()
        };

        self.persist(&job).await;
        self.progress.clear(job_id);
        self.publish_outcome(&job);
    }

    /// Cancel a job.
    ///
    /// A queued job is cancelled at once. A running job has its token
    /// triggered and is marked cancelled at once; whatever its pipeline
    /// reports later is ignored. Returns `false`, changing nothing, when the
    /// job is already terminal.
    ///
    /// The job's one-shot thumbnail is removed here unless a pipeline is
    /// running, in which case the pipeline removes it on exit.
    pub async fn cancel(&self, job_id: &str) -> Result<bool> {
        let mut was_running = false;
        let cancelled = {
            let mut state = self.state.lock();
            match state.jobs.get(job_id).map(|j| (j.status, j.user_id)) {
                None => None,
                Some((status, _)) if status.is_terminal() => return Ok(false),
                Some((status, user_id)) => {
                    was_running = status == JobStatus::Running;
                    if status == JobStatus::Queued {
                        state.unqueue(user_id, job_id);
                    }
                    if let Some(token) = state.tokens.remove(job_id) {
                        token.cancel();
                    }
                    state.jobs.get_mut(job_id).map(|job| {
                        job.status = JobStatus::Cancelled;
                        job.updated_at = Utc::now();
                        job.clone()
                    })
                }
            }
        };

        let job = match cancelled {
            Some(job) => job,
            None => {
                // Not tracked in memory: archived, evicted, or never recovered.
                let mut job = self.repo.get_job(job_id).await?.into_job()?;
                if job.is_terminal() {
                    return Ok(false);
                }
                job.status = JobStatus::Cancelled;
                job.updated_at = Utc::now();
                job
            }
        };

        if !was_running && let Some(thumbnail) = &job.spec.thumbnail {
            remove_file_quiet(thumbnail).await;
        }
        self.persist(&job).await;
        self.progress.clear(job_id);
        self.publish_outcome(&job);
        Ok(true)
    }

    /// Move a failed job back to the queue.
    ///
    /// Only `failed` jobs qualify, and only while their retry count is below
    /// `max_job_retries`; anything else is an
    /// [`Error::InvalidStateTransition`].
    pub async fn retry(&self, job_id: &str) -> Result<Job> {
        self.ensure_loaded(job_id).await?;

        let candidate = {
            let state = self.state.lock();
            let job = state
                .jobs
                .get(job_id)
                .ok_or_else(|| Error::not_found("Job", job_id))?;
            if job.status != JobStatus::Failed {
                return Err(Error::invalid_transition(job.status, JobStatus::Queued));
            }
            if job.retry_count >= self.config.max_job_retries {
                return Err(Error::invalid_transition(
                    format!(
                        "failed (retry limit {} reached)",
                        self.config.max_job_retries
                    ),
                    JobStatus::Queued,
                ));
            }
            if state.outstanding(job.user_id) >= self.config.max_outstanding_per_user {
                return Err(Error::CapacityExceeded {
                    user_id: job.user_id,
                    limit: self.config.max_outstanding_per_user,
                });
            }

            let mut next = job.clone();
            next.status = JobStatus::Queued;
            next.retry_count += 1;
            next.stage = None;
            next.dispatch_seq = None;
            next.filename = None;
            next.remote_ref = None;
            next.error = None;
            next.updated_at = Utc::now();
            next
        };

        let model = JobDbModel::from_job(&candidate)?;
        if !self.repo.requeue_failed_job(&model).await? {
            return Err(Error::invalid_transition("not failed", JobStatus::Queued));
        }

        self.state.lock().enqueue(candidate.clone());
        info!(
            job_id,
            retry_count = candidate.retry_count,
            "Failed job requeued"
        );
        self.notify.notify_one();
        Ok(candidate)
    }

    async fn ensure_loaded(&self, job_id: &str) -> Result<()> {
        let cached = self.state.lock().jobs.contains_key(job_id);
        if cached {
            return Ok(());
        }
        let job = self.repo.get_job(job_id).await?.into_job()?;
        self.state
            .lock()
            .jobs
            .entry(job.id.clone())
            .or_insert(job);
        Ok(())
    }

    /// Current state of a job.
    pub async fn status(&self, job_id: &str) -> Result<Job> {
        let cached = self.state.lock().jobs.get(job_id).cloned();
        match cached {
            Some(job) => Ok(job),
            None => self.repo.get_job(job_id).await?.into_job(),
        }
    }

    /// A user's running jobs in dispatch order, then their queued jobs in
    /// the order they will run.
    pub async fn list_active(&self, user_id: UserId) -> Result<Vec<Job>> {
        let state = self.state.lock();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.user_id == user_id && j.status == JobStatus::Running)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.dispatch_seq);
        jobs.extend(
            state
                .queues
                .get(&user_id)
                .into_iter()
                .flatten()
                .filter_map(|id| state.jobs.get(id))
                .cloned(),
        );
        Ok(jobs)
    }

    /// Attributes recorded for a job.
    pub async fn attributes(&self, job_id: &str) -> Result<Option<JobAttributes>> {
        if let Some(attrs) = self.attributes.get(job_id) {
            return Ok(Some(attrs.value().clone()));
        }
        self.repo
            .get_attributes(job_id)
            .await?
            .map(|row| row.decode())
            .transpose()
    }

    /// Get the current queue depth.
    pub fn depth(&self) -> usize {
        self.state.lock().depth()
    }

    /// Get the queue depth status.
    pub fn depth_status(&self) -> QueueDepthStatus {
        let depth = self.depth();
        if depth >= self.config.critical_threshold {
            QueueDepthStatus::Critical
        } else if depth >= self.config.warning_threshold {
            QueueDepthStatus::Warning
        } else {
            QueueDepthStatus::Normal
        }
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let counts = self.repo.count_by_status().await?;
        let depth = self.depth();
        let depth_status = self.depth_status();

        let mut stats = QueueStats {
            queued: 0,
            running: 0,
            succeeded: 0,
            failed: 0,
            cancelled: 0,
            depth,
            depth_status,
            slots: self.slots.usage(),
        };
        for (status, count) in counts {
            let count = count.max(0) as u64;
            match JobStatus::parse(&status) {
                Some(JobStatus::Queued) => stats.queued = count,
                Some(JobStatus::Running) => stats.running = count,
                Some(JobStatus::Succeeded) => stats.succeeded = count,
                Some(JobStatus::Failed) => stats.failed = count,
                Some(JobStatus::Cancelled) => stats.cancelled = count,
                None => warn!(status, "Unknown job status in database"),
            }
        }

        match depth_status {
            QueueDepthStatus::Critical => error!(depth, "Queue depth is critical"),
            QueueDepthStatus::Warning => warn!(depth, "Queue depth is high"),
            QueueDepthStatus::Normal => {}
        }
        Ok(stats)
    }

    pub fn slots_in_use(&self) -> SlotUsage {
        self.slots.usage()
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<JobOutcome> {
        self.outcomes.subscribe()
    }

    /// Reserve the next naming counter value for a user.
    pub async fn next_counter(&self, user_id: UserId) -> Result<u64> {
        let value = self.counters.next_value(user_id).await?;
        Ok(value.max(0) as u64)
    }

    /// Rebuild the queue after a restart. Call before workers start.
    ///
    /// Every job left `running` is requeued with its retry count bumped by
    /// one. Queued jobs reload in creation order, and the temp root and any
    /// registered staging directories are emptied.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        // Read before the reset clears the interrupted jobs' sequence numbers
        let last_seq = self.repo.max_dispatch_seq().await?;
        let requeued = self.repo.reset_running_jobs().await?;
        let jobs = self
            .repo
            .list_jobs_by_status(JobStatus::Queued.as_str())
            .await?
            .into_iter()
            .map(JobDbModel::into_job)
            .collect::<Result<Vec<_>>>()?;
        let reloaded = jobs.len();

        {
            let mut state = self.state.lock();
            *state = QueueState {
                last_seq,
                ..QueueState::default()
            };
            for job in jobs {
                state.enqueue(job);
            }
        }
        self.attributes.clear();

        let temp_entries_removed = clear_dir(&self.temp_root).await?;
        let mut partial_deliveries_removed = 0;
        for dir in &self.staging_dirs {
            partial_deliveries_removed += clear_dir(dir).await?;
        }
        let report = RecoveryReport {
            requeued,
            reloaded,
            temp_entries_removed,
            partial_deliveries_removed,
        };
        info!(
            requeued = report.requeued,
            reloaded = report.reloaded,
            temp_entries_removed = report.temp_entries_removed,
            partial_deliveries_removed = report.partial_deliveries_removed,
            "Job queue recovered"
        );
        if reloaded > 0 {
            self.notify.notify_one();
        }
        Ok(report)
    }

    /// Drop terminal jobs from memory after they were archived.
    pub fn evict(&self, job_ids: &[String]) -> usize {
        let mut state = self.state.lock();
        let mut evicted = 0;
        for id in job_ids {
            if state.jobs.get(id).is_some_and(Job::is_terminal) {
                state.jobs.remove(id);
                self.attributes.remove(id);
                evicted += 1;
            }
        }
        evicted
    }

    /// Cancel every running job's token without marking jobs cancelled.
    /// Interrupted jobs stay `running` in the database for the next
    /// [`recover`](Self::recover).
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Write `job` through to the database. Terminal states are retried a
    /// few times; if the write still fails the outcome is logged in full so
    /// it can be restored by hand.
    async fn persist(&self, job: &Job) {
        let model = match JobDbModel::from_job(job) {
            Ok(model) => model,
            Err(e) => {
                error!(job_id = %job.id, status = %job.status, "Failed to encode job: {e}");
                return;
            }
        };
        let attempts = if job.is_terminal() {
            PERSIST_ATTEMPTS
        } else {
            1
        };

        let mut attempt = 1;
        loop {
            match self.repo.update_job(&model).await {
                Ok(true) => return,
                Ok(false) => {
                    debug!(job_id = %job.id, "Job row is terminal, update skipped");
                    return;
                }
                Err(e) if attempt < attempts => {
                    warn!(job_id = %job.id, attempt, "Failed to persist job, retrying: {e}");
                    tokio::time::sleep(PERSIST_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        job_id = %job.id,
                        user_id = job.user_id,
                        status = %job.status,
                        retry_count = job.retry_count,
                        filename = job.filename.as_deref().unwrap_or(""),
                        remote_ref = job.remote_ref.as_deref().unwrap_or(""),
                        error_kind = job.error.as_ref().map(|e| e.kind.to_string()).unwrap_or_default(),
                        attempts,
                        "Failed to persist job, the database row is stale: {e}"
                    );
                    return;
                }
            }
        }
    }

    fn publish_outcome(&self, job: &Job) {
        match &job.error {
            Some(err) => info!(
                job_id = %job.id,
                user_id = job.user_id,
                status = %job.status,
                kind = %err.kind,
                "Job finished: {}",
                err.message
            ),
            None => info!(
                job_id = %job.id,
                user_id = job.user_id,
                status = %job.status,
                filename = job.filename.as_deref().unwrap_or(""),
                "Job finished"
            ),
        }
        let _ = self.outcomes.send(JobOutcome::from_job(job));
    }
}

#[async_trait]
impl JobStateSink for JobQueue {
    async fn enter_stage(&self, job_id: &str, stage: Stage) -> Result<()> {
        let job = {
            let mut state = self.state.lock();
            let job = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| Error::not_found("Job", job_id))?;
            if job.status != JobStatus::Running {
                return Err(Error::invalid_transition(job.status, stage));
            }
            job.stage = Some(stage);
            job.updated_at = Utc::now();
            job.clone()
        };
        self.persist(&job).await;
        Ok(())
    }

    async fn record_attributes(&self, job_id: &str, attributes: &JobAttributes) -> Result<bool> {
        if self.attributes.contains_key(job_id) {
            debug!(job_id, "Attributes already recorded");
            return Ok(false);
        }

        let row = JobAttributesDbModel::new(job_id, attributes)?;
        let written = self.repo.insert_attributes(&row).await?;
        if written {
            self.attributes
                .entry(job_id.to_string())
                .or_insert_with(|| attributes.clone());
        } else if let Some(existing) = self.repo.get_attributes(job_id).await? {
            debug!(job_id, "Attributes already stored, keeping the first");
            let existing = existing.decode()?;
            self.attributes
                .entry(job_id.to_string())
                .or_insert(existing);
        }
        Ok(written)
    }

    async fn next_counter(&self, user_id: UserId) -> Result<u64> {
        JobQueue::next_counter(self, user_id).await
    }
}
