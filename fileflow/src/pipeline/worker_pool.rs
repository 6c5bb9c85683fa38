//! Worker pool implementation.
//!
//! A fixed set of tokio tasks. Each one asks the scheduler for work, runs one
//! pipeline to completion, hands the result back and releases its slot.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::job_queue::{Dispatch, JobQueue};
use super::runner::{JobPipeline, PipelineContext, PipelineOutcome};
use crate::error::{ErrorKind, StageError};
use crate::utils::fs::{job_dir, remove_dir_quiet};

/// Configuration for a worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks. Matches the global slot count.
    pub workers: usize,
    /// Poll interval in milliseconds when no notification arrives.
    pub poll_interval_ms: u64,
    /// Job timeout in seconds. Zero disables it.
    pub job_timeout_secs: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            poll_interval_ms: 100,
            job_timeout_secs: 0,
        }
    }
}

/// A pool of workers draining the job queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<JobQueue>,
    pipeline: Arc<JobPipeline>,
    /// Jobs currently executing.
    active_jobs: Arc<AtomicUsize>,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, queue: Arc<JobQueue>, pipeline: Arc<JobPipeline>) -> Self {
        Self {
            config,
            queue,
            pipeline,
            active_jobs: Arc::new(AtomicUsize::new(0)),
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Start the worker tasks.
    pub fn start(&self) {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let job_timeout = (self.config.job_timeout_secs > 0)
            .then(|| Duration::from_secs(self.config.job_timeout_secs));

        info!("Starting worker pool with {} workers", self.config.workers);

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            return;
        };
        for i in 0..self.config.workers {
            let cancellation_token = self.cancellation_token.clone();
            let queue = self.queue.clone();
            let pipeline = self.pipeline.clone();
            let active_jobs = self.active_jobs.clone();
            let notifier = queue.notifier();

            join_set.spawn(async move {
                debug!("Worker {} started", i);

                loop {
                    if cancellation_token.is_cancelled() {
                        break;
                    }

                    if let Some(dispatch) = queue.try_dispatch().await {
                        active_jobs.fetch_add(1, Ordering::SeqCst);
                        run_job(&queue, &pipeline, dispatch, job_timeout).await;
                        active_jobs.fetch_sub(1, Ordering::SeqCst);
                        continue;
                    }

                    // Wait for a job, a released slot, or the poll timeout
                    tokio::select! {
                        _ = cancellation_token.cancelled() => break,
                        _ = notifier.notified() => {}
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                }

                debug!("Worker {} shutting down", i);
            });
        }
    }

    /// Stop the pool. Running jobs are interrupted and stay `running` in the
    /// database so the next start recovers them.
    pub async fn stop(&self) {
        info!("Stopping worker pool");
        self.queue.shutdown();
        self.cancellation_token.cancel();

        // Take the join set out of the mutex before awaiting
        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        info!("Worker pool stopped");
    }

    pub fn active_count(&self) -> usize {
        self.active_jobs.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }
}

async fn run_job(
    queue: &JobQueue,
    pipeline: &JobPipeline,
    dispatch: Dispatch,
    job_timeout: Option<Duration>,
) {
    let Dispatch { job, slot, cancel } = dispatch;
    let reporter = queue.progress_hub().reporter(job.id.clone(), job.user_id);
    let ctx = PipelineContext {
        cancel: &cancel,
        reporter: &reporter,
        sink: queue,
    };

    let run = AssertUnwindSafe(pipeline.run(&job, &ctx)).catch_unwind();
    let result = match job_timeout {
        Some(limit) => match tokio::time::timeout(limit, run).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Ok(PipelineOutcome::Failed(StageError::fatal(
                    ErrorKind::IOFailure,
                    format!("job timed out after {}s", limit.as_secs()),
                )))
            }
        },
        None => run.await,
    };

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(job_id = %job.id, "Pipeline panicked: {}", message);
            PipelineOutcome::Failed(StageError::fatal(
                ErrorKind::IOFailure,
                format!("pipeline panicked: {message}"),
            ))
        }
    };

    // An aborted run skipped its own cleanup.
    if matches!(&outcome, PipelineOutcome::Failed(e) if e.kind == ErrorKind::IOFailure) {
        remove_dir_quiet(&job_dir(pipeline.temp_root(), &job.id)).await;
    }

    if queue.is_shutting_down() && outcome == PipelineOutcome::Cancelled {
        info!(job_id = %job.id, "Job interrupted by shutdown, left for recovery");
    } else {
        queue.finish(&job.id, outcome).await;
    }
    drop(slot);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
