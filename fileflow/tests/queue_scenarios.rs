//! End-to-end scenarios: the scheduler, worker pool and pipeline running
//! against a file-backed SQLite database and real temp directories.

use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{Notify, broadcast};
use tokio_util::sync::CancellationToken;

use fileflow::Error;
use fileflow::access::StaticAccessGate;
use fileflow::database::repositories::{
    SqlxCounterRepository, SqlxJobRepository, SqlxPreferenceRepository,
};
use fileflow::database::{DbPool, init_pool_with_size, run_migrations};
use fileflow::domain::{JobSpec, JobStatus, RetryPolicy, SourceRef, UserId};
use fileflow::error::{ErrorKind, StageError};
use fileflow::media::FileMetadataExtractor;
use fileflow::pipeline::{
    JobOutcome, JobPipeline, JobQueue, JobQueueConfig, WorkerPool, WorkerPoolConfig,
};
use fileflow::preferences::PreferenceService;
use fileflow::transfer::{
    DeliveryRequest, DirectorySink, LocalHandle, ProgressFn, RemoteRef, Transfer,
    TransferExecutor,
};
use fileflow::utils::http_client::build_client;
use media_types::MediaKind;

async fn setup_test_db(dir: &Path) -> DbPool {
    let url = format!("sqlite:{}?mode=rwc", dir.join("fileflow.db").display());
    let pool = init_pool_with_size(&url, 4)
        .await
        .expect("Failed to create test pool");
    run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

struct Harness {
    dir: TempDir,
    queue: Arc<JobQueue>,
    workers: WorkerPool,
    prefs: Arc<PreferenceService>,
}

impl Harness {
    async fn new(config: JobQueueConfig, gate: StaticAccessGate) -> Self {
        Self::with_transfer(config, gate, |inner| Arc::new(inner)).await
    }

    /// `wrap` receives the real executor and may put a fake in front of it.
    async fn with_transfer<F>(config: JobQueueConfig, gate: StaticAccessGate, wrap: F) -> Self
    where
        F: FnOnce(TransferExecutor) -> Arc<dyn Transfer>,
    {
        let dir = TempDir::new().unwrap();
        let pool = setup_test_db(dir.path()).await;
        std::fs::create_dir_all(dir.path().join("uploads")).unwrap();

        let executor = TransferExecutor::new(
            build_client(Duration::from_secs(5), Duration::from_secs(5)).unwrap(),
            dir.path().join("uploads"),
            Arc::new(DirectorySink::new(dir.path().join("outbox"))),
        );
        let prefs = Arc::new(PreferenceService::new(
            Arc::new(SqlxPreferenceRepository::new(pool.clone())),
            dir.path().join("thumbnails"),
        ));
        let retry = RetryPolicy::with_max_retries(3).with_initial_delay(Duration::from_millis(5));
        let pipeline = Arc::new(
            JobPipeline::new(
                wrap(executor),
                Arc::new(FileMetadataExtractor::new()),
                prefs.clone(),
                dir.path().join("temp"),
            )
            .with_fetch_retry(retry.clone())
            .with_deliver_retry(retry),
        );

        let workers = WorkerPoolConfig {
            workers: config.global_slots,
            poll_interval_ms: 20,
            job_timeout_secs: 0,
        };
        let queue = Arc::new(JobQueue::new(
            config,
            Arc::new(SqlxJobRepository::new(pool.clone())),
            Arc::new(SqlxCounterRepository::new(pool)),
            Arc::new(gate),
            dir.path().join("temp"),
        ));
        let workers = WorkerPool::new(workers, queue.clone(), pipeline);

        Self {
            dir,
            queue,
            workers,
            prefs,
        }
    }

    fn upload(&self, name: &str, content: &[u8]) {
        std::fs::write(self.dir.path().join("uploads").join(name), content).unwrap();
    }

    fn spec(&self, user_id: UserId, upload: &str) -> JobSpec {
        JobSpec::new(user_id, SourceRef::upload(upload))
    }

    fn temp_is_empty(&self) -> bool {
        let temp = self.dir.path().join("temp");
        !temp.exists() || std::fs::read_dir(temp).unwrap().next().is_none()
    }
}

/// Collect `n` terminal outcomes in the order they were published.
async fn collect_outcomes(rx: &mut broadcast::Receiver<JobOutcome>, n: usize) -> Vec<JobOutcome> {
    let mut outcomes = Vec::with_capacity(n);
    tokio::time::timeout(Duration::from_secs(60), async {
        while outcomes.len() < n {
            outcomes.push(rx.recv().await.expect("outcome channel closed"));
        }
    })
    .await
    .expect("timed out waiting for jobs");
    outcomes
}

/// Fails the first `failures` fetches with a transient error, then
/// delegates to the real executor.
struct FlakyTransfer {
    inner: TransferExecutor,
    failures: AtomicU32,
    attempts: Arc<AtomicU32>,
}

#[async_trait]
impl Transfer for FlakyTransfer {
    async fn fetch(
        &self,
        spec: &JobSpec,
        job_dir: &Path,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> Result<LocalHandle, StageError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StageError::transient(
                ErrorKind::SourceUnavailable,
                "connection reset by peer",
            ));
        }
        self.inner.fetch(spec, job_dir, cancel, progress).await
    }

    async fn deliver(
        &self,
        local: &LocalHandle,
        request: &DeliveryRequest,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> Result<RemoteRef, StageError> {
        self.inner.deliver(local, request, cancel, progress).await
    }
}

/// Records how many fetches run at once, globally and per user.
struct ConcurrencyTracker {
    inner: TransferExecutor,
    active: AtomicUsize,
    max_active: Arc<AtomicUsize>,
    per_user: DashMap<UserId, usize>,
    max_per_user: Arc<AtomicUsize>,
}

#[async_trait]
impl Transfer for ConcurrencyTracker {
    async fn fetch(
        &self,
        spec: &JobSpec,
        job_dir: &Path,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> Result<LocalHandle, StageError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let mine = {
            let mut entry = self.per_user.entry(spec.user_id).or_insert(0);
            *entry += 1;
            *entry
        };
        self.max_per_user.fetch_max(mine, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(2 + rand::random::<u64>() % 15)).await;

        if let Some(mut entry) = self.per_user.get_mut(&spec.user_id) {
            *entry -= 1;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.inner.fetch(spec, job_dir, cancel, progress).await
    }

    async fn deliver(
        &self,
        local: &LocalHandle,
        request: &DeliveryRequest,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> Result<RemoteRef, StageError> {
        self.inner.deliver(local, request, cancel, progress).await
    }
}

/// Fetches for real, then holds the job in the fetch stage until it is
/// cancelled.
struct StallingTransfer {
    inner: TransferExecutor,
    started: Arc<Notify>,
}

#[async_trait]
impl Transfer for StallingTransfer {
    async fn fetch(
        &self,
        spec: &JobSpec,
        job_dir: &Path,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> Result<LocalHandle, StageError> {
        let local = self.inner.fetch(spec, job_dir, cancel, progress).await?;
        self.started.notify_one();
        tokio::select! {
            _ = cancel.cancelled() => Err(StageError::cancelled()),
            _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(local),
        }
    }

    async fn deliver(
        &self,
        local: &LocalHandle,
        request: &DeliveryRequest,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> Result<RemoteRef, StageError> {
        self.inner.deliver(local, request, cancel, progress).await
    }
}

/// Poll `check` until it holds or five seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Minimal Matroska file: EBML header, DocType, then filler.
fn matroska_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0x1A, 0x45, 0xDF, 0xA3, 0x9F, 0x42, 0x82, 0x88];
    data.extend_from_slice(b"matroska");
    data.resize(len, 0);
    data
}

mod pipeline_tests {
    use super::*;

    #[tokio::test]
    async fn test_video_with_counter_and_date_pattern() {
        let h = Harness::new(JobQueueConfig::default(), StaticAccessGate::allow_all()).await;
        h.upload("holiday.mkv", &matroska_bytes(50 * 1024 * 1024));
        let mut outcomes = h.queue.subscribe_outcomes();
        h.workers.start();

        let id = h
            .queue
            .submit(
                h.spec(7, "holiday.mkv")
                    .with_pattern("{counter}_{date}.mkv"),
            )
            .await
            .unwrap();
        let outcome = collect_outcomes(&mut outcomes, 1).await.remove(0);
        h.workers.stop().await;

        assert_eq!(outcome.job_id, id);
        assert_eq!(outcome.status, JobStatus::Succeeded, "{outcome:?}");
        let filename = outcome.filename.unwrap();
        let shape = Regex::new(r"^\d+_\d{4}-\d{2}-\d{2}\.mkv$").unwrap();
        assert!(shape.is_match(&filename), "unexpected filename {filename}");

        let attributes = h.queue.attributes(&id).await.unwrap().unwrap();
        assert_eq!(attributes.kind, MediaKind::Video);
        assert_eq!(attributes.size_bytes, 50 * 1024 * 1024);
        assert!(attributes.sha256.is_some());

        let delivered = outcome.remote_ref.unwrap();
        assert_eq!(std::fs::metadata(&delivered).unwrap().len(), 50 * 1024 * 1024);
        assert!(h.temp_is_empty());
    }

    #[tokio::test]
    async fn test_transient_fetch_failures_within_bound_succeed() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let h = Harness::with_transfer(
            JobQueueConfig::default(),
            StaticAccessGate::allow_all(),
            move |inner| {
                Arc::new(FlakyTransfer {
                    inner,
                    failures: AtomicU32::new(3),
                    attempts: counter,
                })
            },
        )
        .await;
        h.upload("report.txt", b"quarterly numbers");
        let mut outcomes = h.queue.subscribe_outcomes();
        h.workers.start();

        h.queue.submit(h.spec(1, "report.txt")).await.unwrap();
        let outcome = collect_outcomes(&mut outcomes, 1).await.remove(0);
        h.workers.stop().await;

        assert_eq!(outcome.status, JobStatus::Succeeded, "{outcome:?}");
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_transient_fetch_failures_past_bound_fail() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let h = Harness::with_transfer(
            JobQueueConfig::default(),
            StaticAccessGate::allow_all(),
            move |inner| {
                Arc::new(FlakyTransfer {
                    inner,
                    failures: AtomicU32::new(u32::MAX),
                    attempts: counter,
                })
            },
        )
        .await;
        h.upload("report.txt", b"quarterly numbers");
        let mut outcomes = h.queue.subscribe_outcomes();
        h.workers.start();

        let id = h.queue.submit(h.spec(1, "report.txt")).await.unwrap();
        let outcome = collect_outcomes(&mut outcomes, 1).await.remove(0);
        h.workers.stop().await;

        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.error_kind, Some(ErrorKind::SourceUnavailable));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);

        let job = h.queue.status(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(h.temp_is_empty());
    }

    #[tokio::test]
    async fn test_counter_increases_and_unknown_tokens_stay() {
        let config = JobQueueConfig {
            global_slots: 1,
            ..JobQueueConfig::default()
        };
        let h = Harness::new(config, StaticAccessGate::allow_all()).await;
        h.upload("a.txt", b"alpha");
        h.prefs.save_pattern(3, "numbered", "{counter}-{nope}").await.unwrap();
        h.prefs.set_active_pattern(3, Some("numbered")).await.unwrap();

        for _ in 0..3 {
            h.queue.submit(h.spec(3, "a.txt")).await.unwrap();
        }
        let mut outcomes = h.queue.subscribe_outcomes();
        h.workers.start();
        let outcomes = collect_outcomes(&mut outcomes, 3).await;
        h.workers.stop().await;

        let names: Vec<String> = outcomes
            .into_iter()
            .map(|o| o.filename.expect("succeeded job has a filename"))
            .collect();
        assert_eq!(names, vec!["01-{nope}.txt", "02-{nope}.txt", "03-{nope}.txt"]);

        let saved = h.prefs.list_patterns(3).await.unwrap();
        assert_eq!(saved[0].usage_count, 3);
    }

    #[tokio::test]
    async fn test_blocked_extension_is_unsupported() {
        let h = Harness::new(JobQueueConfig::default(), StaticAccessGate::allow_all()).await;
        h.upload("setup.exe", b"MZ\x90\x00");
        let mut outcomes = h.queue.subscribe_outcomes();
        h.workers.start();

        h.queue.submit(h.spec(1, "setup.exe")).await.unwrap();
        let outcome = collect_outcomes(&mut outcomes, 1).await.remove(0);
        h.workers.stop().await;

        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.error_kind, Some(ErrorKind::UnsupportedFormat));
    }
}

mod scheduling_tests {
    use super::*;

    #[tokio::test]
    async fn test_access_denied_creates_no_job() {
        let h = Harness::new(JobQueueConfig::default(), StaticAccessGate::allow_only([1])).await;
        h.upload("a.txt", b"alpha");

        let err = h.queue.submit(h.spec(2, "a.txt")).await.unwrap_err();
        assert!(matches!(err, Error::AccessDenied { user_id: 2 }));
        assert_eq!(err.kind(), Some(ErrorKind::AccessDenied));
        assert!(h.queue.list_active(2).await.unwrap().is_empty());
        assert_eq!(h.queue.stats().await.unwrap().queued, 0);
    }

    #[tokio::test]
    async fn test_fifo_per_user_and_round_robin_across_users() {
        let config = JobQueueConfig {
            global_slots: 1,
            ..JobQueueConfig::default()
        };
        let h = Harness::new(config, StaticAccessGate::allow_all()).await;
        h.upload("a.txt", b"alpha");

        let a1 = h.queue.submit(h.spec(1, "a.txt")).await.unwrap();
        let a2 = h.queue.submit(h.spec(1, "a.txt")).await.unwrap();
        let a3 = h.queue.submit(h.spec(1, "a.txt")).await.unwrap();
        let b1 = h.queue.submit(h.spec(2, "a.txt")).await.unwrap();

        let mut outcomes = h.queue.subscribe_outcomes();
        h.workers.start();
        let order: Vec<String> = collect_outcomes(&mut outcomes, 4)
            .await
            .into_iter()
            .map(|o| o.job_id)
            .collect();
        h.workers.stop().await;

        assert_eq!(order, vec![a1, b1, a2, a3]);
    }

    #[tokio::test]
    async fn test_capacity_invariant_under_concurrent_load() {
        let max_active = Arc::new(AtomicUsize::new(0));
        let max_per_user = Arc::new(AtomicUsize::new(0));
        let (global_max, user_max) = (max_active.clone(), max_per_user.clone());
        let config = JobQueueConfig {
            global_slots: 3,
            per_user_slots: 2,
            ..JobQueueConfig::default()
        };
        let h = Harness::with_transfer(config, StaticAccessGate::allow_all(), move |inner| {
            Arc::new(ConcurrencyTracker {
                inner,
                active: AtomicUsize::new(0),
                max_active: global_max,
                per_user: DashMap::new(),
                max_per_user: user_max,
            })
        })
        .await;
        h.upload("a.txt", b"alpha");

        let mut outcomes = h.queue.subscribe_outcomes();
        h.workers.start();

        let mut submitters = tokio::task::JoinSet::new();
        for user in 1..=5 {
            let queue = h.queue.clone();
            submitters.spawn(async move {
                for _ in 0..6 {
                    tokio::time::sleep(Duration::from_millis(rand::random::<u64>() % 10)).await;
                    queue
                        .submit(JobSpec::new(user, SourceRef::upload("a.txt")))
                        .await
                        .unwrap();
                    let usage = queue.slots_in_use();
                    assert!(usage.global <= 3);
                    assert!(usage.per_user.values().all(|&n| n <= 2));
                }
            });
        }
        while let Some(result) = submitters.join_next().await {
            result.unwrap();
        }

        let done = collect_outcomes(&mut outcomes, 30).await;
        h.workers.stop().await;

        assert!(done.iter().all(|o| o.status == JobStatus::Succeeded));
        assert!(max_active.load(Ordering::SeqCst) <= 3);
        assert!(max_per_user.load(Ordering::SeqCst) <= 2);
        assert_eq!(h.queue.slots_in_use().global, 0);
        assert!(h.temp_is_empty());
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_end_to_end() {
        let h = Harness::new(JobQueueConfig::default(), StaticAccessGate::allow_all()).await;
        h.upload("a.txt", b"alpha");
        let mut outcomes = h.queue.subscribe_outcomes();

        let id = h.queue.submit(h.spec(1, "a.txt")).await.unwrap();
        assert!(h.queue.cancel(&id).await.unwrap());
        assert!(!h.queue.cancel(&id).await.unwrap());

        h.workers.start();
        let outcome = collect_outcomes(&mut outcomes, 1).await.remove(0);
        // Give workers a chance to pick anything up
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.workers.stop().await;

        assert_eq!(outcome.status, JobStatus::Cancelled);
        assert!(outcomes.try_recv().is_err());
        let job = h.queue.status(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.stage.is_none());
    }

    #[tokio::test]
    async fn test_cancel_running_job_frees_slot_and_temp_dir() {
        let started = Arc::new(Notify::new());
        let signal = started.clone();
        let h = Harness::with_transfer(
            JobQueueConfig::default(),
            StaticAccessGate::allow_all(),
            move |inner| {
                Arc::new(StallingTransfer {
                    inner,
                    started: signal,
                })
            },
        )
        .await;
        h.upload("a.txt", b"alpha");
        let mut outcomes = h.queue.subscribe_outcomes();
        h.workers.start();

        let id = h.queue.submit(h.spec(1, "a.txt")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), started.notified())
            .await
            .expect("job never started");
        let job_dir = h.dir.path().join("temp").join(&id);
        assert!(job_dir.exists());
        assert_eq!(h.queue.status(&id).await.unwrap().status, JobStatus::Running);
        assert_eq!(h.queue.slots_in_use().global, 1);

        assert!(h.queue.cancel(&id).await.unwrap());
        let outcome = collect_outcomes(&mut outcomes, 1).await.remove(0);
        assert_eq!(outcome.status, JobStatus::Cancelled);

        assert!(eventually(|| h.queue.slots_in_use().global == 0).await);
        assert!(eventually(|| !job_dir.exists()).await);
        h.workers.stop().await;

        assert_eq!(h.queue.status(&id).await.unwrap().status, JobStatus::Cancelled);
        assert!(outcomes.try_recv().is_err());
        assert!(h.temp_is_empty());
    }
}
