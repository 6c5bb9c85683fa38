//! The per-job pipeline: fetch, extract, name, thumbnail, deliver.
//!
//! Stages run in that fixed order. The cancellation token is checked before
//! each stage and inside every chunk loop below it. Transient fetch and
//! deliver failures are retried under their own [`RetryPolicy`]; everything
//! else ends the job. The job's scratch directory and its one-shot thumbnail
//! are removed on every exit.

use async_trait::async_trait;
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::progress::ProgressReporter;
use crate::Result;
use crate::domain::{
    Job, JobAttributes, RetryExecutor, RetryPolicy, Stage, UserId, UserProfile,
};
use crate::error::{ErrorKind, StageError};
use crate::media::MetadataExtractor;
use crate::naming::{DEFAULT_PATTERN, NamingContext, NamingEngine, uses_counter};
use crate::preferences::{ActivePattern, PreferenceStore};
use crate::thumbnail::ThumbnailResolver;
use crate::transfer::{DeliveryRequest, LocalHandle, ProgressFn, RemoteRef, Transfer};
use crate::utils::disk::{DiskGuard, DiskSpaceStatus};
use crate::utils::fs::{job_dir, remove_dir_quiet, remove_file_quiet};

/// How a pipeline run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Succeeded {
        filename: String,
        remote_ref: RemoteRef,
    },
    Failed(StageError),
    Cancelled,
}

/// The only way a pipeline touches its job. Implemented by the scheduler.
#[async_trait]
pub trait JobStateSink: Send + Sync {
    async fn enter_stage(&self, job_id: &str, stage: Stage) -> Result<()>;
    /// Attach attributes unless some are already recorded. Returns whether
    /// these were written.
    async fn record_attributes(&self, job_id: &str, attributes: &JobAttributes) -> Result<bool>;
    async fn next_counter(&self, user_id: UserId) -> Result<u64>;
}

/// Per-run collaborators.
pub struct PipelineContext<'a> {
    pub cancel: &'a CancellationToken,
    pub reporter: &'a ProgressReporter,
    pub sink: &'a dyn JobStateSink,
}

pub struct JobPipeline {
    transfer: Arc<dyn Transfer>,
    extractor: Arc<dyn MetadataExtractor>,
    prefs: Arc<dyn PreferenceStore>,
    naming: NamingEngine,
    thumbnails: ThumbnailResolver,
    fetch_retry: RetryExecutor,
    deliver_retry: RetryExecutor,
    temp_root: PathBuf,
    disk: DiskGuard,
    min_free_disk_bytes: u64,
}

impl JobPipeline {
    pub fn new(
        transfer: Arc<dyn Transfer>,
        extractor: Arc<dyn MetadataExtractor>,
        prefs: Arc<dyn PreferenceStore>,
        temp_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            transfer,
            extractor,
            thumbnails: ThumbnailResolver::new(prefs.clone()),
            prefs,
            naming: NamingEngine::default(),
            fetch_retry: RetryExecutor::new(RetryPolicy::default()),
            deliver_retry: RetryExecutor::new(RetryPolicy::default()),
            temp_root: temp_root.into(),
            disk: DiskGuard::new(),
            min_free_disk_bytes: 0,
        }
    }

    pub fn with_naming(mut self, naming: NamingEngine) -> Self {
        self.naming = naming;
        self
    }

    pub fn with_thumbnails(mut self, thumbnails: ThumbnailResolver) -> Self {
        self.thumbnails = thumbnails;
        self
    }

    pub fn with_fetch_retry(mut self, policy: RetryPolicy) -> Self {
        self.fetch_retry = RetryExecutor::new(policy);
        self
    }

    pub fn with_deliver_retry(mut self, policy: RetryPolicy) -> Self {
        self.deliver_retry = RetryExecutor::new(policy);
        self
    }

    /// Refuse to fetch while the temp root has less than this free.
    /// Zero disables the check.
    pub fn with_min_free_disk(mut self, bytes: u64) -> Self {
        self.min_free_disk_bytes = bytes;
        self
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    /// Run `job` to completion.
    pub async fn run(&self, job: &Job, ctx: &PipelineContext<'_>) -> PipelineOutcome {
        let dir = job_dir(&self.temp_root, &job.id);
        let result = self.run_stages(job, &dir, ctx).await;
        remove_dir_quiet(&dir).await;
        if let Some(thumbnail) = &job.spec.thumbnail {
            remove_file_quiet(thumbnail).await;
        }

        match result {
            Ok((filename, remote_ref)) => PipelineOutcome::Succeeded {
                filename,
                remote_ref,
            },
            Err(e) if e.is_cancelled() => PipelineOutcome::Cancelled,
            Err(e) => PipelineOutcome::Failed(e),
        }
    }

    async fn run_stages(
        &self,
        job: &Job,
        dir: &Path,
        ctx: &PipelineContext<'_>,
    ) -> std::result::Result<(String, RemoteRef), StageError> {
        self.enter(job, Stage::Fetch, ctx).await?;
        self.check_disk_space()?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| StageError::from_io("creating job directory", &e))?;

        let fetch_progress =
            |done: u64, total: Option<u64>| ctx.reporter.bytes(Stage::Fetch, done, total);
        let fetch_progress: ProgressFn<'_> = &fetch_progress;
        let local = self
            .fetch_retry
            .run("fetch", ctx.cancel, |attempt| {
                if attempt > 0 {
                    debug!(job_id = %job.id, attempt, "Retrying fetch");
                }
                self.transfer
                    .fetch(&job.spec, dir, ctx.cancel, fetch_progress)
            })
            .await?;

        self.enter(job, Stage::Extract, ctx).await?;
        let attributes = self.extractor.extract(&local, ctx.cancel).await?;
        if let Err(e) = ctx.sink.record_attributes(&job.id, &attributes).await {
            warn!(job_id = %job.id, "Failed to record attributes: {e}");
        }
        ctx.reporter.report(Stage::Extract, 1.0);

        self.enter(job, Stage::Name, ctx).await?;
        let filename = self.resolve_name(job, &local, &attributes, ctx).await?;
        debug!(job_id = %job.id, filename = %filename, "Resolved filename");

        self.enter(job, Stage::Thumbnail, ctx).await?;
        let thumbnail = self
            .thumbnails
            .resolve(job.user_id, job, dir, &attributes, &local.path, ctx.cancel)
            .await;

        self.enter(job, Stage::Deliver, ctx).await?;
        let request = DeliveryRequest {
            job_id: job.id.clone(),
            user_id: job.user_id,
            destination: job.spec.destination.clone(),
            filename: filename.clone(),
            size: local.size,
            mime: attributes.mime.clone(),
            thumbnail,
        };
        let deliver_progress =
            |done: u64, total: Option<u64>| ctx.reporter.bytes(Stage::Deliver, done, total);
        let deliver_progress: ProgressFn<'_> = &deliver_progress;
        let remote_ref = self
            .deliver_retry
            .run("deliver", ctx.cancel, |_| {
                self.transfer
                    .deliver(&local, &request, ctx.cancel, deliver_progress)
            })
            .await?;
        ctx.reporter.report(Stage::Deliver, 1.0);

        Ok((filename, remote_ref))
    }

    async fn enter(
        &self,
        job: &Job,
        stage: Stage,
        ctx: &PipelineContext<'_>,
    ) -> std::result::Result<(), StageError> {
        if ctx.cancel.is_cancelled() {
            return Err(StageError::cancelled());
        }
        if let Err(e) = ctx.sink.enter_stage(&job.id, stage).await {
            // The scheduler refuses stage entries once a job was cancelled.
            if ctx.cancel.is_cancelled() {
                return Err(StageError::cancelled());
            }
            warn!(job_id = %job.id, stage = %stage, "Failed to record stage: {e}");
        }
        ctx.reporter.stage(stage);
        debug!(job_id = %job.id, stage = %stage, "Entering stage");
        Ok(())
    }

    fn check_disk_space(&self) -> std::result::Result<(), StageError> {
        match self.disk.check(&self.temp_root, self.min_free_disk_bytes) {
            DiskSpaceStatus::InsufficientSpace {
                available_bytes,
                required_bytes,
            } => Err(StageError::fatal(
                ErrorKind::IOFailure,
                format!(
                    "insufficient disk space: {available_bytes} bytes free, {required_bytes} required"
                ),
            )),
            _ => Ok(()),
        }
    }

    /// Pattern precedence: the job's own, the user's active one, then the
    /// original name. The counter is only consumed when the pattern uses it,
    /// and a saved pattern has its usage counted once rendered.
    async fn resolve_name(
        &self,
        job: &Job,
        local: &LocalHandle,
        attributes: &JobAttributes,
        ctx: &PipelineContext<'_>,
    ) -> std::result::Result<String, StageError> {
        let active = match &job.spec.pattern {
            Some(template) => Some(ActivePattern {
                name: None,
                template: template.clone(),
            }),
            None => self
                .prefs
                .active_pattern(job.user_id)
                .await
                .unwrap_or_else(|e| {
                    warn!(user_id = job.user_id, "Failed to read active pattern: {e}");
                    None
                }),
        };
        let pattern = active
            .as_ref()
            .map_or(DEFAULT_PATTERN, |a| a.template.as_str());

        let user = self.prefs.profile(job.user_id).await.unwrap_or_else(|e| {
            warn!(user_id = job.user_id, "Failed to read user profile: {e}");
            UserProfile::anonymous(job.user_id)
        });

        let counter = if uses_counter(pattern) {
            ctx.sink.next_counter(job.user_id).await.map_err(|e| {
                StageError::fatal(
                    ErrorKind::IOFailure,
                    format!("reserving naming counter: {e}"),
                )
            })?
        } else {
            0
        };

        let naming = NamingContext {
            attributes,
            user: &user,
            counter,
            original_name: &local.original_name,
            now: Local::now(),
        };
        let filename = self.naming.render(pattern, &naming);

        if let Some(name) = active.as_ref().and_then(|a| a.name.as_deref())
            && let Err(e) = self.prefs.record_pattern_usage(job.user_id, name).await
        {
            warn!(user_id = job.user_id, pattern = name, "Failed to record pattern usage: {e}");
        }
        Ok(filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobSpec, SourceRef, ThumbnailRef};
    use crate::media::FileMetadataExtractor;
    use crate::transfer::{DirectorySink, TransferExecutor};
    use crate::utils::http_client::build_client;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSink {
        stages: Mutex<Vec<Stage>>,
        attributes: Mutex<Option<JobAttributes>>,
        counter: AtomicU64,
    }

    #[async_trait]
    impl JobStateSink for RecordingSink {
        async fn enter_stage(&self, _: &str, stage: Stage) -> Result<()> {
            self.stages.lock().push(stage);
            Ok(())
        }
        async fn record_attributes(&self, _: &str, attributes: &JobAttributes) -> Result<bool> {
            let mut slot = self.attributes.lock();
            if slot.is_some() {
                return Ok(false);
            }
            *slot = Some(attributes.clone());
            Ok(true)
        }
        async fn next_counter(&self, _: UserId) -> Result<u64> {
            Ok(self.counter.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    struct NoPrefs;

    #[async_trait]
    impl PreferenceStore for NoPrefs {
        async fn active_pattern(&self, _: UserId) -> Result<Option<ActivePattern>> {
            Ok(None)
        }
        async fn permanent_thumbnail(&self, _: UserId) -> Result<Option<ThumbnailRef>> {
            Ok(None)
        }
        async fn profile(&self, user_id: UserId) -> Result<UserProfile> {
            Ok(UserProfile::anonymous(user_id))
        }
    }

    /// Has one saved pattern active and counts its uses.
    #[derive(Default)]
    struct SavedPattern {
        uses: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PreferenceStore for SavedPattern {
        async fn active_pattern(&self, _: UserId) -> Result<Option<ActivePattern>> {
            Ok(Some(ActivePattern {
                name: Some("numbered".to_string()),
                template: "{original}_{counter:03}".to_string(),
            }))
        }
        async fn permanent_thumbnail(&self, _: UserId) -> Result<Option<ThumbnailRef>> {
            Ok(None)
        }
        async fn profile(&self, user_id: UserId) -> Result<UserProfile> {
            Ok(UserProfile::anonymous(user_id))
        }
        async fn record_pattern_usage(&self, _: UserId, name: &str) -> Result<()> {
            self.uses.lock().push(name.to_string());
            Ok(())
        }
    }

    struct Setup {
        dir: TempDir,
        pipeline: JobPipeline,
    }

    fn setup() -> Setup {
        setup_with(Arc::new(NoPrefs))
    }

    fn setup_with(prefs: Arc<dyn PreferenceStore>) -> Setup {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("uploads")).unwrap();
        let transfer = TransferExecutor::new(
            build_client(Duration::from_secs(5), Duration::from_secs(5)).unwrap(),
            dir.path().join("uploads"),
            Arc::new(DirectorySink::new(dir.path().join("outbox"))),
        );
        let pipeline = JobPipeline::new(
            Arc::new(transfer),
            Arc::new(FileMetadataExtractor::new()),
            prefs,
            dir.path().join("temp"),
        )
        .with_fetch_retry(RetryPolicy::no_retry())
        .with_deliver_retry(RetryPolicy::no_retry());
        Setup { dir, pipeline }
    }

    #[tokio::test]
    async fn test_runs_every_stage_in_order() {
        let s = setup();
        std::fs::write(s.dir.path().join("uploads/notes.txt"), b"hello world").unwrap();
        let job = Job::new(
            JobSpec::new(1, SourceRef::upload("notes.txt"))
                .with_pattern("{counter}_{original}")
                .with_destination("inbox"),
        );

        let sink = RecordingSink::default();
        let reporter = ProgressReporter::noop(&job.id);
        let cancel = CancellationToken::new();
        let ctx = PipelineContext {
            cancel: &cancel,
            reporter: &reporter,
            sink: &sink,
        };
        let outcome = s.pipeline.run(&job, &ctx).await;

        let PipelineOutcome::Succeeded {
            filename,
            remote_ref,
        } = outcome
        else {
            panic!("unexpected outcome: {outcome:?}");
        };
        assert_eq!(filename, "01_notes.txt");
        assert_eq!(std::fs::read(&remote_ref.0).unwrap(), b"hello world");
        assert_eq!(*sink.stages.lock(), Stage::ALL.to_vec());
        assert_eq!(sink.attributes.lock().as_ref().unwrap().size_bytes, 11);
        assert!(!s.dir.path().join("temp").join(&job.id).exists());
    }

    #[tokio::test]
    async fn test_counter_untouched_without_placeholder() {
        let s = setup();
        std::fs::write(s.dir.path().join("uploads/a.txt"), b"a").unwrap();
        let job = Job::new(JobSpec::new(1, SourceRef::upload("a.txt")));

        let sink = RecordingSink::default();
        let reporter = ProgressReporter::noop(&job.id);
        let cancel = CancellationToken::new();
        let ctx = PipelineContext {
            cancel: &cancel,
            reporter: &reporter,
            sink: &sink,
        };
        let outcome = s.pipeline.run(&job, &ctx).await;
        assert!(matches!(outcome, PipelineOutcome::Succeeded { ref filename, .. } if filename == "a.txt"));
        assert_eq!(sink.counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let s = setup();
        let job = Job::new(JobSpec::new(1, SourceRef::upload("missing.bin")));
        let sink = RecordingSink::default();
        let reporter = ProgressReporter::noop(&job.id);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = PipelineContext {
            cancel: &cancel,
            reporter: &reporter,
            sink: &sink,
        };
        assert_eq!(s.pipeline.run(&job, &ctx).await, PipelineOutcome::Cancelled);
        assert!(sink.stages.lock().is_empty());
    }

    #[tokio::test]
    async fn test_empty_file_fails_extraction() {
        let s = setup();
        std::fs::write(s.dir.path().join("uploads/empty.mkv"), b"").unwrap();
        let job = Job::new(JobSpec::new(1, SourceRef::upload("empty.mkv")));
        let sink = RecordingSink::default();
        let reporter = ProgressReporter::noop(&job.id);
        let cancel = CancellationToken::new();
        let ctx = PipelineContext {
            cancel: &cancel,
            reporter: &reporter,
            sink: &sink,
        };

        let PipelineOutcome::Failed(err) = s.pipeline.run(&job, &ctx).await else {
            panic!("expected failure");
        };
        assert_eq!(err.kind, ErrorKind::UnsupportedFormat);
        assert_eq!(*sink.stages.lock(), vec![Stage::Fetch, Stage::Extract]);
        assert!(!s.dir.path().join("temp").join(&job.id).exists());
    }

    #[tokio::test]
    async fn test_disk_guard_fails_fetch() {
        let s = setup();
        let pipeline = s.pipeline.with_min_free_disk(u64::MAX);
        std::fs::write(s.dir.path().join("uploads/a.txt"), b"a").unwrap();
        let job = Job::new(JobSpec::new(1, SourceRef::upload("a.txt")));
        let sink = RecordingSink::default();
        let reporter = ProgressReporter::noop(&job.id);
        let cancel = CancellationToken::new();
        let ctx = PipelineContext {
            cancel: &cancel,
            reporter: &reporter,
            sink: &sink,
        };

        let outcome = tokio::time::timeout(Duration::from_secs(10), pipeline.run(&job, &ctx))
            .await
            .unwrap();
        // Mount information may be unavailable in sandboxes; then the guard
        // lets the job through.
        match outcome {
            PipelineOutcome::Failed(err) => {
                assert_eq!(err.kind, ErrorKind::IOFailure);
                assert!(!err.is_transient());
            }
            PipelineOutcome::Succeeded { .. } => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_saved_pattern_usage_is_recorded() {
        let prefs = Arc::new(SavedPattern::default());
        let s = setup_with(prefs.clone());
        std::fs::write(s.dir.path().join("uploads/a.txt"), b"a").unwrap();
        let sink = RecordingSink::default();
        let reporter = ProgressReporter::noop("job");
        let cancel = CancellationToken::new();
        let ctx = PipelineContext {
            cancel: &cancel,
            reporter: &reporter,
            sink: &sink,
        };

        let job = Job::new(JobSpec::new(1, SourceRef::upload("a.txt")));
        let outcome = s.pipeline.run(&job, &ctx).await;
        assert!(matches!(outcome, PipelineOutcome::Succeeded { ref filename, .. } if filename == "a_001.txt"));
        assert_eq!(*prefs.uses.lock(), vec!["numbered".to_string()]);

        // A per-job pattern is not a saved one.
        std::fs::write(s.dir.path().join("uploads/b.txt"), b"b").unwrap();
        let job = Job::new(JobSpec::new(1, SourceRef::upload("b.txt")).with_pattern("{original}"));
        s.pipeline.run(&job, &ctx).await;
        assert_eq!(prefs.uses.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_job_thumbnail_removed_when_job_ends() {
        let s = setup();
        let sink = RecordingSink::default();
        let reporter = ProgressReporter::noop("job");
        let cancel = CancellationToken::new();
        let ctx = PipelineContext {
            cancel: &cancel,
            reporter: &reporter,
            sink: &sink,
        };

        std::fs::write(s.dir.path().join("uploads/a.txt"), b"a").unwrap();
        let thumb = s.dir.path().join("a.thumb.jpg");
        std::fs::write(&thumb, b"jpeg").unwrap();
        let job = Job::new(JobSpec::new(1, SourceRef::upload("a.txt")).with_thumbnail(&thumb));
        let outcome = s.pipeline.run(&job, &ctx).await;
        let PipelineOutcome::Succeeded { remote_ref, .. } = outcome else {
            panic!("unexpected outcome: {outcome:?}");
        };
        let delivered = std::path::PathBuf::from(&remote_ref.0);
        assert_eq!(std::fs::read(delivered.with_extension("thumb.jpg")).unwrap(), b"jpeg");
        assert!(!thumb.exists());

        // Failed jobs drop theirs too.
        std::fs::write(s.dir.path().join("uploads/empty.bin"), b"").unwrap();
        std::fs::write(&thumb, b"jpeg").unwrap();
        let job = Job::new(JobSpec::new(1, SourceRef::upload("empty.bin")).with_thumbnail(&thumb));
        assert!(matches!(s.pipeline.run(&job, &ctx).await, PipelineOutcome::Failed(_)));
        assert!(!thumb.exists());
    }
}
