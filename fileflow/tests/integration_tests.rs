//! Integration tests for the persistence layer and the services built on it.
//!
//! Every test opens its own file-backed SQLite database in a temp directory
//! so pooled connections share one schema.

use chrono::{Duration as ChronoDuration, Utc};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use fileflow::Error;
use fileflow::access::StaticAccessGate;
use fileflow::database::models::JobDbModel;
use fileflow::database::repositories::{
    CounterRepository, JobRepository, PreferenceRepository, SqlxCounterRepository,
    SqlxJobRepository, SqlxPreferenceRepository,
};
use fileflow::database::{DbPool, init_pool_with_size, run_migrations};
use fileflow::domain::{Job, JobSpec, JobStatus, SourceRef, ThumbnailScope};
use fileflow::pipeline::{JobQueue, JobQueueConfig, PurgeConfig, PurgeService};
use fileflow::preferences::{PreferenceService, PreferenceStore};
use fileflow::transfer::DirectorySink;

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

fn queue_for(pool: &DbPool, temp_root: &Path, config: JobQueueConfig) -> JobQueue {
    JobQueue::new(
        config,
        Arc::new(SqlxJobRepository::new(pool.clone())),
        Arc::new(SqlxCounterRepository::new(pool.clone())),
        Arc::new(StaticAccessGate::allow_all()),
        temp_root,
    )
}

/// Insert a job row directly, bypassing the scheduler.
async fn insert_job(
    repo: &SqlxJobRepository,
    status: JobStatus,
    retry_count: u32,
    age: ChronoDuration,
) -> Job {
    let mut job = Job::new(JobSpec::new(1, SourceRef::upload("clip.mkv")));
    job.status = status;
    job.retry_count = retry_count;
    job.created_at = Utc::now() - age;
    job.updated_at = job.created_at;
    repo.create_job(&JobDbModel::from_job(&job).unwrap())
        .await
        .unwrap();
    job
}

mod database_tests {
    use super::*;

    #[tokio::test]
    async fn test_database_migrations() {
        let dir = TempDir::new().unwrap();
        let pool = setup_test_db(dir.path()).await;

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .expect("Failed to query tables");
        let table_names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();

        for table in [
            "jobs",
            "job_attributes",
            "job_archive",
            "user_preferences",
            "rename_patterns",
            "user_counters",
        ] {
            assert!(table_names.contains(&table), "{table} table missing");
        }
    }

    #[tokio::test]
    async fn test_counter_is_per_user_and_strictly_increasing() {
        let dir = TempDir::new().unwrap();
        let pool = setup_test_db(dir.path()).await;
        let counters = Arc::new(SqlxCounterRepository::new(pool));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..20 {
            let counters = counters.clone();
            tasks.spawn(async move { counters.next_value(1).await.unwrap() });
        }
        let mut values = Vec::new();
        while let Some(value) = tasks.join_next().await {
            values.push(value.unwrap());
        }
        values.sort_unstable();
        assert_eq!(values, (1..=20).collect::<Vec<i64>>());

        assert_eq!(counters.next_value(2).await.unwrap(), 1);
        assert_eq!(counters.current_value(1).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_terminal_rows_are_not_reopened() {
        let dir = TempDir::new().unwrap();
        let pool = setup_test_db(dir.path()).await;
        let repo = SqlxJobRepository::new(pool);

        let mut job = insert_job(&repo, JobStatus::Cancelled, 0, ChronoDuration::zero()).await;
        job.status = JobStatus::Running;
        let changed = repo
            .update_job(&JobDbModel::from_job(&job).unwrap())
            .await
            .unwrap();
        assert!(!changed);
        assert_eq!(repo.get_job(&job.id).await.unwrap().status, "cancelled");
    }
}

mod recovery_tests {
    use super::*;

    #[tokio::test]
    async fn test_recover_requeues_interrupted_jobs() {
        let dir = TempDir::new().unwrap();
        let pool = setup_test_db(dir.path()).await;
        let repo = SqlxJobRepository::new(pool.clone());
        let temp_root = dir.path().join("temp");

        let interrupted = insert_job(&repo, JobStatus::Running, 0, ChronoDuration::minutes(5)).await;
        // Already at the explicit-retry cap; recovery still requeues it.
        let veteran = insert_job(&repo, JobStatus::Running, 3, ChronoDuration::minutes(4)).await;
        let waiting = insert_job(&repo, JobStatus::Queued, 0, ChronoDuration::minutes(3)).await;

        // Leftovers of the interrupted run
        let orphan = temp_root.join(&interrupted.id);
        std::fs::create_dir_all(&orphan).unwrap();
        std::fs::write(orphan.join("source_clip.mkv"), b"partial").unwrap();
        std::fs::write(temp_root.join("stray.part"), b"x").unwrap();

        let queue = queue_for(&pool, &temp_root, JobQueueConfig::default());
        let report = queue.recover().await.unwrap();

        assert_eq!(report.requeued, 2);
        assert_eq!(report.reloaded, 3);
        assert_eq!(report.temp_entries_removed, 2);
        assert_eq!(std::fs::read_dir(&temp_root).unwrap().count(), 0);

        let job = queue.status(&interrupted.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 1);

        let job = queue.status(&veteran.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 4);
        assert!(job.error.is_none());

        // Requeued work dispatches in creation order.
        let first = queue.try_dispatch().await.unwrap();
        assert_eq!(first.job.id, interrupted.id);
        drop(first.slot);
        assert_eq!(queue.depth(), 2);
        assert_eq!(queue.list_active(1).await.unwrap().len(), 3);
        assert!(queue.list_active(1).await.unwrap().iter().any(|j| j.id == waiting.id));
    }

    #[tokio::test]
    async fn test_recover_clears_partial_deliveries() {
        let dir = TempDir::new().unwrap();
        let pool = setup_test_db(dir.path()).await;
        let sink = DirectorySink::new(dir.path().join("outbox"));
        let staging = sink.staging_dir();

        // What a killed process leaves behind mid-delivery
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("job-a.0f3c.part"), b"half").unwrap();
        std::fs::write(staging.join("job-b.91aa.part"), b"half").unwrap();
        let delivered = dir.path().join("outbox").join("kept.bin");
        std::fs::write(&delivered, b"done").unwrap();

        let queue = queue_for(&pool, &dir.path().join("temp"), JobQueueConfig::default())
            .with_staging_dir(&staging);
        let report = queue.recover().await.unwrap();

        assert_eq!(report.partial_deliveries_removed, 2);
        assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
        assert_eq!(std::fs::read(&delivered).unwrap(), b"done");
    }

    #[tokio::test]
    async fn test_dispatch_order_survives_restart() {
        let dir = TempDir::new().unwrap();
        let pool = setup_test_db(dir.path()).await;
        let temp_root = dir.path().join("temp");

        let before = queue_for(&pool, &temp_root, JobQueueConfig::default());
        before.recover().await.unwrap();
        let id = before
            .submit(JobSpec::new(1, SourceRef::upload("a.txt")))
            .await
            .unwrap();
        let first = before.try_dispatch().await.unwrap();
        let first_seq = first.job.dispatch_seq.unwrap();
        drop(first);
        drop(before);

        let after = queue_for(&pool, &temp_root, JobQueueConfig::default());
        after.recover().await.unwrap();
        let again = after.try_dispatch().await.unwrap();
        assert_eq!(again.job.id, id);
        assert_eq!(again.job.retry_count, 1);
        assert!(again.job.dispatch_seq.unwrap() > first_seq);
    }

    #[tokio::test]
    async fn test_retry_after_failure_is_bounded() {
        let dir = TempDir::new().unwrap();
        let pool = setup_test_db(dir.path()).await;
        let repo = SqlxJobRepository::new(pool.clone());
        let failed = insert_job(&repo, JobStatus::Failed, 3, ChronoDuration::zero()).await;
        let retryable = insert_job(&repo, JobStatus::Failed, 1, ChronoDuration::zero()).await;

        let queue = queue_for(&pool, &dir.path().join("temp"), JobQueueConfig::default());
        queue.recover().await.unwrap();

        let err = queue.retry(&failed.id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));

        let job = queue.retry(&retryable.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 2);
        assert_eq!(repo.get_job(&retryable.id).await.unwrap().status, "queued");
    }
}

mod purge_tests {
    use super::*;

    #[tokio::test]
    async fn test_purge_archives_old_terminal_jobs() {
        let dir = TempDir::new().unwrap();
        let pool = setup_test_db(dir.path()).await;
        let repo = Arc::new(SqlxJobRepository::new(pool.clone()));

        let old_done = insert_job(&repo, JobStatus::Succeeded, 0, ChronoDuration::days(60)).await;
        let old_failed = insert_job(&repo, JobStatus::Failed, 0, ChronoDuration::days(45)).await;
        let recent = insert_job(&repo, JobStatus::Succeeded, 0, ChronoDuration::days(1)).await;
        let old_queued = insert_job(&repo, JobStatus::Queued, 0, ChronoDuration::days(90)).await;

        let queue = Arc::new(queue_for(
            &pool,
            &dir.path().join("temp"),
            JobQueueConfig::default(),
        ));
        let purge = PurgeService::new(
            PurgeConfig::default().with_retention_days(30).with_batch_size(1),
            repo.clone(),
            queue,
        );

        assert_eq!(purge.run_purge().await.unwrap(), 2);

        for id in [&old_done.id, &old_failed.id] {
            let err = repo.get_job(id).await.unwrap_err();
            assert!(matches!(err, Error::NotFound { .. }));
        }
        assert!(repo.get_job(&recent.id).await.is_ok());
        assert!(repo.get_job(&old_queued.id).await.is_ok());

        let (archived,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM job_archive")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(archived, 2);

        // Nothing left to do on a second pass
        assert_eq!(purge.run_purge().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_zero_retention_keeps_everything() {
        let dir = TempDir::new().unwrap();
        let pool = setup_test_db(dir.path()).await;
        let repo = Arc::new(SqlxJobRepository::new(pool.clone()));
        insert_job(&repo, JobStatus::Succeeded, 0, ChronoDuration::days(400)).await;

        let queue = Arc::new(queue_for(
            &pool,
            &dir.path().join("temp"),
            JobQueueConfig::default(),
        ));
        let purge = PurgeService::new(PurgeConfig::default().with_retention_days(0), repo, queue);
        assert_eq!(purge.run_purge().await.unwrap(), 0);
    }
}

mod preference_tests {
    use super::*;

    fn service(pool: &DbPool, dir: &Path) -> PreferenceService {
        PreferenceService::new(
            Arc::new(SqlxPreferenceRepository::new(pool.clone())),
            dir.join("thumbnails"),
        )
    }

    #[tokio::test]
    async fn test_saved_patterns_and_active_pattern() {
        let dir = TempDir::new().unwrap();
        let pool = setup_test_db(dir.path()).await;
        let prefs = service(&pool, dir.path());

        prefs.save_pattern(5, "dated", "{date}_{original}").await.unwrap();
        prefs.save_pattern(5, "numbered", "{counter}").await.unwrap();
        assert!(matches!(
            prefs.save_pattern(5, "broken", "{date").await,
            Err(Error::Validation(_))
        ));
        assert!(prefs.save_pattern(5, "  ", "{date}").await.is_err());

        let names: Vec<String> = prefs
            .list_patterns(5)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"dated".to_string()));

        assert_eq!(prefs.active_pattern(5).await.unwrap(), None);
        let active = prefs.set_active_pattern(5, Some("numbered")).await.unwrap();
        assert_eq!(active.as_deref(), Some("{counter}"));
        let active = prefs.active_pattern(5).await.unwrap().unwrap();
        assert_eq!(active.name.as_deref(), Some("numbered"));
        assert_eq!(active.template, "{counter}");

        prefs.set_pattern_template(5, "{user}_{original}").await.unwrap();
        let active = prefs.active_pattern(5).await.unwrap().unwrap();
        assert_eq!(active.name, None);
        assert_eq!(active.template, "{user}_{original}");

        assert!(matches!(
            prefs.set_active_pattern(5, Some("missing")).await,
            Err(Error::NotFound { .. })
        ));

        prefs.set_active_pattern(5, None).await.unwrap();
        assert_eq!(prefs.active_pattern(5).await.unwrap(), None);

        prefs.delete_pattern(5, "dated").await.unwrap();
        assert!(matches!(
            prefs.delete_pattern(5, "dated").await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_profile_and_permanent_thumbnail() {
        let dir = TempDir::new().unwrap();
        let pool = setup_test_db(dir.path()).await;
        let prefs = service(&pool, dir.path());

        let anonymous = prefs.profile(8).await.unwrap();
        assert_eq!(anonymous.user_id, 8);
        assert!(anonymous.username.is_none());

        prefs
            .upsert_profile(8, Some("mira"), Some("Mira K"))
            .await
            .unwrap();
        let profile = prefs.profile(8).await.unwrap();
        assert_eq!(profile.username.as_deref(), Some("mira"));

        let source = dir.path().join("cover.jpg");
        std::fs::write(&source, b"\xFF\xD8\xFF\xE0jpeg").unwrap();
        let stored = prefs.set_permanent_thumbnail(8, &source).await.unwrap();
        assert_eq!(stored.scope, ThumbnailScope::Permanent);
        assert!(stored.path.ends_with("8.jpg"));
        assert_eq!(std::fs::read(&stored.path).unwrap(), b"\xFF\xD8\xFF\xE0jpeg");

        let found = prefs.permanent_thumbnail(8).await.unwrap().unwrap();
        assert_eq!(found.path, stored.path);

        prefs.clear_permanent_thumbnail(8).await.unwrap();
        assert!(prefs.permanent_thumbnail(8).await.unwrap().is_none());
        assert!(!stored.path.exists());
        // Profile survives thumbnail changes
        assert_eq!(
            prefs.profile(8).await.unwrap().display_name.as_deref(),
            Some("Mira K")
        );
    }

    #[tokio::test]
    async fn test_presets_and_usage_counts() {
        let dir = TempDir::new().unwrap();
        let pool = setup_test_db(dir.path()).await;
        let prefs = service(&pool, dir.path());

        assert!(prefs.presets().iter().any(|p| p.name == "professional"));
        let template = prefs.apply_preset(6, "Professional").await.unwrap();
        assert_eq!(template, "{year}{month}{day}_{counter:04}_{original}");
        assert!(matches!(
            prefs.apply_preset(6, "no_such_preset").await,
            Err(Error::NotFound { .. })
        ));

        let active = prefs.active_pattern(6).await.unwrap().unwrap();
        assert_eq!(active.name.as_deref(), Some("professional"));

        prefs.record_pattern_usage(6, "professional").await.unwrap();
        prefs.record_pattern_usage(6, "professional").await.unwrap();
        // Unknown names are tolerated.
        prefs.record_pattern_usage(6, "deleted").await.unwrap();

        // Re-applying keeps the count.
        prefs.apply_preset(6, "professional").await.unwrap();
        let saved = prefs.list_patterns(6).await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].usage_count, 2);
        assert!(saved[0].last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_thumbnails_must_be_jpeg_without_converter() {
        let dir = TempDir::new().unwrap();
        let pool = setup_test_db(dir.path()).await;
        let prefs = service(&pool, dir.path());

        let png = dir.path().join("cover.png");
        std::fs::write(&png, b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR").unwrap();
        assert!(matches!(
            prefs.set_permanent_thumbnail(8, &png).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            prefs.set_next_thumbnail(8, &png).await,
            Err(Error::Validation(_))
        ));
        assert!(prefs.permanent_thumbnail(8).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_next_upload_thumbnail_is_taken_once() {
        let dir = TempDir::new().unwrap();
        let pool = setup_test_db(dir.path()).await;
        let prefs = service(&pool, dir.path());
        let source = dir.path().join("once.jpg");
        std::fs::write(&source, b"\xFF\xD8\xFF\xE0jpeg").unwrap();

        let first = prefs.set_next_thumbnail(3, &source).await.unwrap();
        let second = prefs.set_next_thumbnail(3, &source).await.unwrap();
        // Replacing drops the earlier file.
        assert!(!first.path.exists());

        let taken = prefs.take_next_thumbnail(3).await.unwrap().unwrap();
        assert_eq!(taken.scope, ThumbnailScope::Ephemeral);
        assert_eq!(taken.path, second.path);
        assert!(taken.path.exists());
        assert!(prefs.take_next_thumbnail(3).await.unwrap().is_none());

        // Cleared before use
        let third = prefs.set_next_thumbnail(3, &source).await.unwrap();
        prefs.clear_next_thumbnail(3).await.unwrap();
        assert!(!third.path.exists());
        assert!(prefs.take_next_thumbnail(3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_next_upload_thumbnail_expires_after_a_day() {
        let dir = TempDir::new().unwrap();
        let pool = setup_test_db(dir.path()).await;
        let prefs = service(&pool, dir.path());
        let repo = SqlxPreferenceRepository::new(pool.clone());

        let stale = dir.path().join("stale.jpg");
        std::fs::write(&stale, b"\xFF\xD8\xFF\xE0jpeg").unwrap();
        let set_at = (Utc::now() - ChronoDuration::hours(25)).to_rfc3339();
        repo.set_next_thumbnail(4, Some(&stale.to_string_lossy()), &set_at)
            .await
            .unwrap();

        assert!(prefs.take_next_thumbnail(4).await.unwrap().is_none());
        assert!(!stale.exists());
        assert!(
            repo.get_preferences(4)
                .await
                .unwrap()
                .unwrap()
                .next_thumbnail
                .is_none()
        );
    }
}
