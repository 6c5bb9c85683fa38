//! Job repository.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::database::models::{JobAttributesDbModel, JobDbModel};
use crate::database::retry::retry_on_sqlite_busy;
use crate::{Error, Result};

/// Job repository trait.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn create_job(&self, job: &JobDbModel) -> Result<()>;
    async fn get_job(&self, id: &str) -> Result<JobDbModel>;
    /// Jobs in `status`, oldest first.
    async fn list_jobs_by_status(&self, status: &str) -> Result<Vec<JobDbModel>>;
    /// Queued and running jobs of a user, oldest first.
    async fn list_active_jobs_for_user(&self, user_id: i64) -> Result<Vec<JobDbModel>>;
    /// Overwrite a job row unless it is already terminal. Returns whether a
    /// row changed.
    async fn update_job(&self, job: &JobDbModel) -> Result<bool>;
    /// Overwrite a job row only while it is `failed` (the retry path).
    async fn requeue_failed_job(&self, job: &JobDbModel) -> Result<bool>;
    /// Move every `running` job back to `queued`, incrementing its retry
    /// count. Returns how many were moved.
    async fn reset_running_jobs(&self) -> Result<u64>;
    async fn count_by_status(&self) -> Result<Vec<(String, i64)>>;
    /// Highest dispatch sequence ever assigned to a live job, or 0.
    async fn max_dispatch_seq(&self) -> Result<u64>;

    /// Insert attributes unless the job already has some. Returns whether
    /// the row was written.
    async fn insert_attributes(&self, attributes: &JobAttributesDbModel) -> Result<bool>;
    async fn get_attributes(&self, job_id: &str) -> Result<Option<JobAttributesDbModel>>;

    /// Move up to `limit` terminal jobs last updated before `cutoff` into the
    /// archive table. Returns the archived ids.
    async fn archive_terminal_jobs(&self, cutoff: &str, limit: u32) -> Result<Vec<String>>;
}

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    pool: SqlitePool,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const UPDATE_COLUMNS: &str = "status = ?, stage = ?, retry_count = ?, filename = ?, remote_ref = ?, \
     error_kind = ?, error_message = ?, dispatch_seq = ?, updated_at = ?";

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn create_job(&self, job: &JobDbModel) -> Result<()> {
        retry_on_sqlite_busy("create_job", || async {
            sqlx::query(
                r#"
                INSERT INTO jobs (
                    id, user_id, status, stage, retry_count, spec, filename, remote_ref,
                    error_kind, error_message, dispatch_seq, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&job.id)
            .bind(job.user_id)
            .bind(&job.status)
            .bind(&job.stage)
            .bind(job.retry_count)
            .bind(&job.spec)
            .bind(&job.filename)
            .bind(&job.remote_ref)
            .bind(&job.error_kind)
            .bind(&job.error_message)
            .bind(job.dispatch_seq)
            .bind(&job.created_at)
            .bind(&job.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get_job(&self, id: &str) -> Result<JobDbModel> {
        sqlx::query_as::<_, JobDbModel>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn list_jobs_by_status(&self, status: &str) -> Result<Vec<JobDbModel>> {
        let jobs = sqlx::query_as::<_, JobDbModel>(
            "SELECT * FROM jobs WHERE status = ? ORDER BY created_at, rowid",
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn list_active_jobs_for_user(&self, user_id: i64) -> Result<Vec<JobDbModel>> {
        let jobs = sqlx::query_as::<_, JobDbModel>(
            "SELECT * FROM jobs WHERE user_id = ? AND status IN ('queued', 'running') \
             ORDER BY created_at, rowid",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn update_job(&self, job: &JobDbModel) -> Result<bool> {
        let sql = format!(
            "UPDATE jobs SET {UPDATE_COLUMNS} WHERE id = ? \
             AND status NOT IN ('succeeded', 'failed', 'cancelled')"
        );
        retry_on_sqlite_busy("update_job", || async {
            let result = sqlx::query(&sql)
                .bind(&job.status)
                .bind(&job.stage)
                .bind(job.retry_count)
                .bind(&job.filename)
                .bind(&job.remote_ref)
                .bind(&job.error_kind)
                .bind(&job.error_message)
                .bind(job.dispatch_seq)
                .bind(&job.updated_at)
                .bind(&job.id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn requeue_failed_job(&self, job: &JobDbModel) -> Result<bool> {
        let sql = format!("UPDATE jobs SET {UPDATE_COLUMNS} WHERE id = ? AND status = 'failed'");
        retry_on_sqlite_busy("requeue_failed_job", || async {
            let result = sqlx::query(&sql)
                .bind(&job.status)
                .bind(&job.stage)
                .bind(job.retry_count)
                .bind(&job.filename)
                .bind(&job.remote_ref)
                .bind(&job.error_kind)
                .bind(&job.error_message)
                .bind(job.dispatch_seq)
                .bind(&job.updated_at)
                .bind(&job.id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn reset_running_jobs(&self) -> Result<u64> {
        let now = Utc::now().to_rfc3339();
        retry_on_sqlite_busy("reset_running_jobs", || async {
            let result = sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'queued', retry_count = retry_count + 1, stage = NULL,
                    dispatch_seq = NULL, updated_at = ?
                WHERE status = 'running'
                "#,
            )
            .bind(&now)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn count_by_status(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    async fn max_dispatch_seq(&self) -> Result<u64> {
        let (max,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(dispatch_seq), 0) FROM jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(max.max(0) as u64)
    }

    async fn insert_attributes(&self, attributes: &JobAttributesDbModel) -> Result<bool> {
        retry_on_sqlite_busy("insert_attributes", || async {
            let result = sqlx::query(
                "INSERT INTO job_attributes (job_id, attributes, created_at) VALUES (?, ?, ?) \
                 ON CONFLICT(job_id) DO NOTHING",
            )
            .bind(&attributes.job_id)
            .bind(&attributes.attributes)
            .bind(&attributes.created_at)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn get_attributes(&self, job_id: &str) -> Result<Option<JobAttributesDbModel>> {
        let row = sqlx::query_as::<_, JobAttributesDbModel>(
            "SELECT * FROM job_attributes WHERE job_id = ?",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn archive_terminal_jobs(&self, cutoff: &str, limit: u32) -> Result<Vec<String>> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        let ids: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM jobs WHERE status IN ('succeeded', 'failed', 'cancelled') \
             AND updated_at < ? ORDER BY updated_at LIMIT ?",
        )
        .bind(cutoff)
        .bind(i64::from(limit))
        .fetch_all(&mut *tx)
        .await?;

        for (id,) in &ids {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO job_archive (
                    id, user_id, status, retry_count, spec, filename, remote_ref,
                    error_kind, error_message, attributes, created_at, updated_at, archived_at
                )
                SELECT j.id, j.user_id, j.status, j.retry_count, j.spec, j.filename, j.remote_ref,
                       j.error_kind, j.error_message, a.attributes, j.created_at, j.updated_at, ?
                FROM jobs j LEFT JOIN job_attributes a ON a.job_id = j.id
                WHERE j.id = ?
                "#,
            )
            .bind(&now)
            .bind(id)
            .execute(&mut *tx)
            .await?;

            // Attributes go with the row through ON DELETE CASCADE.
            sqlx::query("DELETE FROM jobs WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }
}
