//! Job database models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;

use crate::domain::{Job, JobAttributes, JobError, JobSpec, JobStatus, Stage};
use crate::error::ErrorKind;
use crate::{Error, Result};

/// Job database model.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: String,
    pub user_id: i64,
    /// Status: queued, running, succeeded, failed, cancelled
    pub status: String,
    /// Last stage entered, if any
    pub stage: Option<String>,
    pub retry_count: i64,
    /// JSON blob of the submitted JobSpec
    pub spec: String,
    pub filename: Option<String>,
    pub remote_ref: Option<String>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub dispatch_seq: Option<i64>,
    /// RFC 3339 timestamp when the job was created
    pub created_at: String,
    /// RFC 3339 timestamp when the job was last updated
    pub updated_at: String,
}

fn parse_time(field: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Database(format!("invalid {field} timestamp '{value}': {e}")))
}

impl JobDbModel {
    pub fn from_job(job: &Job) -> Result<Self> {
        Ok(Self {
            id: job.id.clone(),
            user_id: job.user_id,
            status: job.status.as_str().to_string(),
            stage: job.stage.map(|s| s.as_str().to_string()),
            retry_count: i64::from(job.retry_count),
            spec: serde_json::to_string(&job.spec)?,
            filename: job.filename.clone(),
            remote_ref: job.remote_ref.clone(),
            error_kind: job.error.as_ref().map(|e| e.kind.to_string()),
            error_message: job.error.as_ref().map(|e| e.message.clone()),
            dispatch_seq: job.dispatch_seq.map(|s| s as i64),
            created_at: job.created_at.to_rfc3339(),
            updated_at: job.updated_at.to_rfc3339(),
        })
    }

    pub fn into_job(self) -> Result<Job> {
        let status = JobStatus::parse(&self.status)
            .ok_or_else(|| Error::Database(format!("unknown job status '{}'", self.status)))?;
        let stage = self.stage.as_deref().and_then(Stage::parse);
        let spec: JobSpec = serde_json::from_str(&self.spec)?;
        let error = match self.error_kind.as_deref() {
            Some(kind) => Some(JobError {
                kind: ErrorKind::from_str(kind).unwrap_or(ErrorKind::IOFailure),
                message: self.error_message.clone().unwrap_or_default(),
            }),
            None => None,
        };

        Ok(Job {
            created_at: parse_time("created_at", &self.created_at)?,
            updated_at: parse_time("updated_at", &self.updated_at)?,
            id: self.id,
            user_id: self.user_id,
            spec,
            stage,
            status,
            retry_count: u32::try_from(self.retry_count).unwrap_or(0),
            dispatch_seq: self.dispatch_seq.and_then(|s| u64::try_from(s).ok()),
            filename: self.filename,
            remote_ref: self.remote_ref,
            error,
        })
    }
}

/// Write-once attributes row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobAttributesDbModel {
    pub job_id: String,
    /// JSON blob of JobAttributes
    pub attributes: String,
    pub created_at: String,
}

impl JobAttributesDbModel {
    pub fn new(job_id: &str, attributes: &JobAttributes) -> Result<Self> {
        Ok(Self {
            job_id: job_id.to_string(),
            attributes: serde_json::to_string(attributes)?,
            created_at: Utc::now().to_rfc3339(),
        })
    }

    pub fn decode(&self) -> Result<JobAttributes> {
        Ok(serde_json::from_str(&self.attributes)?)
    }
}

/// Archived terminal job.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobArchiveDbModel {
    pub id: String,
    pub user_id: i64,
    pub status: String,
    pub retry_count: i64,
    pub spec: String,
    pub filename: Option<String>,
    pub remote_ref: Option<String>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub attributes: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub archived_at: String,
}
