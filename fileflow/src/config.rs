//! Process configuration.
//!
//! Every setting has a default. `FILEFLOW_*` variables (optionally from a
//! `.env` file) override them; a variable that is set but does not parse is
//! an error rather than a silent fallback.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::domain::{RetryPolicy, UserId};
use crate::pipeline::{JobQueueConfig, PurgeConfig, WorkerPoolConfig};
use crate::thumbnail::DEFAULT_THUMBNAIL_SIZE;
use crate::{Error, Result};

const ENV_PREFIX: &str = "FILEFLOW_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,

    pub global_slots: usize,
    pub per_user_slots: usize,
    pub max_outstanding_per_user: usize,
    pub max_job_retries: u32,
    /// Retries of a transient fetch or deliver failure within one run.
    pub transfer_retries: u32,

    pub max_file_size_bytes: u64,
    pub chunk_size_bytes: usize,
    /// Zero disables the free-space check before fetching.
    pub min_free_disk_bytes: u64,
    /// Zero disables the per-job timeout.
    pub job_timeout_secs: u64,

    pub temp_root: PathBuf,
    /// Where the transport layer stages uploaded files.
    pub upload_root: PathBuf,
    /// Delivery directory, used unless `delivery_endpoint` is set.
    pub outbox: PathBuf,
    /// HTTP endpoint receiving deliveries.
    pub delivery_endpoint: Option<String>,
    pub thumbnail_root: PathBuf,
    pub thumbnail_width: u32,

    pub progress_interval_ms: u64,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,

    /// Empty allows every user.
    pub allowed_users: Vec<UserId>,

    pub retention_days: u32,
    /// Local-time purge window, e.g. "02:00-05:00".
    pub purge_window: Option<String>,

    pub log_dir: PathBuf,
    pub log_retention_days: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:fileflow.db?mode=rwc".to_string(),
            global_slots: 3,
            per_user_slots: 1,
            max_outstanding_per_user: 100,
            max_job_retries: 3,
            transfer_retries: 3,
            max_file_size_bytes: 2 * 1024 * 1024 * 1024,
            chunk_size_bytes: 1024 * 1024,
            min_free_disk_bytes: 0,
            job_timeout_secs: 0,
            temp_root: PathBuf::from("./temp"),
            upload_root: PathBuf::from("./uploads"),
            outbox: PathBuf::from("./outbox"),
            delivery_endpoint: None,
            thumbnail_root: PathBuf::from("./thumbnails"),
            thumbnail_width: DEFAULT_THUMBNAIL_SIZE,
            progress_interval_ms: 2000,
            connect_timeout_secs: 30,
            read_timeout_secs: 60,
            allowed_users: Vec::new(),
            retention_days: 30,
            purge_window: None,
            log_dir: PathBuf::from("./logs"),
            log_retention_days: 7,
        }
    }
}

impl AppConfig {
    /// Load `.env` if present, then apply process environment overrides.
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "Loaded .env file");
        }
        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Build from an arbitrary variable source. `DATABASE_URL` is read
    /// unprefixed; everything else uses `FILEFLOW_`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut c = Self::default();
        let env = EnvReader { lookup: &lookup };

        if let Some(url) = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()) {
            c.database_url = url;
        }

        env.parse("GLOBAL_SLOTS", &mut c.global_slots)?;
        env.parse("PER_USER_SLOTS", &mut c.per_user_slots)?;
        env.parse("MAX_OUTSTANDING_PER_USER", &mut c.max_outstanding_per_user)?;
        env.parse("MAX_JOB_RETRIES", &mut c.max_job_retries)?;
        env.parse("TRANSFER_RETRIES", &mut c.transfer_retries)?;
        env.parse("MAX_FILE_SIZE_BYTES", &mut c.max_file_size_bytes)?;
        env.parse("CHUNK_SIZE_BYTES", &mut c.chunk_size_bytes)?;
        env.parse("MIN_FREE_DISK_BYTES", &mut c.min_free_disk_bytes)?;
        env.parse("JOB_TIMEOUT_SECS", &mut c.job_timeout_secs)?;
        env.path("TEMP_ROOT", &mut c.temp_root);
        env.path("UPLOAD_ROOT", &mut c.upload_root);
        env.path("OUTBOX", &mut c.outbox);
        if let Some(endpoint) = env.string("DELIVERY_ENDPOINT") {
            url::Url::parse(&endpoint).map_err(|e| {
                Error::config(format!("{ENV_PREFIX}DELIVERY_ENDPOINT is not a URL: {e}"))
            })?;
            c.delivery_endpoint = Some(endpoint);
        }
        env.path("THUMBNAIL_ROOT", &mut c.thumbnail_root);
        env.parse("THUMBNAIL_WIDTH", &mut c.thumbnail_width)?;
        env.parse("PROGRESS_INTERVAL_MS", &mut c.progress_interval_ms)?;
        env.parse("CONNECT_TIMEOUT_SECS", &mut c.connect_timeout_secs)?;
        env.parse("READ_TIMEOUT_SECS", &mut c.read_timeout_secs)?;
        if let Some(users) = env.string("ALLOWED_USERS") {
            c.allowed_users = parse_user_list(&users)?;
        }
        env.parse("RETENTION_DAYS", &mut c.retention_days)?;
        if let Some(window) = env.string("PURGE_WINDOW") {
            c.purge_window = Some(window);
        }
        env.path("LOG_DIR", &mut c.log_dir);
        env.parse("LOG_RETENTION_DAYS", &mut c.log_retention_days)?;

        Ok(c)
    }

    pub fn validate(&self) -> Result<()> {
        if self.global_slots == 0 {
            return Err(Error::config("global_slots must be at least 1"));
        }
        if self.per_user_slots == 0 {
            return Err(Error::config("per_user_slots must be at least 1"));
        }
        if self.chunk_size_bytes == 0 {
            return Err(Error::config("chunk_size_bytes must be at least 1"));
        }
        if self.max_outstanding_per_user == 0 {
            return Err(Error::config("max_outstanding_per_user must be at least 1"));
        }
        Ok(())
    }

    pub fn queue_config(&self) -> JobQueueConfig {
        JobQueueConfig {
            global_slots: self.global_slots,
            per_user_slots: self.per_user_slots,
            max_outstanding_per_user: self.max_outstanding_per_user,
            max_job_retries: self.max_job_retries,
            progress_interval_ms: self.progress_interval_ms,
            ..JobQueueConfig::default()
        }
    }

    /// One worker per global slot.
    pub fn worker_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers: self.global_slots,
            job_timeout_secs: self.job_timeout_secs,
            ..WorkerPoolConfig::default()
        }
    }

    pub fn purge_config(&self) -> PurgeConfig {
        PurgeConfig::default()
            .with_retention_days(self.retention_days)
            .with_time_window(self.purge_window.clone())
    }

    pub fn transfer_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_max_retries(self.transfer_retries)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

struct EnvReader<'a, F> {
    lookup: &'a F,
}

impl<F> EnvReader<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-empty trimmed value of `FILEFLOW_<key>`.
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{key}"))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn path(&self, key: &str, target: &mut PathBuf) {
        if let Some(value) = self.string(key) {
            *target = PathBuf::from(value);
        }
    }

    fn parse<T>(&self, key: &str, target: &mut T) -> Result<()>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(raw) = self.string(key) {
            *target = raw.parse().map_err(|e| {
                Error::config(format!("invalid {ENV_PREFIX}{key} value {raw:?}: {e}"))
            })?;
        }
        Ok(())
    }
}

/// Comma-separated user ids.
fn parse_user_list(raw: &str) -> Result<Vec<UserId>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<UserId>().map_err(|e| {
                Error::config(format!("invalid user id {s:?} in {ENV_PREFIX}ALLOWED_USERS: {e}"))
            })
        })
        .collect()
}
