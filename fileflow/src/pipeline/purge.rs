//! Retention purge: moves old terminal jobs into the archive table.

use chrono::{Duration as ChronoDuration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job_queue::JobQueue;
use crate::Result;
use crate::database::repositories::JobRepository;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeConfig {
    /// Days a terminal job stays live. Zero keeps jobs forever.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Local-time window such as "02:00-05:00". `None` allows any time.
    #[serde(default)]
    pub time_window: Option<String>,

    /// Jobs archived per transaction.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

fn default_retention_days() -> u32 {
    30
}

fn default_batch_size() -> u32 {
    100
}

fn default_check_interval_secs() -> u64 {
    3600
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            time_window: None,
            batch_size: default_batch_size(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

impl PurgeConfig {
    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn with_time_window(mut self, window: Option<String>) -> Self {
        self.time_window = window;
        self
    }

    pub fn with_batch_size(mut self, size: u32) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct TimeWindow {
    start: NaiveTime,
    end: NaiveTime,
}

impl TimeWindow {
    fn parse(window: &str) -> Option<Self> {
        let (start, end) = window.split_once('-')?;
        Some(Self {
            start: NaiveTime::parse_from_str(start.trim(), "%H:%M").ok()?,
            end: NaiveTime::parse_from_str(end.trim(), "%H:%M").ok()?,
        })
    }

    fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            // Wraps past midnight
            time >= self.start || time < self.end
        }
    }
}

pub struct PurgeService {
    config: PurgeConfig,
    repo: Arc<dyn JobRepository>,
    queue: Arc<JobQueue>,
    time_window: Option<TimeWindow>,
}

impl PurgeService {
    pub fn new(config: PurgeConfig, repo: Arc<dyn JobRepository>, queue: Arc<JobQueue>) -> Self {
        let time_window = config.time_window.as_deref().and_then(TimeWindow::parse);
        if config.time_window.is_some() && time_window.is_none() {
            warn!(
                "Invalid purge window {:?}, expected HH:MM-HH:MM; purging at any time",
                config.time_window
            );
        }
        Self {
            config,
            repo,
            queue,
            time_window,
        }
    }

    pub fn is_purge_allowed(&self) -> bool {
        self.time_window
            .is_none_or(|w| w.contains(chrono::Local::now().time()))
    }

    /// Archive every terminal job older than the retention window. Returns
    /// how many were archived.
    pub async fn run_purge(&self) -> Result<u64> {
        if self.config.retention_days == 0 {
            debug!("Job purging disabled (retention_days = 0)");
            return Ok(0);
        }
        if !self.is_purge_allowed() {
            debug!("Purge not allowed outside time window");
            return Ok(0);
        }

        let cutoff =
            (Utc::now() - ChronoDuration::days(i64::from(self.config.retention_days))).to_rfc3339();
        let mut total = 0u64;
        loop {
            let archived = self
                .repo
                .archive_terminal_jobs(&cutoff, self.config.batch_size)
                .await?;
            if archived.is_empty() {
                break;
            }
            total += archived.len() as u64;
            self.queue.evict(&archived);

            if (archived.len() as u32) < self.config.batch_size {
                break;
            }
            // Let other writers in between batches
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if total > 0 {
            info!(
                archived = total,
                retention_days = self.config.retention_days,
                "Archived old jobs"
            );
        }
        Ok(total)
    }

    /// Run [`run_purge`](Self::run_purge) every `check_interval_secs` until
    /// `cancel` fires.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(self.config.check_interval_secs.max(1)));
            info!(
                retention_days = self.config.retention_days,
                interval_secs = self.config.check_interval_secs,
                "Job purge service started"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Job purge service shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_purge().await {
                            error!("Purge cycle failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}
