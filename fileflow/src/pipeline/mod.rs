//! Job scheduling and execution.
//!
//! [`JobQueue`] admits jobs and decides what runs next, [`WorkerPool`] runs
//! them through [`JobPipeline`], and [`PurgeService`] archives finished ones.

pub mod job_queue;
pub mod progress;
pub mod purge;
pub mod runner;
pub mod slots;
pub mod worker_pool;

pub use job_queue::{
    Dispatch, JobOutcome, JobQueue, JobQueueConfig, QueueDepthStatus, QueueStats, RecoveryReport,
};
pub use progress::{ProgressEvent, ProgressHub, ProgressReporter};
pub use purge::{PurgeConfig, PurgeService};
pub use runner::{JobPipeline, JobStateSink, PipelineContext, PipelineOutcome};
pub use slots::{QueueSlot, SlotPool, SlotUsage};
pub use worker_pool::{WorkerPool, WorkerPoolConfig};
