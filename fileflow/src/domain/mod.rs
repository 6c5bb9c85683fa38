//! Domain types shared by the scheduler, the pipeline and its stages.

pub mod attributes;
pub mod job;
pub mod retry_policy;
pub mod thumbnail;
pub mod user;

pub use attributes::JobAttributes;
pub use job::{Job, JobError, JobId, JobSpec, JobStatus, SourceRef, Stage, UserId};
pub use retry_policy::{RetryExecutor, RetryPolicy};
pub use thumbnail::{ThumbnailRef, ThumbnailScope};
pub use user::UserProfile;
