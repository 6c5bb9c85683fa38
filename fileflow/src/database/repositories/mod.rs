//! Repository traits and their SQLx implementations.

pub mod counter;
pub mod job;
pub mod preferences;

pub use counter::{CounterRepository, SqlxCounterRepository};
pub use job::{JobRepository, SqlxJobRepository};
pub use preferences::{PreferenceRepository, SqlxPreferenceRepository};
