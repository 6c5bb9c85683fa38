//! Row models. Enums and timestamps are stored as text, JSON blobs as text.

pub mod job;
pub mod preferences;

pub use job::{JobArchiveDbModel, JobAttributesDbModel, JobDbModel};
pub use preferences::{RenamePatternDbModel, UserPreferencesDbModel};
