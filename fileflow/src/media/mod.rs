//! Metadata extraction for staged files.

pub mod metadata;
pub mod probe;

pub use metadata::{DEFAULT_BLOCKED_EXTENSIONS, FileMetadataExtractor, MetadataExtractor};
pub use probe::{FfprobeProber, ProbeInfo};
