//! Facts derived from file content.

use media_types::{MediaKind, Resolution};
use serde::{Deserialize, Serialize};

/// Attributes produced once by the metadata extractor and never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAttributes {
    pub size_bytes: u64,
    pub mime: String,
    pub kind: MediaKind,
    /// Canonical extension without the dot.
    pub extension: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,
    /// Overall bitrate in bits per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u64>,
    /// Hex-encoded SHA-256 of the content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl JobAttributes {
    /// Minimal attributes for content that could not be identified.
    pub fn unknown(size_bytes: u64) -> Self {
        Self {
            size_bytes,
            mime: "application/octet-stream".to_string(),
            kind: MediaKind::Unknown,
            extension: MediaKind::Unknown.default_extension().to_string(),
            duration_secs: None,
            resolution: None,
            video_codec: None,
            audio_codec: None,
            bitrate: None,
            sha256: None,
        }
    }

    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0)
    }

    /// Extension to use for the delivered file.
    pub fn output_extension(&self) -> &str {
        if self.extension.is_empty() {
            self.kind.default_extension()
        } else {
            &self.extension
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_attributes() {
        let attrs = JobAttributes::unknown(42);
        assert_eq!(attrs.kind, MediaKind::Unknown);
        assert_eq!(attrs.size_bytes, 42);
        assert_eq!(attrs.output_extension(), "bin");
    }

    #[test]
    fn test_output_extension_falls_back_to_kind() {
        let mut attrs = JobAttributes::unknown(1);
        attrs.kind = MediaKind::Video;
        attrs.extension.clear();
        assert_eq!(attrs.output_extension(), "mp4");
    }

    #[test]
    fn test_serialization_skips_empty_ffprobe_fields() {
        let json = serde_json::to_string(&JobAttributes::unknown(7)).unwrap();
        assert!(!json.contains("duration_secs"));
        let back: JobAttributes = serde_json::from_str(&json).unwrap();
        assert_eq!(back, JobAttributes::unknown(7));
    }
}
