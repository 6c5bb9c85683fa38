use serde::{Deserialize, Serialize};

/// Coarse content category of a file.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
    Image,
    Document,
    #[default]
    Unknown,
}

impl MediaKind {
    /// Extension used when the concrete container could not be determined.
    pub fn default_extension(&self) -> &'static str {
        match self {
            Self::Video => "mp4",
            Self::Audio => "mp3",
            Self::Image => "jpg",
            Self::Document | Self::Unknown => "bin",
        }
    }

    /// Whether a deep probe (ffprobe) can add anything for this kind.
    pub fn is_av(&self) -> bool {
        matches!(self, Self::Video | Self::Audio)
    }

    /// Classify a MIME type by its top-level type.
    pub fn from_mime_prefix(mime: &str) -> Self {
        let top = mime.split('/').next().unwrap_or_default().trim();
        match top.to_ascii_lowercase().as_str() {
            "video" => Self::Video,
            "audio" => Self::Audio,
            "image" => Self::Image,
            "text" => Self::Document,
            _ => Self::Unknown,
        }
    }
}
