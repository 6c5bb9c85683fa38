//! Content identification for staged files.
//!
//! Detection order is: magic bytes, then the declared MIME type, then the
//! file extension. Magic bytes win because declared types are often wrong
//! (a `.mp4` that is really Matroska). Generic containers such as zip are
//! refined by a matching document extension (`docx`, `xlsx`).

use async_trait::async_trait;
use media_types::sniff::{SNIFF_LEN, image_dimensions, is_generic_container, sniff};
use media_types::{Format, MediaKind, by_extension, by_mime, extension_of};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::probe::FfprobeProber;
use crate::domain::JobAttributes;
use crate::error::{ErrorKind, StageError};
use crate::transfer::LocalHandle;

/// Extensions refused outright.
pub const DEFAULT_BLOCKED_EXTENSIONS: &[&str] = &[
    "exe", "bat", "cmd", "scr", "com", "pif", "vbs", "js", "jar", "msi", "ps1",
];

#[async_trait]
pub trait MetadataExtractor: Send + Sync {
    /// Identify `local`. Returns a cancelled error as soon as `cancel` fires.
    async fn extract(
        &self,
        local: &LocalHandle,
        cancel: &CancellationToken,
    ) -> Result<JobAttributes, StageError>;
}

/// Extractor reading the file itself, with optional ffprobe and hashing.
#[derive(Debug, Clone)]
pub struct FileMetadataExtractor {
    prober: Option<FfprobeProber>,
    hash: bool,
    blocked_extensions: Vec<String>,
    chunk_size: usize,
}

impl Default for FileMetadataExtractor {
    fn default() -> Self {
        Self {
            prober: None,
            hash: true,
            blocked_extensions: DEFAULT_BLOCKED_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            chunk_size: 1024 * 1024,
        }
    }
}

impl FileMetadataExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prober(mut self, prober: FfprobeProber) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn with_hash(mut self, hash: bool) -> Self {
        self.hash = hash;
        self
    }

    pub fn with_blocked_extensions(mut self, blocked: impl IntoIterator<Item = String>) -> Self {
        self.blocked_extensions = blocked
            .into_iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .collect();
        self
    }

    fn is_blocked(&self, ext: &str) -> bool {
        self.blocked_extensions.iter().any(|b| b == ext)
    }

    async fn read_header(local: &LocalHandle) -> Result<Vec<u8>, StageError> {
        let file = tokio::fs::File::open(&local.path)
            .await
            .map_err(|e| StageError::from_io("opening staged file", &e))?;
        let mut header = Vec::with_capacity(SNIFF_LEN);
        file.take(SNIFF_LEN as u64)
            .read_to_end(&mut header)
            .await
            .map_err(|e| StageError::from_io("reading file header", &e))?;
        Ok(header)
    }

    async fn sha256(
        &self,
        local: &LocalHandle,
        cancel: &CancellationToken,
    ) -> Result<String, StageError> {
        let mut file = tokio::fs::File::open(&local.path)
            .await
            .map_err(|e| StageError::from_io("opening staged file", &e))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            if cancel.is_cancelled() {
                return Err(StageError::cancelled());
            }
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| StageError::from_io("hashing staged file", &e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }
}

/// How the content was identified.
#[derive(Debug, Clone, PartialEq)]
enum Detection {
    Known(&'static Format),
    /// Recognised by `mime_guess` only; the extension is kept as declared.
    Guessed { mime: String, ext: String },
    Unknown,
}

fn detect(header: &[u8], declared_ext: Option<&str>, mime_hint: Option<&str>) -> Detection {
    let by_ext = declared_ext.and_then(by_extension);

    if let Some(sniffed) = sniff(header) {
        if is_generic_container(sniffed)
            && let Some(declared) = by_ext
            && declared.kind == MediaKind::Document
        {
            return Detection::Known(declared);
        }
        return Detection::Known(sniffed);
    }

    if let Some(format) = mime_hint
        .filter(|m| !m.starts_with("application/octet-stream"))
        .and_then(by_mime)
    {
        return Detection::Known(format);
    }
    if let Some(format) = by_ext {
        return Detection::Known(format);
    }

    if let Some(ext) = declared_ext
        && let Some(mime) = mime_guess::from_ext(ext).first()
    {
        return Detection::Guessed {
            mime: mime.essence_str().to_string(),
            ext: ext.to_string(),
        };
    }
    Detection::Unknown
}

/// Keep a declared extension for unidentified content when it looks sane.
fn plausible_extension(ext: Option<&str>) -> Option<String> {
    ext.filter(|e| !e.is_empty() && e.len() <= 10 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(str::to_string)
}

#[async_trait]
impl MetadataExtractor for FileMetadataExtractor {
    async fn extract(
        &self,
        local: &LocalHandle,
        cancel: &CancellationToken,
    ) -> Result<JobAttributes, StageError> {
        let size = tokio::fs::metadata(&local.path)
            .await
            .map_err(|e| StageError::from_io("reading staged file metadata", &e))?
            .len();
        if size == 0 {
            return Err(StageError::fatal(ErrorKind::UnsupportedFormat, "file is empty"));
        }

        let declared_ext = extension_of(&local.original_name).map(str::to_ascii_lowercase);
        if let Some(ext) = declared_ext.as_deref()
            && self.is_blocked(ext)
        {
            return Err(StageError::fatal(
                ErrorKind::UnsupportedFormat,
                format!("files of type .{ext} are not accepted"),
            ));
        }

        let header = Self::read_header(local).await?;
        let mut attrs = match detect(&header, declared_ext.as_deref(), local.mime_hint.as_deref())
        {
            Detection::Known(format) => {
                let mut attrs = JobAttributes::unknown(size);
                attrs.mime = format.mime.to_string();
                attrs.kind = format.kind;
                attrs.extension = format.ext.to_string();
                attrs
            }
            Detection::Guessed { mime, ext } => {
                let mut attrs = JobAttributes::unknown(size);
                attrs.kind = MediaKind::from_mime_prefix(&mime);
                attrs.mime = mime;
                attrs.extension = ext;
                attrs
            }
            Detection::Unknown => {
                let mut attrs = JobAttributes::unknown(size);
                if let Some(ext) = plausible_extension(declared_ext.as_deref()) {
                    attrs.extension = ext;
                }
                attrs
            }
        };

        // Content sniffed as an executable-like type under another name.
        if self.is_blocked(&attrs.extension) {
            return Err(StageError::fatal(
                ErrorKind::UnsupportedFormat,
                format!("files of type .{} are not accepted", attrs.extension),
            ));
        }

        if attrs.kind == MediaKind::Image {
            attrs.resolution = image_dimensions(&header);
        }

        if attrs.kind.is_av()
            && let Some(prober) = &self.prober
        {
            match prober.probe(&local.path, cancel).await {
                Ok(info) => {
                    attrs.duration_secs = info.duration_secs;
                    attrs.resolution = info.resolution;
                    attrs.video_codec = info.video_codec;
                    attrs.audio_codec = info.audio_codec;
                    attrs.bitrate = info.bitrate;
                }
                Err(_) if cancel.is_cancelled() => return Err(StageError::cancelled()),
                Err(e) => {
                    warn!(path = %local.path.display(), "Deep probe failed, keeping basic attributes: {e}");
                }
            }
        }

        if self.hash {
            attrs.sha256 = Some(self.sha256(local, cancel).await?);
        }

        debug!(
            name = %local.original_name,
            kind = %attrs.kind,
            mime = %attrs.mime,
            size = attrs.size_bytes,
            "Extracted attributes"
        );
        Ok(attrs)
    }
}
