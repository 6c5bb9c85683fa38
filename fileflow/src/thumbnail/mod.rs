//! Thumbnails: picking the one attached to a delivery, and producing JPEGs.
//!
//! Precedence: the job's own image, then the user's one-shot "next upload"
//! thumbnail, then the permanent one, then a frame extracted from the video.
//! Thumbnails are optional, so every failure here degrades to "no
//! thumbnail".

use media_types::MediaKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{Job, JobAttributes, ThumbnailRef, UserId};
use crate::preferences::PreferenceStore;

/// Default bounding box edge, in pixels.
pub const DEFAULT_THUMBNAIL_SIZE: u32 = 320;

/// Runs ffmpeg to grab video frames and to convert images to JPEG.
#[derive(Debug, Clone)]
pub struct FrameExtractor {
    ffmpeg_path: String,
    /// Frames are scaled to this width. Converted images fit in a square of
    /// this edge.
    width: u32,
    timeout: Duration,
}

impl FrameExtractor {
    pub fn new(ffmpeg_path: impl Into<String>, width: u32) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            width: width.max(1),
            timeout: Duration::from_secs(30),
        }
    }

    /// Use `FFMPEG_PATH`, falling back to `ffmpeg` on the `PATH`.
    pub fn from_env(width: u32) -> Self {
        Self::new(
            std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            width,
        )
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Seek offset: 10% into the video, capped at 10 seconds.
    fn seek_secs(duration: Option<f64>) -> f64 {
        duration.map(|d| (d * 0.1).min(10.0)).unwrap_or(0.0)
    }

    /// Write one frame of `input` to `output` as a JPEG.
    pub async fn extract(
        &self,
        input: &Path,
        output: &Path,
        duration: Option<f64>,
        cancel: &CancellationToken,
    ) -> Result<(), String> {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(["-y", "-hide_banner", "-loglevel", "error", "-ss"])
            .arg(format!("{:.2}", Self::seek_secs(duration)))
            .arg("-i")
            .arg(input)
            .args(["-vframes", "1", "-vf"])
            .arg(format!("scale={}:-2", self.width))
            .args(["-q:v", "3"])
            .arg(output);
        self.run(cmd, cancel).await
    }

    /// Convert the image at `input` to a JPEG at `output` that fits in a
    /// `width` x `width` box, keeping the aspect ratio.
    pub async fn normalize(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), String> {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(["-y", "-hide_banner", "-loglevel", "error", "-i"])
            .arg(input)
            .args(["-frames:v", "1", "-vf"])
            .arg(Self::box_filter(self.width))
            .args(["-pix_fmt", "yuvj420p", "-q:v", "3", "-f", "mjpeg"])
            .arg(output);
        self.run(cmd, cancel).await
    }

    fn box_filter(edge: u32) -> String {
        format!("scale={edge}:{edge}:force_original_aspect_ratio=decrease")
    }

    async fn run(&self, mut cmd: Command, cancel: &CancellationToken) -> Result<(), String> {
        cmd.env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err("ffmpeg cancelled".to_string()),
            res = tokio::time::timeout(self.timeout, cmd.output()) => res
                .map_err(|_| "ffmpeg timed out".to_string())?
                .map_err(|e| format!("failed to spawn ffmpeg: {e}"))?,
        };
        if !result.status.success() {
            return Err(format!(
                "ffmpeg exited with {}: {}",
                result.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&result.stderr).trim()
            ));
        }
        Ok(())
    }
}

pub struct ThumbnailResolver {
    prefs: Arc<dyn PreferenceStore>,
    frames: Option<FrameExtractor>,
}

impl ThumbnailResolver {
    pub fn new(prefs: Arc<dyn PreferenceStore>) -> Self {
        Self {
            prefs,
            frames: None,
        }
    }

    pub fn with_frame_extractor(mut self, frames: FrameExtractor) -> Self {
        self.frames = Some(frames);
        self
    }

    /// Resolve the thumbnail for a job. Never fails.
    ///
    /// `local` is the staged file, used when a frame has to be generated. A
    /// one-shot thumbnail taken from the user's preferences is moved into
    /// `job_dir` and goes away with it.
    pub async fn resolve(
        &self,
        user_id: UserId,
        job: &Job,
        job_dir: &Path,
        attributes: &JobAttributes,
        local: &Path,
        cancel: &CancellationToken,
    ) -> Option<ThumbnailRef> {
        if let Some(path) = &job.spec.thumbnail {
            if is_file(path).await {
                return Some(ThumbnailRef::ephemeral(path.clone()));
            }
            warn!(path = %path.display(), "Job thumbnail is missing, falling back");
        }

        match self.prefs.take_next_thumbnail(user_id).await {
            Ok(Some(thumb)) => {
                let target = job_dir.join("next_thumbnail.jpg");
                match move_file(&thumb.path, &target).await {
                    Ok(()) => return Some(ThumbnailRef::ephemeral(target)),
                    Err(e) => {
                        warn!(user_id, path = %thumb.path.display(), "Next-upload thumbnail unusable: {e}");
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!(user_id, "Failed to read next-upload thumbnail: {e}"),
        }

        match self.prefs.permanent_thumbnail(user_id).await {
            Ok(Some(thumb)) if is_file(&thumb.path).await => return Some(thumb),
            Ok(Some(thumb)) => {
                warn!(user_id, path = %thumb.path.display(), "Permanent thumbnail is missing");
            }
            Ok(None) => {}
            Err(e) => warn!(user_id, "Failed to read thumbnail preference: {e}"),
        }

        if attributes.kind != MediaKind::Video || cancel.is_cancelled() {
            return None;
        }
        let frames = self.frames.as_ref()?;
        let output: PathBuf = job_dir.join("thumbnail.jpg");
        match frames
            .extract(local, &output, attributes.duration_secs, cancel)
            .await
        {
            Ok(()) if is_file(&output).await => {
                debug!(path = %output.display(), "Generated thumbnail");
                Some(ThumbnailRef::ephemeral(output))
            }
            Ok(()) => None,
            Err(e) => {
                warn!(path = %local.display(), "Thumbnail generation failed: {e}");
                None
            }
        }
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// Rename, falling back to copy and delete across filesystems.
async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await
}
