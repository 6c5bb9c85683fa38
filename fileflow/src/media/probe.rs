//! Deep inspection of audio/video files through ffprobe.

use media_types::Resolution;
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Facts ffprobe can add on top of magic-number detection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeInfo {
    pub duration_secs: Option<f64>,
    pub resolution: Option<Resolution>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub bitrate: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    duration: Option<String>,
    #[serde(default)]
    disposition: Option<ProbeDisposition>,
}

#[derive(Debug, Deserialize)]
struct ProbeDisposition {
    #[serde(default)]
    attached_pic: u8,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
}

fn positive_f64(s: Option<&str>) -> Option<f64> {
    s?.trim().parse::<f64>().ok().filter(|d| d.is_finite() && *d > 0.0)
}

/// Parse the JSON printed by `ffprobe -show_format -show_streams`.
pub fn parse_probe_output(json: &[u8]) -> Result<ProbeInfo, serde_json::Error> {
    let output: ProbeOutput = serde_json::from_slice(json)?;

    // Cover art is reported as a video stream; skip it.
    let video = output.streams.iter().find(|s| {
        s.codec_type.as_deref() == Some("video")
            && s.disposition.as_ref().is_none_or(|d| d.attached_pic == 0)
    });
    let audio = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));

    let format_duration = output
        .format
        .as_ref()
        .and_then(|f| positive_f64(f.duration.as_deref()));
    let stream_duration = video
        .or(audio)
        .and_then(|s| positive_f64(s.duration.as_deref()));

    Ok(ProbeInfo {
        duration_secs: format_duration.or(stream_duration),
        resolution: video.and_then(|s| Resolution::non_zero(s.width?, s.height?)),
        video_codec: video.and_then(|s| s.codec_name.clone()),
        audio_codec: audio.and_then(|s| s.codec_name.clone()),
        bitrate: output
            .format
            .as_ref()
            .and_then(|f| f.bit_rate.as_deref())
            .and_then(|b| b.trim().parse().ok()),
    })
}

/// Runs the ffprobe binary.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    ffprobe_path: String,
    timeout: Duration,
}

impl FfprobeProber {
    pub fn new(ffprobe_path: impl Into<String>) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Use `FFPROBE_PATH`, falling back to `ffprobe` on the `PATH`.
    pub fn from_env() -> Self {
        Self::new(std::env::var("FFPROBE_PATH").unwrap_or_else(|_| "ffprobe".to_string()))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run ffprobe on `path`. The child is killed on timeout or when `cancel`
    /// fires.
    pub async fn probe(&self, path: &Path, cancel: &CancellationToken) -> Result<ProbeInfo, String> {
        let mut cmd = Command::new(&self.ffprobe_path);
        cmd.args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .env("LC_ALL", "C")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err("ffprobe cancelled".to_string()),
            res = tokio::time::timeout(self.timeout, cmd.output()) => res
                .map_err(|_| format!("ffprobe timed out after {:?}", self.timeout))?
                .map_err(|e| format!("failed to run ffprobe: {e}"))?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "ffprobe exited with {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ));
        }

        let info = parse_probe_output(&output.stdout)
            .map_err(|e| format!("unreadable ffprobe output: {e}"))?;
        debug!(path = %path.display(), ?info, "ffprobe finished");
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_video_probe() {
        let json = br#"{
            "streams": [
                {"codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080,
                 "disposition": {"attached_pic": 0}},
                {"codec_type": "audio", "codec_name": "aac", "duration": "12.0"}
            ],
            "format": {"duration": "125.480000", "bit_rate": "4500000"}
        }"#;
        let info = parse_probe_output(json).unwrap();
        assert_eq!(info.duration_secs, Some(125.48));
        assert_eq!(info.resolution, Some(Resolution::new(1920, 1080)));
        assert_eq!(info.video_codec.as_deref(), Some("h264"));
        assert_eq!(info.audio_codec.as_deref(), Some("aac"));
        assert_eq!(info.bitrate, Some(4_500_000));
    }

    #[test]
    fn test_cover_art_is_not_video() {
        let json = br#"{
            "streams": [
                {"codec_type": "audio", "codec_name": "mp3", "duration": "200.5"},
                {"codec_type": "video", "codec_name": "mjpeg", "width": 500, "height": 500,
                 "disposition": {"attached_pic": 1}}
            ],
            "format": {"duration": "N/A"}
        }"#;
        let info = parse_probe_output(json).unwrap();
        assert_eq!(info.video_codec, None);
        assert_eq!(info.resolution, None);
        assert_eq!(info.duration_secs, Some(200.5));
    }

    #[test]
    fn test_empty_probe() {
        let info = parse_probe_output(b"{}").unwrap();
        assert_eq!(info, ProbeInfo::default());
        assert!(parse_probe_output(b"not json").is_err());
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_error() {
        let prober = FfprobeProber::new("/nonexistent/ffprobe-binary");
        let cancel = CancellationToken::new();
        assert!(prober.probe(Path::new("x.mkv"), &cancel).await.is_err());
    }
}
