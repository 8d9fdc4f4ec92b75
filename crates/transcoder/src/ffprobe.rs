use std::path::Path;
use log::{debug, warn};
use serde::Deserialize;
use tokio::process::Command;
use crate::config::TranscodeConfig;
use crate::error::{TranscodeError, TranscodeResult};

/// Complete ffprobe output structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceMetadata {
    #[serde(default)]
    pub streams: Vec<StreamInfo>,
    #[serde(default)]
    pub format: FormatInfo,
}

/// Format-level metadata from ffprobe. ffprobe reports numbers as strings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FormatInfo {
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub format_name: String,
    pub duration: Option<String>,
    pub size: Option<String>,
    pub bit_rate: Option<String>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamInfo {
    pub codec_name: Option<String>,
    pub codec_type: Option<String>,
    pub pix_fmt: Option<String>,
    pub color_range: Option<String>,
    pub color_space: Option<String>,
    pub color_transfer: Option<String>,
    pub color_primaries: Option<String>,
    pub nb_frames: Option<String>,
    pub r_frame_rate: Option<String>,
    pub avg_frame_rate: Option<String>,
}

impl FormatInfo {
    /// Container size in bytes, 0 when ffprobe did not report it
    pub fn size_bytes(&self) -> u64 {
        self.size.as_deref().and_then(|s| s.trim().parse().ok()).unwrap_or(0)
    }

    pub fn duration_secs(&self) -> f64 {
        self.duration.as_deref().and_then(|s| s.trim().parse().ok()).unwrap_or(0.0)
    }
}

impl StreamInfo {
    pub fn is_video(&self) -> bool {
        self.codec_type.as_deref() == Some("video")
    }

    /// Frame rate from `avg_frame_rate`, falling back to `r_frame_rate`
    pub fn frame_rate(&self) -> f64 {
        self.avg_frame_rate
            .as_deref()
            .and_then(parse_frame_rate)
            .or_else(|| self.r_frame_rate.as_deref().and_then(parse_frame_rate))
            .unwrap_or(0.0)
    }
}

impl SourceMetadata {
    /// First video stream, if any
    pub fn video_stream(&self) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.is_video())
    }

    pub fn size(&self) -> u64 {
        self.format.size_bytes()
    }

    /// Total video frames: `nb_frames` of the first video stream, otherwise
    /// estimated from frame rate and duration. 0 when neither is known.
    pub fn frame_count(&self) -> u64 {
        let Some(video) = self.video_stream() else {
            return 0;
        };

        let frames = video
            .nb_frames
            .as_deref()
            .and_then(|n| n.trim().parse::<u64>().ok())
            .unwrap_or(0);
        if frames > 0 {
            return frames;
        }

        let estimate = video.frame_rate() * self.format.duration_secs();
        if estimate.is_finite() && estimate > 0.0 {
            estimate as u64
        } else {
            0
        }
    }
}

/// Parse "24000/1001" or "29.97" into frames per second
fn parse_frame_rate(frame_rate_str: &str) -> Option<f64> {
    if let Some((num, den)) = frame_rate_str.split_once('/') {
        let num = num.trim().parse::<f64>().ok()?;
        let den = den.trim().parse::<f64>().ok()?;
        return (den != 0.0 && num > 0.0).then(|| num / den);
    }
    frame_rate_str.trim().parse::<f64>().ok().filter(|f| *f > 0.0)
}

/// Run ffprobe once and parse its JSON output
async fn probe_once(cfg: &TranscodeConfig, file_path: &Path) -> anyhow::Result<SourceMetadata> {
    use anyhow::Context;

    let output = Command::new(&cfg.ffprobe_bin)
        .arg("-v")
        .arg("quiet")
        .arg("-print_format")
        .arg("json")
        .arg("-show_format")
        .arg("-show_streams")
        .arg(file_path)
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("failed running {}", cfg.ffprobe_bin.display()))?;

    if !output.status.success() {
        anyhow::bail!(
            "ffprobe exited with code {}: {}",
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    serde_json::from_slice(&output.stdout).context("failed parsing ffprobe output")
}

/// Probe a media file, retrying up to `probe_attempts` times
pub async fn probe_file(cfg: &TranscodeConfig, file_path: &Path) -> TranscodeResult<SourceMetadata> {
    let attempts = cfg.probe_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        debug!(
            "Executing {} -v quiet -print_format json -show_format -show_streams {} (attempt {}/{})",
            cfg.ffprobe_bin.display(),
            file_path.display(),
            attempt,
            attempts
        );

        match probe_once(cfg, file_path).await {
            Ok(metadata) => return Ok(metadata),
            Err(e) => {
                warn!("ffprobe attempt {}/{} failed for {}: {:#}", attempt, attempts, file_path.display(), e);
                last_error = format!("{:#}", e);
            }
        }
    }

    Err(TranscodeError::Probe {
        path: file_path.to_path_buf(),
        attempts,
        reason: last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "streams": [
            {"codec_name": "aac", "codec_type": "audio"},
            {"codec_name": "h264", "codec_type": "video", "pix_fmt": "yuv420p10le",
             "color_range": "tv", "color_space": "bt2020nc", "color_transfer": "smpte2084",
             "color_primaries": "bt2020", "nb_frames": "1440",
             "r_frame_rate": "24/1", "avg_frame_rate": "24000/1001"}
        ],
        "format": {"filename": "/media/a.mkv", "format_name": "matroska,webm",
                   "duration": "60.0", "size": "1000000", "bit_rate": "133333"}
    }"#;

    #[test]
    fn test_parse_probe_json() {
        let meta: SourceMetadata = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(meta.size(), 1_000_000);
        assert_eq!(meta.frame_count(), 1440);
        let video = meta.video_stream().unwrap();
        assert_eq!(video.codec_name.as_deref(), Some("h264"));
        assert!((video.frame_rate() - 23.976).abs() < 0.001);
    }

    #[test]
    fn test_frame_count_falls_back_to_duration() {
        let mut meta: SourceMetadata = serde_json::from_str(SAMPLE).unwrap();
        meta.streams[1].nb_frames = None;
        meta.streams[1].avg_frame_rate = None;
        assert_eq!(meta.frame_count(), 1440);

        meta.streams[1].avg_frame_rate = Some("0/0".to_string());
        assert_eq!(meta.frame_count(), 1440);
    }

    #[test]
    fn test_missing_values_are_zero() {
        let meta: SourceMetadata = serde_json::from_str(r#"{"format": {}}"#).unwrap();
        assert_eq!(meta.size(), 0);
        assert_eq!(meta.frame_count(), 0);
        assert!(meta.video_stream().is_none());
    }

    #[tokio::test]
    async fn test_probe_failure_after_retries() {
        let mut cfg = TranscodeConfig::default();
        cfg.ffprobe_bin = "/nonexistent/ffprobe".into();
        cfg.probe_attempts = 2;

        let err = probe_file(&cfg, Path::new("missing.mkv")).await.unwrap_err();
        match err {
            TranscodeError::Probe { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("expected probe error, got {:?}", other),
        }
    }
}
