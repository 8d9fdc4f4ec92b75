use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the batch transcoder
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    /// Path to the ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to the ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// Extra encoder flags, split on whitespace before being passed to ffmpeg
    pub flags: String,
    /// File extensions considered for transcoding (with leading dot)
    pub extensions: Vec<String>,
    /// Extension of the file that replaces the original
    pub output_extension: String,
    /// Suffix appended to the source path for the in-progress output
    pub temp_suffix: String,
    /// Seconds between progress log lines
    pub interval_secs: u64,
    /// Copy ffmpeg stderr to our own stderr instead of running it quietly
    pub stderr: bool,
    /// Keep the original when the transcoded file is larger
    pub keep_old: bool,
    /// Abort doomed transcodes early (requires `keep_old`)
    pub early_exit: bool,
    /// Confidence above which the early-abort heuristic kills the encoder.
    /// At 0 any predicted overshoot beyond 10% aborts once past 25% completion.
    pub skip_confidence: f64,
    /// Lower the encoder's priority with `nice` (Linux only)
    pub nice: bool,
    /// Number of ffprobe attempts before giving up on a file
    pub probe_attempts: u32,
    /// Accept a `skip` line on stdin as a user skip request
    pub stdin_skip: bool,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl TranscodeConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            flags: "-map 0 -c:v libx265 -preset ultrafast -x265-params crf=16 -c:a aac -strict -2 -b:a 256k"
                .to_string(),
            extensions: vec![".mp4".to_string(), ".mkv".to_string(), ".flv".to_string()],
            output_extension: ".mkv".to_string(),
            temp_suffix: ".transcode-temp".to_string(),
            interval_secs: 5,
            stderr: false,
            keep_old: true,
            early_exit: true,
            skip_confidence: 0.0,
            nice: true,
            probe_attempts: 3,
            stdin_skip: false,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist.
    /// `TRANSCODER_*` environment variables override scalar fields afterwards.
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            } else {
                log::warn!("Config file not found, using defaults: {}", config_path.display());
            }
        }

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TRANSCODER_<FIELD>` overrides using the given lookup
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TRANSCODER_FFMPEG_BIN") {
            self.ffmpeg_bin = PathBuf::from(v);
        }
        if let Some(v) = lookup("TRANSCODER_FFPROBE_BIN") {
            self.ffprobe_bin = PathBuf::from(v);
        }
        if let Some(v) = lookup("TRANSCODER_FLAGS") {
            self.flags = v;
        }
        if let Some(v) = lookup("TRANSCODER_EXTENSIONS") {
            self.extensions = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = lookup("TRANSCODER_INTERVAL") {
            self.interval_secs = v.parse().with_context(|| format!("Invalid TRANSCODER_INTERVAL: {}", v))?;
        }
        if let Some(v) = lookup("TRANSCODER_SKIP_CONFIDENCE") {
            self.skip_confidence = v
                .parse()
                .with_context(|| format!("Invalid TRANSCODER_SKIP_CONFIDENCE: {}", v))?;
        }
        for (key, field) in [
            ("TRANSCODER_STDERR", &mut self.stderr),
            ("TRANSCODER_KEEP_OLD", &mut self.keep_old),
            ("TRANSCODER_EARLY_EXIT", &mut self.early_exit),
            ("TRANSCODER_NICE", &mut self.nice),
            ("TRANSCODER_STDIN_SKIP", &mut self.stdin_skip),
        ] {
            if let Some(v) = lookup(key) {
                *field = parse_bool(&v).with_context(|| format!("Invalid {}: {}", key, v))?;
            }
        }
        Ok(())
    }

    /// Reject settings the transcoder cannot work with
    pub fn validate(&self) -> Result<()> {
        if !self.skip_confidence.is_finite() || self.skip_confidence < 0.0 {
            bail!("skip_confidence must be a finite, non-negative number (got {})", self.skip_confidence);
        }
        if self.interval_secs == 0 {
            bail!("interval_secs must be at least 1");
        }
        if self.ffmpeg_bin.as_os_str().is_empty() || self.ffprobe_bin.as_os_str().is_empty() {
            bail!("ffmpeg_bin and ffprobe_bin must not be empty");
        }
        if self.probe_attempts == 0 {
            bail!("probe_attempts must be at least 1");
        }
        if self.temp_suffix.is_empty() {
            bail!("temp_suffix must not be empty");
        }
        Ok(())
    }

    /// Whether the early-abort heuristic should run for this configuration
    pub fn early_abort_enabled(&self) -> bool {
        self.early_exit && self.keep_old
    }

    /// Whether the encoder should be wrapped with `nice` on this host
    pub fn use_nice(&self) -> bool {
        self.nice && cfg!(target_os = "linux")
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected a boolean, got '{}'", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = TranscodeConfig::default();
        assert!(cfg.validate().is_ok());
        assert!(cfg.early_abort_enabled());
        assert_eq!(cfg.interval_secs, 5);
        assert_eq!(cfg.skip_confidence, 0.0);
    }

    #[test]
    fn test_rejects_degenerate_confidence() {
        let mut cfg = TranscodeConfig::default();
        cfg.skip_confidence = f64::NAN;
        assert!(cfg.validate().is_err());
        cfg.skip_confidence = f64::INFINITY;
        assert!(cfg.validate().is_err());
        cfg.skip_confidence = -1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_early_abort_requires_keep_old() {
        let mut cfg = TranscodeConfig::default();
        cfg.keep_old = false;
        assert!(!cfg.early_abort_enabled());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("TRANSCODER_INTERVAL", "12"),
            ("TRANSCODER_NICE", "false"),
            ("TRANSCODER_EXTENSIONS", ".avi, .mp4"),
        ]
        .into_iter()
        .collect();

        let mut cfg = TranscodeConfig::default();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(cfg.interval_secs, 12);
        assert!(!cfg.nice);
        assert_eq!(cfg.extensions, vec![".avi".to_string(), ".mp4".to_string()]);
    }

    #[test]
    fn test_invalid_env_bool_is_error() {
        let mut cfg = TranscodeConfig::default();
        assert!(cfg.apply_env(|k| (k == "TRANSCODER_STDERR").then(|| "maybe".to_string())).is_err());
    }

    #[test]
    fn test_load_toml_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "skip_confidence = 4.5\nstderr = true\n").unwrap();

        let cfg = TranscodeConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.skip_confidence, 4.5);
        assert!(cfg.stderr);
        assert_eq!(cfg.output_extension, ".mkv");
    }
}
