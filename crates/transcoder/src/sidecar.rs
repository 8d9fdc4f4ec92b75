use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use log::{error, warn};
use crate::config::TranscodeConfig;

/// Path of the file that replaces `source` once transcoded: same stem, output extension
pub fn replacement_path(source: &Path, output_extension: &str) -> PathBuf {
    let ext = output_extension.trim_start_matches('.');
    source.with_extension(ext)
}

/// Marker recording that a file was processed: `dir/.<stem><ext>.processed`
pub fn processed_marker_path(source: &Path, output_extension: &str) -> PathBuf {
    let replacement = replacement_path(source, output_extension);
    let name = replacement
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    replacement.with_file_name(format!(".{}.processed", name))
}

/// In-progress encoder output for a source
pub fn temp_output_path(source: &Path, temp_suffix: &str) -> PathBuf {
    let mut name = source.as_os_str().to_os_string();
    name.push(temp_suffix);
    PathBuf::from(name)
}

/// Delete a marker; a missing marker is fine
pub fn delete_processed_marker(marker: &Path) -> Result<()> {
    match fs::remove_file(marker) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to delete marker: {}", marker.display())),
    }
}

/// Rewrite `marker` with the current size of `file`. A missing file leaves no marker.
pub fn update_processed_marker(file: &Path, marker: &Path) -> Result<()> {
    delete_processed_marker(marker)?;

    let size = match fs::metadata(file) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("Failed to stat file: {}", file.display())),
    };

    fs::write(marker, size.to_string())
        .with_context(|| format!("Failed to write marker: {}", marker.display()))
}

/// Whether `source` still needs transcoding according to its extension and marker.
/// Errors are logged and answer "no".
pub fn should_transcode(cfg: &TranscodeConfig, source: &Path) -> bool {
    let ext = source
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    if !cfg.extensions.iter().any(|allowed| allowed == &ext) {
        return false;
    }

    let marker = processed_marker_path(source, &cfg.output_extension);
    let recorded = match fs::read_to_string(&marker) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return true,
        Err(e) => {
            error!("Error reading file {}: {}", marker.display(), e);
            return false;
        }
    };

    if recorded.trim().is_empty() {
        warn!("Updating processed marker without a size: {}", source.display());
        if let Err(e) = update_processed_marker(source, &marker) {
            error!("{:#}", e);
        }
        return false;
    }

    let recorded: u64 = match recorded.trim().parse() {
        Ok(size) => size,
        Err(e) => {
            error!("Error parsing {}: {}", recorded.trim(), e);
            return false;
        }
    };

    let current = match fs::metadata(source) {
        Ok(meta) => meta.len(),
        Err(e) => {
            error!("Error reading file {}: {}", source.display(), e);
            return false;
        }
    };

    if recorded == current {
        return false;
    }

    // File changed since it was processed
    match delete_processed_marker(&marker) {
        Ok(()) => true,
        Err(e) => {
            error!("{:#}", e);
            false
        }
    }
}
