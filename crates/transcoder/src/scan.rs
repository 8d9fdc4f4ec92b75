use std::path::{Path, PathBuf};
use log::{debug, info, warn};
use walkdir::WalkDir;
use crate::config::TranscodeConfig;

fn has_allowed_extension(cfg: &TranscodeConfig, path: &Path) -> bool {
    let Some(ext) = path.extension().map(|e| format!(".{}", e.to_string_lossy())) else {
        return false;
    };
    cfg.extensions.iter().any(|allowed| allowed == &ext)
}

/// Expand the given paths into candidate files, in order.
///
/// Files are taken as given; directories are walked recursively (sorted by
/// name) and filtered by extension. Missing paths are logged and skipped.
pub fn collect_candidates(cfg: &TranscodeConfig, paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut results = Vec::new();

    for root in paths {
        if root.is_file() {
            results.push(root.clone());
            continue;
        }
        if !root.is_dir() {
            warn!("Path does not exist: {}", root.display());
            continue;
        }

        info!("Scanning directory: {}", root.display());
        let before = results.len();
        for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Error reading directory entry: {}", e);
                    continue;
                }
            };

            let path = entry.path();
            if !entry.file_type().is_file() || !has_allowed_extension(cfg, path) {
                continue;
            }

            debug!("Found media file: {}", path.display());
            results.push(path.to_path_buf());
        }
        info!("Finished scanning {}: {} media files", root.display(), results.len() - before);
    }

    if results.is_empty() {
        warn!("Specified paths did not match any files");
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_walks_directories_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir(root.join("season")).unwrap();
        fs::write(root.join("b.mp4"), b"x").unwrap();
        fs::write(root.join("a.mkv"), b"x").unwrap();
        fs::write(root.join("notes.txt"), b"x").unwrap();
        fs::write(root.join("season/ep.flv"), b"x").unwrap();

        let cfg = TranscodeConfig::default();
        let found = collect_candidates(&cfg, &[root.to_path_buf()]);
        assert_eq!(
            found,
            vec![root.join("a.mkv"), root.join("b.mp4"), root.join("season/ep.flv")]
        );
    }

    #[test]
    fn test_explicit_files_and_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("clip.avi");
        fs::write(&file, b"x").unwrap();

        let cfg = TranscodeConfig::default();
        let found = collect_candidates(&cfg, &[dir.path().join("missing"), file.clone()]);
        // Explicit files bypass the extension filter here; should_transcode applies it later
        assert_eq!(found, vec![file]);
    }
}
