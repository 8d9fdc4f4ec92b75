use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use anyhow::{bail, Context, Result};
use clap::Parser;
use humansize::{format_size, BINARY};
use log::{debug, error, info, warn, LevelFilter};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{oneshot, watch};
use transcoder::{
    config::TranscodeConfig,
    ffprobe, scan, sidecar,
    telemetry::{JobResult, LogSink, Notification, Sinks, TelemetrySink},
    termination, Outcome, SourceMetadata, TranscodeJob,
};

/// Opinionated batch wrapper around ffmpeg
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Files or directories to transcode
    paths: Vec<PathBuf>,

    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    log: Option<String>,
}

/// Sender for the skip request of the job currently running
type SkipSlot = Arc<Mutex<Option<oneshot::Sender<bool>>>>;

struct Driver {
    cfg: Arc<TranscodeConfig>,
    sinks: Sinks,
    shutdown: watch::Receiver<bool>,
    skip_slot: SkipSlot,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut logger = env_logger::Builder::from_default_env();
    logger.format_timestamp_secs();
    if let Some(level) = &args.log {
        let level: LevelFilter = level
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid log level: {}", level))?;
        logger.filter_level(level);
    } else if args.verbose {
        logger.filter_level(LevelFilter::Debug);
    } else if std::env::var_os("RUST_LOG").is_none() {
        logger.filter_level(LevelFilter::Info);
    }
    logger.init();

    let cfg = TranscodeConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    info!("Config initialized");
    debug!("Configuration: {:?}", cfg);

    if args.paths.is_empty() {
        bail!("You must supply at least a single path");
    }

    let (shutdown_tx, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        match termination::shutdown_signal().await {
            Ok(()) => {
                warn!("Termination signal received");
                shutdown_tx.send_replace(true);
            }
            Err(e) => error!("Could not listen for termination signals: {}", e),
        }
    });

    let skip_slot: SkipSlot = Arc::new(Mutex::new(None));
    if cfg.stdin_skip {
        spawn_stdin_skip(skip_slot.clone());
        info!("Type 'skip' and press enter to skip the current file");
    }

    let files = scan::collect_candidates(&cfg, &args.paths);
    let driver = Driver {
        cfg: Arc::new(cfg),
        sinks: Sinks::new().with(Arc::new(LogSink)),
        shutdown,
        skip_slot,
    };

    for file in files {
        if driver.terminated() {
            break;
        }
        if let Err(e) = driver.process_file(&file).await {
            error!("❌ {}: {:#}", file.display(), e);
        }
    }

    Ok(())
}

/// A `skip` line on stdin skips the running job
fn spawn_stdin_skip(slot: SkipSlot) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().eq_ignore_ascii_case("skip") {
                let sender = slot.lock().ok().and_then(|mut s| s.take());
                match sender {
                    Some(tx) => {
                        let _ = tx.send(true);
                    }
                    None => warn!("Nothing to skip"),
                }
            }
        }
    });
}

impl Driver {
    fn terminated(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn process_file(&self, file: &Path) -> Result<()> {
        let cfg = &self.cfg;
        if !sidecar::should_transcode(cfg, file) {
            debug!("Already processed: {}", file.display());
            return Ok(());
        }

        let temp = sidecar::temp_output_path(file, &cfg.temp_suffix);
        match fs::metadata(&temp) {
            Ok(_) => {
                warn!("File is already being transcoded: {}", file.display());
                return Ok(());
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Error reading file {}", temp.display()));
            }
        }

        info!("Transcoding: {}", file.display());
        let metadata = match ffprobe::probe_file(cfg, file).await {
            Ok(m) => Arc::new(m),
            Err(e) => {
                let n = Notification::for_source(file, &SourceMetadata::default());
                self.sinks.job_finished(&n, JobResult::Error);
                return Err(e.into());
            }
        };

        let (skip_tx, skip_rx) = oneshot::channel();
        if let Ok(mut slot) = self.skip_slot.lock() {
            *slot = Some(skip_tx);
        }

        // The driver owns signal handling so it can tell a shutdown from a heuristic abort
        let job = TranscodeJob::new(cfg.clone(), file, &temp, metadata.clone())
            .with_sinks(self.sinks.clone());
        let base = job.notification();
        let watcher = termination::spawn_shutdown_forwarder(self.shutdown.clone(), job.stop_handle());

        let result = job.run(Some(skip_rx)).await;
        watcher.abort();
        if let Ok(mut slot) = self.skip_slot.lock() {
            slot.take();
        }

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.sinks.job_finished(&base, JobResult::Error);
                return Err(e.into());
            }
        };

        if self.terminated() {
            self.sinks.job_finished(&base, JobResult::Error);
            return Ok(());
        }

        self.apply_retention(file, &temp, &metadata, outcome, base).await
    }

    async fn apply_retention(
        &self,
        file: &Path,
        temp: &Path,
        original: &SourceMetadata,
        outcome: Outcome,
        base: Notification,
    ) -> Result<()> {
        let cfg = &self.cfg;
        let replacement = sidecar::replacement_path(file, &cfg.output_extension);
        let marker = sidecar::processed_marker_path(file, &cfg.output_extension);
        let original_size = original.size();

        sidecar::update_processed_marker(temp, &marker)?;

        if outcome.was_killed && !outcome.was_user_skipped {
            sidecar::update_processed_marker(file, &marker)?;
            // Assume a corrupted output
            remove_if_exists(temp)?;

            // Every aborted job is reported, not only the ones already past the original size
            let n = match &outcome.last_sample {
                Some(last) => {
                    if last.total_size > original_size {
                        info!(
                            "Kept original {}: {} < {}",
                            file.display(),
                            format_size(original_size, BINARY),
                            format_size(last.total_size, BINARY)
                        );
                    }
                    base.with_sample(last)
                }
                None => base,
            };
            self.sinks.job_finished(&n, JobResult::KeptOriginal);
            return Ok(());
        }

        if outcome.was_user_skipped {
            sidecar::update_processed_marker(file, &marker)?;
            remove_if_exists(temp)?;

            info!("Skipped, kept original: {}", file.display());
            let n = match &outcome.last_sample {
                Some(last) => base.with_sample(last),
                None => base,
            };
            self.sinks.job_finished(&n, JobResult::Skipped);
            return Ok(());
        }

        let result_meta = ffprobe::probe_file(cfg, temp).await?;
        let result_size = result_meta.size();
        let finished = base.with_result_metadata(&result_meta);

        if cfg.keep_old && result_size > original_size {
            remove_if_exists(temp)?;
            sidecar::update_processed_marker(file, &marker)?;

            info!(
                "Kept original {}: {} < {}",
                file.display(),
                format_size(original_size, BINARY),
                format_size(result_size, BINARY)
            );
            self.sinks.job_finished(&finished, JobResult::KeptOriginal);
        } else {
            fs::remove_file(file).with_context(|| format!("Error deleting file {}", file.display()))?;
            fs::rename(temp, &replacement).with_context(|| {
                format!("Error renaming file {} to {}", temp.display(), replacement.display())
            })?;

            info!(
                "Replaced {} with transcoded: {} < {}",
                file.display(),
                format_size(result_size, BINARY),
                format_size(original_size, BINARY)
            );
            self.sinks.job_finished(&finished, JobResult::Replaced);
        }

        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Error deleting file {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transcoder::ffprobe::FormatInfo;
    use transcoder::ProgressSample;

    #[derive(Default)]
    struct Results(Mutex<Vec<(JobResult, u64)>>);

    impl TelemetrySink for Results {
        fn job_finished(&self, n: &Notification, result: JobResult) {
            self.0.lock().unwrap().push((result, n.current_size));
        }
    }

    fn driver(results: Arc<Results>, shutdown: watch::Receiver<bool>) -> Driver {
        Driver {
            cfg: Arc::new(TranscodeConfig::default()),
            sinks: Sinks::new().with(results),
            shutdown,
            skip_slot: Arc::new(Mutex::new(None)),
        }
    }

    fn original(size: u64) -> SourceMetadata {
        SourceMetadata {
            format: FormatInfo { size: Some(size.to_string()), ..Default::default() },
            ..Default::default()
        }
    }

    fn killed(total_size: u64, skipped: bool) -> Outcome {
        Outcome {
            was_killed: true,
            last_sample: Some(ProgressSample { frame: 300, total_size, ..Default::default() }),
            was_user_skipped: skipped,
        }
    }

    #[tokio::test]
    async fn test_abort_below_original_size_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("movie.mp4");
        fs::write(&file, b"0123456789").unwrap();
        let temp = sidecar::temp_output_path(&file, ".transcode-temp");
        fs::write(&temp, b"partial").unwrap();

        let results = Arc::new(Results::default());
        let (_tx, rx) = watch::channel(false);
        let d = driver(results.clone(), rx);
        let base = Notification::for_source(&file, &original(1_000_000));
        d.apply_retention(&file, &temp, &original(1_000_000), killed(400_000, false), base)
            .await
            .unwrap();

        assert_eq!(*results.0.lock().unwrap(), vec![(JobResult::KeptOriginal, 400_000)]);
        assert!(file.exists());
        assert!(!temp.exists());
        let marker = sidecar::processed_marker_path(&file, ".mkv");
        assert_eq!(fs::read_to_string(marker).unwrap(), "10");
    }

    #[tokio::test]
    async fn test_user_skip_is_reported_as_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("movie.mkv");
        fs::write(&file, b"abc").unwrap();
        let temp = sidecar::temp_output_path(&file, ".transcode-temp");

        let results = Arc::new(Results::default());
        let (_tx, rx) = watch::channel(false);
        let d = driver(results.clone(), rx);
        let base = Notification::for_source(&file, &original(3));
        d.apply_retention(&file, &temp, &original(3), killed(5, true), base).await.unwrap();

        assert_eq!(*results.0.lock().unwrap(), vec![(JobResult::Skipped, 5)]);
        assert!(!sidecar::should_transcode(&d.cfg, &file));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_before_job_start_kills_job() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let encoder = dir.path().join("encoder.sh");
        fs::write(&encoder, "#!/bin/sh\nfor last; do :; done\n: > \"$last\"\nexec sleep 30\n").unwrap();
        fs::set_permissions(&encoder, fs::Permissions::from_mode(0o755)).unwrap();

        let mut cfg = TranscodeConfig::default();
        cfg.ffmpeg_bin = encoder;
        cfg.nice = false;

        // Raised while the file was still being probed
        let (tx, rx) = watch::channel(false);
        tx.send_replace(true);
        let mut d = driver(Arc::new(Results::default()), rx);
        d.cfg = Arc::new(cfg);
        assert!(d.terminated());

        let file = dir.path().join("movie.mp4");
        let temp = dir.path().join("movie.mp4.transcode-temp");
        let job = TranscodeJob::new(d.cfg.clone(), &file, &temp, Arc::new(original(1_000_000)));
        let watcher = termination::spawn_shutdown_forwarder(d.shutdown.clone(), job.stop_handle());

        let outcome = job.run(None).await.unwrap();
        watcher.await.unwrap();
        assert!(outcome.was_killed);
        assert!(!outcome.was_user_skipped);
        assert!(!temp.exists());
    }
}
