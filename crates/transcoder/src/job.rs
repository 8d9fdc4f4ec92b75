use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::ChildStdout;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;
use crate::config::TranscodeConfig;
use crate::error::TranscodeResult;
use crate::ffprobe::SourceMetadata;
use crate::heuristic::{AbortReason, EarlyAbort};
use crate::progress::{ProgressReader, ProgressSample, TickBoundary};
use crate::supervisor::Supervisor;
use crate::telemetry::{Notification, ProgressLog, Sinks, TelemetrySink};
use crate::termination::{
    spawn_signal_listener, spawn_skip_listener, ListenerGuard, StopHandle, StopRequest,
    TerminationCoordinator,
};

/// Result of a job that started.
///
/// `was_user_skipped` implies `was_killed`.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub was_killed: bool,
    pub last_sample: Option<ProgressSample>,
    pub was_user_skipped: bool,
}

/// One encoder run over one source file
pub struct TranscodeJob {
    id: Uuid,
    created: DateTime<Utc>,
    config: Arc<TranscodeConfig>,
    source: PathBuf,
    temp_output: PathBuf,
    metadata: Arc<SourceMetadata>,
    sinks: Sinks,
    boundary: TickBoundary,
    handle_signals: bool,
    coordinator: TerminationCoordinator,
    stop: StopHandle,
    latest_tx: watch::Sender<Option<ProgressSample>>,
    latest_rx: watch::Receiver<Option<ProgressSample>>,
}

impl TranscodeJob {
    pub fn new(
        config: Arc<TranscodeConfig>,
        source: impl Into<PathBuf>,
        temp_output: impl Into<PathBuf>,
        metadata: Arc<SourceMetadata>,
    ) -> Self {
        let (coordinator, stop) = TerminationCoordinator::new();
        let (latest_tx, latest_rx) = watch::channel(None);
        Self {
            id: Uuid::new_v4(),
            created: Utc::now(),
            config,
            source: source.into(),
            temp_output: temp_output.into(),
            metadata,
            sinks: Sinks::new(),
            boundary: TickBoundary::default(),
            handle_signals: false,
            coordinator,
            stop,
            latest_tx,
            latest_rx,
        }
    }

    pub fn with_sinks(mut self, sinks: Sinks) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn with_tick_boundary(mut self, boundary: TickBoundary) -> Self {
        self.boundary = boundary;
        self
    }

    /// Whether the job listens for SIGINT/SIGTERM itself (default false).
    ///
    /// Enabling this installs tokio's process-wide handler, which stays in place
    /// after the job: from then on SIGINT/SIGTERM no longer terminate the process
    /// by default, so the caller must handle them between jobs.
    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn temp_output(&self) -> &Path {
        &self.temp_output
    }

    /// Telemetry snapshot of this job before any progress
    pub fn notification(&self) -> Notification {
        Notification::new(self.id, self.created, &self.source, &self.metadata)
    }

    /// Extra producer for the job's stop channel
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Watch the latest decoded sample while the job runs
    pub fn latest_sample(&self) -> watch::Receiver<Option<ProgressSample>> {
        self.latest_rx.clone()
    }

    /// Run the encoder to completion or until stopped.
    ///
    /// `Err` means the encoder never started. Returns only after the process
    /// has exited, any kill cleanup is done and the decoder has drained.
    pub async fn run(mut self, skip: Option<oneshot::Receiver<bool>>) -> TranscodeResult<Outcome> {
        let notification = self.notification();
        self.sinks.job_started(&notification);

        let mut supervisor =
            Supervisor::start(&self.config, &self.source, &self.temp_output, Some(&self.metadata))?;
        info!("Job {} running ffmpeg (pid {:?}) for {}", self.id, supervisor.id(), self.source.display());

        let decoder = supervisor.take_stdout().map(|stdout| {
            tokio::spawn(decode_progress(DecoderContext {
                stdout,
                boundary: self.boundary,
                early_abort: self.early_abort(),
                stop: self.stop.clone(),
                sinks: self.sinks.clone(),
                notification: notification.clone(),
                latest: self.latest_tx.clone(),
                interval: Duration::from_secs(self.config.interval_secs),
            }))
        });
        let stderr_copy = supervisor
            .take_stderr()
            .map(|stderr| tokio::spawn(copy_stderr(stderr, tokio::io::stderr())));

        let mut listeners = ListenerGuard::default();
        if let Some(skip) = skip {
            listeners.push(spawn_skip_listener(skip, self.stop.clone()));
        }
        if self.handle_signals {
            listeners.push(spawn_signal_listener(self.stop.clone()));
        }

        let state = self.coordinator.run(&mut supervisor).await;
        drop(listeners);

        join_task("progress decoder", decoder).await;
        join_task("stderr copy", stderr_copy).await;

        let outcome = Outcome {
            was_killed: state.was_killed(),
            last_sample: self.latest_rx.borrow().clone(),
            was_user_skipped: state.was_user_skipped(),
        };
        debug!("Job {} finished in state {:?}", self.id, state);
        Ok(outcome)
    }

    fn early_abort(&self) -> Option<EarlyAbort> {
        if !self.config.early_abort_enabled() {
            return None;
        }

        let abort = EarlyAbort::new(self.metadata.size(), self.metadata.frame_count(), self.config.skip_confidence);
        if abort.is_none() {
            warn!(
                "Early exit disabled for {}: original size or frame count unknown",
                self.source.display()
            );
        }
        abort
    }
}

struct DecoderContext {
    stdout: ChildStdout,
    boundary: TickBoundary,
    early_abort: Option<EarlyAbort>,
    stop: StopHandle,
    sinks: Sinks,
    notification: Notification,
    latest: watch::Sender<Option<ProgressSample>>,
    interval: Duration,
}

/// Sole writer of the latest-sample cell. Stops reading once it has asked
/// for an abort.
async fn decode_progress(ctx: DecoderContext) {
    let DecoderContext { stdout, boundary, early_abort, stop, sinks, notification, latest, interval } = ctx;
    let mut reader = ProgressReader::new(stdout, boundary);
    let mut progress_log = ProgressLog::new(interval);

    loop {
        let sample = match reader.next_sample().await {
            Ok(Some(sample)) => sample,
            Ok(None) => break,
            Err(e) => {
                error!("{}", e);
                break;
            }
        };
        latest.send_replace(Some(sample.clone()));

        if let Some(abort) = &early_abort {
            if let Some(reason) = abort.evaluate(sample.frame, sample.total_size) {
                match reason {
                    AbortReason::SizeExceeded => warn!(
                        "Output of {} already exceeds the original at frame {}",
                        notification.filename, sample.frame
                    ),
                    AbortReason::Confident(confidence) => warn!(
                        "Output of {} predicted larger than the original (confidence {:.2}) at frame {}",
                        notification.filename, confidence, sample.frame
                    ),
                }
                stop.request(StopRequest::HeuristicAbort);
                return;
            }
        }

        sinks.progress(&notification.clone().with_sample(&sample));
        progress_log.log(&notification.filename, &sample);
    }
}

/// Copy ffmpeg's stderr verbatim to `out`
async fn copy_stderr<R, W>(mut stderr: R, mut out: W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if let Err(e) = tokio::io::copy(&mut stderr, &mut out).await {
        error!(
            "{}",
            crate::error::TranscodeError::StreamRead { stream: "stderr", source: e }
        );
    }
}

async fn join_task(name: &str, task: Option<JoinHandle<()>>) {
    if let Some(task) = task {
        if let Err(e) = task.await {
            error!("{} task failed: {}", name, e);
        }
    }
}
