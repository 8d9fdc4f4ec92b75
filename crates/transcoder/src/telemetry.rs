use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use chrono::{DateTime, Utc};
use humansize::{format_size, BINARY};
use log::info;
use serde::Serialize;
use uuid::Uuid;
use crate::ffprobe::SourceMetadata;
use crate::progress::ProgressSample;

/// What the outer driver did with a file once its job finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobResult {
    KeptOriginal,
    Replaced,
    Error,
    Skipped,
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            JobResult::KeptOriginal => "Kept original",
            JobResult::Replaced => "Replaced with new",
            JobResult::Error => "Error",
            JobResult::Skipped => "Skipped, kept original",
        };
        f.write_str(text)
    }
}

/// Snapshot handed to telemetry sinks
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub job_id: Uuid,
    pub started: DateTime<Utc>,
    pub filename: String,
    pub original_frames: u64,
    pub original_size: u64,
    pub current_frame: u64,
    pub current_size: u64,
    pub fps: f64,
    pub bitrate: f64,
    pub speed: f64,
}

impl Notification {
    pub fn new(job_id: Uuid, started: DateTime<Utc>, source: &Path, metadata: &SourceMetadata) -> Self {
        let filename = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| source.display().to_string());

        Self {
            job_id,
            started,
            filename,
            original_frames: metadata.frame_count(),
            original_size: metadata.size(),
            current_frame: 0,
            current_size: 0,
            fps: 0.0,
            bitrate: 0.0,
            speed: 0.0,
        }
    }

    /// Snapshot for a file that has no job (yet), e.g. when probing failed
    pub fn for_source(source: &Path, metadata: &SourceMetadata) -> Self {
        Self::new(Uuid::new_v4(), Utc::now(), source, metadata)
    }

    /// Copy the live counters of a sample
    pub fn with_sample(mut self, sample: &ProgressSample) -> Self {
        self.current_frame = sample.frame;
        self.current_size = sample.total_size;
        self.fps = sample.fps;
        self.bitrate = sample.bitrate;
        self.speed = sample.speed;
        self
    }

    /// Replace current counters with the finished file's metadata
    pub fn with_result_metadata(mut self, metadata: &SourceMetadata) -> Self {
        self.current_size = metadata.size();
        self.current_frame = metadata.frame_count();
        self
    }

    pub fn elapsed(&self) -> chrono::Duration {
        Utc::now() - self.started
    }
}

/// Receiver of job lifecycle and progress events. All hooks default to no-ops.
pub trait TelemetrySink: Send + Sync {
    fn job_started(&self, _notification: &Notification) {}

    fn progress(&self, _notification: &Notification) {}

    fn job_finished(&self, _notification: &Notification, _result: JobResult) {}
}

/// Ordered list of sinks owned by the caller
#[derive(Clone, Default)]
pub struct Sinks {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl Sinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn push(&mut self, sink: Arc<dyn TelemetrySink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl TelemetrySink for Sinks {
    fn job_started(&self, notification: &Notification) {
        for sink in &self.sinks {
            sink.job_started(notification);
        }
    }

    fn progress(&self, notification: &Notification) {
        for sink in &self.sinks {
            sink.progress(notification);
        }
    }

    fn job_finished(&self, notification: &Notification, result: JobResult) {
        for sink in &self.sinks {
            sink.job_finished(notification, result);
        }
    }
}

impl fmt::Debug for Sinks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sinks").field("len", &self.sinks.len()).finish()
    }
}

/// Logs job start and end
#[derive(Debug, Default)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn job_started(&self, n: &Notification) {
        info!(
            "▶️  Started {} ({} frames, {})",
            n.filename,
            n.original_frames,
            format_size(n.original_size, BINARY)
        );
    }

    fn job_finished(&self, n: &Notification, result: JobResult) {
        let elapsed = n.elapsed();
        info!(
            "⏹️  {}: {} after {}m{:02}s ({} -> {})",
            result,
            n.filename,
            elapsed.num_minutes(),
            elapsed.num_seconds() % 60,
            format_size(n.original_size, BINARY),
            format_size(n.current_size, BINARY)
        );
    }
}

/// Rate limiter for the human readable progress line
#[derive(Debug)]
pub struct ProgressLog {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressLog {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    /// Whether a line is due at `now`; records the emission if so
    pub fn due(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    /// Log the sample if the interval has elapsed
    pub fn log(&mut self, filename: &str, sample: &ProgressSample) {
        if self.due(Instant::now()) {
            info!(
                "Progress: {} frame={} fps={:.2} bitrate={:.1}kbits/s total_size={} speed={:.2}x",
                filename,
                sample.frame,
                sample.fps,
                sample.bitrate,
                format_size(sample.total_size, BINARY),
                sample.speed
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl TelemetrySink for Recorder {
        fn job_started(&self, n: &Notification) {
            self.events.lock().unwrap().push(format!("start {}", n.filename));
        }

        fn progress(&self, n: &Notification) {
            self.events.lock().unwrap().push(format!("progress {}", n.current_frame));
        }

        fn job_finished(&self, _n: &Notification, result: JobResult) {
            self.events.lock().unwrap().push(format!("end {:?}", result));
        }
    }

    fn notification() -> Notification {
        Notification::new(Uuid::new_v4(), Utc::now(), Path::new("/media/movie.mp4"), &SourceMetadata::default())
    }

    #[test]
    fn test_sinks_fan_out_in_order() {
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        let sinks = Sinks::new().with(a.clone()).with(b.clone());

        let n = notification();
        sinks.job_started(&n);
        sinks.progress(&n.clone().with_sample(&ProgressSample { frame: 9, ..Default::default() }));
        sinks.job_finished(&n, JobResult::Skipped);

        let expected = vec!["start movie.mp4", "progress 9", "end Skipped"];
        assert_eq!(*a.events.lock().unwrap(), expected);
        assert_eq!(*b.events.lock().unwrap(), expected);
    }

    #[test]
    fn test_progress_log_throttles() {
        let mut log = ProgressLog::new(Duration::from_secs(5));
        let t0 = Instant::now();
        assert!(log.due(t0));
        assert!(!log.due(t0 + Duration::from_secs(1)));
        assert!(!log.due(t0 + Duration::from_millis(4999)));
        assert!(log.due(t0 + Duration::from_secs(5)));
        assert!(!log.due(t0 + Duration::from_secs(6)));
    }

    #[test]
    fn test_result_display() {
        assert_eq!(JobResult::Skipped.to_string(), "Skipped, kept original");
        assert_eq!(JobResult::Replaced.to_string(), "Replaced with new");
    }
}
