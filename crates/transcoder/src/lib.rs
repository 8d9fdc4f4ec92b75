pub mod config;
pub mod error;
pub mod ffprobe;
pub mod progress;
pub mod heuristic;
pub mod supervisor;
pub mod termination;
pub mod telemetry;
pub mod job;
pub mod sidecar;
pub mod scan;

#[cfg(all(test, unix))]
pub(crate) mod test_support;

pub use config::TranscodeConfig;
pub use error::{TranscodeError, TranscodeResult};
pub use ffprobe::{probe_file, SourceMetadata};
pub use job::{Outcome, TranscodeJob};
pub use progress::ProgressSample;
pub use telemetry::{JobResult, LogSink, Notification, Sinks, TelemetrySink};
pub use termination::{StopHandle, StopRequest};
