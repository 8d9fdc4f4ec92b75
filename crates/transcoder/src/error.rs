use std::path::PathBuf;
use thiserror::Error;

/// Failures of a transcode job.
///
/// Only [`TranscodeError::Spawn`] and [`TranscodeError::Probe`] stop a job.
/// The remaining variants degrade gracefully: they are built to be logged and
/// never leave the job.
#[derive(Error, Debug)]
pub enum TranscodeError {
    /// The encoder could not be started; nothing was created
    #[error("failed to spawn {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// ffprobe kept failing for the file
    #[error("failed to probe {} after {attempts} attempt(s): {reason}", .path.display())]
    Probe {
        path: PathBuf,
        attempts: u32,
        reason: String,
    },

    #[error("error reading encoder {stream}: {source}")]
    StreamRead {
        stream: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("error killing encoder: {0}")]
    Kill(#[source] std::io::Error),

    #[error("error deleting file {}: {source}", .path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type TranscodeResult<T> = std::result::Result<T, TranscodeError>;
