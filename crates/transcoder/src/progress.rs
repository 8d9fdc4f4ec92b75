//! Decoder for ffmpeg's `-progress` output.
//!
//! ffmpeg writes one `key=value` pair per line and ends each update with a
//! `progress=continue` or `progress=end` line. Updates are grouped into ticks;
//! every completed tick becomes one [`ProgressSample`].

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use crate::error::{TranscodeError, TranscodeResult};

/// Number of lines ffmpeg emits per progress update for a single output
pub const LINES_PER_TICK: usize = 12;

/// One decoded progress update
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressSample {
    pub frame: u64,
    pub fps: f64,
    /// kbit/s, unit suffix stripped
    pub bitrate: f64,
    /// Bytes written to the output so far
    pub total_size: u64,
    /// Multiple of realtime, `x` suffix stripped
    pub speed: f64,
    /// Raw `progress` marker, usually `continue` or `end`
    pub progress: String,
}

impl ProgressSample {
    /// Whether ffmpeg marked this as its final update
    pub fn is_end(&self) -> bool {
        self.progress == "end"
    }
}

/// How tick boundaries are detected in the line stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickBoundary {
    /// Every `n` lines form a tick. Matches ffmpeg's layout for a single
    /// output but breaks as soon as ffmpeg adds or drops a key.
    FixedCount(usize),
    /// A tick ends at the `progress=` line
    ProgressKey,
}

impl Default for TickBoundary {
    fn default() -> Self {
        TickBoundary::FixedCount(LINES_PER_TICK)
    }
}

/// Decode a complete tick. Unknown keys are ignored and unparsable numbers become zero.
pub fn decode_tick<S: AsRef<str>>(lines: &[S]) -> ProgressSample {
    let mut sample = ProgressSample::default();

    for line in lines {
        let Some((key, value)) = line.as_ref().split_once('=') else {
            continue;
        };

        match key.trim() {
            "frame" => sample.frame = value.trim().parse().unwrap_or(0),
            "fps" => sample.fps = value.trim().parse().unwrap_or(0.0),
            "bitrate" => sample.bitrate = leading_number(value),
            "total_size" => sample.total_size = value.trim().parse().unwrap_or(0),
            "speed" => sample.speed = leading_number(value),
            "progress" => sample.progress = value.trim().to_string(),
            _ => {}
        }
    }

    sample
}

/// Parse the leading numeric run of a value such as `1024.5kbits/s` or ` 1.5x`
fn leading_number(value: &str) -> f64 {
    let value = value.trim_start();
    let end = value
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || c == '.' || (i == 0 && c == '-')))
        .map(|(i, _)| i)
        .unwrap_or(value.len());

    value[..end].parse().unwrap_or(0.0)
}

/// Groups lines into ticks
#[derive(Debug, Default)]
pub struct TickAccumulator {
    boundary: TickBoundary,
    lines: Vec<String>,
}

impl TickAccumulator {
    pub fn new(boundary: TickBoundary) -> Self {
        Self { boundary, lines: Vec::new() }
    }

    /// Add a line; returns a sample when it completes a tick
    pub fn push(&mut self, line: String) -> Option<ProgressSample> {
        let closes = match self.boundary {
            TickBoundary::FixedCount(n) => self.lines.len() + 1 >= n.max(1),
            TickBoundary::ProgressKey => line.starts_with("progress="),
        };
        self.lines.push(line);

        if closes {
            let sample = decode_tick(&self.lines);
            self.lines.clear();
            Some(sample)
        } else {
            None
        }
    }
}

/// Lazy sequence of samples read from the encoder's stdout. Ends when the
/// pipe closes; cannot be restarted.
pub struct ProgressReader<R> {
    reader: BufReader<R>,
    ticks: TickAccumulator,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> ProgressReader<R> {
    pub fn new(inner: R, boundary: TickBoundary) -> Self {
        Self {
            reader: BufReader::new(inner),
            ticks: TickAccumulator::new(boundary),
            buf: Vec::new(),
        }
    }

    /// Next completed sample, `Ok(None)` once the stream has closed.
    /// A trailing partial tick is discarded.
    pub async fn next_sample(&mut self) -> TranscodeResult<Option<ProgressSample>> {
        loop {
            self.buf.clear();
            let read = self
                .reader
                .read_until(b'\n', &mut self.buf)
                .await
                .map_err(|source| TranscodeError::StreamRead { stream: "stdout", source })?;
            if read == 0 {
                return Ok(None);
            }

            let line = String::from_utf8_lossy(&self.buf);
            let line = line.trim_end_matches(&['\n', '\r'][..]).to_string();
            if let Some(sample) = self.ticks.push(line) {
                return Ok(Some(sample));
            }
        }
    }
}
