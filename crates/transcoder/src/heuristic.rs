//! Early-abort heuristic.
//!
//! Extrapolates the final output size from a partial transcode and decides
//! whether the result is doomed to be larger than the original.

/// Below this completion the extrapolation is too noisy to act on
pub const MIN_COMPLETION_PERCENT: f64 = 25.0;

/// Predicted overshoot (percent) at or below which confidence is zero
const TOLERATED_OVERSHOOT_PERCENT: f64 = 10.0;

/// Confidence that the finished output will exceed `original_size`.
///
/// Returns 0 when the predicted overshoot is at most 10%. The result is always
/// finite: completions outside `(0, 100)` yield 0, since from 100% on the
/// extrapolation equals the observed size and the plain size check decides.
pub fn skip_confidence(original_size: u64, current_size: u64, completion_percent: f64) -> f64 {
    if original_size == 0 || !(completion_percent > 0.0 && completion_percent < 100.0) {
        return 0.0;
    }

    let expected_size = current_size as f64 * 100.0 / completion_percent;
    let size_diff_percent = (expected_size / original_size as f64 - 1.0) * 100.0;
    if size_diff_percent <= TOLERATED_OVERSHOOT_PERCENT {
        return 0.0;
    }

    let confidence = size_diff_percent.ln() / (3.0 - completion_percent.log10()).ln();
    if confidence.is_finite() {
        confidence
    } else {
        0.0
    }
}

/// Completion in percent of `frame` out of `total_frames`
pub fn completion_percent(frame: u64, total_frames: u64) -> f64 {
    if total_frames == 0 {
        return 0.0;
    }
    frame as f64 / total_frames as f64 * 100.0
}

/// Why the heuristic asked for an abort
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AbortReason {
    /// Output already exceeds the original
    SizeExceeded,
    /// Extrapolated size overshoots with confidence above the threshold
    Confident(f64),
}

/// Early-abort decision for one source file
#[derive(Debug, Clone, Copy)]
pub struct EarlyAbort {
    original_size: u64,
    original_frames: u64,
    threshold: f64,
}

impl EarlyAbort {
    /// Returns `None` when the source lacks the size or frame count the
    /// prediction needs, or when the threshold is not a usable number.
    pub fn new(original_size: u64, original_frames: u64, threshold: f64) -> Option<Self> {
        if original_size == 0 || original_frames == 0 || !threshold.is_finite() || threshold < 0.0 {
            return None;
        }
        Some(Self { original_size, original_frames, threshold })
    }

    /// Confidence for a sample, guarded by [`MIN_COMPLETION_PERCENT`]
    pub fn confidence(&self, frame: u64, current_size: u64) -> f64 {
        let completion = completion_percent(frame, self.original_frames);
        if completion > MIN_COMPLETION_PERCENT {
            skip_confidence(self.original_size, current_size, completion)
        } else {
            0.0
        }
    }

    /// Decide whether the transcode should be aborted at this point
    pub fn evaluate(&self, frame: u64, current_size: u64) -> Option<AbortReason> {
        if current_size > self.original_size {
            return Some(AbortReason::SizeExceeded);
        }

        let confidence = self.confidence(frame, current_size);
        (confidence > self.threshold).then_some(AbortReason::Confident(confidence))
    }
}
