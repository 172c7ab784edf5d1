//! How many frames can be recorded before the buffer runs out.

use std::fmt;

/// Spread applied around a measured write speed by [`guess_frames`].
pub const SPEED_SPREAD: f64 = 512.0 * 1024.0;

/// Above this many frames a recording is reported as continuous.
pub const CONTINUOUS_THRESHOLD: u64 = 5000;

/// Predicted recording length.
///
/// Ordered so that any finite count is smaller than `Continuous`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FramePrediction {
    /// The buffer fills up after about this many frames.
    Frames(u64),
    /// Storage keeps up with capture; the buffer never fills.
    Continuous,
}

/// Predict the number of frames until the buffer is full.
///
/// `arena_table` holds the usable arena sizes, `slot_size` the bytes per
/// frame slot, `fps` the capture rate and `write_speed` the sustained
/// storage speed in bytes per second.
pub fn predict_frames(
    arena_table: &[usize],
    slot_size: usize,
    fps: f64,
    write_speed: f64,
) -> FramePrediction {
    if slot_size == 0 || fps <= 0.0 {
        return FramePrediction::Frames(0);
    }

    let capture_speed = slot_size as f64 * fps;
    let fill_speed = capture_speed - write_speed;
    if fill_speed <= 0.0 {
        return FramePrediction::Continuous;
    }

    let total_slots: usize = arena_table.iter().map(|size| size / slot_size).sum();
    let fill_time = (total_slots * slot_size) as f64 / fill_speed;
    FramePrediction::Frames((fill_time * fps) as u64)
}

/// Low/high frame estimate around a measured write speed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameGuess {
    /// Prediction at the measured speed minus [`SPEED_SPREAD`].
    pub low: FramePrediction,
    /// Prediction at the measured speed plus [`SPEED_SPREAD`].
    pub high: FramePrediction,
    /// Measured speed in bytes per second.
    pub write_speed: f64,
}

impl FrameGuess {
    /// Whether even the pessimistic estimate allows continuous recording.
    pub fn is_continuous(&self) -> bool {
        match self.low {
            FramePrediction::Continuous => true,
            FramePrediction::Frames(n) => n >= CONTINUOUS_THRESHOLD,
        }
    }
}

impl fmt::Display for FrameGuess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_continuous() {
            return f.write_str("Continuous recording OK.");
        }
        let mbps = self.write_speed / (1024.0 * 1024.0);
        match (self.low, self.high) {
            (FramePrediction::Frames(lo), FramePrediction::Frames(hi)) if lo != hi => {
                write!(f, "Expect {lo}-{hi} frames at {mbps:.1}MB/s.")
            }
            (FramePrediction::Frames(lo), FramePrediction::Continuous) => {
                write!(f, "Expect {lo} frames or more at {mbps:.1}MB/s.")
            }
            (FramePrediction::Frames(lo), _) => {
                write!(f, "Expect around {lo} frames at {mbps:.1}MB/s.")
            }
            (FramePrediction::Continuous, _) => f.write_str("Continuous recording OK."),
        }
    }
}

/// Estimate the recording length for a measured write speed.
///
/// Returns `None` without a measurement or without arenas.
pub fn guess_frames(
    arena_table: &[usize],
    slot_size: usize,
    fps: f64,
    measured_speed: Option<f64>,
) -> Option<FrameGuess> {
    let speed = measured_speed.filter(|s| *s > 0.0)?;
    if arena_table.is_empty() {
        return None;
    }
    Some(FrameGuess {
        low: predict_frames(arena_table, slot_size, fps, (speed - SPEED_SPREAD).max(0.0)),
        high: predict_frames(arena_table, slot_size, fps, speed + SPEED_SPREAD),
        write_speed: speed,
    })
}
