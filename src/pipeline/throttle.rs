//! Write accounting and burst throttling.
//!
//! When the buffer is close to full, writing a long burst keeps every slot
//! in it busy until the whole burst is on storage. The throttle shortens
//! the burst so some slots come back before the capture side runs dry.

use crate::config::ThrottleConfig;
use std::time::{Duration, Instant};

/// Counters kept by the disk writer.
#[derive(Debug, Clone, Default)]
pub struct WriteStats {
    bytes_total: u64,
    frame_bytes: u64,
    frames: u64,
    bursts: u64,
    writing_time: Duration,
    idle_time: Duration,
    last_write_end: Option<Instant>,
    last_burst_frames: usize,
}

impl WriteStats {
    /// Empty counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count header or padding bytes.
    pub fn record_overhead(&mut self, bytes: usize) {
        self.bytes_total += bytes as u64;
    }

    /// Mark the start of a burst; returns the start instant.
    pub fn begin_burst(&mut self) -> Instant {
        let now = Instant::now();
        if let Some(end) = self.last_write_end {
            self.idle_time += now.saturating_duration_since(end);
        }
        now
    }

    /// Account a finished burst that started at `started`.
    pub fn end_burst(&mut self, started: Instant, bytes: usize, frames: usize) -> Duration {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(started);
        self.writing_time += elapsed;
        self.last_write_end = Some(now);
        self.bytes_total += bytes as u64;
        self.frame_bytes += bytes as u64;
        self.frames += frames as u64;
        self.bursts += 1;
        self.last_burst_frames = frames;
        elapsed
    }

    /// Sustained write speed in bytes per second, once at least
    /// `min_sample_bytes` of frame data went through.
    pub fn speed(&self, min_sample_bytes: u64) -> Option<f64> {
        let secs = self.writing_time.as_secs_f64();
        (self.frame_bytes >= min_sample_bytes && secs > 0.0)
            .then(|| self.frame_bytes as f64 / secs)
    }

    /// Every byte written, headers included.
    pub fn bytes_total(&self) -> u64 {
        self.bytes_total
    }

    /// Bytes of frame blocks written.
    pub fn frame_bytes(&self) -> u64 {
        self.frame_bytes
    }

    /// Frames written.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Bursts written.
    pub fn bursts(&self) -> u64 {
        self.bursts
    }

    /// Time spent inside write calls.
    pub fn writing_time(&self) -> Duration {
        self.writing_time
    }

    /// Time between bursts.
    pub fn idle_time(&self) -> Duration {
        self.idle_time
    }

    /// Frames in the most recent burst.
    pub fn last_burst_frames(&self) -> usize {
        self.last_burst_frames
    }
}

/// Burst length limiter.
#[derive(Debug, Clone)]
pub struct Throttle {
    config: ThrottleConfig,
    fps: f64,
}

impl Throttle {
    /// Create a throttle for a capture rate of `fps`.
    pub fn new(config: ThrottleConfig, fps: f64) -> Self {
        Self { config, fps }
    }

    /// Speed estimate to plan with: the live measurement once trusted,
    /// the seeded speed before that.
    pub fn write_speed(&self, stats: &WriteStats) -> Option<f64> {
        stats
            .speed(self.config.min_sample_bytes)
            .or(self.config.initial_speed)
    }

    /// How many of `frames` candidate frames (`burst_bytes` in total) to
    /// write with `free_slots` slots left for capture.
    pub fn limit(
        &self,
        frames: usize,
        burst_bytes: usize,
        free_slots: usize,
        speed: Option<f64>,
    ) -> usize {
        if !self.config.enabled || frames == 0 {
            return frames;
        }
        let Some(speed) = speed.filter(|s| *s > 0.0) else {
            return frames;
        };
        let avg_frame = burst_bytes as f64 / frames as f64;
        if avg_frame <= 0.0 {
            return frames;
        }

        let overflow_secs = free_slots as f64 / self.fps;
        let frame_limit = (overflow_secs * speed * self.config.safety_factor / avg_frame).floor();
        if frame_limit < frames as f64 {
            let limited = frame_limit as usize;
            let shortened = limited.saturating_sub(1).max(1);
            tracing::trace!(
                frames,
                free_slots,
                limit = shortened,
                "shortening burst ahead of overflow"
            );
            return shortened;
        }
        frames
    }
}
