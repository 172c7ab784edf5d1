//! Recording configuration.
//!
//! All settings are read once when a session is prepared and stay fixed
//! for its lifetime.

use crate::error::{Error, Result};
use crate::memory::SlotLayout;
use std::path::PathBuf;
use std::time::Duration;

/// Default maximum size of one output file (FAT32 limit).
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 4 * 1024 * 1024 * 1024 - 1;

/// Default free memory pre-roll must leave for steady-state buffering.
pub const DEFAULT_PREROLL_HEADROOM: usize = 16 * 1024 * 1024;

/// Default disk writer poll interval while waiting for a frame.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Default wait for a hardware transfer to complete.
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_millis(500);

/// Sensor geometry and the cropped output window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    /// Full sensor buffer width in pixels.
    pub sensor_width: u32,
    /// Full sensor buffer height in pixels.
    pub sensor_height: u32,
    /// Bits per pixel.
    pub bits_per_pixel: u32,
    /// Output width in pixels.
    pub width: u32,
    /// Output height in pixels.
    pub height: u32,
    /// Requested horizontal crop offset in pixels.
    pub crop_x: u32,
    /// Requested vertical crop offset in pixels.
    pub crop_y: u32,
}

impl Default for FrameGeometry {
    fn default() -> Self {
        Self {
            sensor_width: 1920,
            sensor_height: 1080,
            bits_per_pixel: 14,
            width: 1920,
            height: 1080,
            crop_x: 0,
            crop_y: 0,
        }
    }
}

impl FrameGeometry {
    /// Geometry recording the whole sensor.
    pub fn full_sensor(width: u32, height: u32, bits_per_pixel: u32) -> Self {
        Self {
            sensor_width: width,
            sensor_height: height,
            bits_per_pixel,
            width,
            height,
            crop_x: 0,
            crop_y: 0,
        }
    }

    /// Set the output window size.
    pub fn with_output(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the crop offset.
    pub fn with_crop(mut self, x: u32, y: u32) -> Self {
        self.crop_x = x;
        self.crop_y = y;
        self
    }

    /// Bytes per sensor row.
    pub fn pitch(&self) -> usize {
        self.sensor_width as usize * self.bits_per_pixel as usize / 8
    }

    /// Bytes per output row.
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.bits_per_pixel as usize / 8
    }

    /// Uncompressed output frame size.
    pub fn frame_size(&self) -> usize {
        self.row_bytes() * self.height as usize
    }

    /// Size of one full sensor buffer.
    pub fn sensor_buffer_size(&self) -> usize {
        self.pitch() * self.sensor_height as usize
    }

    /// Crop origin actually copied: x rounded up to 8 pixels, y to an
    /// even row (keeps the Bayer pattern and byte alignment).
    pub fn aligned_crop(&self) -> (u32, u32) {
        (self.crop_x.div_ceil(8) * 8, self.crop_y & !1)
    }

    /// Byte offset of the aligned crop origin in the sensor buffer.
    pub fn crop_offset(&self) -> usize {
        let (x, y) = self.aligned_crop();
        y as usize * self.pitch() + x as usize * self.bits_per_pixel as usize / 8
    }

    /// Check the window fits the sensor and rows stay byte-aligned.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.bits_per_pixel == 0 {
            return Err(Error::InvalidConfig("empty frame geometry".into()));
        }
        if self.bits_per_pixel > 16 {
            return Err(Error::InvalidConfig(format!(
                "unsupported bit depth {}",
                self.bits_per_pixel
            )));
        }
        if (self.width as usize * self.bits_per_pixel as usize) % 8 != 0 {
            return Err(Error::InvalidConfig("output rows are not byte-aligned".into()));
        }
        if self.frame_size() % 4 != 0 {
            return Err(Error::InvalidConfig(format!(
                "frame size {} is not a multiple of 4",
                self.frame_size()
            )));
        }
        let (x, y) = self.aligned_crop();
        if x + self.width > self.sensor_width || y + self.height > self.sensor_height {
            return Err(Error::InvalidConfig(format!(
                "{}x{} window at ({x},{y}) exceeds the {}x{} sensor",
                self.width, self.height, self.sensor_width, self.sensor_height
            )));
        }
        Ok(())
    }
}

/// Output encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionMode {
    /// Uncompressed frames copied by the transfer engine.
    #[default]
    Off,
    /// Lossless software compression; slots shrink to the payload.
    Lossless,
}

impl CompressionMode {
    /// Whether frames go through the compressor.
    pub fn is_enabled(self) -> bool {
        matches!(self, CompressionMode::Lossless)
    }
}

/// Disk writer throttle settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleConfig {
    /// Shorten bursts that would take longer than the free buffer lasts.
    pub enabled: bool,
    /// Fraction of the measured write speed assumed to be sustainable.
    pub safety_factor: f64,
    /// Write speed to assume before anything was measured (bytes/s).
    pub initial_speed: Option<f64>,
    /// Bytes that must be written before the live estimate is trusted.
    pub min_sample_bytes: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            safety_factor: 0.9,
            initial_speed: None,
            min_sample_bytes: 4 * 1024 * 1024,
        }
    }
}

impl ThrottleConfig {
    /// A throttle that never shortens bursts.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Seed the write speed estimate.
    pub fn with_initial_speed(mut self, bytes_per_sec: f64) -> Self {
        self.initial_speed = Some(bytes_per_sec);
        self
    }

    /// Set the safety factor.
    pub fn with_safety_factor(mut self, factor: f64) -> Self {
        self.safety_factor = factor;
        self
    }

    /// Set the minimum sample size for the live estimate.
    pub fn with_min_sample_bytes(mut self, bytes: u64) -> Self {
        self.min_sample_bytes = bytes;
        self
    }
}

/// Pre-roll buffering settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreRollConfig {
    /// How much footage to keep before the trigger.
    pub duration: Duration,
    /// Memory pre-roll must leave unused.
    pub headroom: usize,
}

impl PreRollConfig {
    /// Pre-roll of the given duration with the default headroom.
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            headroom: DEFAULT_PREROLL_HEADROOM,
        }
    }

    /// Set the headroom.
    pub fn with_headroom(mut self, bytes: usize) -> Self {
        self.headroom = bytes;
        self
    }

    /// Frames to buffer at `fps`, capped so `headroom` bytes stay free.
    pub fn frame_budget(&self, fps: f64, slot_count: usize, slot_size: usize) -> u32 {
        let wanted = (self.duration.as_secs_f64() * fps).round() as usize;
        let reserve = self.headroom.div_ceil(slot_size.max(1));
        let cap = slot_count.saturating_sub(reserve);
        wanted.min(cap).min(u32::MAX as usize) as u32
    }
}

/// Settings for one recording session.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Path of the first output chunk.
    pub output: PathBuf,
    /// Frame geometry.
    pub geometry: FrameGeometry,
    /// Capture rate in frames per second.
    pub fps: f64,
    /// Frame encoding.
    pub compression: CompressionMode,
    /// Slot layout.
    pub layout: SlotLayout,
    /// Disk writer throttle.
    pub throttle: ThrottleConfig,
    /// Pre-roll buffering, if any.
    pub pre_roll: Option<PreRollConfig>,
    /// Largest single output file, if the storage has a limit.
    pub max_chunk_size: Option<u64>,
    /// Split chunks before they reach `max_chunk_size`. When false the
    /// limit is only learned from a short write and the partial data is
    /// covered with a NULL block.
    pub chunk_limit_known: bool,
    /// How long the writer sleeps while the head frame is incomplete.
    pub poll_interval: Duration,
    /// How long the copy worker waits for a hardware transfer.
    pub transfer_timeout: Duration,
    /// Capacity of the capture to worker channel.
    pub worker_queue_depth: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            output: PathBuf::from("M00-0000.RVF"),
            geometry: FrameGeometry::default(),
            fps: 24.0,
            compression: CompressionMode::Off,
            layout: SlotLayout::default(),
            throttle: ThrottleConfig::default(),
            pre_roll: None,
            max_chunk_size: Some(DEFAULT_MAX_CHUNK_SIZE),
            chunk_limit_known: true,
            poll_interval: DEFAULT_POLL_INTERVAL,
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
            worker_queue_depth: 2,
        }
    }
}

impl RecorderConfig {
    /// Create a config writing to `output`.
    pub fn new(output: impl Into<PathBuf>, geometry: FrameGeometry, fps: f64) -> Self {
        Self {
            output: output.into(),
            geometry,
            fps,
            ..Self::default()
        }
    }

    /// Set the compression mode.
    pub fn with_compression(mut self, mode: CompressionMode) -> Self {
        self.compression = mode;
        self
    }

    /// Set the slot layout.
    pub fn with_layout(mut self, layout: SlotLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Set the throttle.
    pub fn with_throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.throttle = throttle;
        self
    }

    /// Enable pre-roll.
    pub fn with_pre_roll(mut self, pre_roll: PreRollConfig) -> Self {
        self.pre_roll = Some(pre_roll);
        self
    }

    /// Set the chunk size limit (`None` for unlimited).
    pub fn with_max_chunk_size(mut self, limit: Option<u64>) -> Self {
        self.max_chunk_size = limit;
        self
    }

    /// Whether the chunk limit is enforced up front or discovered from the
    /// device.
    pub fn with_chunk_limit_known(mut self, known: bool) -> Self {
        self.chunk_limit_known = known;
        self
    }

    /// Set the writer poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the transfer timeout.
    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    /// Uncompressed payload size of one frame.
    pub fn frame_size(&self) -> usize {
        self.geometry.frame_size()
    }

    /// Check every setting.
    pub fn validate(&self) -> Result<()> {
        self.geometry.validate()?;
        self.layout.validate()?;
        if !(self.fps.is_finite() && self.fps > 0.0) {
            return Err(Error::InvalidConfig(format!("invalid frame rate {}", self.fps)));
        }
        if !(self.throttle.safety_factor > 0.0 && self.throttle.safety_factor <= 1.0) {
            return Err(Error::InvalidConfig(
                "throttle safety factor must be in (0, 1]".into(),
            ));
        }
        if let Some(limit) = self.max_chunk_size {
            let slot_size = self.layout.slot_size(self.frame_size());
            let min = (slot_size + self.layout.write_alignment) as u64;
            if limit < min {
                return Err(Error::InvalidConfig(format!(
                    "chunk limit {limit} cannot hold a single frame ({min} bytes)"
                )));
            }
        }
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidConfig("poll interval must be > 0".into()));
        }
        if self.worker_queue_depth == 0 {
            return Err(Error::InvalidConfig("worker queue depth must be > 0".into()));
        }
        if self.output.extension().is_none_or(|e| e.len() < 2) {
            return Err(Error::InvalidConfig(format!(
                "output {} needs an extension of at least two characters",
                self.output.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_sizes() {
        let g = FrameGeometry::full_sensor(2080, 1318, 14).with_output(1920, 1080).with_crop(13, 7);
        assert_eq!(g.pitch(), 2080 * 14 / 8);
        assert_eq!(g.row_bytes(), 1920 * 14 / 8);
        assert_eq!(g.frame_size(), 1920 * 14 / 8 * 1080);
        assert_eq!(g.aligned_crop(), (16, 6));
        assert_eq!(g.crop_offset(), 6 * g.pitch() + 16 * 14 / 8);
        g.validate().unwrap();
    }

    #[test]
    fn test_geometry_rejects_oversized_window() {
        let g = FrameGeometry::full_sensor(1920, 1080, 14).with_crop(8, 0);
        assert!(g.validate().is_err());
    }

    #[test]
    fn test_pre_roll_budget() {
        let p = PreRollConfig::new(Duration::from_secs(2)).with_headroom(0);
        assert_eq!(p.frame_budget(30.0, 100, 1 << 20), 60);
        assert_eq!(p.frame_budget(30.0, 40, 1 << 20), 40);

        let p = PreRollConfig::new(Duration::from_secs(2));
        // 16 MiB of 1 MiB slots stay free
        assert_eq!(p.frame_budget(30.0, 50, 1 << 20), 34);
    }

    #[test]
    fn test_recorder_config_validate() {
        let geometry = FrameGeometry::full_sensor(640, 480, 12);
        let config = RecorderConfig::new("/tmp/A.RVF", geometry, 25.0);
        config.validate().unwrap();

        assert!(config.clone().with_max_chunk_size(Some(1024)).validate().is_err());
        let mut bad = config.clone();
        bad.fps = 0.0;
        assert!(bad.validate().is_err());
        let mut bad = config;
        bad.output = PathBuf::from("/tmp/noext");
        assert!(bad.validate().is_err());
    }
}
