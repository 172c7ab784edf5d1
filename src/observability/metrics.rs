//! Metrics collection using metrics-rs.

use metrics::{Counter, Gauge, Histogram, Unit, counter, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const FRAMES_CAPTURED: &str = "rawrec_frames_captured";
const FRAMES_DROPPED: &str = "rawrec_frames_dropped";
const FRAMES_WRITTEN: &str = "rawrec_frames_written";
const BYTES_WRITTEN: &str = "rawrec_bytes_written";
const WRITE_BURSTS: &str = "rawrec_write_bursts";
const BURST_SIZE_BYTES: &str = "rawrec_burst_size_bytes";
const WRITE_TIME_NS: &str = "rawrec_write_time_ns";
const INTEGRITY_FAULTS: &str = "rawrec_integrity_faults";
const TRANSFER_TIMEOUTS: &str = "rawrec_transfer_timeouts";
const CHUNK_ROTATIONS: &str = "rawrec_chunk_rotations";
const FREE_SLOTS: &str = "rawrec_free_slots";
const WRITE_SPEED: &str = "rawrec_write_speed_bytes_per_sec";

/// Initialize metrics descriptions.
///
/// Call this once at application startup before using any metrics.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return; // Already initialized
    }

    metrics::describe_counter!(
        FRAMES_CAPTURED,
        Unit::Count,
        "Frames accepted by the capture trigger"
    );
    metrics::describe_counter!(
        FRAMES_DROPPED,
        Unit::Count,
        "Frames dropped at the trigger (overrun or buffer full)"
    );
    metrics::describe_counter!(FRAMES_WRITTEN, Unit::Count, "Frames written to storage");
    metrics::describe_counter!(BYTES_WRITTEN, Unit::Bytes, "Bytes written to storage");
    metrics::describe_counter!(WRITE_BURSTS, Unit::Count, "Contiguous write bursts issued");
    metrics::describe_histogram!(BURST_SIZE_BYTES, Unit::Bytes, "Size of one write burst");
    metrics::describe_histogram!(WRITE_TIME_NS, Unit::Nanoseconds, "Time spent in one write burst");
    metrics::describe_counter!(
        INTEGRITY_FAULTS,
        Unit::Count,
        "Sentinel or frame order check failures"
    );
    metrics::describe_counter!(
        TRANSFER_TIMEOUTS,
        Unit::Count,
        "Hardware transfers that never completed"
    );
    metrics::describe_counter!(
        CHUNK_ROTATIONS,
        Unit::Count,
        "Output files started after the first"
    );
    metrics::describe_gauge!(FREE_SLOTS, Unit::Count, "Free frame slots");
    metrics::describe_gauge!(WRITE_SPEED, "Measured sustained write speed in bytes per second");
}

/// Metrics collector for one recording session.
///
/// Handles are registered once with a `recording` label so the hot paths
/// only touch atomics.
#[derive(Clone)]
pub struct RecordingMetrics {
    name: String,
    frames_captured: Counter,
    frames_dropped: Counter,
    frames_written: Counter,
    bytes_written: Counter,
    bursts: Counter,
    burst_size: Histogram,
    write_time: Histogram,
    integrity_faults: Counter,
    transfer_timeouts: Counter,
    chunk_rotations: Counter,
    free_slots: Gauge,
    write_speed: Gauge,
}

impl RecordingMetrics {
    /// Create a collector labelled with `name`.
    pub fn new(name: &str) -> Self {
        let label = name.to_string();
        Self {
            name: label.clone(),
            frames_captured: counter!(FRAMES_CAPTURED, "recording" => label.clone()),
            frames_dropped: counter!(FRAMES_DROPPED, "recording" => label.clone()),
            frames_written: counter!(FRAMES_WRITTEN, "recording" => label.clone()),
            bytes_written: counter!(BYTES_WRITTEN, "recording" => label.clone()),
            bursts: counter!(WRITE_BURSTS, "recording" => label.clone()),
            burst_size: histogram!(BURST_SIZE_BYTES, "recording" => label.clone()),
            write_time: histogram!(WRITE_TIME_NS, "recording" => label.clone()),
            integrity_faults: counter!(INTEGRITY_FAULTS, "recording" => label.clone()),
            transfer_timeouts: counter!(TRANSFER_TIMEOUTS, "recording" => label.clone()),
            chunk_rotations: counter!(CHUNK_ROTATIONS, "recording" => label.clone()),
            free_slots: gauge!(FREE_SLOTS, "recording" => label.clone()),
            write_speed: gauge!(WRITE_SPEED, "recording" => label),
        }
    }

    /// Record an accepted frame.
    #[inline]
    pub fn record_captured(&self) {
        self.frames_captured.increment(1);
    }

    /// Record a dropped frame.
    #[inline]
    pub fn record_dropped(&self) {
        self.frames_dropped.increment(1);
    }

    /// Record one completed write burst.
    #[inline]
    pub fn record_burst(&self, bytes: usize, frames: usize, elapsed: Duration) {
        self.bursts.increment(1);
        self.frames_written.increment(frames as u64);
        self.bytes_written.increment(bytes as u64);
        self.burst_size.record(bytes as f64);
        self.write_time.record(elapsed.as_nanos() as f64);
    }

    /// Record header or padding bytes written outside a burst.
    #[inline]
    pub fn record_bytes(&self, bytes: usize) {
        self.bytes_written.increment(bytes as u64);
    }

    /// Record an integrity fault.
    #[inline]
    pub fn record_integrity_fault(&self) {
        self.integrity_faults.increment(1);
    }

    /// Record a transfer timeout.
    #[inline]
    pub fn record_transfer_timeout(&self) {
        self.transfer_timeouts.increment(1);
    }

    /// Record a chunk rotation.
    #[inline]
    pub fn record_chunk_rotation(&self) {
        self.chunk_rotations.increment(1);
    }

    /// Record the number of free slots.
    #[inline]
    pub fn record_free_slots(&self, free: usize) {
        self.free_slots.set(free as f64);
    }

    /// Record the measured write speed.
    #[inline]
    pub fn record_write_speed(&self, bytes_per_sec: f64) {
        self.write_speed.set(bytes_per_sec);
    }

    /// Get the recording name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for RecordingMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingMetrics")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
