//! Observability features: metrics and tracing.
//!
//! - **Metrics**: Counters, gauges, and histograms via `metrics-rs`
//! - **Tracing**: Structured logging and spans via `tracing`
//!
//! ## Metrics
//!
//! rawrec exposes the following metrics, labelled with `recording`:
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `rawrec_frames_captured` | Counter | Frames accepted by the capture trigger |
//! | `rawrec_frames_dropped` | Counter | Frames dropped (overrun, buffer full) |
//! | `rawrec_frames_written` | Counter | Frames written to storage |
//! | `rawrec_bytes_written` | Counter | Bytes written, headers included |
//! | `rawrec_write_bursts` | Counter | Contiguous write bursts |
//! | `rawrec_burst_size_bytes` | Histogram | Bytes per burst |
//! | `rawrec_write_time_ns` | Histogram | Time per burst |
//! | `rawrec_integrity_faults` | Counter | Sentinel or order check failures |
//! | `rawrec_transfer_timeouts` | Counter | Transfers that never completed |
//! | `rawrec_chunk_rotations` | Counter | Output files started after the first |
//! | `rawrec_free_slots` | Gauge | Free frame slots |
//! | `rawrec_write_speed_bytes_per_sec` | Gauge | Measured write speed |
//!
//! ## Tracing
//!
//! rawrec emits spans for:
//! - The recording session (`recording`)
//! - The copy/compress worker thread (`copy-worker`)
//! - The disk writer thread (`disk-writer`)
//!
//! No subscriber is installed by the library.

mod metrics;
mod tracing_support;

pub use metrics::{RecordingMetrics, init_metrics};
pub use tracing_support::{
    span_copy_worker, span_disk_writer, span_recording, trace_chunk_rotation,
    trace_integrity_fault, trace_state_change,
};
