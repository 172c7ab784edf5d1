//! Capture, copy and write pipeline.
//!
//! Three parties share one [`SlotPool`](crate::memory::SlotPool):
//!
//! - [`CaptureTrigger`]: runs once per sensor frame, picks a slot, writes
//!   the frame header and the end-of-frame checks and hands the frame to
//!   the worker
//! - [`CopyWorker`]: copies the frame into its slot through a
//!   [`TransferEngine`], or compresses it with a [`Compressor`]
//! - [`DiskWriter`]: waits for completed frames, writes contiguous bursts
//!   through [`ChunkedOutput`] and frees the slots
//!
//! ```text
//!   on_frame ──► CaptureTrigger ──(kanal)──► CopyWorker
//!                     │                          │
//!                     └──► PendingWriteQueue ◄───┘ (compressed)
//!                                 │
//!                                 ▼
//!                            DiskWriter ──► ChunkedOutput ──► Storage
//! ```

mod capture;
mod chunk;
mod queue;
mod shared;
mod throttle;
pub mod transfer;
mod worker;
mod writer;

pub use capture::{CaptureOutcome, CaptureTrigger, WorkerMessage};
pub use chunk::{ChunkInfo, ChunkedOutput};
pub use queue::{PendingWriteQueue, QueueStats};
pub use shared::{Diagnostics, DiagnosticsReport, Shared, StopReason};
pub use throttle::{Throttle, WriteStats};
pub use transfer::{
    Compressor, CpuTransferEngine, RawFrame, RleCompressor, TransferEngine, TransferTarget,
};
pub use worker::{CopyWorker, FrameProcessor};
pub use writer::{DiskWriter, WriterOutcome};
