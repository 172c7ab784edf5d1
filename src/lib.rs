//! # rawrec
//!
//! A raw video recorder core: a frame slot allocator on top of coarse
//! memory arenas, feeding a capture → copy/compress → disk writer pipeline
//! that keeps up with a sensor running at a fixed frame rate.
//!
//! ## Features
//!
//! - **Slot pool**: address-ordered slots carved from arenas, grown back
//!   together after compressed frames shrink them
//! - **Contiguous bursts**: physically adjacent frames are written with one
//!   call, bounded by the burst ceiling
//! - **Completion sentinels**: every frame carries end markers the writer
//!   checks before and after writing
//! - **Pre-roll**: frames buffered before a trigger, oldest discarded
//! - **Chunked output**: files split at the storage's size limit, proactively
//!   or on a short write
//! - **Linux memfd arenas**: optional memfd + mmap backed arenas
//!
//! ## Quick Start
//!
//! ```rust
//! use rawrec::prelude::*;
//!
//! let geometry = FrameGeometry::full_sensor(64, 16, 8);
//! let config = RecorderConfig::new("/card/M00-0001.RVF", geometry, 24.0);
//! let storage = MemoryStorage::new();
//! let mut recorder = Recorder::new(config, HeapArenaProvider::new(vec![64 * 1024]), storage);
//!
//! recorder.start()?;
//! // call recorder.on_frame(..) on every sensor tick
//! let report = recorder.stop()?;
//! assert_eq!(report.frames_written, 0);
//! # Ok::<(), rawrec::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod error;
pub mod format;
pub mod memory;
pub mod observability;
pub mod pipeline;
pub mod session;
pub mod storage;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{
        CompressionMode, FrameGeometry, PreRollConfig, RecorderConfig, ThrottleConfig,
    };
    pub use crate::error::{Error, IntegrityFault, Result};
    pub use crate::memory::{ArenaProvider, HeapArenaProvider, MemfdArenaProvider, SlotLayout};
    pub use crate::pipeline::{CaptureOutcome, Compressor, RawFrame, StopReason, TransferEngine};
    pub use crate::session::{Recorder, RecordingState, SessionReport};
    pub use crate::storage::{FsStorage, MemoryStorage, Storage};
}

pub use error::{Error, Result};
