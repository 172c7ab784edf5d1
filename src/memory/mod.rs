//! Frame memory for rawrec.
//!
//! This module owns everything between the external arena allocator and the
//! three execution contexts of a recording session.
//!
//! # Architecture
//!
//! - [`MemorySegment`]: Trait for arena backends (heap, memfd)
//! - [`ArenaProvider`]: External allocator handing out the session's arenas
//! - [`ArenaSet`]: Bounds-checked raw access to the session's arenas
//! - [`SlotPool`]: Frame slots tiled over the arenas, with shrink/free repair
//! - [`predict_frames`]: Buffer-fill estimate for a given write speed
//!
//! # Example
//!
//! ```rust
//! use rawrec::memory::{ArenaProvider, ArenaSet, HeapArenaProvider, SlotLayout, SlotPool};
//!
//! let mut provider = HeapArenaProvider::new(vec![4 * 1024 * 1024]);
//! let arenas = ArenaSet::new(provider.allocate()?);
//! let mut pool = SlotPool::initialize(&arenas.regions(), SlotLayout::default(), 256 * 1024)?;
//!
//! let slot = pool.choose_next_slot(None).expect("pool not exhausted");
//! pool.claim(slot, 1)?;
//! # Ok::<(), rawrec::Error>(())
//! ```

mod arena;
mod estimate;
mod heap;
mod layout;
mod memfd;
mod pool;
mod segment;
mod slot;

pub use arena::{ArenaProvider, ArenaRegion, ArenaSet, HeapArenaProvider, MemfdArenaProvider};
pub use estimate::{
    CONTINUOUS_THRESHOLD, FrameGuess, FramePrediction, SPEED_SPREAD, guess_frames, predict_frames,
};
pub use heap::HeapSegment;
pub use layout::{
    ARENA_ALIGNMENT, BURST_CEILING, FRAME_HEADER_SIZE, SENTINEL_SIZE, SlotLayout, WRITE_ALIGNMENT,
    align_up,
};
pub use memfd::MemfdSegment;
pub use pool::{MAX_ARENA_TABLE, MIN_SLOTS, SlotPool};
pub use segment::{MemorySegment, MemoryType};
pub use slot::{FrameSlot, SlotStatus};
