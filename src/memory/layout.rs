//! Slot geometry: header region, write alignment and burst limits.

use crate::error::{Error, Result};

/// Bytes reserved at the start of each slot for the frame block header.
pub const FRAME_HEADER_SIZE: usize = 64;

/// Storage write granularity; every slot size is a multiple of this.
pub const WRITE_ALIGNMENT: usize = 512;

/// Alignment applied to each arena start (fastest transfer boundary).
pub const ARENA_ALIGNMENT: usize = 64;

/// Largest burst the storage device handles at full speed
/// (0xFFFE sectors of 512 bytes).
pub const BURST_CEILING: usize = 0xFFFE * 512;

/// Size of one sentinel word.
pub const SENTINEL_SIZE: usize = 4;

/// Round `value` up to a multiple of `align` (power of two or not).
#[inline]
pub fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// How frames are laid out inside slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLayout {
    /// Header bytes preceding the payload.
    pub header_size: usize,
    /// Storage write alignment.
    pub write_alignment: usize,
    /// Arena start alignment, also the size of the gap that splits groups.
    pub arena_alignment: usize,
    /// Maximum bytes in one contiguous group of slots.
    pub burst_ceiling: usize,
}

impl Default for SlotLayout {
    fn default() -> Self {
        Self {
            header_size: FRAME_HEADER_SIZE,
            write_alignment: WRITE_ALIGNMENT,
            arena_alignment: ARENA_ALIGNMENT,
            burst_ceiling: BURST_CEILING,
        }
    }
}

impl SlotLayout {
    /// Set the burst ceiling.
    pub fn with_burst_ceiling(mut self, ceiling: usize) -> Self {
        self.burst_ceiling = ceiling;
        self
    }

    /// Total slot size for a payload: header, payload, trailing sentinel,
    /// rounded up to the write alignment.
    #[inline]
    pub fn slot_size(&self, payload: usize) -> usize {
        align_up(
            self.header_size + payload + SENTINEL_SIZE,
            self.write_alignment,
        )
    }

    /// Largest payload a slot of `total_size` bytes can hold.
    #[inline]
    pub fn payload_capacity(&self, total_size: usize) -> usize {
        total_size.saturating_sub(self.header_size + SENTINEL_SIZE)
    }

    /// Check the layout is usable.
    pub fn validate(&self) -> Result<()> {
        if self.write_alignment == 0 || self.arena_alignment == 0 {
            return Err(Error::InvalidConfig("alignments must be > 0".into()));
        }
        if !self.arena_alignment.is_power_of_two() {
            return Err(Error::InvalidConfig(
                "arena alignment must be a power of two".into(),
            ));
        }
        if self.header_size % 4 != 0 {
            return Err(Error::InvalidConfig(
                "header size must be a multiple of 4".into(),
            ));
        }
        if self.burst_ceiling < self.write_alignment {
            return Err(Error::InvalidConfig(
                "burst ceiling smaller than one write unit".into(),
            ));
        }
        Ok(())
    }
}
