//! Frame slot descriptor.

/// Lifecycle of a frame slot.
///
/// ```text
///          claim            enqueue/write         written
///  FREE ─────────▶ FULL ─────────────────▶ WRITING ───────▶ FREE
///   ▲                                                        │
///   └──────── RESERVED ◀── free (undersized) ◀───────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotStatus {
    /// Available for image capture.
    Free,
    /// Bookkeeping only; may become available when neighbours are resized.
    Reserved,
    /// Holds a captured frame (the transfer may still be in progress).
    Full,
    /// Being written to storage.
    Writing,
}

impl SlotStatus {
    /// Free or reserved slots can be merged and re-partitioned.
    #[inline]
    pub fn is_unused(self) -> bool {
        matches!(self, SlotStatus::Free | SlotStatus::Reserved)
    }
}

/// One slot of pre-allocated frame memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlot {
    /// Start of the owned memory region.
    pub address: usize,
    /// Bytes reserved for this slot (header + payload + padding).
    pub total_size: usize,
    /// Bytes used by image data.
    pub payload_size: usize,
    /// 1-based capture sequence number; 0 means no frame yet.
    pub frame_number: u32,
    /// Current status.
    pub status: SlotStatus,
    /// Arena this slot was carved from.
    pub arena: usize,
    /// Burst group inside the arena; slots only merge within one group.
    pub group: usize,
}

impl FrameSlot {
    /// One past the last byte of the slot.
    #[inline]
    pub fn end(&self) -> usize {
        self.address + self.total_size
    }

    /// Whether `next` starts exactly where this slot ends, in the same group.
    #[inline]
    pub fn is_followed_by(&self, next: &FrameSlot) -> bool {
        self.group == next.group && self.end() == next.address
    }
}
