//! Slot pool: frame slots carved from coarse arenas.
//!
//! Each arena is tiled by an address-ordered run of slots. Uncompressed
//! frames all use the standard slot size; compressed frames shrink their
//! slot and hand the remainder to the following slot, which grows back into
//! a standard FREE slot once it has collected enough bytes. Freeing an
//! undersized slot re-partitions the surrounding unused run. The tiling
//! invariant (no gaps, no overlaps, sizes summing to the usable arena size)
//! holds after every operation.
//!
//! Slots are additionally split into burst groups: a group never grows past
//! the layout's burst ceiling, and merging never crosses a group boundary,
//! so one contiguous write never exceeds the ceiling either.
//!
//! The pool is pure bookkeeping and never touches arena memory. It is
//! shared between the capture trigger, the copy worker and the disk writer
//! behind one mutex; every method here is one critical section.

use super::arena::ArenaRegion;
use super::layout::{SlotLayout, align_up};
use super::slot::{FrameSlot, SlotStatus};
use crate::error::{Error, Result};

/// Maximum number of arena sizes remembered for frame prediction.
pub const MAX_ARENA_TABLE: usize = 32;

/// Minimum number of free slots needed to record: one capturing, one
/// draining and one being written.
pub const MIN_SLOTS: usize = 3;

/// Usable extent of one arena after start alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ArenaExtent {
    start: usize,
    size: usize,
}

/// Pool of frame slots.
///
/// # Example
///
/// ```rust
/// use rawrec::memory::{ArenaRegion, SlotLayout, SlotPool};
///
/// let layout = SlotLayout::default();
/// let arenas = [ArenaRegion::new(0x1000_0000, 8 * 1024 * 1024)];
/// let mut pool = SlotPool::initialize(&arenas, layout, 1024 * 1024).unwrap();
///
/// let first = pool.choose_next_slot(None).unwrap();
/// pool.claim(first, 1).unwrap();
/// let second = pool.choose_next_slot(Some(first)).unwrap();
/// assert_eq!(second, first + 1);
/// ```
#[derive(Debug, Clone)]
pub struct SlotPool {
    slots: Vec<FrameSlot>,
    layout: SlotLayout,
    /// Uncompressed payload size.
    frame_size: usize,
    /// Standard total slot size for an uncompressed frame.
    slot_size: usize,
    /// Usable arena sizes, for throughput prediction.
    arena_table: Vec<usize>,
    extents: Vec<ArenaExtent>,
    force_new_buffer: bool,
}

impl SlotPool {
    /// Carve slots for `frame_size`-byte payloads out of `arenas`.
    ///
    /// Fails with [`Error::Allocation`] if fewer than [`MIN_SLOTS`] slots
    /// fit.
    pub fn initialize(
        arenas: &[ArenaRegion],
        layout: SlotLayout,
        frame_size: usize,
    ) -> Result<Self> {
        layout.validate()?;
        if frame_size == 0 {
            return Err(Error::Allocation("frame size must be > 0".into()));
        }

        let slot_size = layout.slot_size(frame_size);
        let mut pool = Self {
            slots: Vec::new(),
            layout,
            frame_size,
            slot_size,
            arena_table: Vec::with_capacity(MAX_ARENA_TABLE),
            extents: Vec::with_capacity(arenas.len()),
            force_new_buffer: false,
        };

        let mut group = 0;
        for (arena, region) in arenas.iter().enumerate() {
            if pool.arena_table.len() < MAX_ARENA_TABLE && region.size > layout.arena_alignment {
                pool.arena_table.push(region.size - layout.arena_alignment);
            }

            let start = align_up(region.address, layout.arena_alignment);
            let head = start - region.address;
            let mut size = region.size.saturating_sub(head);
            pool.extents.push(ArenaExtent { start, size });

            let mut ptr = start;
            let mut group_slots = 0;
            let mut group_bytes = 0;
            while size >= slot_size {
                pool.slots.push(FrameSlot {
                    address: ptr,
                    total_size: slot_size,
                    payload_size: frame_size,
                    frame_number: 0,
                    status: SlotStatus::Free,
                    arena,
                    group,
                });
                ptr += slot_size;
                size -= slot_size;
                group_slots += 1;
                group_bytes += slot_size;

                // sustained write speed drops above the ceiling: end the
                // group here and leave a small gap before the next one
                if group_bytes + slot_size > layout.burst_ceiling && size >= slot_size {
                    let gap = layout.arena_alignment.min(size);
                    pool.close_group(ptr, group_slots, gap, arena, group);
                    ptr += gap;
                    size -= gap;
                    group += 1;
                    group_slots = 0;
                    group_bytes = 0;
                }
            }

            pool.close_group(ptr, group_slots, size, arena, group);
            group += 1;
        }

        let usable = pool.free_count();
        if usable < MIN_SLOTS {
            return Err(Error::Allocation(format!(
                "only {usable} slots of {slot_size} bytes fit, need at least {MIN_SLOTS}"
            )));
        }

        tracing::debug!(
            slots = usable,
            slot_size,
            arenas = arenas.len(),
            groups = group,
            "slot pool initialized"
        );

        Ok(pool)
    }

    /// Append the reserved slots that end a group.
    ///
    /// One reserved slot per full slot, so compressed frames can free up to
    /// that many extra slots. The first one covers the trailing remainder.
    fn close_group(
        &mut self,
        ptr: usize,
        group_slots: usize,
        remainder: usize,
        arena: usize,
        group: usize,
    ) {
        let count = group_slots.max(usize::from(remainder > 0));
        let mut address = ptr;
        for i in 0..count {
            let size = if i == 0 { remainder } else { 0 };
            self.slots.push(FrameSlot {
                address,
                total_size: size,
                payload_size: 0,
                frame_number: 0,
                status: SlotStatus::Reserved,
                arena,
                group,
            });
            address += size;
        }
    }

    /// Whether slot `a + 1` directly follows slot `a` in memory.
    #[inline]
    fn linked(&self, a: usize) -> bool {
        match (self.slots.get(a), self.slots.get(a + 1)) {
            (Some(x), Some(y)) => x.is_followed_by(y),
            _ => false,
        }
    }

    /// Pick the slot for the next capture.
    ///
    /// Fast path: keep rolling into the slot right after `previous` when it
    /// is free and physically adjacent. Otherwise start the longest run of
    /// contiguous free slots (first one on ties). `None` means the buffer is
    /// exhausted.
    pub fn choose_next_slot(&mut self, previous: Option<usize>) -> Option<usize> {
        if let Some(prev) = previous
            && !self.force_new_buffer
            && self
                .slots
                .get(prev + 1)
                .is_some_and(|s| s.status == SlotStatus::Free)
            && self.linked(prev)
        {
            return Some(prev + 1);
        }

        self.force_new_buffer = false;

        let mut best: Option<(usize, usize)> = None;
        let mut run_start = 0;
        let mut run_len = 0;
        for i in 0..self.slots.len() {
            if self.slots[i].status != SlotStatus::Free {
                run_len = 0;
                continue;
            }
            if run_len > 0 && self.linked(i - 1) {
                run_len += 1;
            } else {
                run_start = i;
                run_len = 1;
            }
            if best.is_none_or(|(_, len)| run_len > len) {
                best = Some((run_start, run_len));
            }
        }

        best.map(|(start, _)| start)
    }

    /// Make the next [`choose_next_slot`](Self::choose_next_slot) skip the
    /// fast path and look for the largest free run.
    pub fn request_new_buffer(&mut self) {
        self.force_new_buffer = true;
    }

    /// Whether a new-buffer search is pending.
    pub fn new_buffer_requested(&self) -> bool {
        self.force_new_buffer
    }

    /// Mark a free slot as holding frame `frame_number`.
    pub fn claim(&mut self, index: usize, frame_number: u32) -> Result<FrameSlot> {
        let frame_size = self.frame_size;
        let slot = self.slot_mut(index)?;
        if slot.status != SlotStatus::Free {
            return Err(Error::InvalidState(format!(
                "slot {index} is {:?}, cannot capture into it",
                slot.status
            )));
        }
        slot.status = SlotStatus::Full;
        slot.frame_number = frame_number;
        slot.payload_size = frame_size;
        Ok(*slot)
    }

    /// Shrink a full slot to fit a `payload`-byte compressed frame.
    ///
    /// The freed tail is handed to the following slot when that slot is
    /// unused and adjacent; a neighbour that reaches the standard size
    /// becomes FREE and passes its excess further along. When nobody can
    /// take the remainder it stays with the shrunk slot as padding.
    pub fn shrink(&mut self, index: usize, payload: usize) -> Result<FrameSlot> {
        let new_size = self.layout.slot_size(payload);
        let layout = self.layout;
        let slot = self.slot_mut(index)?;
        if new_size > slot.total_size {
            return Err(Error::CompressionOverflow {
                produced: payload,
                capacity: layout.payload_capacity(slot.total_size),
            });
        }

        slot.payload_size = payload;
        if new_size == slot.total_size {
            return Ok(*slot);
        }

        let old_end = slot.end();
        let carry = slot.total_size - new_size;
        slot.total_size = new_size;
        self.pass_remainder(index, old_end, carry);
        Ok(self.slots[index])
    }

    fn pass_remainder(&mut self, index: usize, old_end: usize, mut carry: usize) {
        let mut prev = index;
        let mut expected = old_end;
        loop {
            let group = self.slots[prev].group;
            let next = prev + 1;
            let takes = self.slots.get(next).is_some_and(|n| {
                n.status.is_unused() && n.group == group && n.address == expected
            });
            if !takes {
                let slot_size = self.slot_size;
                let last = &mut self.slots[prev];
                last.total_size += carry;
                if prev != index {
                    // a FREE slot must keep the standard size
                    last.status = SlotStatus::Reserved;
                    last.payload_size = 0;
                    if last.total_size == slot_size {
                        last.status = SlotStatus::Free;
                        last.payload_size = self.frame_size;
                    }
                }
                return;
            }

            let slot_size = self.slot_size;
            let frame_size = self.frame_size;
            let n = &mut self.slots[next];
            let n_end = n.end();
            n.address -= carry;
            n.total_size += carry;
            if n.total_size < slot_size {
                return;
            }

            let excess = n.total_size - slot_size;
            n.total_size = slot_size;
            n.payload_size = frame_size;
            n.status = SlotStatus::Free;
            if excess == 0 {
                return;
            }
            carry = excess;
            expected = n_end;
            prev = next;
        }
    }

    /// Mark a full slot as being written.
    pub fn mark_writing(&mut self, index: usize) -> Result<()> {
        let slot = self.slot_mut(index)?;
        if slot.status != SlotStatus::Full {
            return Err(Error::InvalidState(format!(
                "slot {index} is {:?}, expected full",
                slot.status
            )));
        }
        slot.status = SlotStatus::Writing;
        Ok(())
    }

    /// Return a slot to the pool.
    ///
    /// Standard-size slots become FREE in O(1). Undersized or oversized
    /// slots trigger a re-partition of the whole unused run around them
    /// into standard FREE slots plus a RESERVED remainder.
    pub fn free(&mut self, index: usize) -> Result<()> {
        let slot_size = self.slot_size;
        let frame_size = self.frame_size;
        let slot = self.slot_mut(index)?;
        slot.status = SlotStatus::Reserved;
        slot.frame_number = 0;
        if slot.total_size == slot_size {
            slot.status = SlotStatus::Free;
            slot.payload_size = frame_size;
            return Ok(());
        }

        let mut start = index;
        while start > 0 && self.slots[start - 1].status.is_unused() && self.linked(start - 1) {
            start -= 1;
        }
        let mut end = index;
        while end + 1 < self.slots.len()
            && self.slots[end + 1].status.is_unused()
            && self.linked(end)
        {
            end += 1;
        }

        // the run may hold more bytes than its entries can cover with
        // standard slots; the last entry then keeps the excess as RESERVED
        let end_address = self.slots[end].end();
        let mut ptr = self.slots[start].address;
        for (i, slot) in (start..=end).zip(&mut self.slots[start..=end]) {
            let left = end_address - ptr;
            slot.address = ptr;
            if left == slot_size || (left > slot_size && i < end) {
                slot.status = SlotStatus::Free;
                slot.total_size = slot_size;
                slot.payload_size = frame_size;
            } else {
                slot.status = SlotStatus::Reserved;
                slot.total_size = left;
                slot.payload_size = 0;
            }
            ptr += slot.total_size;
        }

        Ok(())
    }

    /// Change the frame number of a full slot (pre-roll renumbering).
    pub fn renumber(&mut self, index: usize, frame_number: u32) -> Result<()> {
        let slot = self.slot_mut(index)?;
        if slot.status != SlotStatus::Full {
            return Err(Error::InvalidState(format!("slot {index} is not full")));
        }
        slot.frame_number = frame_number;
        Ok(())
    }

    /// Index of the full slot holding `frame_number`, if any.
    pub fn find_full(&self, frame_number: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.status == SlotStatus::Full && s.frame_number == frame_number)
    }

    /// Drop every slot. The arenas themselves are owned by the session's
    /// [`ArenaSet`](super::ArenaSet) and go back to the provider from there.
    pub fn teardown(&mut self) {
        self.slots.clear();
        self.extents.clear();
        self.force_new_buffer = false;
    }

    /// Verify the tiling invariant for every arena.
    pub fn check_tiling(&self) -> Result<()> {
        for (arena, extent) in self.extents.iter().enumerate() {
            let mut cursor = extent.start;
            let mut total = 0;
            for (i, slot) in self.slots.iter().enumerate().filter(|(_, s)| s.arena == arena) {
                if slot.address != cursor {
                    return Err(Error::InvalidState(format!(
                        "arena {arena}: slot {i} at {:#x}, expected {cursor:#x}",
                        slot.address
                    )));
                }
                if slot.status != SlotStatus::Reserved
                    && slot.total_size % self.layout.write_alignment != 0
                {
                    return Err(Error::InvalidState(format!(
                        "arena {arena}: slot {i} size {} not aligned",
                        slot.total_size
                    )));
                }
                cursor += slot.total_size;
                total += slot.total_size;
            }
            if total != extent.size || cursor != extent.start + extent.size {
                return Err(Error::InvalidState(format!(
                    "arena {arena}: slots cover {total} of {} bytes",
                    extent.size
                )));
            }
        }
        Ok(())
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut FrameSlot> {
        let len = self.slots.len();
        self.slots
            .get_mut(index)
            .ok_or_else(|| Error::InvalidState(format!("slot index {index} out of range ({len})")))
    }

    /// Get a slot.
    #[inline]
    pub fn slot(&self, index: usize) -> Option<&FrameSlot> {
        self.slots.get(index)
    }

    /// All slots, in address order within each arena.
    #[inline]
    pub fn slots(&self) -> &[FrameSlot] {
        &self.slots
    }

    /// Total number of slot entries (including reserved ones).
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true after teardown.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of FREE slots.
    pub fn free_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.status == SlotStatus::Free)
            .count()
    }

    /// Number of slots with the given status.
    pub fn count(&self, status: SlotStatus) -> usize {
        self.slots.iter().filter(|s| s.status == status).count()
    }

    /// Usable size of each arena (at most [`MAX_ARENA_TABLE`] entries).
    #[inline]
    pub fn arena_table(&self) -> &[usize] {
        &self.arena_table
    }

    /// Standard slot size.
    #[inline]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Uncompressed payload size.
    #[inline]
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Slot layout in use.
    #[inline]
    pub fn layout(&self) -> &SlotLayout {
        &self.layout
    }
}
