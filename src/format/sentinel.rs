//! Frame completion sentinels.
//!
//! Two marker words bracket the end of each payload:
//!
//! ```text
//! payload ............................│ end-4 │ after │
//!                                     │ SENT  │ SENT  │
//! ```
//!
//! A finished transfer overwrites the first word with image data and must
//! never touch the second. So: `after` changed means the transfer overran,
//! `end-4` still holding the marker means it has not finished.

use crate::error::{IntegrityFault, Result};
use crate::memory::{ArenaSet, FrameSlot, align_up};

/// Marker value.
pub const FRAME_SENTINEL: u32 = 0xA5A5_A5A5;

/// Outcome of a sentinel check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCheck {
    /// Payload fully written.
    Complete,
    /// Transfer still running.
    Incomplete,
    /// Transfer wrote past the payload.
    Overflow,
}

impl FrameCheck {
    /// Translate a failed check into an integrity fault for `slot`.
    pub fn fault(self, slot: usize, frame: u32) -> Option<IntegrityFault> {
        match self {
            FrameCheck::Complete => None,
            FrameCheck::Incomplete => Some(IntegrityFault::Incomplete { slot, frame }),
            FrameCheck::Overflow => Some(IntegrityFault::Overflow { slot, frame }),
        }
    }
}

fn positions(slot: &FrameSlot, header_size: usize) -> (Option<usize>, usize) {
    let payload_start = slot.address + header_size;
    let span = align_up(slot.payload_size, 4);
    let frame_end = span.checked_sub(4).map(|off| payload_start + off);
    (frame_end, payload_start + span)
}

/// Write both markers before a transfer starts.
pub fn add_checks(arenas: &ArenaSet, slot: &FrameSlot, header_size: usize) -> Result<()> {
    let (frame_end, after) = positions(slot, header_size);
    if let Some(end) = frame_end {
        arenas.write_u32(end, FRAME_SENTINEL)?;
    }
    arenas.write_u32(after, FRAME_SENTINEL)
}

/// Mark a payload written by software as complete.
pub fn mark_complete(arenas: &ArenaSet, slot: &FrameSlot, header_size: usize) -> Result<()> {
    let (_, after) = positions(slot, header_size);
    arenas.write_u32(after, FRAME_SENTINEL)
}

/// Check the markers of a slot.
pub fn check(arenas: &ArenaSet, slot: &FrameSlot, header_size: usize) -> Result<FrameCheck> {
    let (frame_end, after) = positions(slot, header_size);
    if arenas.read_u32(after)? != FRAME_SENTINEL {
        return Ok(FrameCheck::Overflow);
    }
    if let Some(end) = frame_end
        && arenas.read_u32(end)? == FRAME_SENTINEL
    {
        return Ok(FrameCheck::Incomplete);
    }
    Ok(FrameCheck::Complete)
}
