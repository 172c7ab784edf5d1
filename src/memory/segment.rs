//! Memory segment trait and types.

/// Type of memory backing a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryType {
    /// Regular heap allocation.
    Heap,
    /// Anonymous memfd region mapped into this process.
    Memfd,
}

/// Trait for arena backends.
///
/// A memory segment represents one contiguous region handed to the recorder
/// by an external allocator. Slots are carved out of it; the recorder never
/// assumes segments are adjacent or equal-sized.
///
/// # Safety
///
/// Implementations must ensure that:
/// - The pointer stays valid and writable for the lifetime of the segment
/// - The region is not accessed by anyone else while the recorder owns it
pub trait MemorySegment: Send + Sync {
    /// Get a raw pointer to the start of this segment.
    fn as_ptr(&self) -> *mut u8;

    /// Total size of the segment in bytes.
    fn len(&self) -> usize;

    /// Returns true if the segment has zero length.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The type of memory backing this segment.
    fn memory_type(&self) -> MemoryType;

    /// Start address, used for slot bookkeeping.
    fn address(&self) -> usize {
        self.as_ptr() as usize
    }
}
