//! Heap-backed memory segment.

use super::{MemorySegment, MemoryType};
use crate::error::{Error, Result};
use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// A memory segment backed by a heap allocation.
///
/// This is the simplest arena backend, suitable for tests and for hosts
/// where the capture memory comes from the regular allocator.
///
/// # Example
///
/// ```rust
/// use rawrec::memory::{HeapSegment, MemorySegment};
///
/// let segment = HeapSegment::new(1024).unwrap();
/// assert_eq!(segment.len(), 1024);
/// ```
pub struct HeapSegment {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl HeapSegment {
    /// Default alignment for heap arenas.
    pub const DEFAULT_ALIGNMENT: usize = 64;

    /// Create a new zero-initialized heap segment.
    ///
    /// # Errors
    ///
    /// Returns an error if size is 0 or allocation fails.
    pub fn new(size: usize) -> Result<Self> {
        Self::with_alignment(size, Self::DEFAULT_ALIGNMENT)
    }

    /// Create a new heap segment with a specific alignment.
    ///
    /// # Arguments
    ///
    /// * `size` - Size in bytes.
    /// * `align` - Required alignment (must be a power of 2).
    pub fn with_alignment(size: usize, align: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::Allocation("size must be greater than 0".into()));
        }
        let layout = Layout::from_size_align(size, align)
            .map_err(|e| Error::Allocation(format!("bad layout: {e}")))?;

        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| Error::Allocation(format!("out of memory allocating {size} bytes")))?;

        Ok(Self { ptr, layout })
    }
}

impl MemorySegment for HeapSegment {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.layout.size()
    }

    fn memory_type(&self) -> MemoryType {
        MemoryType::Heap
    }
}

impl Drop for HeapSegment {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc_zeroed with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

// SAFETY: the allocation is exclusively owned by the segment; access from
// several threads is coordinated by the slot pool.
unsafe impl Send for HeapSegment {}
unsafe impl Sync for HeapSegment {}
