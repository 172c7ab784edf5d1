//! Arena providers and the per-session arena set.
//!
//! The recorder asks an [`ArenaProvider`] for a list of coarse memory regions
//! once per session, carves frame slots out of them, and hands every region
//! back verbatim at teardown. All raw memory access by the capture trigger,
//! the copy worker and the disk writer goes through [`ArenaSet`], which
//! bounds-checks every access against the owned regions.
//!
//! # Memory Layout
//!
//! ```text
//! arena 0                                   arena 1
//! ┌───┬────────┬────────┬─────┬───┐         ┌───┬────────┬─────┐
//! │pad│ slot 0 │ slot 1 │ ... │ r │   ...   │pad│ slot k │ ... │
//! └───┴────────┴────────┴─────┴───┘         └───┴────────┴─────┘
//! ```
//!
//! Arenas are neither adjacent nor equal-sized; the pool never assumes so.

use super::{HeapSegment, MemfdSegment, MemorySegment};
use crate::error::{Error, Result};

/// Address range of one arena, as recorded by the slot pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaRegion {
    /// Start address.
    pub address: usize,
    /// Size in bytes.
    pub size: usize,
}

impl ArenaRegion {
    /// Create a region descriptor.
    pub fn new(address: usize, size: usize) -> Self {
        Self { address, size }
    }

    /// One past the last byte.
    #[inline]
    pub fn end(&self) -> usize {
        self.address + self.size
    }
}

/// External allocator supplying the capture arenas.
pub trait ArenaProvider: Send {
    /// Hand out every arena available for this session.
    fn allocate(&mut self) -> Result<Vec<Box<dyn MemorySegment>>>;

    /// Take the arenas back at session teardown.
    fn release(&mut self, segments: Vec<Box<dyn MemorySegment>>) {
        drop(segments);
    }
}

/// Provider that allocates one heap segment per configured size.
#[derive(Debug, Clone, Default)]
pub struct HeapArenaProvider {
    sizes: Vec<usize>,
}

impl HeapArenaProvider {
    /// Create a provider that hands out arenas of the given sizes.
    pub fn new(sizes: impl Into<Vec<usize>>) -> Self {
        Self {
            sizes: sizes.into(),
        }
    }
}

impl ArenaProvider for HeapArenaProvider {
    fn allocate(&mut self) -> Result<Vec<Box<dyn MemorySegment>>> {
        self.sizes
            .iter()
            .map(|&size| Ok(Box::new(HeapSegment::new(size)?) as Box<dyn MemorySegment>))
            .collect()
    }
}

/// Provider backed by memfd mappings, one per configured size.
#[derive(Debug, Clone)]
pub struct MemfdArenaProvider {
    name: String,
    sizes: Vec<usize>,
    prefault: bool,
}

impl MemfdArenaProvider {
    /// Create a provider that maps arenas of the given sizes.
    pub fn new(sizes: impl Into<Vec<usize>>) -> Self {
        Self {
            name: "rawrec-arena".into(),
            sizes: sizes.into(),
            prefault: false,
        }
    }

    /// Set the memfd debug name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Pre-fault every page at allocation time.
    pub fn with_prefault(mut self, prefault: bool) -> Self {
        self.prefault = prefault;
        self
    }
}

impl ArenaProvider for MemfdArenaProvider {
    fn allocate(&mut self) -> Result<Vec<Box<dyn MemorySegment>>> {
        let mut segments: Vec<Box<dyn MemorySegment>> = Vec::with_capacity(self.sizes.len());
        for (i, &size) in self.sizes.iter().enumerate() {
            let segment = MemfdSegment::new(&format!("{}-{}", self.name, i), size)?;
            if self.prefault {
                segment.prefault();
            }
            segments.push(Box::new(segment));
        }
        Ok(segments)
    }
}

/// The arenas owned by one recording session.
///
/// Access is raw and unsynchronized: exclusivity of each byte range is
/// guaranteed by the slot status protocol (a slot is written by exactly one
/// context at a time), not by this type.
pub struct ArenaSet {
    segments: Vec<Box<dyn MemorySegment>>,
}

impl ArenaSet {
    /// Take ownership of the provider's segments.
    pub fn new(segments: Vec<Box<dyn MemorySegment>>) -> Self {
        Self { segments }
    }

    /// Region descriptors, in provider order.
    pub fn regions(&self) -> Vec<ArenaRegion> {
        self.segments
            .iter()
            .map(|s| ArenaRegion::new(s.address(), s.len()))
            .collect()
    }

    /// Total bytes across all arenas.
    pub fn total_size(&self) -> usize {
        self.segments.iter().map(|s| s.len()).sum()
    }

    /// Number of arenas.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Returns true if there are no arenas.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Give the segments back, for release to the provider.
    pub fn into_segments(self) -> Vec<Box<dyn MemorySegment>> {
        self.segments
    }

    fn locate(&self, address: usize, len: usize) -> Result<*mut u8> {
        let end = address
            .checked_add(len)
            .ok_or_else(|| Error::InvalidState("address range overflow".into()))?;
        self.segments
            .iter()
            .find(|s| address >= s.address() && end <= s.address() + s.len())
            .map(|s| {
                // SAFETY: address lies inside this segment.
                unsafe { s.as_ptr().add(address - s.address()) }
            })
            .ok_or_else(|| {
                Error::InvalidState(format!(
                    "range {address:#x}+{len} is outside every arena"
                ))
            })
    }

    /// Copy `data` into arena memory at `address`.
    pub fn write_at(&self, address: usize, data: &[u8]) -> Result<()> {
        let dst = self.locate(address, data.len())?;
        // SAFETY: bounds checked by locate; the caller owns this range.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }

    /// Copy `out.len()` bytes from arena memory at `address`.
    pub fn read_at(&self, address: usize, out: &mut [u8]) -> Result<()> {
        let src = self.locate(address, out.len())?;
        // SAFETY: bounds checked by locate.
        unsafe { std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len()) };
        Ok(())
    }

    /// Fill a range with one byte value.
    pub fn fill(&self, address: usize, len: usize, value: u8) -> Result<()> {
        let dst = self.locate(address, len)?;
        // SAFETY: bounds checked by locate.
        unsafe { std::ptr::write_bytes(dst, value, len) };
        Ok(())
    }

    /// Volatile little-endian word read (sentinel checks).
    pub fn read_u32(&self, address: usize) -> Result<u32> {
        let src = self.locate(address, 4)?;
        let mut bytes = [0u8; 4];
        for (i, b) in bytes.iter_mut().enumerate() {
            // SAFETY: four bytes in bounds.
            *b = unsafe { std::ptr::read_volatile(src.add(i)) };
        }
        Ok(u32::from_le_bytes(bytes))
    }

    /// Volatile little-endian word write (sentinel marks).
    pub fn write_u32(&self, address: usize, value: u32) -> Result<()> {
        let dst = self.locate(address, 4)?;
        for (i, b) in value.to_le_bytes().into_iter().enumerate() {
            // SAFETY: four bytes in bounds.
            unsafe { std::ptr::write_volatile(dst.add(i), b) };
        }
        Ok(())
    }

    /// Borrow a range of arena memory.
    ///
    /// # Safety
    ///
    /// No other context may write to the range while the slice is alive.
    pub unsafe fn slice(&self, address: usize, len: usize) -> Result<&[u8]> {
        let src = self.locate(address, len)?;
        // SAFETY: bounds checked; caller guarantees no concurrent writers.
        Ok(unsafe { std::slice::from_raw_parts(src, len) })
    }

    /// Mutably borrow a range of arena memory.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the range while the slice
    /// is alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, address: usize, len: usize) -> Result<&mut [u8]> {
        let dst = self.locate(address, len)?;
        // SAFETY: bounds checked; caller guarantees exclusivity.
        Ok(unsafe { std::slice::from_raw_parts_mut(dst, len) })
    }
}

impl std::fmt::Debug for ArenaSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaSet")
            .field("regions", &self.regions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_provider_allocates_requested_sizes() {
        let mut provider = HeapArenaProvider::new(vec![4096, 8192]);
        let set = ArenaSet::new(provider.allocate().unwrap());
        assert_eq!(set.len(), 2);
        assert_eq!(set.total_size(), 4096 + 8192);
        let regions = set.regions();
        assert_eq!(regions[0].size, 4096);
        assert_eq!(regions[1].size, 8192);
        provider.release(set.into_segments());
    }

    #[test]
    fn test_arena_set_bounds() {
        let mut provider = HeapArenaProvider::new(vec![1024]);
        let set = ArenaSet::new(provider.allocate().unwrap());
        let base = set.regions()[0].address;

        set.write_at(base + 10, b"abc").unwrap();
        let mut out = [0u8; 3];
        set.read_at(base + 10, &mut out).unwrap();
        assert_eq!(&out, b"abc");

        assert!(set.write_at(base + 1022, b"abc").is_err());
        assert!(set.read_u32(base + 1024).is_err());
        assert!(set.write_at(base.wrapping_sub(1), b"a").is_err());
    }

    #[test]
    fn test_word_access() {
        let mut provider = HeapArenaProvider::new(vec![64]);
        let set = ArenaSet::new(provider.allocate().unwrap());
        let base = set.regions()[0].address;
        set.write_u32(base + 8, 0xA5A5_A5A5).unwrap();
        assert_eq!(set.read_u32(base + 8).unwrap(), 0xA5A5_A5A5);
        set.fill(base + 8, 4, 0).unwrap();
        assert_eq!(set.read_u32(base + 8).unwrap(), 0);
    }
}
