//! memfd-backed memory segment.
//!
//! One anonymous memfd per arena, mapped once for the whole session. This is
//! the closest userspace analogue to the large shooting-memory chunks a
//! capture device hands out: a single big region whose address is stable
//! until it is released.

use super::{MemorySegment, MemoryType};
use crate::error::{Error, Result};
use rustix::fd::OwnedFd;
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::CString;
use std::ptr::NonNull;

/// A memfd region mapped read-write into this process.
pub struct MemfdSegment {
    /// Keeps the memfd alive for as long as the mapping exists.
    _fd: OwnedFd,
    base: NonNull<u8>,
    size: usize,
}

impl MemfdSegment {
    /// Create and map a memfd of `size` bytes.
    pub fn new(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::Allocation("size must be greater than 0".into()));
        }

        let cname = CString::new(name).map_err(|e| Error::Allocation(e.to_string()))?;
        let fd = rustix::fs::memfd_create(&cname, rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, size as u64)?;

        // SAFETY: fresh shared mapping of a file we just sized; nothing else
        // aliases it.
        let base = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };

        let base = NonNull::new(base.cast::<u8>())
            .ok_or_else(|| Error::Allocation("mmap returned null".into()))?;

        Ok(Self {
            _fd: fd,
            base,
            size,
        })
    }

    /// Touch every page so the first frames don't pay for page faults.
    pub fn prefault(&self) {
        let page_size = 4096;
        let ptr = self.base.as_ptr();
        for offset in (0..self.size).step_by(page_size) {
            // SAFETY: offset < size, inside the mapping.
            unsafe {
                std::ptr::read_volatile(ptr.add(offset));
            }
        }
    }
}

impl MemorySegment for MemfdSegment {
    fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    fn len(&self) -> usize {
        self.size
    }

    fn memory_type(&self) -> MemoryType {
        MemoryType::Memfd
    }
}

impl Drop for MemfdSegment {
    fn drop(&mut self) {
        // SAFETY: base/size describe the mapping created in `new`.
        unsafe {
            let _ = rustix::mm::munmap(self.base.as_ptr().cast(), self.size);
        }
    }
}

// SAFETY: the mapping is owned by this segment; the fd is kernel
// reference-counted and there is no thread-local state.
unsafe impl Send for MemfdSegment {}
unsafe impl Sync for MemfdSegment {}
