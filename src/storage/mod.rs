//! Storage device abstraction.
//!
//! The disk writer only sees this interface. A write that returns fewer
//! bytes than requested is the only "card full" or "file too large" signal
//! a device gives; the writer decides which one it was.
//!
//! - [`FsStorage`]: Regular filesystem, with an optional simulated file
//!   size limit
//! - [`MemoryStorage`]: In-memory device with size limits, capacity and
//!   bandwidth, for simulation and tests

mod fs;
mod memory;

pub use fs::FsStorage;
pub use memory::MemoryStorage;

use crate::error::Result;
use std::path::Path;

/// An open output file.
pub trait StorageFile: Send {
    /// Write `data` at the current position.
    ///
    /// Returns the number of bytes written; less than `data.len()` means the
    /// device refused the rest.
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Move to an absolute position.
    fn seek(&mut self, position: u64) -> Result<()>;

    /// Current position.
    fn position(&self) -> u64;

    /// Flush and close.
    fn close(self: Box<Self>) -> Result<()>;
}

/// A storage device.
pub trait Storage: Send + Sync {
    /// Create (or truncate) a file.
    fn create(&self, path: &Path) -> Result<Box<dyn StorageFile>>;

    /// Delete a file.
    fn remove(&self, path: &Path) -> Result<()>;
}
