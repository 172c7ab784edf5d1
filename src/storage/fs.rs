//! Filesystem storage.

use super::{Storage, StorageFile};
use crate::error::Result;
use std::fs::File;
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Storage on a regular filesystem.
///
/// # Example
///
/// ```rust,ignore
/// use rawrec::storage::{FsStorage, Storage};
///
/// // behave like a FAT32 card
/// let storage = FsStorage::new().with_file_size_limit(4 * 1024 * 1024 * 1024 - 1);
/// let mut file = storage.create("M00-0000.RVF".as_ref())?;
/// file.write(b"...")?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct FsStorage {
    file_size_limit: Option<u64>,
}

impl FsStorage {
    /// Storage without limits beyond the filesystem's own.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to grow any file past `limit` bytes (writes come up short).
    pub fn with_file_size_limit(mut self, limit: u64) -> Self {
        self.file_size_limit = Some(limit);
        self
    }
}

impl Storage for FsStorage {
    fn create(&self, path: &Path) -> Result<Box<dyn StorageFile>> {
        let file = File::create(path)?;
        tracing::debug!(path = %path.display(), "created output file");
        Ok(Box::new(FsFile {
            path: path.to_path_buf(),
            file,
            position: 0,
            limit: self.file_size_limit,
        }))
    }

    fn remove(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path)?;
        Ok(())
    }
}

struct FsFile {
    path: PathBuf,
    file: File,
    position: u64,
    limit: Option<u64>,
}

impl StorageFile for FsFile {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let allowed = match self.limit {
            Some(limit) => (limit.saturating_sub(self.position)).min(data.len() as u64) as usize,
            None => data.len(),
        };

        let mut written = 0;
        while written < allowed {
            match self.file.write(&data[written..allowed]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if written > 0 || e.kind() == ErrorKind::StorageFull => {
                    tracing::warn!(path = %self.path.display(), error = %e, "short write");
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.position += written as u64;
        Ok(written)
    }

    fn seek(&mut self, position: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(position))?;
        self.position = position;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}
