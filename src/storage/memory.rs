//! In-memory storage for simulation.

use super::{Storage, StorageFile};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct Device {
    files: BTreeMap<PathBuf, Vec<u8>>,
    used: u64,
    creates_left: Option<usize>,
    paused: bool,
}

#[derive(Debug)]
struct Inner {
    device: Mutex<Device>,
    resumed: Condvar,
    file_size_limit: Option<u64>,
    capacity: Option<u64>,
    bandwidth: Option<f64>,
}

/// A simulated storage device.
///
/// Clones share the same device, so a test can keep one handle to inspect
/// files while the recorder writes through another.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    inner: Arc<Inner>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Unlimited device.
    pub fn new() -> Self {
        Self::build(None, None, None)
    }

    fn build(file_size_limit: Option<u64>, capacity: Option<u64>, bandwidth: Option<f64>) -> Self {
        Self {
            inner: Arc::new(Inner {
                device: Mutex::new(Device::default()),
                resumed: Condvar::new(),
                file_size_limit,
                capacity,
                bandwidth,
            }),
        }
    }

    /// Limit every file to `limit` bytes.
    pub fn with_file_size_limit(self, limit: u64) -> Self {
        Self::build(Some(limit), self.inner.capacity, self.inner.bandwidth)
    }

    /// Limit the device to `bytes` in total.
    pub fn with_capacity(self, bytes: u64) -> Self {
        Self::build(self.inner.file_size_limit, Some(bytes), self.inner.bandwidth)
    }

    /// Throttle writes to `bytes_per_sec`.
    pub fn with_bandwidth(self, bytes_per_sec: f64) -> Self {
        Self::build(self.inner.file_size_limit, self.inner.capacity, Some(bytes_per_sec))
    }

    fn device(&self) -> std::sync::MutexGuard<'_, Device> {
        self.inner.device.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allow only `count` more files to be created.
    pub fn fail_creates_after(&self, count: usize) {
        self.device().creates_left = Some(count);
    }

    /// Block every write until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.device().paused = true;
    }

    /// Let blocked writes continue.
    pub fn resume(&self) {
        self.device().paused = false;
        self.inner.resumed.notify_all();
    }

    /// Contents of a file.
    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.device().files.get(path).cloned()
    }

    /// Every file, sorted by path.
    pub fn files(&self) -> Vec<PathBuf> {
        self.device().files.keys().cloned().collect()
    }

    /// Whether a file exists.
    pub fn exists(&self, path: &Path) -> bool {
        self.device().files.contains_key(path)
    }

    /// Total bytes stored.
    pub fn used(&self) -> u64 {
        self.device().used
    }
}

impl Storage for MemoryStorage {
    fn create(&self, path: &Path) -> Result<Box<dyn StorageFile>> {
        let mut device = self.device();
        if let Some(left) = device.creates_left.as_mut() {
            if *left == 0 {
                return Err(Error::StorageExhausted(format!(
                    "cannot create {}",
                    path.display()
                )));
            }
            *left -= 1;
        }
        if let Some(old) = device.files.insert(path.to_path_buf(), Vec::new()) {
            device.used -= old.len() as u64;
        }
        Ok(Box::new(MemoryFile {
            storage: self.clone(),
            path: path.to_path_buf(),
            position: 0,
        }))
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let mut device = self.device();
        let old = device.files.remove(path).ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                path.display().to_string(),
            ))
        })?;
        device.used -= old.len() as u64;
        Ok(())
    }
}

struct MemoryFile {
    storage: MemoryStorage,
    path: PathBuf,
    position: u64,
}

impl StorageFile for MemoryFile {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let inner = &self.storage.inner;
        let mut device = self.storage.device();
        while device.paused {
            device = inner
                .resumed
                .wait(device)
                .unwrap_or_else(PoisonError::into_inner);
        }

        let mut allowed = data.len() as u64;
        if let Some(limit) = inner.file_size_limit {
            allowed = allowed.min(limit.saturating_sub(self.position));
        }
        let file_len = device.files.get(&self.path).map_or(0, |f| f.len() as u64);
        if let Some(capacity) = inner.capacity {
            let growth_room = capacity.saturating_sub(device.used);
            let overlap = file_len.saturating_sub(self.position);
            allowed = allowed.min(overlap + growth_room);
        }
        let allowed = allowed as usize;

        let start = self.position as usize;
        let end = start + allowed;
        let Device { files, used, .. } = &mut *device;
        let file = files
            .get_mut(&self.path)
            .ok_or_else(|| Error::InvalidState(format!("{} was removed", self.path.display())))?;
        if file.len() < end {
            *used += (end - file.len()) as u64;
            file.resize(end, 0);
        }
        file[start..end].copy_from_slice(&data[..allowed]);
        self.position += allowed as u64;
        drop(device);

        if let Some(bps) = inner.bandwidth
            && bps > 0.0
        {
            std::thread::sleep(Duration::from_secs_f64(allowed as f64 / bps));
        }
        Ok(allowed)
    }

    fn seek(&mut self, position: u64) -> Result<()> {
        self.position = position;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
