//! Moving a sensor frame into slot memory.
//!
//! Two collaborators do the actual work: a [`TransferEngine`] that copies
//! the cropped window asynchronously (the hardware path), and a
//! [`Compressor`] that encodes it synchronously into the slot payload.

use crate::config::FrameGeometry;
use crate::error::{Error, Result};
use crate::memory::ArenaSet;
use bytes::Bytes;
use kanal::{Receiver, Sender};
use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// One full sensor buffer as delivered by the capture hardware.
#[derive(Debug, Clone)]
pub struct RawFrame {
    data: Bytes,
    geometry: FrameGeometry,
}

impl RawFrame {
    /// Wrap a sensor buffer; it must cover the whole sensor.
    pub fn new(data: impl Into<Bytes>, geometry: FrameGeometry) -> Result<Self> {
        let data = data.into();
        if data.len() < geometry.sensor_buffer_size() {
            return Err(Error::InvalidState(format!(
                "sensor buffer has {} bytes, geometry needs {}",
                data.len(),
                geometry.sensor_buffer_size()
            )));
        }
        Ok(Self { data, geometry })
    }

    /// The raw buffer.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Geometry of the buffer and its crop window.
    pub fn geometry(&self) -> &FrameGeometry {
        &self.geometry
    }

    /// Rows of the cropped output window, top to bottom.
    pub fn rows(&self) -> impl Iterator<Item = &[u8]> + '_ {
        window_rows(&self.data, &self.geometry)
    }
}

/// Rows of the crop window of `data`; the caller checked the length.
fn window_rows<'a>(
    data: &'a [u8],
    geometry: &FrameGeometry,
) -> impl Iterator<Item = &'a [u8]> + 'a {
    let pitch = geometry.pitch();
    let row_bytes = geometry.row_bytes();
    let origin = geometry.crop_offset();
    (0..geometry.height as usize).map(move |r| {
        let start = origin + r * pitch;
        &data[start..start + row_bytes]
    })
}

/// Where a transfer lands: the payload region of one slot.
#[derive(Debug, Clone)]
pub struct TransferTarget {
    /// Session arenas.
    pub arenas: Arc<ArenaSet>,
    /// First payload byte.
    pub address: usize,
}

/// Called once when a transfer finished.
pub type CompleteCallback = Box<dyn FnOnce() + Send>;

/// Called once when a transfer failed.
pub type ErrorCallback = Box<dyn FnOnce(Error) + Send>;

/// Asynchronous crop-and-copy engine.
///
/// At most one transfer is in flight. Exactly one of the two callbacks runs
/// per accepted transfer, from whatever context the engine completes in;
/// a transfer may also never complete, which the caller detects by timeout.
pub trait TransferEngine: Send {
    /// Start copying the crop window of `src` to `dst`.
    fn start_async_copy(
        &mut self,
        src: RawFrame,
        dst: TransferTarget,
        on_error: ErrorCallback,
        on_complete: CompleteCallback,
    ) -> Result<()>;
}

/// Software compressor writing straight into slot memory.
pub trait Compressor: Send {
    /// Encode the crop window of `src` into `dst`; returns the bytes used.
    ///
    /// Fails with [`Error::CompressionOverflow`] when `dst` is too small.
    fn compress(&mut self, src: &[u8], geometry: &FrameGeometry, dst: &mut [u8]) -> Result<usize>;
}

struct CopyJob {
    src: RawFrame,
    dst: TransferTarget,
    on_error: ErrorCallback,
    on_complete: CompleteCallback,
}

/// Transfer engine that copies rows on a dedicated thread.
///
/// The last payload word is stored after a release fence, so a reader that
/// sees it changed also sees every earlier row.
pub struct CpuTransferEngine {
    jobs: Option<Sender<CopyJob>>,
    thread: Option<JoinHandle<()>>,
}

impl CpuTransferEngine {
    /// Start the copy thread.
    pub fn new() -> Result<Self> {
        Self::with_delay(Duration::ZERO)
    }

    /// Start the copy thread, sleeping `delay` before each copy (slow
    /// hardware simulation).
    pub fn with_delay(delay: Duration) -> Result<Self> {
        let (tx, rx) = kanal::bounded::<CopyJob>(1);
        let thread = thread::Builder::new()
            .name("rawrec-transfer".to_string())
            .spawn(move || Self::run(rx, delay))?;
        Ok(Self {
            jobs: Some(tx),
            thread: Some(thread),
        })
    }

    fn run(rx: Receiver<CopyJob>, delay: Duration) {
        while let Ok(job) = rx.recv() {
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            let CopyJob {
                src,
                dst,
                on_error,
                on_complete,
            } = job;
            let result = copy_window(&src, &dst);
            // the arenas must not outlive the completion signal
            drop(dst);
            match result {
                Ok(()) => on_complete(),
                Err(e) => on_error(e),
            }
        }
        tracing::trace!("transfer thread exiting");
    }
}

impl TransferEngine for CpuTransferEngine {
    fn start_async_copy(
        &mut self,
        src: RawFrame,
        dst: TransferTarget,
        on_error: ErrorCallback,
        on_complete: CompleteCallback,
    ) -> Result<()> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| Error::InvalidState("transfer engine stopped".into()))?;
        jobs.send(CopyJob {
            src,
            dst,
            on_error,
            on_complete,
        })
        .map_err(|_| Error::InvalidState("transfer thread is gone".into()))
    }
}

impl Drop for CpuTransferEngine {
    fn drop(&mut self) {
        // closing the channel ends the thread
        self.jobs.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for CpuTransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuTransferEngine")
            .field("running", &self.thread.is_some())
            .finish()
    }
}

fn copy_window(src: &RawFrame, dst: &TransferTarget) -> Result<()> {
    let row_bytes = src.geometry().row_bytes();
    let rows = src.geometry().height as usize;
    let mut address = dst.address;
    for (r, row) in src.rows().enumerate() {
        if r + 1 == rows && row_bytes >= 4 {
            let (body, last) = row.split_at(row_bytes - 4);
            dst.arenas.write_at(address, body)?;
            fence(Ordering::Release);
            dst.arenas.write_at(address + body.len(), last)?;
        } else {
            dst.arenas.write_at(address, row)?;
        }
        address += row_bytes;
    }
    Ok(())
}

/// Lossless PackBits run-length coder over the crop window.
///
/// Each control byte `n` is followed by `n + 1` literal bytes when
/// `n < 128`, or by one byte repeated `257 - n` times when `n > 128`.
#[derive(Debug, Default)]
pub struct RleCompressor {
    window: Vec<u8>,
}

impl RleCompressor {
    /// Create a compressor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a PackBits stream.
    pub fn decompress(src: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(src.len() * 2);
        let mut i = 0;
        while i < src.len() {
            let n = src[i] as usize;
            i += 1;
            if n < 128 {
                let end = i + n + 1;
                let literal = src
                    .get(i..end)
                    .ok_or_else(|| Error::InvalidState("truncated literal run".into()))?;
                out.extend_from_slice(literal);
                i = end;
            } else if n > 128 {
                let value = *src
                    .get(i)
                    .ok_or_else(|| Error::InvalidState("truncated repeat run".into()))?;
                out.resize(out.len() + 257 - n, value);
                i += 1;
            }
        }
        Ok(out)
    }
}

impl Compressor for RleCompressor {
    fn compress(&mut self, src: &[u8], geometry: &FrameGeometry, dst: &mut [u8]) -> Result<usize> {
        if src.len() < geometry.sensor_buffer_size() {
            return Err(Error::InvalidState(format!(
                "sensor buffer has {} bytes, geometry needs {}",
                src.len(),
                geometry.sensor_buffer_size()
            )));
        }
        self.window.clear();
        for row in window_rows(src, geometry) {
            self.window.extend_from_slice(row);
        }

        let mut out = Packer { dst, len: 0, produced: 0 };
        let data = &self.window;
        let mut i = 0;
        while i < data.len() {
            let run = data[i..]
                .iter()
                .take(128)
                .take_while(|&&b| b == data[i])
                .count();
            if run >= 3 {
                out.push(&[(257 - run) as u8, data[i]]);
                i += run;
                continue;
            }

            let start = i;
            while i < data.len() && i - start < 128 {
                if i + 2 < data.len() && data[i] == data[i + 1] && data[i] == data[i + 2] {
                    break;
                }
                i += 1;
            }
            out.push(&[(i - start - 1) as u8]);
            out.push(&data[start..i]);
        }
        out.finish()
    }
}

struct Packer<'a> {
    dst: &'a mut [u8],
    len: usize,
    produced: usize,
}

impl Packer<'_> {
    fn push(&mut self, bytes: &[u8]) {
        self.produced += bytes.len();
        if let Some(room) = self.dst.get_mut(self.len..self.len + bytes.len()) {
            room.copy_from_slice(bytes);
            self.len += bytes.len();
        }
    }

    fn finish(self) -> Result<usize> {
        if self.produced > self.dst.len() {
            return Err(Error::CompressionOverflow {
                produced: self.produced,
                capacity: self.dst.len(),
            });
        }
        Ok(self.produced)
    }
}
