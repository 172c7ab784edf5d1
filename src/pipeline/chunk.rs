//! Chunked output files.
//!
//! Storage may cap the size of a single file. When the cap is known the
//! writer starts a new chunk before a burst would cross it; otherwise the
//! cap shows up as a short write, the partial data is covered with a NULL
//! block and the burst is written again into a fresh chunk. From then on
//! the cap is known and splitting is proactive.

use crate::error::{Error, Result};
use crate::format::{RecordingFormat, chunk_path, null_block_header};
use crate::observability::{RecordingMetrics, trace_chunk_rotation};
use crate::storage::{Storage, StorageFile};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A closed chunk file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    /// File path.
    pub path: PathBuf,
    /// File size in bytes.
    pub bytes: u64,
    /// Frame blocks in the file.
    pub frames: u32,
}

/// The sequence of chunk files of one recording.
pub struct ChunkedOutput {
    storage: Arc<dyn Storage>,
    base: PathBuf,
    format: RecordingFormat,
    limit: Option<u64>,
    limit_hit: bool,
    file: Option<Box<dyn StorageFile>>,
    index: u16,
    written_chunk: u64,
    chunk_frames: u32,
    overhead: usize,
    finished: Vec<ChunkInfo>,
    metrics: Option<RecordingMetrics>,
}

impl ChunkedOutput {
    /// Create chunk 0 at `base` and write its headers.
    ///
    /// `limit_known` enables proactive splitting at `limit` from the start.
    pub fn open(
        storage: Arc<dyn Storage>,
        base: impl Into<PathBuf>,
        format: RecordingFormat,
        limit: Option<u64>,
        limit_known: bool,
    ) -> Result<Self> {
        let base = base.into();
        let mut file = storage.create(&base)?;
        let headers = match write_headers(file.as_mut(), &format, 0) {
            Ok(n) => n,
            Err(e) => {
                let _ = file.close();
                let _ = storage.remove(&base);
                return Err(e);
            }
        };
        tracing::debug!(path = %base.display(), headers, "opened recording");

        Ok(Self {
            storage,
            base,
            format,
            limit,
            limit_hit: limit_known && limit.is_some(),
            file: Some(file),
            index: 0,
            written_chunk: headers as u64,
            chunk_frames: 0,
            overhead: headers,
            finished: Vec::new(),
            metrics: None,
        })
    }

    /// Report chunk rotations to `metrics`.
    pub fn with_metrics(mut self, metrics: RecordingMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Write one burst of contiguous frame blocks.
    ///
    /// `frame_sizes` lists the block size of every frame in `data`, in
    /// order. Fails with [`Error::StorageExhausted`] when nothing more can
    /// be written; frames written before the failure stay on storage.
    pub fn write_burst(&mut self, data: &[u8], frame_sizes: &[usize]) -> Result<()> {
        let Some(limit) = self.limit.filter(|_| self.limit_hit) else {
            return self.write_part(data, frame_sizes.len() as u32);
        };

        let mut offset = 0;
        let mut sizes = frame_sizes;
        while !sizes.is_empty() {
            let room = limit.saturating_sub(self.written_chunk);
            let mut bytes = 0usize;
            let fit = sizes
                .iter()
                .take_while(|&&size| {
                    let fits = (bytes + size) as u64 <= room;
                    if fits {
                        bytes += size;
                    }
                    fits
                })
                .count();

            if fit == 0 {
                if self.chunk_frames > 0 {
                    self.rotate("size limit")?;
                    continue;
                }
                // a single frame larger than an empty chunk
                bytes = sizes[0];
            }

            let count = fit.max(1);
            self.write_part(&data[offset..offset + bytes], count as u32)?;
            offset += bytes;
            sizes = &sizes[count..];
        }
        Ok(())
    }

    fn write_part(&mut self, part: &[u8], frames: u32) -> Result<()> {
        let file = self.file_mut()?;
        let written = file.write(part)?;
        if written == part.len() {
            self.written_chunk += part.len() as u64;
            self.chunk_frames += frames;
            return Ok(());
        }

        let attempted = self.written_chunk + part.len() as u64;
        if self.limit.is_none_or(|limit| attempted < limit) {
            tracing::error!(
                chunk = self.index,
                written,
                requested = part.len(),
                "write failed before the file size limit, storage full"
            );
            return Err(Error::StorageExhausted(format!(
                "short write ({written} of {} bytes) in chunk {}",
                part.len(),
                self.index
            )));
        }

        self.limit_hit = true;
        if written > 0 {
            tracing::debug!(chunk = self.index, written, "covering incomplete block");
            let cover = null_block_header(written.max(crate::format::BLOCK_HEADER_SIZE));
            let at = self.written_chunk;
            let file = self.file_mut()?;
            file.seek(at)?;
            let _ = file.write(&cover)?;
        }

        self.rotate("short write")?;
        let file = self.file_mut()?;
        let retried = file.write(part)?;
        if retried != part.len() {
            self.abandon_current()?;
            return Err(Error::StorageExhausted(format!(
                "new chunk {} refused {} bytes",
                self.index,
                part.len()
            )));
        }
        self.written_chunk += part.len() as u64;
        self.chunk_frames += frames;
        Ok(())
    }

    fn file_mut(&mut self) -> Result<&mut Box<dyn StorageFile>> {
        self.file
            .as_mut()
            .ok_or_else(|| Error::StorageExhausted("no chunk open".into()))
    }

    /// Close the current chunk and start the next one.
    fn rotate(&mut self, reason: &str) -> Result<()> {
        self.finish_chunk()?;

        let index = self
            .index
            .checked_add(1)
            .ok_or_else(|| Error::StorageExhausted("out of chunk names".into()))?;
        let path = chunk_path(&self.base, index);
        trace_chunk_rotation(&path, index, reason);

        let mut file = self.storage.create(&path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "cannot create chunk");
            Error::StorageExhausted(format!("cannot create {}: {e}", path.display()))
        })?;
        let headers = match write_headers(file.as_mut(), &self.format, index) {
            Ok(n) => n,
            Err(e) => {
                let _ = file.close();
                let _ = self.storage.remove(&path);
                return Err(e);
            }
        };

        self.index = index;
        self.file = Some(file);
        self.written_chunk = headers as u64;
        self.chunk_frames = 0;
        self.overhead += headers;
        if let Some(metrics) = &self.metrics {
            metrics.record_chunk_rotation();
        }
        Ok(())
    }

    /// Rewrite the file block with the final frame count and close.
    fn finish_chunk(&mut self) -> Result<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        let block = self.format.file_block(self.index, self.chunk_frames).to_bytes();
        file.seek(0)?;
        let rewritten = file.write(&block)?;
        if rewritten != block.len() {
            tracing::warn!(chunk = self.index, "could not update the frame count");
        }
        file.close()?;
        self.finished.push(ChunkInfo {
            path: chunk_path(&self.base, self.index),
            bytes: self.written_chunk,
            frames: self.chunk_frames,
        });
        Ok(())
    }

    /// Drop a freshly created chunk that could not take its first burst.
    fn abandon_current(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            let path = chunk_path(&self.base, self.index);
            tracing::warn!(path = %path.display(), "new chunk didn't work, removing it");
            let _ = file.close();
            self.storage.remove(&path)?;
            self.overhead = self.overhead.saturating_sub(self.written_chunk as usize);
            self.index -= 1;
        }
        Ok(())
    }

    /// Header bytes written since the last call.
    pub fn take_overhead(&mut self) -> usize {
        std::mem::take(&mut self.overhead)
    }

    /// Index of the chunk being written.
    pub fn chunk_index(&self) -> u16 {
        self.index
    }

    /// Frames in the chunk being written.
    pub fn chunk_frames(&self) -> u32 {
        self.chunk_frames
    }

    /// Bytes in the chunk being written.
    pub fn chunk_bytes(&self) -> u64 {
        self.written_chunk
    }

    /// Whether the file size limit is enforced before writing.
    pub fn limit_known(&self) -> bool {
        self.limit_hit
    }

    /// Path of chunk 0.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Close the last chunk; returns every chunk written.
    pub fn finish(mut self) -> Result<Vec<ChunkInfo>> {
        self.finish_chunk()?;
        Ok(std::mem::take(&mut self.finished))
    }
}

impl std::fmt::Debug for ChunkedOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedOutput")
            .field("base", &self.base)
            .field("index", &self.index)
            .field("written_chunk", &self.written_chunk)
            .field("chunk_frames", &self.chunk_frames)
            .field("limit", &self.limit)
            .field("limit_hit", &self.limit_hit)
            .finish()
    }
}

fn write_headers(
    file: &mut dyn StorageFile,
    format: &RecordingFormat,
    index: u16,
) -> Result<usize> {
    let headers = format.chunk_headers(index);
    let written = file.write(&headers)?;
    if written != headers.len() {
        return Err(Error::StorageExhausted(format!(
            "could not write the headers of chunk {index}"
        )));
    }
    Ok(headers.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FrameGeometry, RecorderConfig};
    use crate::format::{FileBlock, summarize};
    use crate::storage::MemoryStorage;

    fn format() -> RecordingFormat {
        let config = RecorderConfig::new("/card/A.RVF", FrameGeometry::full_sensor(64, 4, 8), 25.0);
        RecordingFormat::new(&config)
    }

    fn frames(count: usize, size: usize) -> (Vec<u8>, Vec<usize>) {
        let mut data = Vec::new();
        let fmt = format();
        for i in 0..count {
            let mut block = fmt.frame_header(size, i as u32 + 1).to_vec();
            block.resize(size, 0x5A);
            data.extend_from_slice(&block);
        }
        (data, vec![size; count])
    }

    #[test]
    fn test_single_chunk() {
        let storage = MemoryStorage::new();
        let mut out = ChunkedOutput::open(
            Arc::new(storage.clone()),
            "/card/A.RVF",
            format(),
            None,
            false,
        )
        .unwrap();
        assert_eq!(out.take_overhead(), 512);

        let (data, sizes) = frames(3, 512);
        out.write_burst(&data, &sizes).unwrap();
        let chunks = out.finish().unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].frames, 3);
        assert_eq!(chunks[0].bytes, 512 * 4);

        let file = storage.contents(Path::new("/card/A.RVF")).unwrap();
        assert_eq!(file.len(), 512 * 4);
        assert_eq!(FileBlock::decode(&file).unwrap().video_frame_count, 3);
    }

    #[test]
    fn test_proactive_split() {
        let storage = MemoryStorage::new();
        let mut out = ChunkedOutput::open(
            Arc::new(storage.clone()),
            "/card/A.RVF",
            format(),
            Some(2048),
            true,
        )
        .unwrap();

        // 512 header + 3 frames fill chunk 0 exactly
        let (data, sizes) = frames(5, 512);
        out.write_burst(&data, &sizes).unwrap();
        assert_eq!(out.chunk_index(), 1);
        let chunks = out.finish().unwrap();
        assert_eq!(
            chunks.iter().map(|c| c.frames).collect::<Vec<_>>(),
            vec![3, 2]
        );
        assert_eq!(chunks[1].path, Path::new("/card/A.R00"));

        let a = storage.contents(Path::new("/card/A.RVF")).unwrap();
        let b = storage.contents(Path::new("/card/A.R00")).unwrap();
        let summary = summarize([a.as_slice(), b.as_slice()]).unwrap();
        assert_eq!(summary.frames, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_reactive_split_covers_partial_data() {
        let storage = MemoryStorage::new().with_file_size_limit(1800);
        let mut out = ChunkedOutput::open(
            Arc::new(storage.clone()),
            "/card/A.RVF",
            format(),
            Some(1800),
            false,
        )
        .unwrap();

        let (data, sizes) = frames(2, 512);
        out.write_burst(&data, &sizes).unwrap();
        assert!(!out.limit_known());
        // 1536 + 512 > 1800: short write of 264 bytes, then a new chunk
        let (data, sizes) = frames(1, 512);
        out.write_burst(&data, &sizes).unwrap();
        assert!(out.limit_known());
        assert_eq!(out.chunk_index(), 1);

        let chunks = out.finish().unwrap();
        assert_eq!(chunks[0].frames, 2);
        assert_eq!(chunks[1].frames, 1);

        // chunk 0 still parses: the partial frame is hidden in a NULL block
        let a = storage.contents(Path::new("/card/A.RVF")).unwrap();
        assert_eq!(a.len(), 1800);
        let b = storage.contents(Path::new("/card/A.R00")).unwrap();
        let summary = summarize([a.as_slice(), b.as_slice()]).unwrap();
        assert_eq!(summary.frames.len(), 3);
    }

    #[test]
    fn test_card_full_before_limit() {
        let storage = MemoryStorage::new().with_capacity(1024 + 100);
        let mut out = ChunkedOutput::open(
            Arc::new(storage.clone()),
            "/card/A.RVF",
            format(),
            Some(1 << 30),
            false,
        )
        .unwrap();
        let (data, sizes) = frames(1, 512);
        out.write_burst(&data, &sizes).unwrap();
        let err = out.write_burst(&data, &sizes).unwrap_err();
        assert!(matches!(err, Error::StorageExhausted(_)));
    }

    #[test]
    fn test_failed_new_chunk_is_removed() {
        let storage = MemoryStorage::new().with_file_size_limit(1024);
        storage.fail_creates_after(1);
        let mut out = ChunkedOutput::open(
            Arc::new(storage.clone()),
            "/card/A.RVF",
            format(),
            Some(1024),
            true,
        )
        .unwrap();
        let (data, sizes) = frames(2, 512);
        let err = out.write_burst(&data, &sizes).unwrap_err();
        assert!(matches!(err, Error::StorageExhausted(_)));
        let chunks = out.finish().unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].frames, 1);
        assert!(!storage.exists(Path::new("/card/A.R00")));
    }
}
