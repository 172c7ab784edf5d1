//! On-disk layout of a recording.
//!
//! A recording is one or more chunk files. Each chunk starts with a header
//! region padded to the write alignment, followed by one frame block per
//! slot written:
//!
//! ```text
//! chunk 0: │ FILE │ RAWI │ NULL pad │ VIDF │ VIDF │ ... │
//! chunk n: │ FILE │ NULL pad        │ VIDF │ ... │
//! ```
//!
//! Frame blocks are written straight from slot memory; their header is
//! stamped into the slot's header region at capture time.

mod blocks;
mod reader;
mod sentinel;

pub use blocks::{
    BLOCK_HEADER_SIZE, BlockHeader, BlockType, FLAG_COMPRESSED, FLAG_SEQUENTIAL, FORMAT_VERSION,
    FileBlock, FrameHeader, RawInfoBlock, null_block, null_block_header,
};
pub use reader::{BlockReader, RecordingSummary, summarize};
pub use sentinel::{FRAME_SENTINEL, FrameCheck, add_checks, check, mark_complete};

use crate::config::{CompressionMode, FrameGeometry, RecorderConfig};
use crate::memory::align_up;
use bytes::{Bytes, BytesMut};
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Path of chunk `index` of a recording whose first chunk is `base`.
///
/// Chunk 0 is `base` itself; later chunks replace the last two characters
/// of the extension with the zero-padded index minus one
/// (`M00-0000.RVF`, `M00-0000.R00`, `M00-0000.R01`, ...).
pub fn chunk_path(base: &Path, index: u16) -> PathBuf {
    if index == 0 {
        return base.to_path_buf();
    }
    let Some(ext) = base.extension().and_then(|e| e.to_str()) else {
        return base.with_extension(format!("{:02}", index - 1));
    };
    let keep: String = ext.chars().take(ext.chars().count().saturating_sub(2)).collect();
    base.with_extension(format!("{keep}{:02}", index - 1))
}

/// Per-session format state shared by the capture trigger and the writer.
#[derive(Debug, Clone)]
pub struct RecordingFormat {
    guid: u64,
    start: Instant,
    geometry: FrameGeometry,
    compression: CompressionMode,
    fps_num: u32,
    fps_den: u32,
    header_size: usize,
    write_alignment: usize,
}

impl RecordingFormat {
    /// Set up the format for a session starting now.
    pub fn new(config: &RecorderConfig) -> Self {
        Self {
            guid: generate_guid(),
            start: Instant::now(),
            geometry: config.geometry,
            compression: config.compression,
            fps_num: (config.fps * 1000.0).round() as u32,
            fps_den: 1000,
            header_size: config.layout.header_size,
            write_alignment: config.layout.write_alignment,
        }
    }

    /// Microseconds since the session started.
    pub fn timestamp(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    /// Recording identifier.
    pub fn guid(&self) -> u64 {
        self.guid
    }

    /// The file block for a chunk.
    pub fn file_block(&self, chunk_index: u16, frames: u32) -> FileBlock {
        let mut flags = FLAG_SEQUENTIAL;
        if self.compression.is_enabled() {
            flags |= FLAG_COMPRESSED;
        }
        FileBlock {
            version: FORMAT_VERSION,
            guid: self.guid,
            chunk_index,
            chunk_count: 0,
            flags,
            video_frame_count: frames,
            fps_num: self.fps_num,
            fps_den: self.fps_den,
        }
    }

    /// Header region of a chunk, padded with a NULL block to the write
    /// alignment.
    pub fn chunk_headers(&self, chunk_index: u16) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.write_alignment);
        self.file_block(chunk_index, 0).encode(&mut buf);
        if chunk_index == 0 {
            RawInfoBlock::new(&self.geometry, self.compression).encode(&mut buf, self.timestamp());
        }
        let padded = align_up(buf.len() + BLOCK_HEADER_SIZE, self.write_alignment);
        let pad = null_block(padded - buf.len());
        buf.extend_from_slice(&pad);
        buf.freeze()
    }

    /// Header region for frame `frame_number` (1-based) in a slot of
    /// `block_size` bytes.
    pub fn frame_header(&self, block_size: usize, frame_number: u32) -> BytesMut {
        FrameHeader::new(
            &self.geometry,
            self.header_size,
            block_size,
            frame_number.saturating_sub(1),
            self.timestamp(),
        )
        .encode(self.header_size)
    }
}

fn generate_guid() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    // splitmix64 over time and pid
    let mut z = nanos ^ (u64::from(std::process::id()) << 32);
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
