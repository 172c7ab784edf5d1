//! Block encoding.
//!
//! Every block starts with the same 16-byte header:
//!
//! ```text
//! ┌──────────┬──────────────┬────────────────────┐
//! │ type [4] │ size u32 LE  │ timestamp u64 LE   │ body ...
//! └──────────┴──────────────┴────────────────────┘
//! ```
//!
//! `size` covers the whole block including the header. Frame blocks span
//! their entire slot, so padding and sentinels are part of the block.

use crate::config::{CompressionMode, FrameGeometry};
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the common block header.
pub const BLOCK_HEADER_SIZE: usize = 16;

/// File format version written to every chunk.
pub const FORMAT_VERSION: u32 = 1;

/// Set in [`FileBlock::flags`] when frames may be compressed.
pub const FLAG_COMPRESSED: u32 = 1 << 0;
/// Set in [`FileBlock::flags`]: frames are stored in capture order.
pub const FLAG_SEQUENTIAL: u32 = 1 << 2;

/// Block type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    /// Per-chunk file header.
    File,
    /// Raw image information (first chunk only).
    RawInfo,
    /// One video frame.
    VideoFrame,
    /// Padding.
    Null,
}

impl BlockType {
    /// Four-byte tag.
    pub const fn tag(self) -> [u8; 4] {
        match self {
            BlockType::File => *b"RVFF",
            BlockType::RawInfo => *b"RAWI",
            BlockType::VideoFrame => *b"VIDF",
            BlockType::Null => *b"NULL",
        }
    }

    /// Parse a tag.
    pub fn from_tag(tag: [u8; 4]) -> Option<Self> {
        match &tag {
            b"RVFF" => Some(BlockType::File),
            b"RAWI" => Some(BlockType::RawInfo),
            b"VIDF" => Some(BlockType::VideoFrame),
            b"NULL" => Some(BlockType::Null),
            _ => None,
        }
    }
}

/// Common block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Block type.
    pub block_type: BlockType,
    /// Whole block size in bytes.
    pub size: u32,
    /// Microseconds since the recording started.
    pub timestamp: u64,
}

impl BlockHeader {
    fn put(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.block_type.tag());
        buf.put_u32_le(self.size);
        buf.put_u64_le(self.timestamp);
    }

    /// Decode a header from the start of `data`.
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < BLOCK_HEADER_SIZE {
            return Err(Error::InvalidState("truncated block header".into()));
        }
        let mut tag = [0u8; 4];
        data.copy_to_slice(&mut tag);
        let block_type = BlockType::from_tag(tag).ok_or_else(|| {
            Error::InvalidState(format!("unknown block tag {:?}", String::from_utf8_lossy(&tag)))
        })?;
        let size = data.get_u32_le();
        let timestamp = data.get_u64_le();
        if (size as usize) < BLOCK_HEADER_SIZE {
            return Err(Error::InvalidState(format!("block size {size} too small")));
        }
        Ok(Self {
            block_type,
            size,
            timestamp,
        })
    }
}

/// Per-chunk file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileBlock {
    /// Format version.
    pub version: u32,
    /// Identifier shared by every chunk of one recording.
    pub guid: u64,
    /// Index of this chunk.
    pub chunk_index: u16,
    /// Number of chunks (0 = unknown, readers count the files).
    pub chunk_count: u16,
    /// Format flags.
    pub flags: u32,
    /// Frames stored in this chunk; rewritten when the chunk is closed.
    pub video_frame_count: u32,
    /// Frame rate numerator.
    pub fps_num: u32,
    /// Frame rate denominator.
    pub fps_den: u32,
}

impl FileBlock {
    /// Encoded size.
    pub const SIZE: usize = BLOCK_HEADER_SIZE + 32;

    /// Encode the block.
    pub fn encode(&self, buf: &mut impl BufMut) {
        BlockHeader {
            block_type: BlockType::File,
            size: Self::SIZE as u32,
            timestamp: 0,
        }
        .put(buf);
        buf.put_u32_le(self.version);
        buf.put_u64_le(self.guid);
        buf.put_u16_le(self.chunk_index);
        buf.put_u16_le(self.chunk_count);
        buf.put_u32_le(self.flags);
        buf.put_u32_le(self.video_frame_count);
        buf.put_u32_le(self.fps_num);
        buf.put_u32_le(self.fps_den);
    }

    /// Encode into a standalone buffer (used to rewrite the frame count).
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode from the start of `data`.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = BlockHeader::decode(data)?;
        if header.block_type != BlockType::File || data.len() < Self::SIZE {
            return Err(Error::InvalidState("not a file block".into()));
        }
        let mut body = &data[BLOCK_HEADER_SIZE..Self::SIZE];
        Ok(Self {
            version: body.get_u32_le(),
            guid: body.get_u64_le(),
            chunk_index: body.get_u16_le(),
            chunk_count: body.get_u16_le(),
            flags: body.get_u32_le(),
            video_frame_count: body.get_u32_le(),
            fps_num: body.get_u32_le(),
            fps_den: body.get_u32_le(),
        })
    }
}

/// Raw image information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawInfoBlock {
    /// Output width.
    pub width: u32,
    /// Output height.
    pub height: u32,
    /// Bits per pixel.
    pub bits_per_pixel: u32,
    /// Bytes per output row.
    pub pitch: u32,
    /// 0 = uncompressed, 1 = lossless.
    pub compression: u32,
    /// Uncompressed payload size.
    pub frame_size: u32,
}

impl RawInfoBlock {
    /// Encoded size.
    pub const SIZE: usize = BLOCK_HEADER_SIZE + 24;

    /// Describe `geometry`.
    pub fn new(geometry: &FrameGeometry, compression: CompressionMode) -> Self {
        Self {
            width: geometry.width,
            height: geometry.height,
            bits_per_pixel: geometry.bits_per_pixel,
            pitch: geometry.row_bytes() as u32,
            compression: u32::from(compression.is_enabled()),
            frame_size: geometry.frame_size() as u32,
        }
    }

    /// Encode the block.
    pub fn encode(&self, buf: &mut impl BufMut, timestamp: u64) {
        BlockHeader {
            block_type: BlockType::RawInfo,
            size: Self::SIZE as u32,
            timestamp,
        }
        .put(buf);
        buf.put_u32_le(self.width);
        buf.put_u32_le(self.height);
        buf.put_u32_le(self.bits_per_pixel);
        buf.put_u32_le(self.pitch);
        buf.put_u32_le(self.compression);
        buf.put_u32_le(self.frame_size);
    }

    /// Decode from the start of `data`.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = BlockHeader::decode(data)?;
        if header.block_type != BlockType::RawInfo || data.len() < Self::SIZE {
            return Err(Error::InvalidState("not a raw info block".into()));
        }
        let mut body = &data[BLOCK_HEADER_SIZE..Self::SIZE];
        Ok(Self {
            width: body.get_u32_le(),
            height: body.get_u32_le(),
            bits_per_pixel: body.get_u32_le(),
            pitch: body.get_u32_le(),
            compression: body.get_u32_le(),
            frame_size: body.get_u32_le(),
        })
    }
}

/// Frame block header, stored in the slot's header region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Whole block size (the slot size).
    pub block_size: u32,
    /// Microseconds since the recording started.
    pub timestamp: u64,
    /// 0-based frame number.
    pub frame_number: u32,
    /// Crop origin actually copied.
    pub crop_x: u16,
    /// Crop origin actually copied.
    pub crop_y: u16,
    /// Requested crop offset.
    pub pan_x: u16,
    /// Requested crop offset.
    pub pan_y: u16,
    /// Bytes between the header fields and the payload.
    pub frame_space: u32,
}

impl FrameHeader {
    /// Bytes used by the header fields; the rest of the header region is
    /// frame space.
    pub const FIELDS_SIZE: usize = BLOCK_HEADER_SIZE + 16;

    /// Offset of the block size field.
    pub const SIZE_OFFSET: usize = 4;

    /// Offset of the frame number field.
    pub const FRAME_NUMBER_OFFSET: usize = BLOCK_HEADER_SIZE;

    /// Header for frame `frame_number` (0-based) in a `block_size` slot.
    pub fn new(
        geometry: &FrameGeometry,
        header_size: usize,
        block_size: usize,
        frame_number: u32,
        timestamp: u64,
    ) -> Self {
        let (crop_x, crop_y) = geometry.aligned_crop();
        Self {
            block_size: block_size as u32,
            timestamp,
            frame_number,
            crop_x: crop_x as u16,
            crop_y: crop_y as u16,
            pan_x: geometry.crop_x as u16,
            pan_y: geometry.crop_y as u16,
            frame_space: header_size.saturating_sub(Self::FIELDS_SIZE) as u32,
        }
    }

    /// Encode into a header region of `header_size` bytes (zero filled).
    pub fn encode(&self, header_size: usize) -> BytesMut {
        let mut buf = BytesMut::with_capacity(header_size);
        BlockHeader {
            block_type: BlockType::VideoFrame,
            size: self.block_size,
            timestamp: self.timestamp,
        }
        .put(&mut buf);
        buf.put_u32_le(self.frame_number);
        buf.put_u16_le(self.crop_x);
        buf.put_u16_le(self.crop_y);
        buf.put_u16_le(self.pan_x);
        buf.put_u16_le(self.pan_y);
        buf.put_u32_le(self.frame_space);
        buf.resize(header_size.max(Self::FIELDS_SIZE), 0);
        buf
    }

    /// Decode from the start of `data`.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = BlockHeader::decode(data)?;
        if header.block_type != BlockType::VideoFrame || data.len() < Self::FIELDS_SIZE {
            return Err(Error::InvalidState("not a frame block".into()));
        }
        let mut body = &data[BLOCK_HEADER_SIZE..Self::FIELDS_SIZE];
        Ok(Self {
            block_size: header.size,
            timestamp: header.timestamp,
            frame_number: body.get_u32_le(),
            crop_x: body.get_u16_le(),
            crop_y: body.get_u16_le(),
            pan_x: body.get_u16_le(),
            pan_y: body.get_u16_le(),
            frame_space: body.get_u32_le(),
        })
    }
}

/// Encode a padding block of exactly `size` bytes (at least a header).
pub fn null_block(size: usize) -> BytesMut {
    let size = size.max(BLOCK_HEADER_SIZE);
    let mut buf = BytesMut::with_capacity(size);
    BlockHeader {
        block_type: BlockType::Null,
        size: size as u32,
        timestamp: 0,
    }
    .put(&mut buf);
    buf.resize(size, 0);
    buf
}

/// Just the header of a padding block covering `size` bytes.
///
/// Used to cover partially written data at the end of a chunk without
/// rewriting the data itself.
pub fn null_block_header(size: usize) -> [u8; BLOCK_HEADER_SIZE] {
    let mut out = [0u8; BLOCK_HEADER_SIZE];
    let mut buf = &mut out[..];
    BlockHeader {
        block_type: BlockType::Null,
        size: size.clamp(BLOCK_HEADER_SIZE, u32::MAX as usize) as u32,
        timestamp: 0,
    }
    .put(&mut buf);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_block_layout() {
        let block = FileBlock {
            version: FORMAT_VERSION,
            guid: 0x1122_3344_5566_7788,
            chunk_index: 3,
            chunk_count: 0,
            flags: FLAG_SEQUENTIAL,
            video_frame_count: 42,
            fps_num: 23976,
            fps_den: 1000,
        };
        let bytes = block.to_bytes();
        assert_eq!(bytes.len(), FileBlock::SIZE);
        assert_eq!(&bytes[..4], b"RVFF");
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), FileBlock::SIZE as u32);
        assert_eq!(FileBlock::decode(&bytes).unwrap(), block);
    }

    #[test]
    fn test_frame_header_fills_region() {
        let geometry = FrameGeometry::full_sensor(1936, 1100, 14)
            .with_output(1920, 1080)
            .with_crop(9, 5);
        let header = FrameHeader::new(&geometry, 64, 4096, 7, 1234);
        let encoded = header.encode(64);
        assert_eq!(encoded.len(), 64);
        assert_eq!(&encoded[..4], b"VIDF");

        let decoded = FrameHeader::decode(&encoded).unwrap();
        assert_eq!(decoded.frame_number, 7);
        assert_eq!((decoded.crop_x, decoded.crop_y), (16, 4));
        assert_eq!((decoded.pan_x, decoded.pan_y), (9, 5));
        assert_eq!(decoded.frame_space, 32);
        assert_eq!(decoded.block_size, 4096);
    }

    #[test]
    fn test_null_block() {
        let block = null_block(100);
        assert_eq!(block.len(), 100);
        let header = BlockHeader::decode(&block).unwrap();
        assert_eq!(header.block_type, BlockType::Null);
        assert_eq!(header.size, 100);

        let short = null_block_header(3);
        assert_eq!(BlockHeader::decode(&short).unwrap().size, BLOCK_HEADER_SIZE as u32);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut data = [0u8; 16];
        data[..4].copy_from_slice(b"XXXX");
        data[4] = 16;
        assert!(BlockHeader::decode(&data).is_err());
    }
}
