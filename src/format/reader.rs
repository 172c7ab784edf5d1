//! Block-level reading, for verification and diagnostics.

use super::blocks::{BlockHeader, BlockType, FileBlock, FrameHeader, RawInfoBlock};
use crate::error::{Error, Result};

/// Iterator over the blocks of one chunk.
///
/// Yields the offset and header of each block. A truncated or corrupt
/// block yields one error and ends the iteration.
#[derive(Debug, Clone)]
pub struct BlockReader<'a> {
    data: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> BlockReader<'a> {
    /// Read blocks from the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            failed: false,
        }
    }
}

impl<'a> Iterator for BlockReader<'a> {
    type Item = Result<(usize, BlockHeader)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.data.len() {
            return None;
        }
        let offset = self.offset;
        let header = match BlockHeader::decode(&self.data[offset..]) {
            Ok(h) => h,
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };
        let end = offset + header.size as usize;
        if end > self.data.len() {
            self.failed = true;
            return Some(Err(Error::InvalidState(format!(
                "block at {offset} runs past the end ({end} > {})",
                self.data.len()
            ))));
        }
        self.offset = end;
        Some(Ok((offset, header)))
    }
}

/// What a set of chunks contains.
#[derive(Debug, Clone, Default)]
pub struct RecordingSummary {
    /// File block of every chunk, in order.
    pub files: Vec<FileBlock>,
    /// Raw info from the first chunk.
    pub raw_info: Option<RawInfoBlock>,
    /// 0-based frame numbers in file order.
    pub frames: Vec<u32>,
    /// Frame count per chunk, as found (not as recorded in the header).
    pub frames_per_chunk: Vec<u32>,
}

/// Walk every block of every chunk.
pub fn summarize<'a>(chunks: impl IntoIterator<Item = &'a [u8]>) -> Result<RecordingSummary> {
    let mut summary = RecordingSummary::default();
    for chunk in chunks {
        let mut count = 0;
        for block in BlockReader::new(chunk) {
            let (offset, header) = block?;
            let data = &chunk[offset..];
            match header.block_type {
                BlockType::File => summary.files.push(FileBlock::decode(data)?),
                BlockType::RawInfo => summary.raw_info = Some(RawInfoBlock::decode(data)?),
                BlockType::VideoFrame => {
                    summary.frames.push(FrameHeader::decode(data)?.frame_number);
                    count += 1;
                }
                BlockType::Null => {}
            }
        }
        summary.frames_per_chunk.push(count);
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::null_block;

    #[test]
    fn test_reader_stops_on_truncation() {
        let mut data = null_block(32).to_vec();
        data.extend_from_slice(&null_block(64)[..40]);
        let items: Vec<_> = BlockReader::new(&data).collect();
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
    }
}
