//! File content: full data blocks and shared fragment blocks.
//!
//! Each file is cut into `block_size` chunks. Full chunks become data
//! blocks, compressed only when that makes them strictly smaller. The short
//! tail is appended to the current fragment block, which is shared by many
//! files and flushed when the next tail would not fit, or at the end.

use crate::backend::{Backend, Region};
use crate::compression::{compress_if_smaller, Compressor};
use crate::error::Result;
use crate::format::{DATA_UNCOMPRESSED, FRAGMENT_ENTRY_SIZE};
use log::trace;

/// Where a file's tail lives inside a fragment block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentRef {
    pub index: u32,
    pub offset: u32,
    pub len: u32,
}

/// On-disk placement of one file's content.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataBlockRef {
    /// Position of the first data block.
    pub start: u64,
    /// One size word per data block (see [`DATA_UNCOMPRESSED`]; `0` = sparse).
    pub block_sizes: Vec<u32>,
    pub fragment: Option<FragmentRef>,
    /// Bytes covered by sparse blocks.
    pub sparse: u64,
}

/// Location and size word of a written fragment block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentEntry {
    pub start: u64,
    pub size: u32,
}

impl FragmentEntry {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.start.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
    }

    pub fn decode(raw: &[u8]) -> Self {
        debug_assert_eq!(raw.len(), FRAGMENT_ENTRY_SIZE);
        let mut start = [0u8; 8];
        start.copy_from_slice(&raw[0..8]);
        Self {
            start: u64::from_le_bytes(start),
            size: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
        }
    }
}

/// Knobs for [`DataWriter`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct DataOptions {
    pub compress_data: bool,
    pub compress_fragments: bool,
    pub use_fragments: bool,
    pub detect_sparse: bool,
}

pub(crate) struct DataWriter<'c> {
    compressor: &'c dyn Compressor,
    block_size: usize,
    options: DataOptions,
    position: u64,
    fragment: Vec<u8>,
    fragments: Vec<FragmentEntry>,
}

impl<'c> DataWriter<'c> {
    /// Start writing data at `position` (right after the superblock).
    pub fn new(
        compressor: &'c dyn Compressor,
        block_size: u32,
        options: DataOptions,
        position: u64,
    ) -> Self {
        Self {
            compressor,
            block_size: block_size as usize,
            options,
            position,
            fragment: Vec::with_capacity(block_size as usize),
            fragments: Vec::new(),
        }
    }

    /// Write one file's content and return where it went.
    pub fn write_file<B: Backend>(
        &mut self,
        region: &mut Region<B>,
        data: &[u8],
    ) -> Result<DataBlockRef> {
        let mut placed = DataBlockRef {
            start: self.position,
            ..Default::default()
        };
        for chunk in data.chunks(self.block_size) {
            if chunk.len() < self.block_size && self.options.use_fragments {
                placed.fragment = Some(self.add_fragment(region, chunk)?);
                continue;
            }
            if self.options.detect_sparse && chunk.iter().all(|&b| b == 0) {
                placed.block_sizes.push(0);
                placed.sparse += chunk.len() as u64;
                continue;
            }
            let word = self.write_block(region, chunk, self.options.compress_data)?;
            placed.block_sizes.push(word);
        }
        Ok(placed)
    }

    fn write_block<B: Backend>(
        &mut self,
        region: &mut Region<B>,
        chunk: &[u8],
        compress: bool,
    ) -> Result<u32> {
        let (stored, compressed) = if compress {
            compress_if_smaller(self.compressor, chunk)?
        } else {
            (chunk.to_vec(), false)
        };
        region.write_all_at(self.position, &stored)?;
        self.position += stored.len() as u64;
        let mut word = stored.len() as u32;
        if !compressed {
            word |= DATA_UNCOMPRESSED;
        }
        Ok(word)
    }

    fn add_fragment<B: Backend>(
        &mut self,
        region: &mut Region<B>,
        tail: &[u8],
    ) -> Result<FragmentRef> {
        if self.fragment.len() + tail.len() > self.block_size {
            self.flush_fragment(region)?;
        }
        let placed = FragmentRef {
            index: self.fragments.len() as u32,
            offset: self.fragment.len() as u32,
            len: tail.len() as u32,
        };
        self.fragment.extend_from_slice(tail);
        Ok(placed)
    }

    fn flush_fragment<B: Backend>(&mut self, region: &mut Region<B>) -> Result<()> {
        if self.fragment.is_empty() {
            return Ok(());
        }
        let block = std::mem::take(&mut self.fragment);
        let start = self.position;
        let size = self.write_block(region, &block, self.options.compress_fragments)?;
        trace!(
            "fragment block {} at {}: {} bytes",
            self.fragments.len(),
            start,
            block.len()
        );
        self.fragments.push(FragmentEntry { start, size });
        self.fragment = block;
        self.fragment.clear();
        Ok(())
    }

    /// Flush the pending fragment block. Returns the end of the data area
    /// and every fragment block written.
    pub fn finish<B: Backend>(
        mut self,
        region: &mut Region<B>,
    ) -> Result<(u64, Vec<FragmentEntry>)> {
        self.flush_fragment(region)?;
        Ok((self.position, self.fragments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Gzip;
    use crate::format::SUPERBLOCK_SIZE;

    const BS: u32 = 4096;

    fn options() -> DataOptions {
        DataOptions {
            compress_data: true,
            compress_fragments: true,
            use_fragments: true,
            detect_sparse: true,
        }
    }

    fn noise(len: usize, seed: u32) -> Vec<u8> {
        let mut x = seed.wrapping_mul(2_654_435_761).max(1);
        (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                x as u8
            })
            .collect()
    }

    #[test]
    fn test_full_blocks_and_tail_fragment() {
        let gz = Gzip::default();
        let mut region = Region::new(Vec::new(), 0, 0);
        let mut writer = DataWriter::new(&gz, BS, options(), SUPERBLOCK_SIZE as u64);

        let data = noise(BS as usize * 3 + 100, 1);
        let placed = writer.write_file(&mut region, &data).unwrap();
        assert_eq!(placed.start, SUPERBLOCK_SIZE as u64);
        assert_eq!(placed.block_sizes.len(), 3);
        // Random bytes do not compress.
        assert!(placed.block_sizes.iter().all(|w| w & DATA_UNCOMPRESSED != 0));
        assert_eq!(
            placed.fragment,
            Some(FragmentRef {
                index: 0,
                offset: 0,
                len: 100
            })
        );

        let (end, fragments) = writer.finish(&mut region).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].start, SUPERBLOCK_SIZE as u64 + 3 * BS as u64);
        assert_eq!(end, region.get_ref().len() as u64);
    }

    #[test]
    fn test_exact_multiple_has_no_fragment() {
        let gz = Gzip::default();
        let mut region = Region::new(Vec::new(), 0, 0);
        let mut writer = DataWriter::new(&gz, BS, options(), 0);
        let placed = writer.write_file(&mut region, &vec![b'a'; BS as usize * 2]).unwrap();
        assert_eq!(placed.block_sizes.len(), 2);
        assert!(placed.fragment.is_none());
        // Repetitive data compresses.
        assert!(placed.block_sizes.iter().all(|w| w & DATA_UNCOMPRESSED == 0));
    }

    #[test]
    fn test_empty_file() {
        let gz = Gzip::default();
        let mut region = Region::new(Vec::new(), 0, 0);
        let mut writer = DataWriter::new(&gz, BS, options(), 96);
        let placed = writer.write_file(&mut region, &[]).unwrap();
        assert!(placed.block_sizes.is_empty());
        assert!(placed.fragment.is_none());
        let (end, fragments) = writer.finish(&mut region).unwrap();
        assert_eq!(end, 96);
        assert!(fragments.is_empty());
    }

    #[test]
    fn test_tails_share_fragment_blocks() {
        let gz = Gzip::default();
        let mut region = Region::new(Vec::new(), 0, 0);
        let mut writer = DataWriter::new(&gz, BS, options(), 0);

        let mut refs = Vec::new();
        for i in 0..10u32 {
            let tail = noise(1000, i + 1);
            refs.push(writer.write_file(&mut region, &tail).unwrap().fragment.unwrap());
        }
        // Four 1000-byte tails fit in a 4096-byte fragment block.
        assert_eq!(refs[0], FragmentRef { index: 0, offset: 0, len: 1000 });
        assert_eq!(refs[3], FragmentRef { index: 0, offset: 3000, len: 1000 });
        assert_eq!(refs[4], FragmentRef { index: 1, offset: 0, len: 1000 });
        assert_eq!(refs[9].index, 2);

        let (_, fragments) = writer.finish(&mut region).unwrap();
        assert_eq!(fragments.len(), 3);
    }

    #[test]
    fn test_zero_blocks_are_sparse() {
        let gz = Gzip::default();
        let mut region = Region::new(Vec::new(), 0, 0);
        let mut writer = DataWriter::new(&gz, BS, options(), 0);
        let mut data = vec![0u8; BS as usize * 2];
        data.extend(noise(BS as usize, 9));
        let placed = writer.write_file(&mut region, &data).unwrap();
        assert_eq!(&placed.block_sizes[..2], &[0, 0]);
        assert_eq!(placed.sparse, 2 * BS as u64);
        assert_eq!(region.get_ref().len(), BS as usize);
    }

    #[test]
    fn test_without_fragments_tail_is_a_short_block() {
        let gz = Gzip::default();
        let mut region = Region::new(Vec::new(), 0, 0);
        let opts = DataOptions {
            use_fragments: false,
            ..options()
        };
        let mut writer = DataWriter::new(&gz, BS, opts, 0);
        let placed = writer.write_file(&mut region, &noise(BS as usize + 10, 3)).unwrap();
        assert_eq!(placed.block_sizes.len(), 2);
        assert_eq!(placed.block_sizes[1], 10 | DATA_UNCOMPRESSED);
        assert!(placed.fragment.is_none());
    }

    #[test]
    fn test_fragment_entry_encoding() {
        let entry = FragmentEntry {
            start: 0x1_0000_0000,
            size: 77 | DATA_UNCOMPRESSED,
        };
        let mut raw = Vec::new();
        entry.encode(&mut raw);
        assert_eq!(raw.len(), FRAGMENT_ENTRY_SIZE);
        assert_eq!(FragmentEntry::decode(&raw), entry);
    }
}
