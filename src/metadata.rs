//! Metadata blocks: the compressed 8 KiB units holding inode records,
//! directory listings and lookup tables.
//!
//! Block layout:
//!   [u16 header]  stored length, bit 15 set when stored uncompressed
//!   [payload]     at most 8192 bytes once decompressed
//!
//! Records are appended to a stream and may straddle two blocks. A record
//! is addressed by a [`MetadataRef`]: the block's byte position inside its
//! table plus the offset into the decompressed block.

use crate::backend::{Backend, Region};
use crate::compression::{compress_if_smaller, Compressor};
use crate::error::{Error, Result};
use crate::format::{MetadataRef, RecordRead, METADATA_BLOCK_SIZE, METADATA_UNCOMPRESSED};
use log::trace;

/// Builds one metadata table in memory.
pub(crate) struct MetadataWriter<'c> {
    compressor: &'c dyn Compressor,
    compress: bool,
    output: Vec<u8>,
    pending: Vec<u8>,
}

impl<'c> MetadataWriter<'c> {
    pub fn new(compressor: &'c dyn Compressor, compress: bool) -> Self {
        Self {
            compressor,
            compress,
            output: Vec::new(),
            pending: Vec::with_capacity(METADATA_BLOCK_SIZE),
        }
    }

    /// Where the next appended byte will land.
    pub fn position(&self) -> MetadataRef {
        MetadataRef::new(self.output.len() as u32, self.pending.len() as u16)
    }

    /// Append a record and return its starting reference.
    pub fn append(&mut self, mut record: &[u8]) -> Result<MetadataRef> {
        if self.output.len() > u32::MAX as usize - 2 * METADATA_BLOCK_SIZE {
            return Err(Error::Unsupported("metadata table larger than 4 GiB".into()));
        }
        let start = self.position();
        while !record.is_empty() {
            let room = METADATA_BLOCK_SIZE - self.pending.len();
            let take = room.min(record.len());
            self.pending.extend_from_slice(&record[..take]);
            record = &record[take..];
            if self.pending.len() == METADATA_BLOCK_SIZE {
                self.flush_block()?;
            }
        }
        Ok(start)
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let (stored, compressed) = if self.compress {
            compress_if_smaller(self.compressor, &self.pending)?
        } else {
            (self.pending.clone(), false)
        };
        let mut header = stored.len() as u16;
        if !compressed {
            header |= METADATA_UNCOMPRESSED;
        }
        trace!(
            "metadata block at {}: {} -> {} bytes",
            self.output.len(),
            self.pending.len(),
            stored.len()
        );
        self.output.extend_from_slice(&header.to_le_bytes());
        self.output.extend_from_slice(&stored);
        self.pending.clear();
        Ok(())
    }

    /// Flush the last partial block and return the table bytes.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        self.flush_block()?;
        Ok(self.output)
    }
}

/// Read and decode the metadata block at absolute position `pos`, which must
/// end at or before `limit`. Returns the payload and the stored block length
/// including its header.
pub(crate) fn read_metadata_block<B: Backend>(
    region: &Region<B>,
    compressor: &dyn Compressor,
    pos: u64,
    limit: u64,
) -> Result<(Vec<u8>, u64)> {
    if pos.checked_add(2).map_or(true, |end| end > limit) {
        return Err(Error::corrupt(format!(
            "metadata block at {pos} starts outside its table (ends at {limit})"
        )));
    }
    let mut header = [0u8; 2];
    region.read_exact_at(pos, &mut header)?;
    let header = u16::from_le_bytes(header);
    let len = (header & !METADATA_UNCOMPRESSED) as usize;
    if len == 0 || len > METADATA_BLOCK_SIZE {
        return Err(Error::corrupt(format!(
            "metadata block at {pos} has stored length {len}"
        )));
    }
    if pos + 2 + len as u64 > limit {
        return Err(Error::corrupt(format!(
            "metadata block at {pos} overruns its table"
        )));
    }
    let stored = region.read_vec(pos + 2, len)?;
    let data = if header & METADATA_UNCOMPRESSED != 0 {
        stored
    } else {
        compressor.decompress(&stored, METADATA_BLOCK_SIZE)?
    };
    Ok((data, 2 + len as u64))
}

/// Bounds of one metadata table inside the image.
pub(crate) struct MetadataTable<'a, B> {
    region: &'a Region<B>,
    compressor: &'a dyn Compressor,
    start: u64,
    end: u64,
}

impl<'a, B: Backend> MetadataTable<'a, B> {
    pub fn new(region: &'a Region<B>, compressor: &'a dyn Compressor, start: u64, end: u64) -> Self {
        Self {
            region,
            compressor,
            start,
            end,
        }
    }

    /// Open a record stream positioned at `at`.
    pub fn cursor(&self, at: MetadataRef) -> Result<MetadataCursor<'_, 'a, B>> {
        let (block, stored_len) = self.read_block(at.block as u64)?;
        if at.offset as usize > block.len() {
            return Err(Error::corrupt(format!(
                "offset {} beyond the {} bytes of metadata block {}",
                at.offset,
                block.len(),
                at.block
            )));
        }
        Ok(MetadataCursor {
            table: self,
            block,
            pos: at.offset as usize,
            next_block: at.block as u64 + stored_len,
        })
    }

    fn read_block(&self, relative: u64) -> Result<(Vec<u8>, u64)> {
        read_metadata_block(self.region, self.compressor, self.start + relative, self.end)
    }

    fn len(&self) -> u64 {
        self.end - self.start
    }
}

/// Sequential reader over a metadata table, crossing block boundaries as
/// needed.
pub(crate) struct MetadataCursor<'t, 'a, B> {
    table: &'t MetadataTable<'a, B>,
    block: Vec<u8>,
    pos: usize,
    next_block: u64,
}

impl<B: Backend> RecordRead for MetadataCursor<'_, '_, B> {
    fn read_into(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            if self.pos == self.block.len() {
                if self.next_block >= self.table.len() {
                    return Err(Error::corrupt("record runs past the end of its table"));
                }
                let (block, stored_len) = self.table.read_block(self.next_block)?;
                self.block = block;
                self.pos = 0;
                self.next_block += stored_len;
            }
            let take = (self.block.len() - self.pos).min(buf.len() - done);
            buf[done..done + take].copy_from_slice(&self.block[self.pos..self.pos + take]);
            self.pos += take;
            done += take;
        }
        Ok(())
    }
}

/// Write a lookup table (fragment entries, ids, export refs) at `offset`:
/// the entries packed into metadata blocks, followed by a u64 array of the
/// blocks' absolute positions. Returns the position of that array and the
/// end of the table.
pub(crate) fn write_lookup_table<B: Backend>(
    region: &mut Region<B>,
    compressor: &dyn Compressor,
    compress: bool,
    offset: u64,
    entries: &[u8],
) -> Result<(u64, u64)> {
    let mut pos = offset;
    let mut index = Vec::new();
    for chunk in entries.chunks(METADATA_BLOCK_SIZE) {
        let mut writer = MetadataWriter::new(compressor, compress);
        writer.append(chunk)?;
        let block = writer.finish()?;
        region.write_all_at(pos, &block)?;
        index.extend_from_slice(&pos.to_le_bytes());
        pos += block.len() as u64;
    }
    let index_start = pos;
    region.write_all_at(index_start, &index)?;
    Ok((index_start, index_start + index.len() as u64))
}

/// Block positions listed in a lookup table's index.
pub(crate) fn read_lookup_index<B: Backend>(
    region: &Region<B>,
    index_start: u64,
    count: usize,
    entry_size: usize,
    limit: u64,
) -> Result<Vec<u64>> {
    let blocks = (count * entry_size).div_ceil(METADATA_BLOCK_SIZE);
    let index_len = blocks as u64 * 8;
    if index_start.checked_add(index_len).map_or(true, |end| end > limit) {
        return Err(Error::corrupt(format!(
            "lookup index at {index_start} ({blocks} blocks) runs past {limit}"
        )));
    }
    let raw = region.read_vec(index_start, index_len as usize)?;
    let positions: Vec<u64> = raw
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect();
    if positions.iter().any(|&p| p >= index_start) {
        return Err(Error::corrupt("lookup table block positioned after its index"));
    }
    Ok(positions)
}

/// Fetch `count` entries of `entry_size` bytes through a lookup index.
pub(crate) fn read_lookup_table<B: Backend>(
    region: &Region<B>,
    compressor: &dyn Compressor,
    positions: &[u64],
    index_start: u64,
    count: usize,
    entry_size: usize,
) -> Result<Vec<u8>> {
    let wanted = count * entry_size;
    let mut data = Vec::with_capacity(wanted);
    for &pos in positions {
        let (block, _) = read_metadata_block(region, compressor, pos, index_start)?;
        data.extend_from_slice(&block);
    }
    if data.len() < wanted {
        return Err(Error::corrupt(format!(
            "lookup table holds {} bytes, expected {}",
            data.len(),
            wanted
        )));
    }
    data.truncate(wanted);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Gzip;

    #[test]
    fn test_records_straddle_blocks() {
        let gz = Gzip::default();
        let mut writer = MetadataWriter::new(&gz, true);
        let mut refs = Vec::new();
        for i in 0..1000u32 {
            let record = format!("record number {i:05} with some padding text;");
            refs.push((writer.append(record.as_bytes()).unwrap(), record));
        }
        let table = writer.finish().unwrap();
        assert!(refs.iter().all(|(r, _)| (r.offset as usize) < METADATA_BLOCK_SIZE));
        assert!(refs.iter().any(|(r, _)| r.block > 0));

        let region = Region::new(table.clone(), 0, 0);
        let reader = MetadataTable::new(&region, &gz, 0, table.len() as u64);
        for (r, record) in refs.iter().step_by(37) {
            let mut cursor = reader.cursor(*r).unwrap();
            let got = cursor.bytes(record.len()).unwrap();
            assert_eq!(got, record.as_bytes());
        }
    }

    #[test]
    fn test_uncompressed_blocks_are_flagged() {
        let gz = Gzip::default();
        let mut writer = MetadataWriter::new(&gz, false);
        writer.append(&[0u8; 100]).unwrap();
        let table = writer.finish().unwrap();
        let header = u16::from_le_bytes([table[0], table[1]]);
        assert_eq!(header, 100 | METADATA_UNCOMPRESSED);
        assert_eq!(table.len(), 102);
    }

    #[test]
    fn test_reads_past_table_end_are_corrupt() {
        let gz = Gzip::default();
        let mut writer = MetadataWriter::new(&gz, true);
        writer.append(b"short").unwrap();
        let table = writer.finish().unwrap();

        let region = Region::new(table.clone(), 0, 0);
        let reader = MetadataTable::new(&region, &gz, 0, table.len() as u64);
        let mut cursor = reader.cursor(MetadataRef::new(0, 0)).unwrap();
        assert!(matches!(cursor.bytes(6), Err(Error::CorruptTable(_))));
        assert!(matches!(
            reader.cursor(MetadataRef::new(table.len() as u32, 0)),
            Err(Error::CorruptTable(_))
        ));
        assert!(matches!(
            reader.cursor(MetadataRef::new(0, 100)),
            Err(Error::CorruptTable(_))
        ));
    }

    #[test]
    fn test_lookup_table_round_trip() {
        let gz = Gzip::default();
        let entries: Vec<u8> = (0..3000u32).flat_map(|i| i.to_le_bytes()).collect();
        let mut region = Region::new(vec![0u8; 64], 0, 0);
        let (index_start, end) = write_lookup_table(&mut region, &gz, true, 64, &entries).unwrap();
        assert_eq!(end - index_start, 16);

        let positions = read_lookup_index(&region, index_start, 3000, 4, end).unwrap();
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0], 64);
        let data = read_lookup_table(&region, &gz, &positions, index_start, 3000, 4).unwrap();
        assert_eq!(data, entries);
    }

    #[test]
    fn test_empty_lookup_table() {
        let gz = Gzip::default();
        let mut region = Region::new(Vec::new(), 0, 0);
        let (index_start, end) = write_lookup_table(&mut region, &gz, true, 0, &[]).unwrap();
        assert_eq!((index_start, end), (0, 0));
        assert!(read_lookup_index(&region, 0, 0, 16, 0).unwrap().is_empty());
    }
}
