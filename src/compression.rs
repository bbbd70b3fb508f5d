//! Block codecs.
//!
//! Every compressed unit in an image (data block, fragment block, metadata
//! block) goes through a [`Compressor`]. The algorithm is selected once per
//! image and persisted in the superblock as a [`CompressionId`].

use crate::error::{Error, Result};
use std::io::{Read, Write};

/// Compression algorithm identifiers as stored in the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionId {
    Gzip,
    Lzma,
    Lzo,
    Xz,
    Lz4,
    Zstd,
}

impl CompressionId {
    pub fn from_u16(id: u16) -> Option<Self> {
        match id {
            1 => Some(Self::Gzip),
            2 => Some(Self::Lzma),
            3 => Some(Self::Lzo),
            4 => Some(Self::Xz),
            5 => Some(Self::Lz4),
            6 => Some(Self::Zstd),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            Self::Gzip => 1,
            Self::Lzma => 2,
            Self::Lzo => 3,
            Self::Xz => 4,
            Self::Lz4 => 5,
            Self::Zstd => 6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Lzma => "lzma",
            Self::Lzo => "lzo",
            Self::Xz => "xz",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "gzip" | "zlib" => Some(Self::Gzip),
            "lzma" => Some(Self::Lzma),
            "lzo" => Some(Self::Lzo),
            "xz" => Some(Self::Xz),
            "lz4" => Some(Self::Lz4),
            "zstd" => Some(Self::Zstd),
            _ => None,
        }
    }

    /// Instantiate the codec for this id with its default level.
    pub fn compressor(self) -> Result<Box<dyn Compressor>> {
        match self {
            Self::Gzip => Ok(Box::new(Gzip::default())),
            #[cfg(feature = "zstd")]
            Self::Zstd => Ok(Box::new(Zstd::default())),
            other => Err(Error::Unsupported(format!(
                "{} compression is not built into this binary",
                other.name()
            ))),
        }
    }
}

impl Default for CompressionId {
    fn default() -> Self {
        Self::Gzip
    }
}

/// A block codec.
pub trait Compressor: Send + Sync {
    fn id(&self) -> CompressionId;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress `data`, producing at most `max_size` bytes. Output that
    /// would exceed `max_size` is a [`Error::CorruptTable`].
    fn decompress(&self, data: &[u8], max_size: usize) -> Result<Vec<u8>>;
}

/// zlib-framed deflate, which is what the format calls "gzip".
pub struct Gzip {
    level: u32,
}

impl Gzip {
    pub fn new(level: u32) -> Self {
        Self { level: level.min(9) }
    }
}

impl Default for Gzip {
    fn default() -> Self {
        Self::new(9)
    }
}

impl Compressor for Gzip {
    fn id(&self) -> CompressionId {
        CompressionId::Gzip
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = flate2::write::ZlibEncoder::new(
            Vec::with_capacity(data.len() / 2),
            flate2::Compression::new(self.level),
        );
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    fn decompress(&self, data: &[u8], max_size: usize) -> Result<Vec<u8>> {
        let decoder = flate2::read::ZlibDecoder::new(data);
        let mut out = Vec::with_capacity(max_size);
        decoder
            .take(max_size as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| Error::corrupt(format!("zlib stream: {e}")))?;
        if out.len() > max_size {
            return Err(Error::corrupt(format!(
                "block decompressed past its {max_size} byte limit"
            )));
        }
        Ok(out)
    }
}

#[cfg(feature = "zstd")]
pub struct Zstd {
    level: i32,
}

#[cfg(feature = "zstd")]
impl Default for Zstd {
    fn default() -> Self {
        Self {
            level: zstd::DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

#[cfg(feature = "zstd")]
impl Compressor for Zstd {
    fn id(&self) -> CompressionId {
        CompressionId::Zstd
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(zstd::bulk::compress(data, self.level)?)
    }

    fn decompress(&self, data: &[u8], max_size: usize) -> Result<Vec<u8>> {
        zstd::bulk::decompress(data, max_size)
            .map_err(|e| Error::corrupt(format!("zstd frame: {e}")))
    }
}

/// Compress `data` unless the result would not be strictly smaller.
/// Returns the stored bytes and whether they are compressed.
pub(crate) fn compress_if_smaller(
    compressor: &dyn Compressor,
    data: &[u8],
) -> Result<(Vec<u8>, bool)> {
    let compressed = compressor.compress(data)?;
    if compressed.len() < data.len() {
        Ok((compressed, true))
    } else {
        Ok((data.to_vec(), false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_round_trip() {
        let gz = Gzip::default();
        let data = b"squash squash squash squash squash squash".repeat(20);
        let packed = gz.compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(gz.decompress(&packed, data.len()).unwrap(), data);
    }

    #[test]
    fn test_gzip_rejects_oversized_output() {
        let gz = Gzip::default();
        let data = vec![7u8; 1000];
        let packed = gz.compress(&data).unwrap();
        assert!(matches!(
            gz.decompress(&packed, 999),
            Err(Error::CorruptTable(_))
        ));
    }

    #[test]
    fn test_gzip_rejects_garbage() {
        let gz = Gzip::default();
        assert!(matches!(
            gz.decompress(b"definitely not zlib", 4096),
            Err(Error::CorruptTable(_))
        ));
    }

    #[test]
    fn test_incompressible_block_is_stored_raw() {
        let gz = Gzip::default();
        let data: Vec<u8> = (0..64u32).map(|i| (i * 97 % 251) as u8).collect();
        let (stored, compressed) = compress_if_smaller(&gz, &data).unwrap();
        assert!(!compressed);
        assert_eq!(stored, data);

        let zeros = vec![0u8; 4096];
        let (stored, compressed) = compress_if_smaller(&gz, &zeros).unwrap();
        assert!(compressed);
        assert!(stored.len() < zeros.len());
    }

    #[test]
    fn test_compression_ids() {
        for id in 1..=6u16 {
            let parsed = CompressionId::from_u16(id).unwrap();
            assert_eq!(parsed.as_u16(), id);
            assert_eq!(CompressionId::from_name(parsed.name()), Some(parsed));
        }
        assert_eq!(CompressionId::from_u16(0), None);
        assert!(matches!(
            CompressionId::Lzo.compressor(),
            Err(Error::Unsupported(_))
        ));
    }
}
