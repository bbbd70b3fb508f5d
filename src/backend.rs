//! Byte storage the engine reads images from and writes images to.
//!
//! The engine never assumes it owns the whole device: every access goes
//! through a [`Region`], which adds a base offset and an optional size limit
//! so an image can live inside a larger container (a partition, a disk
//! image, an archive).

use crate::error::{Error, Result};
use std::fs::File;
use std::io;

/// Positioned byte storage.
///
/// Reads take `&self` so a finalized image can be shared between readers
/// when the storage supports concurrent positioned reads (files do).
pub trait Backend {
    /// Read up to `buf.len()` bytes at `offset`, returning the count read.
    /// Returns `Ok(0)` at end of storage.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Write `buf` at `offset`, returning the count written.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize>;

    /// Current length of the storage in bytes.
    fn len(&self) -> io::Result<u64>;
}

impl Backend for File {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        #[cfg(unix)]
        {
            std::os::unix::fs::FileExt::read_at(self, buf, offset)
        }
        #[cfg(windows)]
        {
            std::os::windows::fs::FileExt::seek_read(self, buf, offset)
        }
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        #[cfg(unix)]
        {
            std::os::unix::fs::FileExt::write_at(self, buf, offset)
        }
        #[cfg(windows)]
        {
            std::os::windows::fs::FileExt::seek_write(self, buf, offset)
        }
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

/// In-memory storage. Writes past the end grow the buffer.
impl Backend for Vec<u8> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= Vec::len(self) {
            return Ok(0);
        }
        let n = buf.len().min(Vec::len(self) - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset too large"))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "offset too large"))?;
        // `self.len()` would pick `<&mut Vec<u8> as Backend>::len` here.
        if Vec::len(self) < end {
            self.resize(end, 0);
        }
        self[start..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn len(&self) -> io::Result<u64> {
        Ok(Vec::len(self) as u64)
    }
}

impl<B: Backend + ?Sized> Backend for &mut B {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        (**self).write_at(offset, buf)
    }

    fn len(&self) -> io::Result<u64> {
        (**self).len()
    }
}

/// A window of a [`Backend`]: offsets are relative to `start` and bounded
/// by `size` when one was declared.
#[derive(Debug)]
pub struct Region<B> {
    inner: B,
    start: u64,
    size: Option<u64>,
}

impl<B: Backend> Region<B> {
    /// `size` of `0` means "unbounded": the window extends to the end of the
    /// storage and may grow on write.
    pub fn new(inner: B, start: u64, size: u64) -> Self {
        Self {
            inner,
            start,
            size: (size > 0).then_some(size),
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    /// Declared size, or the bytes available past `start` when unbounded.
    pub fn size(&self) -> Result<u64> {
        match self.size {
            Some(size) => Ok(size),
            None => Ok(self.inner.len()?.saturating_sub(self.start)),
        }
    }

    pub fn get_ref(&self) -> &B {
        &self.inner
    }

    pub fn into_inner(self) -> B {
        self.inner
    }

    /// Fill `buf` from `offset`, failing on a short read.
    pub fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, buf.len())?;
        let mut done = 0;
        while done < buf.len() {
            let n = self
                .inner
                .read_at(self.start + offset + done as u64, &mut buf[done..])?;
            if n == 0 {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "short read at offset {}: wanted {} bytes, got {}",
                        offset,
                        buf.len(),
                        done
                    ),
                )));
            }
            done += n;
        }
        Ok(())
    }

    pub fn read_vec(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }

    pub fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_bounds(offset, buf.len())?;
        let mut done = 0;
        while done < buf.len() {
            let n = self
                .inner
                .write_at(self.start + offset + done as u64, &buf[done..])?;
            if n == 0 {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("backend accepted no bytes at offset {}", offset + done as u64),
                )));
            }
            done += n;
        }
        Ok(())
    }

    fn check_bounds(&self, offset: u64, len: usize) -> Result<()> {
        if let Some(size) = self.size {
            let end = offset.checked_add(len as u64);
            if end.map_or(true, |end| end > size) {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "access of {} bytes at offset {} exceeds region size {}",
                        len, offset, size
                    ),
                )));
            }
        }
        Ok(())
    }
}
