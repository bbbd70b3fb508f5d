//! Read-only access to a finalized image.
//!
//! Opening an image parses the superblock and loads the small lookup tables
//! (ids, fragments, export). Inodes and directory listings are decoded on
//! demand from their metadata tables; file contents are decompressed one
//! block at a time.
//!
//! Table bounds used for every lookup:
//!
//!   data area        [96, inode_table_start)
//!   inode table      [inode_table_start, directory_table_start)
//!   directory table  [directory_table_start, first lookup table block)
//!   lookup tables    [..., bytes_used)

use crate::backend::{Backend, Region};
use crate::compression::Compressor;
use crate::data::FragmentEntry;
use crate::error::{Error, Result};
use crate::format::{
    decode_listing, DirRecord, DirectoryInode, EntryKind, FileInode, Inode, InodeBody,
    MetadataRef, RecordRead, Superblock, DATA_UNCOMPRESSED, DIR_SIZE_BIAS, EXPORT_ENTRY_SIZE,
    FRAGMENT_ENTRY_SIZE, ID_ENTRY_SIZE, SUPERBLOCK_SIZE,
};
use crate::metadata::{read_lookup_index, read_lookup_table, MetadataTable};
use log::{debug, trace};
use std::cell::RefCell;
use std::io::{self, Read, Seek, SeekFrom};

/// Symlink expansions allowed while resolving one path.
pub const MAX_SYMLINK_FOLLOWS: usize = 40;

/// Low 24 bits of a data block size word.
const SIZE_MASK: u32 = DATA_UNCOMPRESSED - 1;

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub inode_number: u32,
    inode: MetadataRef,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Location of the entry's inode record.
    pub fn inode_ref(&self) -> MetadataRef {
        self.inode
    }
}

impl From<DirRecord> for DirEntry {
    fn from(r: DirRecord) -> Self {
        Self {
            name: r.name,
            kind: r.kind,
            inode_number: r.inode_number,
            inode: r.inode,
        }
    }
}

/// Attributes of a resolved entry, with uid/gid looked up in the id table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub kind: EntryKind,
    pub size: u64,
    pub permissions: u16,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u32,
    pub inode_number: u32,
}

impl Metadata {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == EntryKind::Symlink
    }
}

/// An opened image. All reads take `&self`.
pub struct Image<B> {
    region: Region<B>,
    superblock: Superblock,
    compressor: Box<dyn Compressor>,
    ids: Vec<u32>,
    fragments: Vec<FragmentEntry>,
    export: Option<Vec<MetadataRef>>,
    directory_table_end: u64,
}

impl<B: Backend> Image<B> {
    /// Open an image stored at the start of `backend`.
    pub fn open(backend: B) -> Result<Self> {
        Self::open_at(backend, 0, 0)
    }

    /// Open an image stored at `start` inside `backend`. A `size` of 0
    /// means the image may extend to the end of the backend.
    pub fn open_at(backend: B, start: u64, size: u64) -> Result<Self> {
        let region = Region::new(backend, start, size);
        let available = region.size()?;
        if available < SUPERBLOCK_SIZE as u64 {
            return Err(Error::format(format!(
                "truncated superblock: {available} of {SUPERBLOCK_SIZE} bytes"
            )));
        }
        let superblock = Superblock::parse(&region.read_vec(0, SUPERBLOCK_SIZE)?)?;
        if superblock.bytes_used > available {
            return Err(Error::format(format!(
                "image claims {} bytes but only {} are available",
                superblock.bytes_used, available
            )));
        }
        let compressor = superblock.compression.compressor()?;
        debug!(
            "opened image: {} inodes, block size {}, {} compression, {} bytes used",
            superblock.inode_count,
            superblock.block_size,
            superblock.compression.name(),
            superblock.bytes_used
        );

        let sb = &superblock;
        let limit = sb.bytes_used;
        // Lookup tables follow the directory table; the first block of each
        // marks where the directory table can no longer extend.
        let mut floors = Vec::new();

        if sb.id_count == 0 {
            return Err(Error::corrupt("image has an empty id table"));
        }
        let id_count = sb.id_count as usize;
        let positions = read_lookup_index(&region, sb.id_table_start, id_count, ID_ENTRY_SIZE, limit)?;
        floors.extend(positions.first().copied());
        let raw = read_lookup_table(
            &region,
            compressor.as_ref(),
            &positions,
            sb.id_table_start,
            id_count,
            ID_ENTRY_SIZE,
        )?;
        let ids: Vec<u32> = raw
            .chunks_exact(ID_ENTRY_SIZE)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let mut fragments = Vec::new();
        if sb.fragment_count > 0 {
            let count = sb.fragment_count as usize;
            let positions = read_lookup_index(
                &region,
                sb.fragment_table_start,
                count,
                FRAGMENT_ENTRY_SIZE,
                limit,
            )?;
            floors.extend(positions.first().copied());
            let raw = read_lookup_table(
                &region,
                compressor.as_ref(),
                &positions,
                sb.fragment_table_start,
                count,
                FRAGMENT_ENTRY_SIZE,
            )?;
            fragments = raw
                .chunks_exact(FRAGMENT_ENTRY_SIZE)
                .map(FragmentEntry::decode)
                .collect();
        }

        let export = if sb.has_export_table() && sb.inode_count > 0 {
            let count = sb.inode_count as usize;
            let positions = read_lookup_index(
                &region,
                sb.export_table_start,
                count,
                EXPORT_ENTRY_SIZE,
                limit,
            )?;
            floors.extend(positions.first().copied());
            let raw = read_lookup_table(
                &region,
                compressor.as_ref(),
                &positions,
                sb.export_table_start,
                count,
                EXPORT_ENTRY_SIZE,
            )?;
            Some(
                raw.chunks_exact(EXPORT_ENTRY_SIZE)
                    .map(|c| {
                        MetadataRef::from_u64(u64::from_le_bytes([
                            c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7],
                        ]))
                    })
                    .collect(),
            )
        } else {
            None
        };

        if floors.iter().any(|&f| f < sb.directory_table_start) {
            return Err(Error::corrupt("lookup table overlaps the directory table"));
        }
        let directory_table_end = floors.into_iter().fold(limit, u64::min);

        Ok(Self {
            region,
            superblock,
            compressor,
            ids,
            fragments,
            export,
            directory_table_end,
        })
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn backend(&self) -> &B {
        self.region.get_ref()
    }

    pub fn into_backend(self) -> B {
        self.region.into_inner()
    }

    // ── Public operations ─────────────────────────────────────────────

    /// Entries of the directory at `path`, in stored order.
    pub fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let inode = self.resolve(path, true)?;
        match &inode.body {
            InodeBody::Directory(dir) => Ok(self
                .read_listing(dir)?
                .into_iter()
                .map(DirEntry::from)
                .collect()),
            _ => Err(Error::NotADirectory(path.to_string())),
        }
    }

    /// Attributes of `path`, following a final symlink.
    pub fn metadata(&self, path: &str) -> Result<Metadata> {
        let inode = self.resolve(path, true)?;
        self.describe(&inode)
    }

    /// Attributes of `path` itself, even when it is a symlink.
    pub fn symlink_metadata(&self, path: &str) -> Result<Metadata> {
        let inode = self.resolve(path, false)?;
        self.describe(&inode)
    }

    /// Open the regular file at `path` for reading, following symlinks.
    pub fn open_file(&self, path: &str) -> Result<FileReader<'_, B>> {
        let inode = self.resolve(path, true)?;
        let inode_number = inode.inode_number;
        match inode.body {
            InodeBody::File(file) => FileReader::new(self, file, inode_number),
            _ => Err(Error::TypeMismatch {
                path: path.to_string(),
                expected: "regular file",
            }),
        }
    }

    /// Whole content of the regular file at `path`.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let reader = self.open_file(path)?;
        let mut buf = vec![0u8; self.superblock.block_size as usize];
        let mut out = Vec::new();
        loop {
            let n = reader.read_at(out.len() as u64, &mut buf)?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// The literal target stored in the symlink at `path`.
    pub fn readlink(&self, path: &str) -> Result<String> {
        let inode = self.resolve(path, false)?;
        match inode.body {
            InodeBody::Symlink(link) => String::from_utf8(link.target)
                .map_err(|_| Error::corrupt(format!("symlink {path} has a non-UTF-8 target"))),
            _ => Err(Error::NotASymlink(path.to_string())),
        }
    }

    /// Look an inode up by number through the export table.
    pub fn inode_by_number(&self, number: u32) -> Result<Inode> {
        let export = self
            .export
            .as_ref()
            .ok_or_else(|| Error::NotFound(format!("inode {number}: image has no export table")))?;
        let at = number
            .checked_sub(1)
            .and_then(|i| export.get(i as usize))
            .ok_or_else(|| Error::NotFound(format!("inode {number}")))?;
        let inode = self.read_inode(*at)?;
        if inode.inode_number != number {
            return Err(Error::corrupt(format!(
                "export table entry {} points at inode {}",
                number, inode.inode_number
            )));
        }
        Ok(inode)
    }

    // ── Tables ────────────────────────────────────────────────────────

    fn read_inode(&self, at: MetadataRef) -> Result<Inode> {
        let sb = &self.superblock;
        let table = MetadataTable::new(
            &self.region,
            self.compressor.as_ref(),
            sb.inode_table_start,
            sb.directory_table_start,
        );
        let mut cursor = table.cursor(at)?;
        Inode::decode(&mut cursor, sb.block_size)
    }

    fn root(&self) -> Result<Inode> {
        let root = self.read_inode(self.superblock.root_inode)?;
        if !root.kind.is_dir() {
            return Err(Error::corrupt("root inode is not a directory"));
        }
        Ok(root)
    }

    fn read_listing(&self, dir: &DirectoryInode) -> Result<Vec<DirRecord>> {
        if dir.file_size < DIR_SIZE_BIAS {
            return Err(Error::corrupt(format!(
                "directory size {} is below the minimum",
                dir.file_size
            )));
        }
        let len = (dir.file_size - DIR_SIZE_BIAS) as u64;
        if len == 0 {
            return Ok(Vec::new());
        }
        let start = self.superblock.directory_table_start;
        // The cursor bounds every block read by the table end.
        let table = MetadataTable::new(
            &self.region,
            self.compressor.as_ref(),
            start,
            self.directory_table_end,
        );
        let mut cursor = table.cursor(MetadataRef::new(dir.start_block, dir.offset))?;
        let raw = cursor.bytes(len as usize)?;
        decode_listing(&raw)
    }

    fn id(&self, index: u16) -> Result<u32> {
        self.ids
            .get(index as usize)
            .copied()
            .ok_or_else(|| Error::corrupt(format!("id index {index} outside the id table")))
    }

    fn describe(&self, inode: &Inode) -> Result<Metadata> {
        Ok(Metadata {
            kind: inode.kind,
            size: inode.size(),
            permissions: inode.permissions,
            uid: self.id(inode.uid_index)?,
            gid: self.id(inode.gid_index)?,
            mtime: inode.mtime,
            inode_number: inode.inode_number,
        })
    }

    // ── Path resolution ───────────────────────────────────────────────

    /// Resolve `path` to an inode. Symlinks in intermediate positions are
    /// always expanded; a final symlink only when `follow_last` is set.
    fn resolve(&self, path: &str, follow_last: bool) -> Result<Inode> {
        // Directories from the root down to the current one.
        let mut stack = vec![self.root()?];
        // Segments still to walk, last one on top. The flag marks segments
        // that came out of a symlink target.
        let mut pending: Vec<(String, bool)> =
            components(path).rev().map(|s| (s.to_string(), false)).collect();
        let mut follows = 0;

        while let Some((segment, from_link)) = pending.pop() {
            let missing = |e: Error| {
                if from_link {
                    Error::BrokenSymlink(path.to_string())
                } else {
                    e
                }
            };
            if segment == ".." {
                if stack.len() > 1 {
                    stack.pop();
                }
                continue;
            }
            let listing = match stack.last().map(|d| &d.body) {
                Some(InodeBody::Directory(dir)) => self.read_listing(dir)?,
                _ => return Err(Error::corrupt("resolution stack holds a non-directory")),
            };
            let record = listing
                .into_iter()
                .find(|r| r.name == segment)
                .ok_or_else(|| missing(Error::NotFound(path.to_string())))?;
            let inode = self.read_inode(record.inode)?;
            let is_last = pending.is_empty();

            if let InodeBody::Symlink(link) = &inode.body {
                if follow_last || !is_last {
                    follows += 1;
                    if follows > MAX_SYMLINK_FOLLOWS {
                        return Err(Error::SymlinkLoop(path.to_string()));
                    }
                    let target = std::str::from_utf8(&link.target).map_err(|_| {
                        Error::corrupt(format!("symlink {segment} has a non-UTF-8 target"))
                    })?;
                    trace!("{path}: following {segment} -> {target}");
                    if target.is_empty() {
                        return Err(Error::BrokenSymlink(path.to_string()));
                    }
                    if target.starts_with('/') {
                        stack.truncate(1);
                    }
                    pending.extend(components(target).rev().map(|s| (s.to_string(), true)));
                    continue;
                }
            }
            if inode.kind.is_dir() {
                stack.push(inode);
            } else if is_last {
                return Ok(inode);
            } else if from_link && pending.last().is_some_and(|(_, next)| *next) {
                // The target itself walks through a non-directory.
                return Err(Error::BrokenSymlink(path.to_string()));
            } else {
                return Err(Error::NotADirectory(path.to_string()));
            }
        }

        stack
            .pop()
            .ok_or_else(|| Error::corrupt("resolution stack is empty"))
    }
}

/// Path segments, skipping empty and "." ones. ".." is kept.
fn components(path: &str) -> impl DoubleEndedIterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty() && *s != ".")
}

// ── File reads ────────────────────────────────────────────────────────

/// A readable regular file. Supports positioned reads through
/// [`FileReader::read_at`] and sequential ones through [`Read`]/[`Seek`].
pub struct FileReader<'a, B> {
    image: &'a Image<B>,
    inode: FileInode,
    inode_number: u32,
    /// Absolute position of each data block.
    offsets: Vec<u64>,
    pos: u64,
    /// Last decoded block, by block index.
    cache: RefCell<Option<(u64, Vec<u8>)>>,
}

impl<'a, B: Backend> FileReader<'a, B> {
    fn new(image: &'a Image<B>, inode: FileInode, inode_number: u32) -> Result<Self> {
        let sb = &image.superblock;
        let mut offsets = Vec::with_capacity(inode.block_sizes.len());
        let mut at = inode.blocks_start;
        for &word in &inode.block_sizes {
            let stored = (word & SIZE_MASK) as u64;
            if stored > sb.block_size as u64 {
                return Err(Error::corrupt(format!(
                    "inode {inode_number}: data block of {stored} bytes exceeds the block size"
                )));
            }
            offsets.push(at);
            at = at.checked_add(stored).ok_or_else(|| {
                Error::corrupt(format!("inode {inode_number}: data blocks overflow the image"))
            })?;
        }
        if at > sb.inode_table_start {
            return Err(Error::corrupt(format!(
                "inode {inode_number}: data blocks run into the inode table"
            )));
        }
        if inode.has_fragment() && inode.fragment as usize >= image.fragments.len() {
            return Err(Error::corrupt(format!(
                "inode {inode_number}: fragment {} outside the fragment table",
                inode.fragment
            )));
        }
        Ok(Self {
            image,
            inode,
            inode_number,
            offsets,
            pos: 0,
            cache: RefCell::new(None),
        })
    }

    pub fn size(&self) -> u64 {
        self.inode.file_size
    }

    pub fn inode_number(&self) -> u32 {
        self.inode_number
    }

    /// Read into `buf` starting at `offset`. Returns 0 only at or past end
    /// of file; fewer bytes than requested means the end was reached.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let size = self.size();
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min((size - offset).min(usize::MAX as u64) as usize);
        let block_size = self.image.superblock.block_size as u64;
        let mut done = 0;
        while done < want {
            let pos = offset + done as u64;
            let index = pos / block_size;
            let within = (pos % block_size) as usize;
            let n = self.with_block(index, |block| {
                if within >= block.len() {
                    return Err(Error::corrupt(format!(
                        "inode {}: block {index} holds {} bytes, needed offset {within}",
                        self.inode_number,
                        block.len()
                    )));
                }
                let take = (block.len() - within).min(want - done);
                buf[done..done + take].copy_from_slice(&block[within..within + take]);
                Ok(take)
            })?;
            done += n;
        }
        Ok(want)
    }

    fn with_block<T>(&self, index: u64, f: impl FnOnce(&[u8]) -> Result<T>) -> Result<T> {
        let mut cache = self.cache.borrow_mut();
        if let Some((cached, block)) = cache.as_ref() {
            if *cached == index {
                return f(block.as_slice());
            }
        }
        let block = self.load_block(index)?;
        let result = f(block.as_slice());
        *cache = Some((index, block));
        result
    }

    /// Logical content of block `index`: a data block, or the tail held in
    /// the file's fragment.
    fn load_block(&self, index: u64) -> Result<Vec<u8>> {
        let sb = &self.image.superblock;
        let block_size = sb.block_size as u64;
        let expected = (self.size() - index * block_size).min(block_size) as usize;

        if let Some(&word) = self.inode.block_sizes.get(index as usize) {
            if word == 0 {
                return Ok(vec![0; expected]);
            }
            let data = self.read_stored(self.offsets[index as usize], word)?;
            if data.len() != expected {
                return Err(Error::corrupt(format!(
                    "inode {}: block {index} decoded to {} bytes, expected {expected}",
                    self.inode_number,
                    data.len()
                )));
            }
            return Ok(data);
        }

        if !self.inode.has_fragment() {
            return Err(Error::corrupt(format!(
                "inode {}: block {index} is past the stored blocks and there is no fragment",
                self.inode_number
            )));
        }
        let entry = self.image.fragments[self.inode.fragment as usize];
        let fragment = self.read_stored(entry.start, entry.size)?;
        let start = self.inode.fragment_offset as usize;
        let end = start + expected;
        if end > fragment.len() {
            return Err(Error::corrupt(format!(
                "inode {}: tail {start}..{end} outside fragment {} of {} bytes",
                self.inode_number,
                self.inode.fragment,
                fragment.len()
            )));
        }
        Ok(fragment[start..end].to_vec())
    }

    /// Read and decode one stored block described by a size word.
    fn read_stored(&self, at: u64, word: u32) -> Result<Vec<u8>> {
        let sb = &self.image.superblock;
        let stored = (word & SIZE_MASK) as usize;
        if at < SUPERBLOCK_SIZE as u64
            || at.checked_add(stored as u64).map_or(true, |end| end > sb.inode_table_start)
        {
            return Err(Error::corrupt(format!(
                "data block at {at} ({stored} bytes) lies outside the data area"
            )));
        }
        let raw = self.image.region.read_vec(at, stored)?;
        if word & DATA_UNCOMPRESSED != 0 {
            Ok(raw)
        } else {
            self.image
                .compressor
                .decompress(&raw, sb.block_size as usize)
        }
    }
}

impl<B: Backend> Read for FileReader<'_, B> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<B: Backend> Seek for FileReader<'_, B> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(d) => self.size().checked_add_signed(d),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
        };
        match target {
            Some(n) => {
                self.pos = n;
                Ok(n)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finalize::{FinalizeOptions, ImageBuilder};
    use crate::format::MAGIC;

    fn build(f: impl FnOnce(&mut ImageBuilder<Vec<u8>>)) -> Vec<u8> {
        let mut builder = ImageBuilder::create(Vec::new(), 4096).unwrap();
        f(&mut builder);
        builder.finalize(&FinalizeOptions::default()).unwrap();
        builder.into_backend()
    }

    fn sample() -> Vec<u8> {
        build(|b| {
            b.mkdir("/docs/old").unwrap();
            b.write_file("/docs/readme.txt", b"hello\n").unwrap();
            b.write_file("/empty", b"").unwrap();
            b.symlink("docs/readme.txt", "/readme").unwrap();
            b.symlink("/docs", "/d").unwrap();
            b.symlink("nowhere", "/dangling").unwrap();
            b.set_owner("/docs/readme.txt", 1000, 100).unwrap();
            b.set_permissions("/docs/readme.txt", 0o600).unwrap();
        })
    }

    fn names(entries: &[DirEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn test_list_root_and_subdir() {
        let image = Image::open(sample()).unwrap();
        let root = image.read_dir("/").unwrap();
        assert_eq!(names(&root), ["d", "dangling", "docs", "empty", "readme"]);
        let docs = image.read_dir("/docs").unwrap();
        assert_eq!(names(&docs), ["old", "readme.txt"]);
        assert!(docs[0].is_dir());
        assert!(image.read_dir("/docs/old").unwrap().is_empty());
    }

    #[test]
    fn test_paths_are_normalized() {
        let image = Image::open(sample()).unwrap();
        assert_eq!(image.read_file("docs//./readme.txt").unwrap(), b"hello\n");
        assert_eq!(image.read_file("/docs/old/../readme.txt").unwrap(), b"hello\n");
        assert_eq!(image.read_dir("").unwrap().len(), 5);
    }

    #[test]
    fn test_metadata_and_ids() {
        let image = Image::open(sample()).unwrap();
        let meta = image.metadata("/readme").unwrap();
        assert!(meta.is_file());
        assert_eq!(meta.size, 6);
        assert_eq!(meta.uid, 1000);
        assert_eq!(meta.gid, 100);
        assert_eq!(meta.permissions, 0o600);

        let link = image.symlink_metadata("/readme").unwrap();
        assert!(link.is_symlink());
        assert_eq!(link.size, "docs/readme.txt".len() as u64);

        let root = image.metadata("/").unwrap();
        assert!(root.is_dir());
        assert_eq!(root.inode_number, image.superblock().inode_count);
    }

    #[test]
    fn test_symlinks() {
        let image = Image::open(sample()).unwrap();
        assert_eq!(image.readlink("/readme").unwrap(), "docs/readme.txt");
        assert_eq!(image.read_file("/readme").unwrap(), b"hello\n");
        assert_eq!(image.read_file("/d/readme.txt").unwrap(), b"hello\n");
        assert_eq!(names(&image.read_dir("/d").unwrap()), ["old", "readme.txt"]);

        assert_eq!(image.readlink("/dangling").unwrap(), "nowhere");
        assert!(matches!(image.open_file("/dangling"), Err(Error::BrokenSymlink(_))));
        assert!(matches!(image.read_dir("/dangling"), Err(Error::BrokenSymlink(_))));
        assert!(matches!(image.readlink("/docs"), Err(Error::NotASymlink(_))));
        // A missing entry after a valid link is a plain miss.
        assert!(matches!(image.open_file("/d/missing"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_symlink_loop() {
        let image = Image::open(build(|b| {
            b.symlink("b", "/a").unwrap();
            b.symlink("a", "/b").unwrap();
            b.symlink("self/x", "/self").unwrap();
        }))
        .unwrap();
        assert!(matches!(image.open_file("/a"), Err(Error::SymlinkLoop(_))));
        assert!(matches!(image.read_dir("/self"), Err(Error::SymlinkLoop(_))));
        assert_eq!(image.readlink("/a").unwrap(), "b");
    }

    #[test]
    fn test_type_errors() {
        let image = Image::open(sample()).unwrap();
        assert!(matches!(image.open_file("/docs"), Err(Error::TypeMismatch { .. })));
        assert!(matches!(image.read_dir("/empty"), Err(Error::NotADirectory(_))));
        assert!(matches!(image.open_file("/empty/x"), Err(Error::NotADirectory(_))));
        assert!(matches!(image.open_file("/nope"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_read_at_eof_semantics() {
        let image = Image::open(sample()).unwrap();
        let file = image.open_file("/docs/readme.txt").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(file.read_at(0, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"hell");
        assert_eq!(file.read_at(4, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"o\n");
        assert_eq!(file.read_at(6, &mut buf).unwrap(), 0);
        assert_eq!(file.read_at(600, &mut buf).unwrap(), 0);

        let empty = image.open_file("/empty").unwrap();
        assert_eq!(empty.size(), 0);
        assert_eq!(empty.read_at(0, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_read_and_seek() {
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let image = Image::open(build(|b| b.write_file("/f", &data).unwrap())).unwrap();
        let mut file = image.open_file("/f").unwrap();

        file.seek(SeekFrom::Start(4090)).unwrap();
        let mut buf = [0u8; 12];
        file.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, &data[4090..4102]);

        file.seek(SeekFrom::End(-5)).unwrap();
        let mut tail = Vec::new();
        file.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, &data[data.len() - 5..]);

        assert!(file.seek(SeekFrom::Current(-100_000)).is_err());
    }

    #[test]
    fn test_list_root_with_two_small_entries() {
        let image = Image::open(build(|b| {
            b.write_file("/f", b"x").unwrap();
            b.symlink("f", "/l").unwrap();
        }))
        .unwrap();
        let root = image.read_dir("/").unwrap();
        assert_eq!(names(&root), ["f", "l"]);
        assert_eq!(image.read_file("/l").unwrap(), b"x");
    }

    #[test]
    fn test_path_through_link_to_file() {
        let image = Image::open(build(|b| {
            b.write_file("/file", b"data").unwrap();
            b.symlink("file", "/to-file").unwrap();
            b.symlink("file/inner", "/through-file").unwrap();
        }))
        .unwrap();
        assert!(matches!(image.open_file("/to-file/child"), Err(Error::NotADirectory(_))));
        assert!(matches!(image.read_dir("/to-file"), Err(Error::NotADirectory(_))));
        assert!(matches!(image.open_file("/through-file"), Err(Error::BrokenSymlink(_))));
    }

    #[test]
    fn test_block_offsets_overflow_is_corrupt() {
        let image = Image::open(sample()).unwrap();
        let inode = FileInode {
            blocks_start: u64::MAX - 10,
            file_size: 8192,
            sparse: 0,
            link_count: 1,
            fragment: crate::format::NO_FRAGMENT,
            fragment_offset: 0,
            xattr: crate::format::NO_XATTR,
            block_sizes: vec![4096, 4096],
        };
        assert!(matches!(FileReader::new(&image, inode, 1), Err(Error::CorruptTable(_))));
    }

    #[test]
    fn test_inode_by_number() {
        let image = Image::open(sample()).unwrap();
        let count = image.superblock().inode_count;
        let root = image.inode_by_number(count).unwrap();
        assert!(root.kind.is_dir());
        for entry in image.read_dir("/docs").unwrap() {
            let inode = image.inode_by_number(entry.inode_number).unwrap();
            assert_eq!(inode.kind, entry.kind);
        }
        assert!(matches!(image.inode_by_number(0), Err(Error::NotFound(_))));
        assert!(matches!(image.inode_by_number(count + 1), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_rejects_bad_headers() {
        assert!(matches!(Image::open(vec![0u8; 10]), Err(Error::InvalidFormat(_))));

        let mut bad_magic = sample();
        bad_magic[0] ^= 0xFF;
        assert!(matches!(Image::open(bad_magic), Err(Error::InvalidFormat(_))));

        let mut bad_version = sample();
        bad_version[28] = 3;
        assert!(matches!(Image::open(bad_version), Err(Error::InvalidFormat(_))));

        let mut truncated = sample();
        let sb = Superblock::parse(&truncated).unwrap();
        truncated.truncate(sb.bytes_used as usize - 1);
        assert!(matches!(Image::open(truncated), Err(Error::InvalidFormat(_))));

        assert_eq!(
            u32::from_le_bytes([b'h', b's', b'q', b's']),
            MAGIC
        );
    }

    #[test]
    fn test_corrupt_root_reference() {
        let mut image = sample();
        // Point the root inode at a block far past the inode table.
        image[32..40].copy_from_slice(&(0x7FFF_0000u64 << 16).to_le_bytes());
        let opened = Image::open(image).unwrap();
        assert!(matches!(opened.read_dir("/"), Err(Error::CorruptTable(_))));
    }

    #[test]
    fn test_image_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Image<Vec<u8>>>();
        assert_send_sync::<Image<std::fs::File>>();
    }
}
