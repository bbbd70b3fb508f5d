//! On-disk layout: constants, the superblock, inode records and directory
//! listings.
//!
//! Layout (all integers little-endian):
//!   Offset 0:       Superblock (96 bytes)
//!   Offset 96:      Data blocks and fragment blocks, in file-processing order
//!   ...             Inode table (metadata blocks)
//!   ...             Directory table (metadata blocks)
//!   ...             Fragment table (entry blocks, then u64 block index)
//!   ...             Export table (entry blocks, then u64 block index)
//!   ...             Id table (entry blocks, then u64 block index)
//!   Zero padding up to a 4 KiB boundary.

use crate::compression::CompressionId;
use crate::error::{Error, Result};

pub const MAGIC: u32 = 0x7371_7368; // "hsqs"
pub const VERSION_MAJOR: u16 = 4;
pub const VERSION_MINOR: u16 = 0;
pub const SUPERBLOCK_SIZE: usize = 96;

pub const MIN_BLOCK_SIZE: u32 = 4 * 1024;
pub const MAX_BLOCK_SIZE: u32 = 1024 * 1024;
pub const DEFAULT_BLOCK_SIZE: u32 = 128 * 1024;

/// Uncompressed capacity of one metadata block.
pub const METADATA_BLOCK_SIZE: usize = 8192;
/// Metadata block header bit: payload stored uncompressed.
pub const METADATA_UNCOMPRESSED: u16 = 0x8000;
/// Data/fragment size word bit: payload stored uncompressed.
pub const DATA_UNCOMPRESSED: u32 = 1 << 24;

pub const NO_FRAGMENT: u32 = 0xFFFF_FFFF;
pub const NO_XATTR: u32 = 0xFFFF_FFFF;
pub const NO_TABLE: u64 = u64::MAX;

/// Maximum entries under one directory run header.
pub const DIR_RUN_MAX: usize = 256;
/// Directory `file_size` counts the implicit "." and ".." entries as 3 bytes.
pub const DIR_SIZE_BIAS: u32 = 3;

/// The finished image is padded to a multiple of this.
pub const IMAGE_ALIGN: u64 = 4096;

pub const FRAGMENT_ENTRY_SIZE: usize = 16;
pub const ID_ENTRY_SIZE: usize = 4;
pub const EXPORT_ENTRY_SIZE: usize = 8;
/// Longest symlink target accepted on either side.
pub const MAX_SYMLINK_LEN: usize = 4096;

/// Superblock flag bits.
pub mod flags {
    pub const UNCOMPRESSED_INODES: u16 = 0x0001;
    pub const UNCOMPRESSED_DATA: u16 = 0x0002;
    pub const UNCOMPRESSED_FRAGMENTS: u16 = 0x0008;
    pub const NO_FRAGMENTS: u16 = 0x0010;
    pub const ALWAYS_FRAGMENTS: u16 = 0x0020;
    pub const EXPORTABLE: u16 = 0x0080;
    pub const NO_XATTRS: u16 = 0x0200;
    pub const COMPRESSOR_OPTIONS: u16 = 0x0400;
}

// Inode type codes
const BASIC_DIR: u16 = 1;
const BASIC_FILE: u16 = 2;
const BASIC_SYMLINK: u16 = 3;
const BASIC_BLOCK_DEV: u16 = 4;
const BASIC_CHAR_DEV: u16 = 5;
const BASIC_FIFO: u16 = 6;
const BASIC_SOCKET: u16 = 7;
const EXT_DIR: u16 = 8;
const EXT_FILE: u16 = 9;
const EXT_SYMLINK: u16 = 10;
const EXT_BLOCK_DEV: u16 = 11;
const EXT_CHAR_DEV: u16 = 12;
const EXT_FIFO: u16 = 13;
const EXT_SOCKET: u16 = 14;

/// Location of a record in the inode or directory table: the byte position
/// of its metadata block relative to the table start, and the byte offset
/// inside the uncompressed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MetadataRef {
    pub block: u32,
    pub offset: u16,
}

impl MetadataRef {
    pub fn new(block: u32, offset: u16) -> Self {
        Self { block, offset }
    }

    pub fn from_u64(raw: u64) -> Self {
        Self {
            block: (raw >> 16) as u32,
            offset: (raw & 0xFFFF) as u16,
        }
    }

    pub fn to_u64(self) -> u64 {
        ((self.block as u64) << 16) | self.offset as u64
    }
}

/// Kind of a directory entry or inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Directory,
    File,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl EntryKind {
    /// The basic inode type code, which is what directory entries store.
    pub fn type_code(self) -> u16 {
        match self {
            EntryKind::Directory => BASIC_DIR,
            EntryKind::File => BASIC_FILE,
            EntryKind::Symlink => BASIC_SYMLINK,
            EntryKind::BlockDevice => BASIC_BLOCK_DEV,
            EntryKind::CharDevice => BASIC_CHAR_DEV,
            EntryKind::Fifo => BASIC_FIFO,
            EntryKind::Socket => BASIC_SOCKET,
        }
    }

    /// Accepts both basic and extended type codes.
    pub fn from_type_code(code: u16) -> Option<Self> {
        match code {
            BASIC_DIR | EXT_DIR => Some(EntryKind::Directory),
            BASIC_FILE | EXT_FILE => Some(EntryKind::File),
            BASIC_SYMLINK | EXT_SYMLINK => Some(EntryKind::Symlink),
            BASIC_BLOCK_DEV | EXT_BLOCK_DEV => Some(EntryKind::BlockDevice),
            BASIC_CHAR_DEV | EXT_CHAR_DEV => Some(EntryKind::CharDevice),
            BASIC_FIFO | EXT_FIFO => Some(EntryKind::Fifo),
            BASIC_SOCKET | EXT_SOCKET => Some(EntryKind::Socket),
            _ => None,
        }
    }

    pub fn is_dir(self) -> bool {
        self == EntryKind::Directory
    }
}

// ── Little-endian helpers ─────────────────────────────────────────────

pub(crate) fn write_le16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_le32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_le64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn read_le16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn read_le32(buf: &[u8], offset: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(b)
}

fn read_le64(buf: &[u8], offset: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(b)
}

/// Sequential little-endian decoding from a record stream that may span
/// several metadata blocks.
pub(crate) trait RecordRead {
    fn read_into(&mut self, buf: &mut [u8]) -> Result<()>;

    fn u16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.read_into(&mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    fn i16(&mut self) -> Result<i16> {
        let mut b = [0u8; 2];
        self.read_into(&mut b)?;
        Ok(i16::from_le_bytes(b))
    }

    fn u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read_into(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        self.read_into(&mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    fn bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut b = vec![0u8; len];
        self.read_into(&mut b)?;
        Ok(b)
    }
}

impl RecordRead for &[u8] {
    fn read_into(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.len() < buf.len() {
            return Err(Error::corrupt(format!(
                "record truncated: wanted {} bytes, {} left",
                buf.len(),
                self.len()
            )));
        }
        let (head, tail) = self.split_at(buf.len());
        buf.copy_from_slice(head);
        *self = tail;
        Ok(())
    }
}

// ── Superblock ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub inode_count: u32,
    pub modification_time: u32,
    pub block_size: u32,
    pub fragment_count: u32,
    pub compression: CompressionId,
    pub block_log: u16,
    pub flags: u16,
    pub id_count: u16,
    pub root_inode: MetadataRef,
    pub bytes_used: u64,
    pub id_table_start: u64,
    pub xattr_table_start: u64,
    pub inode_table_start: u64,
    pub directory_table_start: u64,
    pub fragment_table_start: u64,
    pub export_table_start: u64,
}

impl Superblock {
    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    pub fn has_export_table(&self) -> bool {
        self.export_table_start != NO_TABLE
    }

    pub fn to_bytes(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut sb = [0u8; SUPERBLOCK_SIZE];
        write_le32(&mut sb, 0, MAGIC);
        write_le32(&mut sb, 4, self.inode_count);
        write_le32(&mut sb, 8, self.modification_time);
        write_le32(&mut sb, 12, self.block_size);
        write_le32(&mut sb, 16, self.fragment_count);
        write_le16(&mut sb, 20, self.compression.as_u16());
        write_le16(&mut sb, 22, self.block_log);
        write_le16(&mut sb, 24, self.flags);
        write_le16(&mut sb, 26, self.id_count);
        write_le16(&mut sb, 28, VERSION_MAJOR);
        write_le16(&mut sb, 30, VERSION_MINOR);
        write_le64(&mut sb, 32, self.root_inode.to_u64());
        write_le64(&mut sb, 40, self.bytes_used);
        write_le64(&mut sb, 48, self.id_table_start);
        write_le64(&mut sb, 56, self.xattr_table_start);
        write_le64(&mut sb, 64, self.inode_table_start);
        write_le64(&mut sb, 72, self.directory_table_start);
        write_le64(&mut sb, 80, self.fragment_table_start);
        write_le64(&mut sb, 88, self.export_table_start);
        sb
    }

    /// Parse and validate a superblock. Table ordering is checked here so
    /// later lookups can bound every table by the start of the next one.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < SUPERBLOCK_SIZE {
            return Err(Error::format(format!(
                "truncated superblock: {} of {} bytes",
                buf.len(),
                SUPERBLOCK_SIZE
            )));
        }
        let magic = read_le32(buf, 0);
        if magic != MAGIC {
            return Err(Error::format(format!("bad magic 0x{magic:08x}")));
        }
        let (major, minor) = (read_le16(buf, 28), read_le16(buf, 30));
        if (major, minor) != (VERSION_MAJOR, VERSION_MINOR) {
            return Err(Error::format(format!("unsupported version {major}.{minor}")));
        }

        let block_size = read_le32(buf, 12);
        let block_log = read_le16(buf, 22);
        if !block_size.is_power_of_two()
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        {
            return Err(Error::format(format!("invalid block size {block_size}")));
        }
        if block_size.trailing_zeros() != block_log as u32 {
            return Err(Error::format(format!(
                "block log {block_log} does not match block size {block_size}"
            )));
        }

        let compression_raw = read_le16(buf, 20);
        let compression = CompressionId::from_u16(compression_raw)
            .ok_or_else(|| Error::format(format!("unknown compression id {compression_raw}")))?;

        let sb = Superblock {
            inode_count: read_le32(buf, 4),
            modification_time: read_le32(buf, 8),
            block_size,
            fragment_count: read_le32(buf, 16),
            compression,
            block_log,
            flags: read_le16(buf, 24),
            id_count: read_le16(buf, 26),
            root_inode: MetadataRef::from_u64(read_le64(buf, 32)),
            bytes_used: read_le64(buf, 40),
            id_table_start: read_le64(buf, 48),
            xattr_table_start: read_le64(buf, 56),
            inode_table_start: read_le64(buf, 64),
            directory_table_start: read_le64(buf, 72),
            fragment_table_start: read_le64(buf, 80),
            export_table_start: read_le64(buf, 88),
        };

        if sb.inode_table_start < SUPERBLOCK_SIZE as u64
            || sb.directory_table_start < sb.inode_table_start
            || sb.bytes_used < sb.directory_table_start
            || sb.id_table_start > sb.bytes_used
        {
            return Err(Error::format("table offsets out of order"));
        }
        if sb.root_inode.offset as usize >= METADATA_BLOCK_SIZE {
            return Err(Error::format("root inode offset outside a metadata block"));
        }
        Ok(sb)
    }
}

// ── Inode records ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryInode {
    /// Position of the listing's metadata block in the directory table.
    pub start_block: u32,
    pub offset: u16,
    /// Listing size in bytes plus [`DIR_SIZE_BIAS`].
    pub file_size: u32,
    pub link_count: u32,
    pub parent_inode: u32,
    pub xattr: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInode {
    pub blocks_start: u64,
    pub file_size: u64,
    pub sparse: u64,
    pub link_count: u32,
    pub fragment: u32,
    pub fragment_offset: u32,
    pub xattr: u32,
    /// One size word per full (or final short) data block.
    pub block_sizes: Vec<u32>,
}

impl FileInode {
    pub fn has_fragment(&self) -> bool {
        self.fragment != NO_FRAGMENT
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymlinkInode {
    pub link_count: u32,
    pub target: Vec<u8>,
    pub xattr: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InodeBody {
    Directory(DirectoryInode),
    File(FileInode),
    Symlink(SymlinkInode),
    /// Block or character device.
    Device {
        link_count: u32,
        device: u32,
        xattr: u32,
    },
    /// Fifo or socket.
    Ipc { link_count: u32, xattr: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub kind: EntryKind,
    pub permissions: u16,
    pub uid_index: u16,
    pub gid_index: u16,
    pub mtime: u32,
    pub inode_number: u32,
    pub body: InodeBody,
}

impl Inode {
    /// Logical size: file length, listing size, or symlink target length.
    pub fn size(&self) -> u64 {
        match &self.body {
            InodeBody::Directory(d) => d.file_size as u64,
            InodeBody::File(f) => f.file_size,
            InodeBody::Symlink(s) => s.target.len() as u64,
            InodeBody::Device { .. } | InodeBody::Ipc { .. } => 0,
        }
    }

    fn type_code(&self) -> u16 {
        let basic = self.kind.type_code();
        let extended = match &self.body {
            InodeBody::Directory(d) => {
                d.file_size > u16::MAX as u32 || d.xattr != NO_XATTR
            }
            InodeBody::File(f) => {
                f.blocks_start > u32::MAX as u64
                    || f.file_size > u32::MAX as u64
                    || f.sparse != 0
                    || f.link_count != 1
                    || f.xattr != NO_XATTR
            }
            InodeBody::Symlink(s) => s.xattr != NO_XATTR,
            InodeBody::Device { xattr, .. } | InodeBody::Ipc { xattr, .. } => *xattr != NO_XATTR,
        };
        if extended {
            basic + 7
        } else {
            basic
        }
    }

    /// Append the serialized record to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let code = self.type_code();
        let extended = code > BASIC_SOCKET;
        out.extend_from_slice(&code.to_le_bytes());
        out.extend_from_slice(&self.permissions.to_le_bytes());
        out.extend_from_slice(&self.uid_index.to_le_bytes());
        out.extend_from_slice(&self.gid_index.to_le_bytes());
        out.extend_from_slice(&self.mtime.to_le_bytes());
        out.extend_from_slice(&self.inode_number.to_le_bytes());

        match &self.body {
            InodeBody::Directory(d) if extended => {
                out.extend_from_slice(&d.link_count.to_le_bytes());
                out.extend_from_slice(&d.file_size.to_le_bytes());
                out.extend_from_slice(&d.start_block.to_le_bytes());
                out.extend_from_slice(&d.parent_inode.to_le_bytes());
                out.extend_from_slice(&0u16.to_le_bytes()); // index count
                out.extend_from_slice(&d.offset.to_le_bytes());
                out.extend_from_slice(&d.xattr.to_le_bytes());
            }
            InodeBody::Directory(d) => {
                out.extend_from_slice(&d.start_block.to_le_bytes());
                out.extend_from_slice(&d.link_count.to_le_bytes());
                out.extend_from_slice(&(d.file_size as u16).to_le_bytes());
                out.extend_from_slice(&d.offset.to_le_bytes());
                out.extend_from_slice(&d.parent_inode.to_le_bytes());
            }
            InodeBody::File(f) if extended => {
                out.extend_from_slice(&f.blocks_start.to_le_bytes());
                out.extend_from_slice(&f.file_size.to_le_bytes());
                out.extend_from_slice(&f.sparse.to_le_bytes());
                out.extend_from_slice(&f.link_count.to_le_bytes());
                out.extend_from_slice(&f.fragment.to_le_bytes());
                out.extend_from_slice(&f.fragment_offset.to_le_bytes());
                out.extend_from_slice(&f.xattr.to_le_bytes());
                for size in &f.block_sizes {
                    out.extend_from_slice(&size.to_le_bytes());
                }
            }
            InodeBody::File(f) => {
                out.extend_from_slice(&(f.blocks_start as u32).to_le_bytes());
                out.extend_from_slice(&f.fragment.to_le_bytes());
                out.extend_from_slice(&f.fragment_offset.to_le_bytes());
                out.extend_from_slice(&(f.file_size as u32).to_le_bytes());
                for size in &f.block_sizes {
                    out.extend_from_slice(&size.to_le_bytes());
                }
            }
            InodeBody::Symlink(s) => {
                out.extend_from_slice(&s.link_count.to_le_bytes());
                out.extend_from_slice(&(s.target.len() as u32).to_le_bytes());
                out.extend_from_slice(&s.target);
                if extended {
                    out.extend_from_slice(&s.xattr.to_le_bytes());
                }
            }
            InodeBody::Device {
                link_count,
                device,
                xattr,
            } => {
                out.extend_from_slice(&link_count.to_le_bytes());
                out.extend_from_slice(&device.to_le_bytes());
                if extended {
                    out.extend_from_slice(&xattr.to_le_bytes());
                }
            }
            InodeBody::Ipc { link_count, xattr } => {
                out.extend_from_slice(&link_count.to_le_bytes());
                if extended {
                    out.extend_from_slice(&xattr.to_le_bytes());
                }
            }
        }
    }

    /// Decode one record. `block_size` is needed to know how many block
    /// size words a file inode carries.
    pub(crate) fn decode<R: RecordRead>(r: &mut R, block_size: u32) -> Result<Self> {
        let code = r.u16()?;
        let kind = EntryKind::from_type_code(code)
            .ok_or_else(|| Error::corrupt(format!("unknown inode type {code}")))?;
        let extended = code > BASIC_SOCKET;
        let permissions = r.u16()?;
        let uid_index = r.u16()?;
        let gid_index = r.u16()?;
        let mtime = r.u32()?;
        let inode_number = r.u32()?;

        let body = match kind {
            EntryKind::Directory if extended => {
                let link_count = r.u32()?;
                let file_size = r.u32()?;
                let start_block = r.u32()?;
                let parent_inode = r.u32()?;
                let index_count = r.u16()?;
                let offset = r.u16()?;
                let xattr = r.u32()?;
                // Directory index entries only speed up lookups; skip them.
                for _ in 0..index_count {
                    let _index = r.u32()?;
                    let _start = r.u32()?;
                    let name_len = r.u32()? as usize + 1;
                    r.bytes(name_len)?;
                }
                InodeBody::Directory(DirectoryInode {
                    start_block,
                    offset,
                    file_size,
                    link_count,
                    parent_inode,
                    xattr,
                })
            }
            EntryKind::Directory => {
                let start_block = r.u32()?;
                let link_count = r.u32()?;
                let file_size = r.u16()? as u32;
                let offset = r.u16()?;
                let parent_inode = r.u32()?;
                InodeBody::Directory(DirectoryInode {
                    start_block,
                    offset,
                    file_size,
                    link_count,
                    parent_inode,
                    xattr: NO_XATTR,
                })
            }
            EntryKind::File => {
                let (blocks_start, file_size, sparse, link_count, fragment, fragment_offset, xattr) =
                    if extended {
                        (
                            r.u64()?,
                            r.u64()?,
                            r.u64()?,
                            r.u32()?,
                            r.u32()?,
                            r.u32()?,
                            r.u32()?,
                        )
                    } else {
                        let blocks_start = r.u32()? as u64;
                        let fragment = r.u32()?;
                        let fragment_offset = r.u32()?;
                        let file_size = r.u32()? as u64;
                        (blocks_start, file_size, 0, 1, fragment, fragment_offset, NO_XATTR)
                    };
                let block_count = block_count(file_size, block_size, fragment != NO_FRAGMENT);
                // A corrupt size would otherwise reserve an absurd buffer up front;
                // the table bound stops the reads themselves.
                let mut block_sizes = Vec::with_capacity(block_count.min(1024) as usize);
                for _ in 0..block_count {
                    block_sizes.push(r.u32()?);
                }
                InodeBody::File(FileInode {
                    blocks_start,
                    file_size,
                    sparse,
                    link_count,
                    fragment,
                    fragment_offset,
                    xattr,
                    block_sizes,
                })
            }
            EntryKind::Symlink => {
                let link_count = r.u32()?;
                let target_size = r.u32()? as usize;
                if target_size > MAX_SYMLINK_LEN {
                    return Err(Error::corrupt(format!(
                        "inode {inode_number}: symlink target of {target_size} bytes"
                    )));
                }
                let target = r.bytes(target_size)?;
                let xattr = if extended { r.u32()? } else { NO_XATTR };
                InodeBody::Symlink(SymlinkInode {
                    link_count,
                    target,
                    xattr,
                })
            }
            EntryKind::BlockDevice | EntryKind::CharDevice => {
                let link_count = r.u32()?;
                let device = r.u32()?;
                let xattr = if extended { r.u32()? } else { NO_XATTR };
                InodeBody::Device {
                    link_count,
                    device,
                    xattr,
                }
            }
            EntryKind::Fifo | EntryKind::Socket => {
                let link_count = r.u32()?;
                let xattr = if extended { r.u32()? } else { NO_XATTR };
                InodeBody::Ipc { link_count, xattr }
            }
        };

        Ok(Inode {
            kind,
            permissions,
            uid_index,
            gid_index,
            mtime,
            inode_number,
            body,
        })
    }
}

/// Number of block size words stored for a file: every full block, plus a
/// trailing short block when the tail is not in a fragment.
pub fn block_count(file_size: u64, block_size: u32, has_fragment: bool) -> u64 {
    if has_fragment {
        file_size / block_size as u64
    } else {
        file_size.div_ceil(block_size as u64)
    }
}

// ── Directory listings ────────────────────────────────────────────────

/// One entry of a directory listing, as written or read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirRecord {
    pub name: String,
    pub kind: EntryKind,
    pub inode_number: u32,
    pub inode: MetadataRef,
}

/// Serialize a listing. Entries must already be in their stored order.
/// A new run header starts whenever the 256-entry limit is reached, the
/// inode lives in a different metadata block, or the inode number delta
/// no longer fits in an `i16`.
pub fn encode_listing(entries: &[DirRecord]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < entries.len() {
        let first = &entries[i];
        let run_len = entries[i..]
            .iter()
            .take(DIR_RUN_MAX)
            .take_while(|e| {
                e.inode.block == first.inode.block
                    && i16::try_from(e.inode_number as i64 - first.inode_number as i64).is_ok()
            })
            .count();

        out.extend_from_slice(&(run_len as u32 - 1).to_le_bytes());
        out.extend_from_slice(&first.inode.block.to_le_bytes());
        out.extend_from_slice(&first.inode_number.to_le_bytes());
        for entry in &entries[i..i + run_len] {
            let delta = (entry.inode_number as i64 - first.inode_number as i64) as i16;
            let name = entry.name.as_bytes();
            out.extend_from_slice(&entry.inode.offset.to_le_bytes());
            out.extend_from_slice(&delta.to_le_bytes());
            out.extend_from_slice(&entry.kind.type_code().to_le_bytes());
            out.extend_from_slice(&(name.len() as u16 - 1).to_le_bytes());
            out.extend_from_slice(name);
        }
        i += run_len;
    }
    out
}

/// Parse a complete listing of exactly `data.len()` bytes.
pub fn decode_listing(mut data: &[u8]) -> Result<Vec<DirRecord>> {
    let mut entries = Vec::new();
    while !data.is_empty() {
        let count = data.u32()? as usize + 1;
        let block = data.u32()?;
        let base = data.u32()?;
        if count > DIR_RUN_MAX {
            return Err(Error::corrupt(format!(
                "directory run of {count} entries exceeds {DIR_RUN_MAX}"
            )));
        }
        for _ in 0..count {
            let offset = data.u16()?;
            let delta = data.i16()?;
            let type_code = data.u16()?;
            let name_len = data.u16()? as usize + 1;
            let name = data.bytes(name_len)?;

            if offset as usize >= METADATA_BLOCK_SIZE {
                return Err(Error::corrupt(format!(
                    "directory entry inode offset {offset} outside a metadata block"
                )));
            }
            let kind = EntryKind::from_type_code(type_code)
                .ok_or_else(|| Error::corrupt(format!("unknown entry type {type_code}")))?;
            let name = String::from_utf8(name)
                .map_err(|_| Error::corrupt("directory entry name is not UTF-8"))?;
            if name.is_empty() || name.contains('/') || name == "." || name == ".." {
                return Err(Error::corrupt(format!("invalid entry name {name:?}")));
            }
            let inode_number = (base as i64 + delta as i64) as u32;
            entries.push(DirRecord {
                name,
                kind,
                inode_number,
                inode: MetadataRef::new(block, offset),
            });
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_superblock() -> Superblock {
        Superblock {
            inode_count: 7,
            modification_time: 1_700_000_000,
            block_size: 4096,
            fragment_count: 1,
            compression: CompressionId::Gzip,
            block_log: 12,
            flags: flags::NO_XATTRS | flags::EXPORTABLE,
            id_count: 1,
            root_inode: MetadataRef::new(0, 200),
            bytes_used: 9000,
            id_table_start: 8990,
            xattr_table_start: NO_TABLE,
            inode_table_start: 5000,
            directory_table_start: 6000,
            fragment_table_start: 7000,
            export_table_start: 8000,
        }
    }

    #[test]
    fn test_superblock_round_trip() {
        let sb = sample_superblock();
        let bytes = sb.to_bytes();
        assert_eq!(&bytes[..4], b"hsqs");
        assert_eq!(Superblock::parse(&bytes).unwrap(), sb);
    }

    #[test]
    fn test_superblock_validation() {
        let good = sample_superblock().to_bytes();

        assert!(matches!(
            Superblock::parse(&good[..50]),
            Err(Error::InvalidFormat(_))
        ));

        let mut bad_magic = good;
        bad_magic[0] = b'x';
        assert!(matches!(
            Superblock::parse(&bad_magic),
            Err(Error::InvalidFormat(_))
        ));

        let mut bad_version = good;
        write_le16(&mut bad_version, 28, 3);
        assert!(matches!(
            Superblock::parse(&bad_version),
            Err(Error::InvalidFormat(_))
        ));

        let mut bad_log = good;
        write_le16(&mut bad_log, 22, 13);
        assert!(matches!(
            Superblock::parse(&bad_log),
            Err(Error::InvalidFormat(_))
        ));

        let mut bad_size = good;
        write_le32(&mut bad_size, 12, 5000);
        assert!(matches!(
            Superblock::parse(&bad_size),
            Err(Error::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_metadata_ref_packing() {
        let r = MetadataRef::new(0x1234_5678, 0x1FFF);
        assert_eq!(r.to_u64(), 0x1234_5678_1FFF);
        assert_eq!(MetadataRef::from_u64(r.to_u64()), r);
    }

    #[test]
    fn test_file_inode_switches_to_extended_form() {
        let mut inode = Inode {
            kind: EntryKind::File,
            permissions: 0o644,
            uid_index: 0,
            gid_index: 0,
            mtime: 0,
            inode_number: 3,
            body: InodeBody::File(FileInode {
                blocks_start: 96,
                file_size: 4096 * 2 + 10,
                sparse: 0,
                link_count: 1,
                fragment: 0,
                fragment_offset: 20,
                xattr: NO_XATTR,
                block_sizes: vec![100, 4096 | DATA_UNCOMPRESSED],
            }),
        };
        let mut basic = Vec::new();
        inode.encode(&mut basic);
        assert_eq!(u16::from_le_bytes([basic[0], basic[1]]), BASIC_FILE);
        assert_eq!(basic.len(), 16 + 16 + 8);
        assert_eq!(Inode::decode(&mut basic.as_slice(), 4096).unwrap(), inode);

        if let InodeBody::File(f) = &mut inode.body {
            f.blocks_start = 1 << 33;
        }
        let mut ext = Vec::new();
        inode.encode(&mut ext);
        assert_eq!(u16::from_le_bytes([ext[0], ext[1]]), EXT_FILE);
        assert_eq!(Inode::decode(&mut ext.as_slice(), 4096).unwrap(), inode);
    }

    #[test]
    fn test_large_directory_uses_extended_form() {
        let inode = Inode {
            kind: EntryKind::Directory,
            permissions: 0o755,
            uid_index: 0,
            gid_index: 0,
            mtime: 5,
            inode_number: 9,
            body: InodeBody::Directory(DirectoryInode {
                start_block: 8200,
                offset: 17,
                file_size: 70_000,
                link_count: 2,
                parent_inode: 10,
                xattr: NO_XATTR,
            }),
        };
        let mut buf = Vec::new();
        inode.encode(&mut buf);
        assert_eq!(u16::from_le_bytes([buf[0], buf[1]]), EXT_DIR);
        assert_eq!(Inode::decode(&mut buf.as_slice(), 4096).unwrap(), inode);
    }

    #[test]
    fn test_truncated_inode_is_corrupt() {
        let inode = Inode {
            kind: EntryKind::Symlink,
            permissions: 0o777,
            uid_index: 0,
            gid_index: 0,
            mtime: 0,
            inode_number: 1,
            body: InodeBody::Symlink(SymlinkInode {
                link_count: 1,
                target: b"../target/file.txt".to_vec(),
                xattr: NO_XATTR,
            }),
        };
        let mut buf = Vec::new();
        inode.encode(&mut buf);
        let mut short = &buf[..buf.len() - 3];
        assert!(matches!(
            Inode::decode(&mut short, 4096),
            Err(Error::CorruptTable(_))
        ));
    }

    #[test]
    fn test_listing_splits_runs() {
        let mut entries: Vec<DirRecord> = (0..300u32)
            .map(|i| DirRecord {
                name: format!("entry_{i:03}"),
                kind: EntryKind::File,
                inode_number: i + 1,
                inode: MetadataRef::new(0, (i * 20) as u16),
            })
            .collect();
        // The last few inodes live in the next metadata block.
        for e in entries.iter_mut().skip(290) {
            e.inode.block = 8000;
        }

        let encoded = encode_listing(&entries);
        // Three runs: 256 entries, 34 entries, 10 entries in the next block.
        let names_len: usize = entries.iter().map(|e| 8 + e.name.len()).sum();
        assert_eq!(encoded.len(), 3 * 12 + names_len);
        assert_eq!(decode_listing(&encoded).unwrap(), entries);
    }

    #[test]
    fn test_listing_rejects_bad_names() {
        let entries = vec![DirRecord {
            name: "..".to_string(),
            kind: EntryKind::Directory,
            inode_number: 1,
            inode: MetadataRef::default(),
        }];
        let encoded = encode_listing(&entries);
        assert!(matches!(
            decode_listing(&encoded),
            Err(Error::CorruptTable(_))
        ));
    }
}
