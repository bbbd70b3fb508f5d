//! Image builder: stages a tree and serializes it once.
//!
//! Finalize runs strictly in order, because every later table embeds
//! positions that are only known once the earlier ones are written:
//!
//!   Staging -> DataWritten -> MetadataWritten -> Finalized
//!
//! 1. Number inodes post-order (children before parents, root last).
//! 2. Write file contents as data blocks and fragment blocks.
//! 3. Write inode records and directory listings into metadata tables,
//!    children first so every listing can point at finished inodes.
//! 4. Write the fragment, export and id lookup tables.
//! 5. Write the superblock with every table position.
//!
//! A failed finalize leaves the backend half-written; the builder refuses
//! to run again.

use crate::backend::{Backend, Region};
use crate::compression::{CompressionId, Compressor};
use crate::data::{DataBlockRef, DataOptions, DataWriter};
use crate::error::{Error, Result};
use crate::format::{
    encode_listing, flags, DirRecord, DirectoryInode, EntryKind, FileInode, Inode, InodeBody,
    MetadataRef, Superblock, SymlinkInode, DIR_SIZE_BIAS, IMAGE_ALIGN, MAX_BLOCK_SIZE,
    MIN_BLOCK_SIZE, NO_FRAGMENT, NO_TABLE, NO_XATTR, SUPERBLOCK_SIZE,
};
use crate::metadata::{write_lookup_table, MetadataWriter};
use crate::staging::{FileHandle, NodeId, StagedKind, StagingTree};
use log::{debug, warn};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Which optional tables to emit and how to compress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeOptions {
    pub compression: CompressionId,
    /// Emit the export table (inode number -> inode location).
    pub export_table: bool,
    /// Record this uid for every inode instead of the staged one.
    pub force_uid: Option<u32>,
    /// Record this gid for every inode instead of the staged one.
    pub force_gid: Option<u32>,
    /// Store file tails as short data blocks instead of packing them.
    pub no_fragments: bool,
    pub uncompressed_inodes: bool,
    pub uncompressed_data: bool,
    pub uncompressed_fragments: bool,
    /// Store all-zero blocks as sparse holes.
    pub sparse: bool,
}

impl Default for FinalizeOptions {
    fn default() -> Self {
        Self {
            compression: CompressionId::Gzip,
            export_table: true,
            force_uid: None,
            force_gid: None,
            no_fragments: false,
            uncompressed_inodes: false,
            uncompressed_data: false,
            uncompressed_fragments: false,
            sparse: true,
        }
    }
}

impl FinalizeOptions {
    fn superblock_flags(&self) -> u16 {
        let mut f = flags::NO_XATTRS;
        if self.export_table {
            f |= flags::EXPORTABLE;
        }
        if self.no_fragments {
            f |= flags::NO_FRAGMENTS;
        } else {
            f |= flags::ALWAYS_FRAGMENTS;
        }
        if self.uncompressed_inodes {
            f |= flags::UNCOMPRESSED_INODES;
        }
        if self.uncompressed_data {
            f |= flags::UNCOMPRESSED_DATA;
        }
        if self.uncompressed_fragments {
            f |= flags::UNCOMPRESSED_FRAGMENTS;
        }
        f
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Staging,
    DataWritten,
    MetadataWritten,
    Finalized,
    /// Finalize failed part-way; the backend content is unusable.
    Failed,
}

/// Builds an image on a backend: stage with `mkdir`/`open_file`/`write`/
/// `symlink`, then call [`ImageBuilder::finalize`] once.
pub struct ImageBuilder<B> {
    region: Region<B>,
    block_size: u32,
    tree: StagingTree,
    state: BuildState,
}

impl<B: Backend> ImageBuilder<B> {
    /// Build an image occupying `backend` from offset 0.
    pub fn create(backend: B, block_size: u32) -> Result<Self> {
        Self::create_at(backend, 0, 0, block_size)
    }

    /// Build an image inside a window of `backend` starting at `start`.
    /// A `size` of 0 leaves the window unbounded.
    pub fn create_at(backend: B, start: u64, size: u64, block_size: u32) -> Result<Self> {
        if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        {
            return Err(Error::format(format!(
                "block size {block_size} must be a power of two between {MIN_BLOCK_SIZE} and {MAX_BLOCK_SIZE}"
            )));
        }
        if size != 0 && size < (SUPERBLOCK_SIZE as u64) {
            return Err(Error::format(format!("region of {size} bytes cannot hold an image")));
        }
        Ok(Self {
            region: Region::new(backend, start, size),
            block_size,
            tree: StagingTree::new(),
            state: BuildState::Staging,
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn tree(&self) -> &StagingTree {
        &self.tree
    }

    pub fn backend(&self) -> &B {
        self.region.get_ref()
    }

    pub fn into_backend(self) -> B {
        self.region.into_inner()
    }

    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        self.staging()?.mkdir(path).map(|_| ())
    }

    pub fn open_file(&mut self, path: &str, create: bool) -> Result<FileHandle> {
        self.staging()?.open_file(path, create)
    }

    pub fn write(&mut self, handle: &mut FileHandle, bytes: &[u8]) -> Result<usize> {
        self.staging()?.write(handle, bytes)
    }

    /// Create `path` if needed and write `bytes` at its start.
    pub fn write_file(&mut self, path: &str, bytes: &[u8]) -> Result<()> {
        let mut handle = self.open_file(path, true)?;
        self.write(&mut handle, bytes)?;
        handle.close();
        Ok(())
    }

    pub fn symlink(&mut self, target: &str, path: &str) -> Result<()> {
        self.staging()?.symlink(target, path).map(|_| ())
    }

    pub fn set_permissions(&mut self, path: &str, mode: u16) -> Result<()> {
        self.staging()?.set_permissions(path, mode)
    }

    pub fn set_owner(&mut self, path: &str, uid: u32, gid: u32) -> Result<()> {
        self.staging()?.set_owner(path, uid, gid)
    }

    pub fn set_mtime(&mut self, path: &str, mtime: u32) -> Result<()> {
        self.staging()?.set_mtime(path, mtime)
    }

    fn staging(&mut self) -> Result<&mut StagingTree> {
        match self.state {
            BuildState::Staging => Ok(&mut self.tree),
            _ => Err(Error::AlreadyFinalized),
        }
    }

    /// Serialize the staged tree into the backend.
    pub fn finalize(&mut self, options: &FinalizeOptions) -> Result<()> {
        if self.state != BuildState::Staging {
            return Err(Error::AlreadyFinalized);
        }
        let compressor = options.compression.compressor()?;

        match self.write_image(compressor.as_ref(), options) {
            Ok(()) => {
                self.state = BuildState::Finalized;
                Ok(())
            }
            Err(e) => {
                warn!("finalize failed after reaching {:?}: {}", self.state, e);
                self.state = BuildState::Failed;
                Err(e)
            }
        }
    }

    fn write_image(&mut self, compressor: &dyn Compressor, options: &FinalizeOptions) -> Result<()> {
        let plan = Plan::new(&self.tree);
        debug!(
            "finalizing {} inodes, block size {}, {} compression",
            plan.order.len(),
            self.block_size,
            compressor.id().name()
        );

        // Data blocks and fragments
        let mut data = DataWriter::new(
            compressor,
            self.block_size,
            DataOptions {
                compress_data: !options.uncompressed_data,
                compress_fragments: !options.uncompressed_fragments,
                use_fragments: !options.no_fragments,
                detect_sparse: options.sparse,
            },
            SUPERBLOCK_SIZE as u64,
        );
        let mut placements: HashMap<NodeId, DataBlockRef> = HashMap::new();
        for &id in &plan.order {
            if let StagedKind::File { data: bytes } = &self.tree.node(id).kind {
                placements.insert(id, data.write_file(&mut self.region, bytes)?);
            }
        }
        let (data_end, fragments) = data.finish(&mut self.region)?;
        self.state = BuildState::DataWritten;
        debug!(
            "data area ends at {}, {} fragment blocks",
            data_end,
            fragments.len()
        );

        // Inode and directory tables
        let mut ids = IdTable::default();
        let mut inodes = MetadataWriter::new(compressor, !options.uncompressed_inodes);
        let mut dirs = MetadataWriter::new(compressor, !options.uncompressed_inodes);
        let mut refs: HashMap<NodeId, MetadataRef> = HashMap::new();
        let inode_count = plan.order.len() as u32;

        for &id in &plan.order {
            let node = self.tree.node(id);
            let body = match &node.kind {
                StagedKind::File { data: bytes } => {
                    let placed = &placements[&id];
                    InodeBody::File(FileInode {
                        blocks_start: placed.start,
                        file_size: bytes.len() as u64,
                        sparse: placed.sparse,
                        link_count: 1,
                        fragment: placed.fragment.map_or(NO_FRAGMENT, |f| f.index),
                        fragment_offset: placed.fragment.map_or(0, |f| f.offset),
                        xattr: NO_XATTR,
                        block_sizes: placed.block_sizes.clone(),
                    })
                }
                StagedKind::Symlink { target } => InodeBody::Symlink(SymlinkInode {
                    link_count: 1,
                    target: target.as_bytes().to_vec(),
                    xattr: NO_XATTR,
                }),
                StagedKind::Directory { .. } => {
                    let mut records = Vec::new();
                    let mut subdirs = 0;
                    for (name, child) in self.tree.children(id) {
                        let kind = match self.tree.node(child).kind {
                            StagedKind::Directory { .. } => {
                                subdirs += 1;
                                EntryKind::Directory
                            }
                            StagedKind::File { .. } => EntryKind::File,
                            StagedKind::Symlink { .. } => EntryKind::Symlink,
                        };
                        records.push(DirRecord {
                            name: name.to_string(),
                            kind,
                            inode_number: plan.number(child),
                            inode: refs[&child],
                        });
                    }
                    let listing = encode_listing(&records);
                    let at = dirs.append(&listing)?;
                    let parent_inode = match plan.parent(id) {
                        Some(parent) => plan.number(parent),
                        None => inode_count + 1,
                    };
                    InodeBody::Directory(DirectoryInode {
                        start_block: at.block,
                        offset: at.offset,
                        file_size: listing.len() as u32 + DIR_SIZE_BIAS,
                        link_count: 2 + subdirs,
                        parent_inode,
                        xattr: NO_XATTR,
                    })
                }
            };
            let kind = match &body {
                InodeBody::Directory(_) => EntryKind::Directory,
                InodeBody::Symlink(_) => EntryKind::Symlink,
                _ => EntryKind::File,
            };
            let attrs = node.attrs;
            let inode = Inode {
                kind,
                permissions: attrs.mode,
                uid_index: ids.index(options.force_uid.unwrap_or(attrs.uid))?,
                gid_index: ids.index(options.force_gid.unwrap_or(attrs.gid))?,
                mtime: attrs.mtime,
                inode_number: plan.number(id),
                body,
            };
            let mut record = Vec::new();
            inode.encode(&mut record);
            refs.insert(id, inodes.append(&record)?);
        }

        let inode_table = inodes.finish()?;
        let directory_table = dirs.finish()?;
        let inode_table_start = data_end;
        self.region.write_all_at(inode_table_start, &inode_table)?;
        let directory_table_start = inode_table_start + inode_table.len() as u64;
        self.region
            .write_all_at(directory_table_start, &directory_table)?;
        let mut end = directory_table_start + directory_table.len() as u64;
        debug!(
            "inode table at {} ({} bytes), directory table at {} ({} bytes)",
            inode_table_start,
            inode_table.len(),
            directory_table_start,
            directory_table.len()
        );

        // Lookup tables
        let compress_tables = !options.uncompressed_inodes;
        let mut fragment_entries = Vec::new();
        for entry in &fragments {
            entry.encode(&mut fragment_entries);
        }
        let (fragment_table_start, next) = write_lookup_table(
            &mut self.region,
            compressor,
            compress_tables,
            end,
            &fragment_entries,
        )?;
        end = next;

        let export_table_start = if options.export_table {
            let entries: Vec<u8> = plan
                .order
                .iter()
                .flat_map(|id| refs[id].to_u64().to_le_bytes())
                .collect();
            let (start, next) =
                write_lookup_table(&mut self.region, compressor, compress_tables, end, &entries)?;
            end = next;
            start
        } else {
            NO_TABLE
        };

        let id_entries: Vec<u8> = ids.values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let (id_table_start, next) =
            write_lookup_table(&mut self.region, compressor, compress_tables, end, &id_entries)?;
        let bytes_used = next;
        self.state = BuildState::MetadataWritten;

        let padded = bytes_used.div_ceil(IMAGE_ALIGN) * IMAGE_ALIGN;
        if padded > bytes_used {
            let zeros = vec![0u8; (padded - bytes_used) as usize];
            self.region.write_all_at(bytes_used, &zeros)?;
        }

        let superblock = Superblock {
            inode_count,
            modification_time: now(),
            block_size: self.block_size,
            fragment_count: fragments.len() as u32,
            compression: compressor.id(),
            block_log: self.block_size.trailing_zeros() as u16,
            flags: options.superblock_flags(),
            id_count: u16::try_from(ids.values.len())
                .map_err(|_| Error::Unsupported("id table does not fit the superblock".into()))?,
            root_inode: refs[&NodeId::ROOT],
            bytes_used,
            id_table_start,
            xattr_table_start: NO_TABLE,
            inode_table_start,
            directory_table_start,
            fragment_table_start,
            export_table_start,
        };
        self.region.write_all_at(0, &superblock.to_bytes())?;
        debug!(
            "superblock written: {} bytes used, padded to {}",
            bytes_used, padded
        );
        Ok(())
    }
}

/// Post-order inode numbering and parent links.
struct Plan {
    order: Vec<NodeId>,
    numbers: Vec<u32>,
    parents: Vec<Option<NodeId>>,
}

impl Plan {
    fn new(tree: &StagingTree) -> Self {
        let mut order = Vec::with_capacity(tree.len());
        let mut parents = vec![None; tree.len()];
        let mut stack = vec![(NodeId::ROOT, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            stack.push((id, true));
            let children: Vec<NodeId> = tree.children(id).map(|(_, child)| child).collect();
            for &child in children.iter().rev() {
                parents[child.index()] = Some(id);
                stack.push((child, false));
            }
        }
        let mut numbers = vec![0; tree.len()];
        for (i, id) in order.iter().enumerate() {
            numbers[id.index()] = i as u32 + 1;
        }
        Plan {
            order,
            numbers,
            parents,
        }
    }

    fn number(&self, id: NodeId) -> u32 {
        self.numbers[id.index()]
    }

    fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.parents[id.index()]
    }
}

const MAX_IDS: usize = u16::MAX as usize;

/// Deduplicated uid/gid values, referenced from inodes by index.
#[derive(Default)]
struct IdTable {
    values: Vec<u32>,
    lookup: HashMap<u32, u16>,
}

impl IdTable {
    fn index(&mut self, id: u32) -> Result<u16> {
        if let Some(&idx) = self.lookup.get(&id) {
            return Ok(idx);
        }
        // The superblock stores the count in a u16, so the last index is
        // u16::MAX - 1.
        if self.values.len() >= MAX_IDS {
            return Err(Error::Unsupported(format!(
                "more than {MAX_IDS} distinct uid/gid values"
            )));
        }
        let idx = self.values.len() as u16;
        self.values.push(id);
        self.lookup.insert(id, idx);
        Ok(idx)
    }
}

fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::MAGIC;

    fn small_builder() -> ImageBuilder<Vec<u8>> {
        let mut builder = ImageBuilder::create(Vec::new(), 4096).unwrap();
        builder.mkdir("/etc").unwrap();
        builder.write_file("/etc/hostname", b"squash\n").unwrap();
        builder.symlink("etc/hostname", "/hostname").unwrap();
        builder
    }

    #[test]
    fn test_block_size_validation() {
        assert!(matches!(
            ImageBuilder::create(Vec::new(), 1000),
            Err(Error::InvalidFormat(_))
        ));
        assert!(matches!(
            ImageBuilder::create(Vec::new(), 2048),
            Err(Error::InvalidFormat(_))
        ));
        assert!(ImageBuilder::create(Vec::new(), 1 << 20).is_ok());
    }

    #[test]
    fn test_finalize_writes_superblock_and_pads() {
        let mut builder = small_builder();
        builder.finalize(&FinalizeOptions::default()).unwrap();
        assert_eq!(builder.state(), BuildState::Finalized);

        let image = builder.into_backend();
        assert_eq!(image.len() % IMAGE_ALIGN as usize, 0);
        let sb = Superblock::parse(&image).unwrap();
        assert_eq!(u32::from_le_bytes([image[0], image[1], image[2], image[3]]), MAGIC);
        // root, /etc, /etc/hostname, /hostname
        assert_eq!(sb.inode_count, 4);
        assert_eq!(sb.fragment_count, 1);
        assert_eq!(sb.id_count, 1);
        assert!(sb.has_export_table());
        assert!(sb.bytes_used <= image.len() as u64);
    }

    #[test]
    fn test_second_finalize_is_rejected_and_leaves_image_alone() {
        let mut builder = small_builder();
        builder.finalize(&FinalizeOptions::default()).unwrap();
        let before = builder.backend().clone();
        assert!(matches!(
            builder.finalize(&FinalizeOptions::default()),
            Err(Error::AlreadyFinalized)
        ));
        assert_eq!(builder.backend(), &before);
        assert!(matches!(builder.mkdir("/late"), Err(Error::AlreadyFinalized)));
    }

    #[test]
    fn test_unsupported_compression_keeps_staging() {
        let mut builder = small_builder();
        let options = FinalizeOptions {
            compression: CompressionId::Lzo,
            ..Default::default()
        };
        assert!(matches!(builder.finalize(&options), Err(Error::Unsupported(_))));
        assert_eq!(builder.state(), BuildState::Staging);
        assert!(builder.backend().is_empty());
    }

    #[test]
    fn test_failed_write_poisons_builder() {
        // Large enough for the superblock, far too small for the image.
        let mut builder = ImageBuilder::create_at(Vec::new(), 0, 200, 4096).unwrap();
        builder.write_file("/big", &vec![0xAB; 10_000]).unwrap();
        assert!(matches!(
            builder.finalize(&FinalizeOptions::default()),
            Err(Error::Io(_))
        ));
        assert_eq!(builder.state(), BuildState::Failed);
        assert!(matches!(
            builder.finalize(&FinalizeOptions::default()),
            Err(Error::AlreadyFinalized)
        ));
    }

    #[test]
    fn test_without_export_table() {
        let mut builder = small_builder();
        let options = FinalizeOptions {
            export_table: false,
            no_fragments: true,
            ..Default::default()
        };
        builder.finalize(&options).unwrap();
        let sb = Superblock::parse(&builder.into_backend()).unwrap();
        assert!(!sb.has_export_table());
        assert!(sb.has_flag(flags::NO_FRAGMENTS));
        assert_eq!(sb.fragment_count, 0);
    }

    #[test]
    fn test_plan_numbers_children_before_parents() {
        let builder = small_builder();
        let plan = Plan::new(builder.tree());
        let tree = builder.tree();
        let etc = tree.lookup("/etc").unwrap();
        let hostname = tree.lookup("/etc/hostname").unwrap();
        assert!(plan.number(hostname) < plan.number(etc));
        assert_eq!(plan.number(NodeId::ROOT), plan.order.len() as u32);
        assert_eq!(plan.parent(hostname), Some(etc));
        assert_eq!(plan.parent(NodeId::ROOT), None);
    }

    #[test]
    fn test_forced_ids_collapse_id_table() {
        let mut builder = small_builder();
        builder.set_owner("/etc/hostname", 1000, 1000).unwrap();
        builder.set_owner("/etc", 33, 44).unwrap();
        let options = FinalizeOptions {
            force_uid: Some(7),
            force_gid: Some(7),
            ..Default::default()
        };
        builder.finalize(&options).unwrap();
        let sb = Superblock::parse(&builder.into_backend()).unwrap();
        assert_eq!(sb.id_count, 1);
    }

    #[test]
    fn test_id_table_count_fits_superblock() {
        let mut ids = IdTable::default();
        for id in 0..MAX_IDS as u32 {
            ids.index(id).unwrap();
        }
        assert_eq!(ids.index(0).unwrap(), 0);
        assert_eq!(ids.index(MAX_IDS as u32 - 1).unwrap(), u16::MAX - 1);
        assert!(matches!(ids.index(u32::MAX), Err(Error::Unsupported(_))));
        assert_eq!(ids.values.len(), u16::MAX as usize);
    }
}
