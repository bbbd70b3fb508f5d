//! In-memory tree of directories, files and symlinks waiting to be
//! finalized into an image.
//!
//! Nodes live in an arena and refer to each other by [`NodeId`]; a
//! directory maps child names to ids. Nothing is removed once created, so
//! ids stay valid for the life of the tree.

use crate::error::{Error, Result};
use crate::format::MAX_SYMLINK_LEN;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Longest name a directory entry can hold.
pub const MAX_NAME_LEN: usize = 256;
/// Largest file the staging tree holds in memory.
pub const MAX_FILE_SIZE: u64 = 1 << 32;

const DEFAULT_DIR_MODE: u16 = 0o755;
const DEFAULT_FILE_MODE: u16 = 0o644;
const DEFAULT_SYMLINK_MODE: u16 = 0o777;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    pub fn index(self) -> usize {
        self.0
    }
}

/// Ownership, permission bits and modification time of a staged node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attributes {
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u32,
}

impl Attributes {
    fn with_mode(mode: u16) -> Self {
        let mtime = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        Self {
            mode,
            uid: 0,
            gid: 0,
            mtime,
        }
    }
}

#[derive(Debug, Clone)]
pub enum StagedKind {
    Directory { children: BTreeMap<String, NodeId> },
    File { data: Vec<u8> },
    Symlink { target: String },
}

#[derive(Debug, Clone)]
pub struct StagedNode {
    pub kind: StagedKind,
    pub attrs: Attributes,
}

impl StagedNode {
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, StagedKind::Directory { .. })
    }
}

/// A writable handle to a staged file: the node plus a write cursor.
#[derive(Debug)]
pub struct FileHandle {
    node: NodeId,
    cursor: u64,
    open: bool,
}

impl FileHandle {
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn position(&self) -> u64 {
        self.cursor
    }

    /// Move the write cursor. Seeking past the end is allowed; the gap is
    /// zero-filled by the next write.
    pub fn seek(&mut self, pos: u64) {
        self.cursor = pos;
    }

    pub fn close(&mut self) {
        self.open = false;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }
}

#[derive(Debug, Clone)]
pub struct StagingTree {
    nodes: Vec<StagedNode>,
}

impl Default for StagingTree {
    fn default() -> Self {
        Self::new()
    }
}

impl StagingTree {
    pub fn new() -> Self {
        StagingTree {
            nodes: vec![StagedNode {
                kind: StagedKind::Directory {
                    children: BTreeMap::new(),
                },
                attrs: Attributes::with_mode(DEFAULT_DIR_MODE),
            }],
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn node(&self, id: NodeId) -> &StagedNode {
        &self.nodes[id.0]
    }

    /// Children of a directory in name order; empty for other nodes.
    pub fn children(&self, id: NodeId) -> impl Iterator<Item = (&str, NodeId)> {
        let children = match &self.nodes[id.0].kind {
            StagedKind::Directory { children } => Some(children),
            _ => None,
        };
        children
            .into_iter()
            .flat_map(|c| c.iter().map(|(name, &id)| (name.as_str(), id)))
    }

    /// Create a directory and any missing parents. Existing directories
    /// along the way are reused.
    pub fn mkdir(&mut self, path: &str) -> Result<NodeId> {
        let segments = split_path(path)?;
        let mut current = NodeId::ROOT;
        for (i, name) in segments.iter().enumerate() {
            current = match self.child(current, name) {
                Some(id) if self.nodes[id.0].is_dir() => id,
                Some(_) if i + 1 == segments.len() => {
                    return Err(Error::AlreadyExists(path.to_string()))
                }
                Some(_) => return Err(Error::InvalidPath(path.to_string())),
                None => self.insert(
                    current,
                    name,
                    StagedNode {
                        kind: StagedKind::Directory {
                            children: BTreeMap::new(),
                        },
                        attrs: Attributes::with_mode(DEFAULT_DIR_MODE),
                    },
                ),
            };
        }
        Ok(current)
    }

    /// Open a file for writing, creating it when `create` is set. The
    /// parent directory must already exist.
    pub fn open_file(&mut self, path: &str, create: bool) -> Result<FileHandle> {
        let (parent, name) = self.parent_of(path)?;
        let Some(name) = name else {
            return Err(Error::TypeMismatch {
                path: path.to_string(),
                expected: "file",
            });
        };
        let node = match self.child(parent, name) {
            Some(id) => match self.nodes[id.0].kind {
                StagedKind::File { .. } => id,
                _ => {
                    return Err(Error::TypeMismatch {
                        path: path.to_string(),
                        expected: "file",
                    })
                }
            },
            None if create => self.insert(
                parent,
                name,
                StagedNode {
                    kind: StagedKind::File { data: Vec::new() },
                    attrs: Attributes::with_mode(DEFAULT_FILE_MODE),
                },
            ),
            None => return Err(Error::NotFound(path.to_string())),
        };
        Ok(FileHandle {
            node,
            cursor: 0,
            open: true,
        })
    }

    /// Write at the handle's cursor and advance it.
    pub fn write(&mut self, handle: &mut FileHandle, bytes: &[u8]) -> Result<usize> {
        if !handle.open {
            return Err(Error::FileClosed);
        }
        let StagedKind::File { data } = &mut self.nodes[handle.node.0].kind else {
            return Err(Error::FileClosed);
        };
        let end = handle
            .cursor
            .checked_add(bytes.len() as u64)
            .filter(|&end| end <= MAX_FILE_SIZE)
            .ok_or_else(|| {
                Error::Unsupported(format!(
                    "write at {} would grow a file past {MAX_FILE_SIZE} bytes",
                    handle.cursor
                ))
            })?;
        let (start, end) = (handle.cursor as usize, end as usize);
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        handle.cursor = end as u64;
        Ok(bytes.len())
    }

    /// Create a symlink at `path` pointing at `target`. The target is stored
    /// verbatim and never resolved; only its length is limited, since the
    /// format cannot hold an empty target.
    pub fn symlink(&mut self, target: &str, path: &str) -> Result<NodeId> {
        let (parent, name) = self.parent_of(path)?;
        let Some(name) = name else {
            return Err(Error::AlreadyExists(path.to_string()));
        };
        if target.is_empty() || target.len() > MAX_SYMLINK_LEN {
            return Err(Error::InvalidPath(format!(
                "symlink target for {path} must be 1 to {MAX_SYMLINK_LEN} bytes"
            )));
        }
        if self.child(parent, name).is_some() {
            return Err(Error::AlreadyExists(path.to_string()));
        }
        Ok(self.insert(
            parent,
            name,
            StagedNode {
                kind: StagedKind::Symlink {
                    target: target.to_string(),
                },
                attrs: Attributes::with_mode(DEFAULT_SYMLINK_MODE),
            },
        ))
    }

    pub fn set_permissions(&mut self, path: &str, mode: u16) -> Result<()> {
        let id = self.lookup(path)?;
        self.nodes[id.0].attrs.mode = mode & 0o7777;
        Ok(())
    }

    pub fn set_owner(&mut self, path: &str, uid: u32, gid: u32) -> Result<()> {
        let id = self.lookup(path)?;
        let attrs = &mut self.nodes[id.0].attrs;
        attrs.uid = uid;
        attrs.gid = gid;
        Ok(())
    }

    pub fn set_mtime(&mut self, path: &str, mtime: u32) -> Result<()> {
        let id = self.lookup(path)?;
        self.nodes[id.0].attrs.mtime = mtime;
        Ok(())
    }

    /// Find a node by path without following symlinks.
    pub fn lookup(&self, path: &str) -> Result<NodeId> {
        let mut current = NodeId::ROOT;
        for name in split_path(path)? {
            current = self
                .child(current, name)
                .ok_or_else(|| Error::NotFound(path.to_string()))?;
        }
        Ok(current)
    }

    fn child(&self, dir: NodeId, name: &str) -> Option<NodeId> {
        match &self.nodes[dir.0].kind {
            StagedKind::Directory { children } => children.get(name).copied(),
            _ => None,
        }
    }

    /// Resolve the parent directory of `path`, returning it with the final
    /// segment (`None` for the root itself).
    fn parent_of<'p>(&self, path: &'p str) -> Result<(NodeId, Option<&'p str>)> {
        let segments = split_path(path)?;
        let Some((name, dirs)) = segments.split_last() else {
            return Ok((NodeId::ROOT, None));
        };
        let mut current = NodeId::ROOT;
        for dir in dirs {
            current = match self.child(current, dir) {
                Some(id) if self.nodes[id.0].is_dir() => id,
                Some(_) => return Err(Error::InvalidPath(path.to_string())),
                None => return Err(Error::NotFound(path.to_string())),
            };
        }
        Ok((current, Some(*name)))
    }

    fn insert(&mut self, parent: NodeId, name: &str, node: StagedNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        if let StagedKind::Directory { children } = &mut self.nodes[parent.0].kind {
            children.insert(name.to_string(), id);
        }
        id
    }
}

/// Split a `/`-separated path into names. A leading `/` is optional; empty
/// and `.` segments are dropped. `..` is rejected.
pub(crate) fn split_path(path: &str) -> Result<Vec<&str>> {
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(Error::InvalidPath(path.to_string())),
            s if s.len() > MAX_NAME_LEN || s.contains('\0') => {
                return Err(Error::InvalidPath(path.to_string()))
            }
            s => segments.push(s),
        }
    }
    Ok(segments)
}
