//! Pre-order tree walk over anything that can list a directory by path.
//!
//! Siblings are visited in case-insensitive name order. The visitor steers
//! the walk through its return value:
//!
//!   Continue  descend into a directory / move on to the next sibling
//!   SkipDir   on a directory, skip its contents; on anything else, skip
//!             the remaining siblings
//!   SkipAll   stop the walk
//!
//! A directory that cannot be listed is still passed to the visitor once,
//! together with the error. The visitor may swallow it or return it.

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::format::EntryKind;
use crate::reader::Image;
use crate::staging::{StagedKind, StagingTree};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walk {
    Continue,
    SkipDir,
    SkipAll,
}

/// A named entry as seen by the walker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub kind: EntryKind,
}

impl Entry {
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }
}

/// A tree that can list the entries of a directory given its path.
pub trait WalkSource {
    fn list(&self, path: &str) -> Result<Vec<Entry>>;
}

impl<B: Backend> WalkSource for Image<B> {
    fn list(&self, path: &str) -> Result<Vec<Entry>> {
        Ok(self
            .read_dir(path)?
            .into_iter()
            .map(|e| Entry {
                name: e.name,
                kind: e.kind,
            })
            .collect())
    }
}

impl WalkSource for StagingTree {
    fn list(&self, path: &str) -> Result<Vec<Entry>> {
        let id = self.lookup(path)?;
        if !self.node(id).is_dir() {
            return Err(Error::NotADirectory(path.to_string()));
        }
        Ok(self
            .children(id)
            .map(|(name, child)| Entry {
                name: name.to_string(),
                kind: match self.node(child).kind {
                    StagedKind::Directory { .. } => EntryKind::Directory,
                    StagedKind::File { .. } => EntryKind::File,
                    StagedKind::Symlink { .. } => EntryKind::Symlink,
                },
            })
            .collect())
    }
}

/// Walk everything below `root`. The root itself is only passed to the
/// visitor when it cannot be listed.
pub fn walk<S, F>(source: &S, root: &str, mut visit: F) -> Result<()>
where
    S: WalkSource + ?Sized,
    F: FnMut(&str, Option<&Entry>, Option<Error>) -> Result<Walk>,
{
    match list_sorted(source, root) {
        Ok(entries) => walk_entries(source, root, entries, &mut visit).map(|_| ()),
        Err(e) => visit(root, None, Some(e)).map(|_| ()),
    }
}

fn walk_entries<S, F>(source: &S, dir: &str, entries: Vec<Entry>, visit: &mut F) -> Result<Walk>
where
    S: WalkSource + ?Sized,
    F: FnMut(&str, Option<&Entry>, Option<Error>) -> Result<Walk>,
{
    for entry in entries {
        let path = join(dir, &entry.name);
        match walk_entry(source, &path, &entry, visit)? {
            Walk::Continue => {}
            Walk::SkipDir if entry.is_dir() => {}
            Walk::SkipDir => return Ok(Walk::Continue),
            Walk::SkipAll => return Ok(Walk::SkipAll),
        }
    }
    Ok(Walk::Continue)
}

fn walk_entry<S, F>(source: &S, path: &str, entry: &Entry, visit: &mut F) -> Result<Walk>
where
    S: WalkSource + ?Sized,
    F: FnMut(&str, Option<&Entry>, Option<Error>) -> Result<Walk>,
{
    if !entry.is_dir() {
        return visit(path, Some(entry), None);
    }
    match list_sorted(source, path) {
        Err(e) => visit(path, Some(entry), Some(e)),
        Ok(children) => match visit(path, Some(entry), None)? {
            Walk::Continue => walk_entries(source, path, children, visit),
            other => Ok(other),
        },
    }
}

fn list_sorted<S: WalkSource + ?Sized>(source: &S, path: &str) -> Result<Vec<Entry>> {
    let mut entries = source.list(path)?;
    entries.sort_by_cached_key(|e| e.name.to_lowercase());
    Ok(entries)
}

fn join(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}
