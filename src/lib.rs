//! Build, finalize and read SquashFS 4.0 style images without mounting them.
//!
//! Building: stage a tree with [`ImageBuilder`] (`mkdir`, `open_file`,
//! `write`, `symlink`), then call [`ImageBuilder::finalize`] once.
//!
//! Reading: [`Image::open`] a finalized image and use `read_dir`,
//! `open_file`, `readlink` and friends. Any [`Backend`] works as storage,
//! including a window inside a larger file.

pub mod backend;
pub mod compression;
pub mod data;
pub mod error;
pub mod finalize;
pub mod format;
mod metadata;
pub mod reader;
pub mod staging;
pub mod walk;

pub use backend::{Backend, Region};
pub use compression::{CompressionId, Compressor};
pub use error::{Error, Result};
pub use finalize::{BuildState, FinalizeOptions, ImageBuilder};
pub use format::{EntryKind, Superblock, DEFAULT_BLOCK_SIZE};
pub use reader::{DirEntry, FileReader, Image, Metadata};
pub use staging::{FileHandle, StagingTree};
pub use walk::{walk, Walk, WalkSource};
