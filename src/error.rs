//! Error type shared by the staging tree, the finalizer and the reader.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by image building and image reading.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed path, or a path segment that conflicts with an existing entry.
    #[error("invalid path {0}")]
    InvalidPath(String),

    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("entry already exists: {0}")]
    AlreadyExists(String),

    /// The operation needs a different kind of node.
    #[error("{path} is not a {expected}")]
    TypeMismatch { path: String, expected: &'static str },

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("not a symlink: {0}")]
    NotASymlink(String),

    /// Superblock magic, version or geometry is wrong, or the header is truncated.
    #[error("invalid image format: {0}")]
    InvalidFormat(String),

    /// A table reference points outside its table, or a block decompressed
    /// to an unexpected size.
    #[error("corrupt table: {0}")]
    CorruptTable(String),

    #[error("broken symlink: {0}")]
    BrokenSymlink(String),

    #[error("too many levels of symbolic links: {0}")]
    SymlinkLoop(String),

    #[error("image has already been finalized")]
    AlreadyFinalized,

    #[error("file handle is closed")]
    FileClosed,

    /// A compression algorithm that is known to the format but not built in.
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn corrupt(what: impl Into<String>) -> Self {
        Error::CorruptTable(what.into())
    }

    pub(crate) fn format(what: impl Into<String>) -> Self {
        Error::InvalidFormat(what.into())
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        use std::io::ErrorKind;
        match e {
            Error::Io(e) => e,
            Error::NotFound(_) => std::io::Error::new(ErrorKind::NotFound, e),
            Error::CorruptTable(_) | Error::InvalidFormat(_) => {
                std::io::Error::new(ErrorKind::InvalidData, e)
            }
            other => std::io::Error::new(ErrorKind::Other, other),
        }
    }
}
