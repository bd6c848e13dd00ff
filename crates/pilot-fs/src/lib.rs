//! # pilot-fs
//!
//! Copy-on-write view of the filesystem for dry runs.
//!
//! Shadow threads open files through [`ShadowFs`]. Nothing under the
//! original tree is ever written: writes to files that existed before the
//! dry run are appended to a per-file log, and the shadow copy is only
//! materialized (original bytes plus the replayed log) once something needs
//! to read it back.
//!
//! ## Layout
//!
//! ```text
//! /data/db/table.bin                 original, never modified
//! <shadow_root>/data/db/table.bin    reconstructed copy
//! <log_root>/data/db/table.bin.log   pending operations
//! ```
//!
//! A [`ShadowWorkspace`] inserts a `pilot-<id>` level under both roots so
//! every pilot gets a tree of its own.

pub mod channel;
pub mod global_lock;
pub mod operation;
pub mod shadow_fs;
pub mod state;
pub mod stream;
pub mod workspace;

pub use channel::ShadowFileChannel;
pub use global_lock::{GlobalFsGuard, GlobalFsLock, PathTable};
pub use operation::{FileOperation, OpType};
pub use shadow_fs::{RoutedFile, ShadowFs, ShadowOpenOptions, ShadowRoots};
pub use state::ShadowFileState;
pub use stream::ShadowFileStream;
pub use workspace::ShadowWorkspace;

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Disk failure while logging or rebuilding; the handle that hit it
    /// refuses every later operation.
    #[error("shadow I/O failure on {path}: {source}")]
    ShadowIo { path: PathBuf, source: io::Error },

    #[error("append log codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("no such file: {0}")]
    NotFound(PathBuf),

    #[error("deleted in shadow filesystem: {0}")]
    Deleted(PathBuf),

    #[error("already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("invalid path: {0}")]
    InvalidPath(PathBuf),

    #[error("channel closed: {0}")]
    Closed(PathBuf),

    #[error("no pilot bound to the calling thread")]
    NoPilot,
}

impl FsError {
    pub(crate) fn shadow_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        FsError::ShadowIo {
            path: path.into(),
            source,
        }
    }
}

impl From<FsError> for io::Error {
    fn from(err: FsError) -> Self {
        let kind = match &err {
            FsError::Io(e) => e.kind(),
            FsError::ShadowIo { source, .. } => source.kind(),
            FsError::Codec(_) => io::ErrorKind::InvalidData,
            FsError::NotFound(_) | FsError::Deleted(_) => io::ErrorKind::NotFound,
            FsError::AlreadyExists(_) => io::ErrorKind::AlreadyExists,
            FsError::InvalidPath(_) => io::ErrorKind::InvalidInput,
            FsError::Closed(_) => io::ErrorKind::BrokenPipe,
            FsError::NoPilot => io::ErrorKind::Other,
        };
        match err {
            FsError::Io(e) => e,
            other => io::Error::new(kind, other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
