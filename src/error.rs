//! Storage error type shared by the whole disk subsystem.
//!
//! Every failed operation is reported through a single [`StorageError`]
//! carrying the error kind, the operation that failed, and (when it is
//! meaningful) the index of the layout file involved.

use std::fmt;

use thiserror::Error;

pub type Result<T, E = StorageError> = std::result::Result<T, E>;

/// What went wrong.
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// Buffer pool or cache buffer allocation failed.
    #[error("out of disk buffers")]
    NoMemory,

    /// The request was malformed (zero length, over-long, out of range).
    #[error("invalid request")]
    InvalidRequest,

    /// A layout file name did not parse as a hex device offset.
    #[error("file name is not a hex offset")]
    ParseFailed,

    /// The underlying positional read or write reported an OS error.
    #[error("{0}")]
    FileIoFailed(#[from] std::io::Error),

    /// The operation is not meaningful for raw-device storage.
    #[error("operation not supported")]
    Unsupported,

    /// The target device could not be opened. The device is the engine's
    /// reason to exist, so callers are expected to treat this as terminal.
    #[error("cannot open disk: {0}")]
    Fatal(std::io::Error),
}

/// The operation an error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskOp {
    Open,
    Read,
    Write,
    Hash,
    Parse,
    AllocCache,
    Flush,
    MoveStorage,
    RenameFile,
    DeleteFiles,
    FilePriority,
}

impl fmt::Display for DiskOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiskOp::Open => "open",
            DiskOp::Read => "read",
            DiskOp::Write => "write",
            DiskOp::Hash => "hash",
            DiskOp::Parse => "parse",
            DiskOp::AllocCache => "alloc-cache-piece",
            DiskOp::Flush => "flush",
            DiskOp::MoveStorage => "move-storage",
            DiskOp::RenameFile => "rename-file",
            DiskOp::DeleteFiles => "delete-files",
            DiskOp::FilePriority => "file-priority",
        };
        f.write_str(s)
    }
}

/// An error reported through an operation's completion handler.
#[derive(Debug, Error)]
#[error("{op}: {kind}")]
pub struct StorageError {
    #[source]
    pub kind: ErrorKind,
    pub op: DiskOp,
    /// Index of the layout file the error is attributed to, if any.
    pub file: Option<u32>,
}

impl StorageError {
    pub fn new(kind: ErrorKind, op: DiskOp) -> Self {
        Self {
            kind,
            op,
            file: None,
        }
    }

    pub fn with_file(kind: ErrorKind, op: DiskOp, file: u32) -> Self {
        Self {
            kind,
            op,
            file: Some(file),
        }
    }

    pub fn io(err: std::io::Error, op: DiskOp, file: Option<u32>) -> Self {
        Self {
            kind: ErrorKind::FileIoFailed(err),
            op,
            file,
        }
    }

    /// True for open-time failures that make the engine unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind, ErrorKind::Fatal(_))
    }
}
