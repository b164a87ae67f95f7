#![forbid(unsafe_code)]

//! Shared error model and small value types.

use std::fmt;

use thiserror::Error;

pub mod codes;

/// Opaque identifier of a session in the external commit/snapshot log.
///
/// Zero is reserved as "no session" and is rejected at open time.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct DurabilityHandle(i64);

impl DurabilityHandle {
    /// Wraps a raw handle, returning `None` for the reserved value zero.
    pub fn new(raw: i64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    /// Returns the raw handle value.
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for DurabilityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Failure reported by one of the durability log entry points.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("durability log {op} failed for handle {handle} (status {status})")]
pub struct DurabilityError {
    /// Entry point that failed.
    pub op: &'static str,
    /// Session the call was made for.
    pub handle: DurabilityHandle,
    /// Status returned by the log.
    pub status: i32,
}

/// Errors surfaced by the virtual file system layer.
///
/// Every variant maps onto exactly one SQLite result code through
/// [`VfsError::code`].
#[derive(Error, Debug)]
pub enum VfsError {
    /// A required open parameter was missing, zero, or inconsistent.
    #[error("cannot open: {0}")]
    CantOpen(&'static str),
    /// The durability log refused to start a session.
    #[error("internal: {0}")]
    Internal(#[source] DurabilityError),
    /// A write or truncate would grow the file past its capacity.
    #[error("region full: end {end} exceeds capacity {capacity}")]
    Full {
        /// Requested end offset.
        end: u64,
        /// Fixed capacity of the region.
        capacity: u64,
    },
    /// A checkpoint commit failed after the buffer was already mutated.
    #[error("checkpoint failed: {0}")]
    Snapshot(#[source] DurabilityError),
    /// Shared-memory mapping is unsupported for this file.
    #[error("shared-memory mapping unsupported")]
    ShmMap,
    /// Shared-memory locking is unsupported for this file.
    #[error("shared-memory locking unsupported")]
    ShmLock,
    /// Unrecognized file-control operation.
    #[error("not found")]
    NotFound,
    /// Fewer bytes than requested were available; the rest was zero-filled.
    #[error("short read")]
    ShortRead,
    /// A read addressed bytes beyond the region's capacity.
    #[error("read of {len} bytes at {offset} exceeds capacity {capacity}")]
    OutOfBounds {
        /// Requested offset.
        offset: u64,
        /// Requested length.
        len: usize,
        /// Fixed capacity of the region.
        capacity: u64,
    },
    /// Operating-system I/O failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// The layer was driven in a way it does not support.
    #[error("misuse: {0}")]
    Misuse(&'static str),
    /// Status code returned verbatim by a delegated SQLite file or VFS.
    #[error("sqlite status {0}")]
    Sqlite(i32),
}

impl VfsError {
    /// Returns the SQLite (extended) result code for this error.
    pub fn code(&self) -> i32 {
        match self {
            VfsError::CantOpen(_) => codes::SQLITE_CANTOPEN,
            VfsError::Internal(_) => codes::SQLITE_INTERNAL,
            VfsError::Full { .. } => codes::SQLITE_FULL,
            VfsError::Snapshot(_) => codes::SQLITE_ERROR_SNAPSHOT,
            VfsError::ShmMap => codes::SQLITE_IOERR_SHMMAP,
            VfsError::ShmLock => codes::SQLITE_IOERR_SHMLOCK,
            VfsError::NotFound => codes::SQLITE_NOTFOUND,
            VfsError::ShortRead => codes::SQLITE_IOERR_SHORT_READ,
            VfsError::OutOfBounds { .. } => codes::SQLITE_IOERR_READ,
            VfsError::Io(_) => codes::SQLITE_IOERR,
            VfsError::Misuse(_) => codes::SQLITE_MISUSE,
            VfsError::Sqlite(code) => *code,
        }
    }

    /// Builds an error from a non-OK SQLite status, preserving the code.
    pub fn from_code(code: i32) -> Self {
        VfsError::Sqlite(code)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, VfsError>;

/// Converts a raw SQLite status into a [`Result`].
pub fn check(rc: i32) -> Result<()> {
    if rc == codes::SQLITE_OK {
        Ok(())
    } else {
        Err(VfsError::from_code(rc))
    }
}

/// Collapses a [`Result`] back into a SQLite status.
pub fn into_rc(result: Result<()>) -> i32 {
    match result {
        Ok(()) => codes::SQLITE_OK,
        Err(err) => err.code(),
    }
}
