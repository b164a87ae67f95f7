//! The storage-provider surface the database engine drives.
//!
//! [`StorageProvider`] mirrors the VFS object (open, delete, access, path
//! resolution and the OS services) and [`FileHandle`] mirrors the per-file
//! I/O method table. Both the memory-backed layer and the delegates it wraps
//! implement these traits.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::time::Duration;

use bitflags::bitflags;

use crate::types::{codes, Result};

pub mod os;
pub mod uri;

pub use uri::{UriParameters, UriPath};

bitflags! {
    /// Flags passed to [`StorageProvider::open`], bit-compatible with
    /// `SQLITE_OPEN_*`.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct OpenFlags: i32 {
        /// Open for reading only.
        const READ_ONLY = 0x0000_0001;
        /// Open for reading and writing.
        const READ_WRITE = 0x0000_0002;
        /// Create the file if it does not exist.
        const CREATE = 0x0000_0004;
        /// Delete the file when it is closed.
        const DELETE_ON_CLOSE = 0x0000_0008;
        /// Fail if the file already exists.
        const EXCLUSIVE = 0x0000_0010;
        /// The name is a URI.
        const URI = 0x0000_0040;
        /// The file is the engine's main database file.
        const MAIN_DB = 0x0000_0100;
        /// The file is a temporary database.
        const TEMP_DB = 0x0000_0200;
        /// The file is a transient database.
        const TRANSIENT_DB = 0x0000_0400;
        /// The file is the main rollback journal.
        const MAIN_JOURNAL = 0x0000_0800;
        /// The file is a temporary journal.
        const TEMP_JOURNAL = 0x0000_1000;
        /// The file is a statement sub-journal.
        const SUBJOURNAL = 0x0000_2000;
        /// The file is a super-journal.
        const SUPER_JOURNAL = 0x0000_4000;
        /// The file is a write-ahead log.
        const WAL = 0x0008_0000;
        /// Do not follow symbolic links.
        const NOFOLLOW = 0x0100_0000;
    }
}

impl OpenFlags {
    /// Returns true when the open request designates the main database file.
    pub fn is_main_db(self) -> bool {
        self.contains(OpenFlags::MAIN_DB)
    }
}

bitflags! {
    /// Capability flags reported by [`FileHandle::device_characteristics`],
    /// bit-compatible with `SQLITE_IOCAP_*`.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct IoCapabilities: i32 {
        /// All writes of any size are atomic.
        const ATOMIC = 0x0000_0001;
        /// 512-byte aligned writes are atomic.
        const ATOMIC512 = 0x0000_0002;
        /// 4 KiB aligned writes are atomic.
        const ATOMIC4K = 0x0000_0010;
        /// Data is appended before the file size grows.
        const SAFE_APPEND = 0x0000_0200;
        /// Writes reach storage in the order issued.
        const SEQUENTIAL = 0x0000_0400;
        /// The file cannot be deleted while open.
        const UNDELETABLE_WHEN_OPEN = 0x0000_0800;
        /// A crash never damages bytes outside the written range.
        const POWERSAFE_OVERWRITE = 0x0000_1000;
        /// The file never changes while open.
        const IMMUTABLE = 0x0000_2000;
        /// Batch atomic writes are supported.
        const BATCH_ATOMIC = 0x0000_4000;
    }
}

bitflags! {
    /// Flags passed to [`FileHandle::sync`], bit-compatible with
    /// `SQLITE_SYNC_*`.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct SyncFlags: i32 {
        /// Ordinary fsync.
        const NORMAL = 0x0000_0002;
        /// Full fsync (`F_FULLFSYNC` on macOS).
        const FULL = 0x0000_0003;
        /// Only the file data needs to reach storage.
        const DATA_ONLY = 0x0000_0010;
    }
}

bitflags! {
    /// Flags passed to [`FileHandle::shm_lock`], bit-compatible with
    /// `SQLITE_SHM_*`.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct ShmLockFlags: i32 {
        /// Release the lock.
        const UNLOCK = 1;
        /// Acquire the lock.
        const LOCK = 2;
        /// Shared mode.
        const SHARED = 4;
        /// Exclusive mode.
        const EXCLUSIVE = 8;
    }
}

/// File locking levels of the engine's rollback-journal protocol.
#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub enum LockLevel {
    /// No lock held.
    None,
    /// Readers may proceed.
    Shared,
    /// A writer intends to write.
    Reserved,
    /// A writer is waiting for readers to drain.
    Pending,
    /// A writer holds the file exclusively.
    Exclusive,
}

impl LockLevel {
    /// Decodes a raw `SQLITE_LOCK_*` value.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            codes::SQLITE_LOCK_NONE => Some(LockLevel::None),
            codes::SQLITE_LOCK_SHARED => Some(LockLevel::Shared),
            codes::SQLITE_LOCK_RESERVED => Some(LockLevel::Reserved),
            codes::SQLITE_LOCK_PENDING => Some(LockLevel::Pending),
            codes::SQLITE_LOCK_EXCLUSIVE => Some(LockLevel::Exclusive),
            _ => None,
        }
    }

    /// Encodes the level as a raw `SQLITE_LOCK_*` value.
    pub fn to_raw(self) -> i32 {
        match self {
            LockLevel::None => codes::SQLITE_LOCK_NONE,
            LockLevel::Shared => codes::SQLITE_LOCK_SHARED,
            LockLevel::Reserved => codes::SQLITE_LOCK_RESERVED,
            LockLevel::Pending => codes::SQLITE_LOCK_PENDING,
            LockLevel::Exclusive => codes::SQLITE_LOCK_EXCLUSIVE,
        }
    }
}

/// Kind of permission asked by [`StorageProvider::access`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AccessCheck {
    /// Does the file exist?
    Exists,
    /// Is the file readable and writable?
    ReadWrite,
    /// Is the file readable?
    Read,
}

impl AccessCheck {
    /// Decodes a raw `SQLITE_ACCESS_*` value.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            codes::SQLITE_ACCESS_EXISTS => Some(AccessCheck::Exists),
            codes::SQLITE_ACCESS_READWRITE => Some(AccessCheck::ReadWrite),
            codes::SQLITE_ACCESS_READ => Some(AccessCheck::Read),
            _ => None,
        }
    }

    /// Encodes the check as a raw `SQLITE_ACCESS_*` value.
    pub fn to_raw(self) -> i32 {
        match self {
            AccessCheck::Exists => codes::SQLITE_ACCESS_EXISTS,
            AccessCheck::ReadWrite => codes::SQLITE_ACCESS_READWRITE,
            AccessCheck::Read => codes::SQLITE_ACCESS_READ,
        }
    }
}

/// A file-control request.
///
/// Only the diagnostic name query is understood by this layer; every other
/// operation travels as an opaque `(op, arg)` pair that delegates interpret.
#[derive(Debug)]
pub enum FileControl<'r> {
    /// `SQLITE_FCNTL_VFSNAME`: report a human-readable identifier.
    VfsName(&'r mut Option<String>),
    /// Any other operation, passed through untouched.
    Raw {
        /// Operation code.
        op: i32,
        /// Operation argument, owned by the engine.
        arg: *mut c_void,
    },
}

impl FileControl<'_> {
    /// Returns the raw operation code of the request.
    pub fn op(&self) -> i32 {
        match self {
            FileControl::VfsName(_) => codes::SQLITE_FCNTL_VFSNAME,
            FileControl::Raw { op, .. } => *op,
        }
    }
}

/// Handle of a dynamically loaded library.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct DlHandle(pub NonNull<c_void>);

/// Address of a symbol resolved from a dynamically loaded library.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct DlSymbol(pub NonNull<c_void>);

/// Per-file I/O methods.
///
/// Offsets and lengths are in bytes. Implementations are driven by one
/// connection at a time and receive `&mut self`.
pub trait FileHandle {
    /// Releases the handle's resources.
    fn close(&mut self) -> Result<()>;
    /// Fills `dst` from offset `off`.
    ///
    /// Reading past the end of a real file zero-fills the remainder and
    /// returns [`crate::VfsError::ShortRead`].
    fn read_at(&mut self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes `src` at offset `off`.
    fn write_at(&mut self, off: u64, src: &[u8]) -> Result<()>;
    /// Sets the file length to `len`.
    fn truncate(&mut self, len: u64) -> Result<()>;
    /// Makes previously written data durable.
    fn sync(&mut self, flags: SyncFlags) -> Result<()>;
    /// Returns the current file length.
    fn file_size(&mut self) -> Result<u64>;
    /// Raises the lock to `level`.
    fn lock(&mut self, level: LockLevel) -> Result<()>;
    /// Lowers the lock to `level`.
    fn unlock(&mut self, level: LockLevel) -> Result<()>;
    /// Reports whether any connection holds a RESERVED or higher lock.
    fn check_reserved_lock(&mut self) -> Result<bool>;
    /// Handles a file-control request.
    fn file_control(&mut self, request: &mut FileControl<'_>) -> Result<()>;
    /// Returns the sector size of the underlying medium.
    fn sector_size(&mut self) -> u32;
    /// Returns the capability flags of the underlying medium.
    fn device_characteristics(&mut self) -> IoCapabilities;
    /// Maps shared-memory region `region` of `region_size` bytes.
    fn shm_map(
        &mut self,
        region: u32,
        region_size: u32,
        extend: bool,
    ) -> Result<Option<NonNull<u8>>>;
    /// Acquires or releases `n` shared-memory locks starting at `offset`.
    fn shm_lock(&mut self, offset: u32, n: u32, flags: ShmLockFlags) -> Result<()>;
    /// Orders shared-memory accesses.
    fn shm_barrier(&mut self);
    /// Unmaps shared memory, deleting it when `delete` is set.
    fn shm_unmap(&mut self, delete: bool) -> Result<()>;
    /// Returns a pointer to `len` bytes of file content at `off`, if the file
    /// can expose its pages directly.
    fn fetch(&mut self, off: u64, len: usize) -> Result<Option<NonNull<u8>>>;
    /// Releases a page returned by [`FileHandle::fetch`].
    fn unfetch(&mut self, off: u64, page: Option<NonNull<u8>>) -> Result<()>;
    /// Reports whether the shared-memory methods are implemented.
    fn supports_shared_memory(&self) -> bool {
        true
    }
}

/// Provider-level operations.
///
/// `Path` is the provider's notion of an open request's name: a plain path
/// plus any URI parameters that travelled with it.
pub trait StorageProvider: Send + Sync {
    /// Name argument accepted by [`StorageProvider::open`].
    type Path: UriParameters + ?Sized;
    /// File handle produced by [`StorageProvider::open`].
    type File: FileHandle;

    /// Name the provider is known by.
    fn name(&self) -> &str;
    /// Longest pathname the provider accepts.
    fn max_pathname(&self) -> usize;
    /// Bytes of per-file state the provider needs.
    fn file_state_size(&self) -> usize;
    /// Opens `name` (or an anonymous temporary file when `None`), returning
    /// the handle and the flags actually used.
    fn open(&self, name: Option<&Self::Path>, flags: OpenFlags)
        -> Result<(Self::File, OpenFlags)>;
    /// Deletes `name`, syncing its directory when `sync_dir` is set.
    fn delete(&self, name: &str, sync_dir: bool) -> Result<()>;
    /// Answers an access-permission query for `name`.
    fn access(&self, name: &str, check: AccessCheck) -> Result<bool>;
    /// Resolves `name` to a full pathname no longer than `capacity - 1` bytes.
    fn full_pathname(&self, name: &str, capacity: usize) -> Result<String>;
    /// Opens a dynamic library.
    fn dl_open(&self, path: &str) -> Option<DlHandle>;
    /// Describes the most recent dynamic-loading error, in at most
    /// `capacity - 1` bytes.
    fn dl_error(&self, capacity: usize) -> String;
    /// Resolves `symbol` in `handle`.
    fn dl_sym(&self, handle: DlHandle, symbol: &str) -> Option<DlSymbol>;
    /// Closes a dynamic library.
    fn dl_close(&self, handle: DlHandle);
    /// Fills `dst` with random bytes, returning how many were written.
    fn randomness(&self, dst: &mut [u8]) -> usize;
    /// Sleeps for at least `duration`, returning the time actually requested.
    fn sleep(&self, duration: Duration) -> Duration;
    /// Current time as a Julian day number.
    fn current_time(&self) -> Result<f64>;
    /// Current time as milliseconds since the Julian epoch.
    fn current_time_millis(&self) -> Result<i64>;
    /// Most recent OS error code and message (message capped at
    /// `capacity - 1` bytes).
    fn last_error(&self, capacity: usize) -> (i32, String);
}

/// Truncates `text` to at most `capacity - 1` bytes on a character boundary.
pub(crate) fn bounded(text: &str, capacity: usize) -> String {
    let limit = capacity.saturating_sub(1);
    if text.len() <= limit {
        return text.to_owned();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_owned()
}

/// Milliseconds between the Julian epoch and the Unix epoch.
pub(crate) const UNIX_EPOCH_JULIAN_MS: i64 = 24_405_875 * 8_640_000;

/// Converts Julian-epoch milliseconds into a fractional Julian day.
pub(crate) fn julian_day(julian_ms: i64) -> f64 {
    julian_ms as f64 / 86_400_000.0
}
