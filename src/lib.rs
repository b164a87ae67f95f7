//! A SQLite VFS that serves the main database file from memory the
//! application already owns.
//!
//! Open requests flagged as the main database carry `ptr`, `sz`, `max` and
//! `fd` URI parameters naming a lent buffer and a durability-log session.
//! Reads and writes go straight to the buffer; a checkpoint trigger calls the
//! external commit/snapshot log once enough bytes have been written or when
//! the engine syncs. Every other file (journals, WAL, temp files) is handed to
//! the VFS that was the default before registration.
//!
//! The safe core ([`vfs`], [`provider`], [`primitives`]) is independent of the
//! engine; [`sqlite`] binds it to `sqlite3_vfs` through `rusqlite::ffi`.

#![warn(missing_docs)]

pub mod primitives;
pub mod provider;
pub mod sqlite;
pub mod types;
pub mod vfs;

pub use primitives::region::{LentRegions, MemoryRegion, RawAddresses, RegionSource};
pub use provider::os::OsProvider;
pub use provider::{FileHandle, OpenFlags, StorageProvider, UriParameters, UriPath};
pub use sqlite::{register, register_trusting_addresses, Registered, SqliteProvider};
pub use types::{DurabilityError, DurabilityHandle, Result, VfsError};
pub use vfs::{
    Checkpoint, DurabilityLog, MemVfs, MemoryFile, MemoryFileConfig, RecordingLog, VfsFile,
    VfsOptions,
};
