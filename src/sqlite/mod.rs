#![allow(unsafe_code)]

//! Registration of the memory VFS with the SQLite engine.
//!
//! [`register`] looks up the current default VFS, wraps it as the delegate of
//! a [`MemVfs`], and registers the result under the configured name, as the
//! new default unless [`VfsOptions::make_default`] turned that off. The
//! registration lives for the rest of the process; the returned handle gives
//! access to the lending table used to resolve `ptr=` addresses.
//!
//! When the current default is itself a memory VFS, the new one delegates to
//! the VFS underneath it, so main-database opens never chain through another
//! memory VFS.
//!
//! ```no_run
//! use std::sync::Arc;
//! use memvfs::{register, RecordingLog, VfsOptions};
//!
//! let log = Arc::new(RecordingLog::new());
//! let registered = register(VfsOptions::default(), log.clone())?;
//! let buf: &'static mut [u8] = Box::leak(vec![0u8; 1 << 20].into_boxed_slice());
//! let address = registered.regions().lend(buf);
//! let uri = format!("file:/app.db?ptr={address:#x}&sz=0&max=1048576&fd=3");
//! let conn = rusqlite::Connection::open_with_flags_and_vfs(
//!     uri,
//!     rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
//!         | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
//!         | rusqlite::OpenFlags::SQLITE_OPEN_URI,
//!     registered.name(),
//! )?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::ffi::{c_int, c_void, CString};
use std::ptr::{self, NonNull};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::ffi;
use tracing::{debug, info};

use crate::primitives::region::{LentRegions, RawAddresses, RegionSource};
use crate::provider::StorageProvider;
use crate::types::{check, codes, Result, VfsError};
use crate::vfs::{DurabilityLog, MemVfs, Registry, VfsOptions};

mod methods;
pub mod provider;

pub use provider::{SqliteFile, SqliteFilename, SqliteProvider};

/// Addresses of the `sqlite3_vfs` records installed here, each paired with
/// the address of the VFS it delegates to.
static INSTALLED: Mutex<Vec<(usize, usize)>> = parking_lot::const_mutex(Vec::new());

/// Follows `vfs` down past any memory VFS to the one it delegates to.
fn underlying(
    installed: &[(usize, usize)],
    mut vfs: NonNull<ffi::sqlite3_vfs>,
) -> NonNull<ffi::sqlite3_vfs> {
    while let Some(&(_, delegate)) = installed
        .iter()
        .find(|(record, _)| *record == vfs.as_ptr() as usize)
    {
        match NonNull::new(delegate as *mut ffi::sqlite3_vfs) {
            Some(next) => vfs = next,
            None => break,
        }
    }
    vfs
}

/// A memory VFS registered with the engine.
///
/// Holds the `sqlite3_vfs` record the engine points at, so it never moves and
/// is never freed.
pub struct Registered<R: RegionSource<'static> = LentRegions<'static>> {
    base: ffi::sqlite3_vfs,
    name: CString,
    vfs: MemVfs<'static, SqliteProvider, R>,
}

// SAFETY: the `sqlite3_vfs` record is only written before registration and
// the provider it points at is `Send + Sync`.
unsafe impl<R: RegionSource<'static>> Send for Registered<R> {}
unsafe impl<R: RegionSource<'static>> Sync for Registered<R> {}

impl<R: RegionSource<'static>> Registered<R> {
    /// Name the VFS is registered under.
    pub fn name(&self) -> &str {
        self.vfs.name()
    }

    /// The provider behind the registration.
    pub fn vfs(&self) -> &MemVfs<'static, SqliteProvider, R> {
        &self.vfs
    }

    /// Source resolving `ptr=` addresses.
    pub fn regions(&self) -> &Arc<R> {
        self.vfs.regions()
    }

    /// Durability log receiving checkpoints.
    pub fn log(&self) -> &Arc<dyn DurabilityLog> {
        self.vfs.log()
    }

    /// Main databases currently served from memory.
    pub fn registry(&self) -> &Registry {
        self.vfs.registry()
    }

    /// Bytes the engine reserves per open file.
    pub fn file_state_size(&self) -> usize {
        self.base.szOsFile.max(0) as usize
    }

    /// Raw pointer to the registered `sqlite3_vfs`.
    pub fn as_ptr(&self) -> *const ffi::sqlite3_vfs {
        &self.base
    }
}

/// Registers a memory VFS whose `ptr=` addresses must come from buffers lent
/// through [`Registered::regions`].
pub fn register(
    options: VfsOptions,
    log: Arc<dyn DurabilityLog>,
) -> Result<&'static Registered<LentRegions<'static>>> {
    register_with(options, Arc::new(LentRegions::new()), log)
}

/// Registers a memory VFS that takes `ptr=` addresses at face value.
///
/// # Safety
///
/// Every address reaching an open request must satisfy the contract of
/// [`RawAddresses::new`] for as long as the opened file stays open.
pub unsafe fn register_trusting_addresses(
    options: VfsOptions,
    log: Arc<dyn DurabilityLog>,
) -> Result<&'static Registered<RawAddresses>> {
    let regions = Arc::new(unsafe { RawAddresses::new() });
    register_with(options, regions, log)
}

fn register_with<R: RegionSource<'static> + 'static>(
    options: VfsOptions,
    regions: Arc<R>,
    log: Arc<dyn DurabilityLog>,
) -> Result<&'static Registered<R>> {
    let name = CString::new(options.name.as_str())
        .map_err(|_| VfsError::Misuse("vfs name contains NUL"))?;
    if name.as_bytes().is_empty() {
        return Err(VfsError::Misuse("vfs name is empty"));
    }
    let mut installed = INSTALLED.lock();
    // SAFETY: `name` is NUL-terminated.
    if !unsafe { ffi::sqlite3_vfs_find(name.as_ptr()) }.is_null() {
        return Err(VfsError::Misuse("vfs name already registered"));
    }

    // SAFETY: a null name asks for the default VFS.
    let current = NonNull::new(unsafe { ffi::sqlite3_vfs_find(ptr::null()) })
        .ok_or(VfsError::Sqlite(codes::SQLITE_ERROR))?;
    let original = underlying(&installed, current);
    if original != current {
        debug!("memvfs.register default is a memory vfs, delegating beneath it");
    }
    // SAFETY: registered VFS objects are never unregistered by this crate.
    let delegate = unsafe { SqliteProvider::from_raw(original) };
    let delegate_name = delegate.name().to_owned();
    let state_size = methods::FileSlot::state_size(delegate.file_state_size());
    let make_default = options.make_default;
    let max_pathname = options.max_pathname;

    let vfs = MemVfs::new(options, delegate, regions, log);
    let registered: &'static mut Registered<R> = Box::leak(Box::new(Registered {
        // SAFETY: an all-null record is a valid `sqlite3_vfs`; it is filled in
        // below before the engine sees it.
        base: unsafe { std::mem::zeroed() },
        name,
        vfs,
    }));
    let app_data = ptr::addr_of_mut!(*registered).cast::<c_void>();
    registered.base =
        methods::vfs_methods::<R>(app_data, registered.name.as_ptr(), state_size, max_pathname);

    // SAFETY: the record is leaked and therefore valid for the process.
    check(unsafe { ffi::sqlite3_vfs_register(&mut registered.base, make_default as c_int) })?;
    installed.push((
        ptr::addr_of!(registered.base) as usize,
        original.as_ptr() as usize,
    ));
    drop(installed);
    info!(
        name = registered.name(),
        delegate = %delegate_name,
        file_state_size = state_size,
        make_default,
        "memvfs.register"
    );
    Ok(registered)
}
