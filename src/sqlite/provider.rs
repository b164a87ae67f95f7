#![allow(unsafe_code)]

//! Delegate adapters over an already registered `sqlite3_vfs`.
//!
//! [`SqliteProvider`] exposes another VFS (normally the process default) as a
//! [`StorageProvider`], and [`SqliteFile`] drives the `sqlite3_file` objects it
//! opens through their own method tables.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::mem;
use std::ptr::{self, NonNull};
use std::time::Duration;

use rusqlite::ffi;

use crate::provider::{
    AccessCheck, DlHandle, DlSymbol, FileControl, FileHandle, IoCapabilities, LockLevel,
    OpenFlags, ShmLockFlags, StorageProvider, SyncFlags, UriParameters,
};
use crate::types::{check, codes, Result, VfsError};

/// A filename handed to `xOpen`, with its URI parameters.
///
/// Either borrowed from the engine or created by [`SqliteFilename::create`],
/// in which case it is freed on drop.
pub struct SqliteFilename {
    raw: NonNull<c_char>,
    owned: bool,
}

impl SqliteFilename {
    /// Wraps a filename passed in by the engine.
    ///
    /// # Safety
    ///
    /// `raw` must be null or a filename the engine handed to `xOpen`, and must
    /// stay valid while the returned value is used.
    pub unsafe fn from_raw(raw: ffi::sqlite3_filename) -> Option<Self> {
        NonNull::new(raw.cast_mut()).map(|raw| Self { raw, owned: false })
    }

    /// Builds a filename carrying `params` that the engine's parameter lookup
    /// understands.
    pub fn create(path: &str, params: &[(&str, &str)]) -> Result<Self> {
        let path = CString::new(path).map_err(|_| VfsError::CantOpen("filename contains NUL"))?;
        let mut owned = Vec::with_capacity(params.len() * 2);
        for (key, value) in params {
            owned.push(CString::new(*key).map_err(|_| VfsError::CantOpen("parameter contains NUL"))?);
            owned.push(CString::new(*value).map_err(|_| VfsError::CantOpen("parameter contains NUL"))?);
        }
        let mut pointers: Vec<*const c_char> = owned.iter().map(|text| text.as_ptr()).collect();
        let count = c_int::try_from(params.len()).map_err(|_| VfsError::Misuse("too many parameters"))?;
        // SAFETY: every pointer refers to a NUL-terminated string alive for
        // the call; the engine copies them.
        let raw = unsafe {
            ffi::sqlite3_create_filename(
                path.as_ptr(),
                c"".as_ptr(),
                c"".as_ptr(),
                count,
                pointers.as_mut_ptr(),
            )
        };
        let raw = NonNull::new(raw.cast_mut()).ok_or(VfsError::Sqlite(codes::SQLITE_NOMEM))?;
        Ok(Self { raw, owned: true })
    }

    /// Pointer to pass to `xOpen`.
    pub fn as_ptr(&self) -> ffi::sqlite3_filename {
        self.raw.as_ptr()
    }
}

impl UriParameters for SqliteFilename {
    fn path(&self) -> &str {
        // SAFETY: a filename starts with a NUL-terminated path.
        unsafe { CStr::from_ptr(self.raw.as_ptr()) }
            .to_str()
            .unwrap_or_default()
    }

    fn parameter(&self, key: &str) -> Option<&str> {
        let key = CString::new(key).ok()?;
        // SAFETY: the filename is valid per construction; the result lives as
        // long as the filename does.
        let value = unsafe { ffi::sqlite3_uri_parameter(self.raw.as_ptr(), key.as_ptr()) };
        if value.is_null() {
            return None;
        }
        unsafe { CStr::from_ptr(value) }.to_str().ok()
    }
}

impl Drop for SqliteFilename {
    fn drop(&mut self) {
        if self.owned {
            // SAFETY: created by `sqlite3_create_filename` and freed once.
            unsafe { ffi::sqlite3_free_filename(self.raw.as_ptr()) };
        }
    }
}

/// An existing VFS used as a delegate.
pub struct SqliteProvider {
    vfs: NonNull<ffi::sqlite3_vfs>,
}

// SAFETY: registered VFS objects are immutable after registration and are
// required by the engine to be callable from any thread.
unsafe impl Send for SqliteProvider {}
unsafe impl Sync for SqliteProvider {}

impl SqliteProvider {
    /// The process default VFS.
    pub fn default_vfs() -> Result<Self> {
        // SAFETY: a null name asks for the default VFS.
        let vfs = unsafe { ffi::sqlite3_vfs_find(ptr::null()) };
        NonNull::new(vfs)
            .map(|vfs| Self { vfs })
            .ok_or(VfsError::Sqlite(codes::SQLITE_ERROR))
    }

    /// The VFS registered as `name`, if any.
    pub fn find(name: &str) -> Option<Self> {
        let name = CString::new(name).ok()?;
        // SAFETY: `name` is NUL-terminated.
        let vfs = unsafe { ffi::sqlite3_vfs_find(name.as_ptr()) };
        NonNull::new(vfs).map(|vfs| Self { vfs })
    }

    /// Wraps a VFS pointer.
    ///
    /// # Safety
    ///
    /// `vfs` must point to a registered VFS that is never unregistered while
    /// the provider lives.
    pub unsafe fn from_raw(vfs: NonNull<ffi::sqlite3_vfs>) -> Self {
        Self { vfs }
    }

    /// Raw pointer to the wrapped VFS.
    pub fn as_ptr(&self) -> *mut ffi::sqlite3_vfs {
        self.vfs.as_ptr()
    }

    fn raw(&self) -> &ffi::sqlite3_vfs {
        // SAFETY: valid for the provider's lifetime per construction.
        unsafe { self.vfs.as_ref() }
    }

    /// Opens `name` into `slot`, which must hold `file_state_size()` bytes.
    ///
    /// # Safety
    ///
    /// `slot` must be writable for `file_state_size()` bytes, suitably
    /// aligned, and must outlive the returned handle.
    pub unsafe fn open_in_place(
        &self,
        slot: NonNull<ffi::sqlite3_file>,
        name: Option<&SqliteFilename>,
        flags: OpenFlags,
    ) -> Result<(SqliteFile, OpenFlags)> {
        let x_open = self.raw().xOpen.ok_or(VfsError::Misuse("delegate has no xOpen"))?;
        let name = name.map_or(ptr::null(), SqliteFilename::as_ptr);
        let mut used: c_int = 0;
        // SAFETY: upheld by the caller; `pMethods` is cleared so a failed open
        // is detectable.
        let rc = unsafe {
            (*slot.as_ptr()).pMethods = ptr::null();
            x_open(self.vfs.as_ptr(), name, slot.as_ptr(), flags.bits(), &mut used)
        };
        let file = SqliteFile {
            file: slot,
            storage: None,
            open: unsafe { !(*slot.as_ptr()).pMethods.is_null() },
        };
        check(rc)?;
        Ok((file, OpenFlags::from_bits_retain(used)))
    }

    fn c_name(name: &str) -> Result<CString> {
        CString::new(name).map_err(|_| VfsError::CantOpen("name contains NUL"))
    }
}

impl StorageProvider for SqliteProvider {
    type Path = SqliteFilename;
    type File = SqliteFile;

    fn name(&self) -> &str {
        let name = self.raw().zName;
        if name.is_null() {
            return "";
        }
        // SAFETY: registered VFS names are NUL-terminated and static.
        unsafe { CStr::from_ptr(name) }.to_str().unwrap_or_default()
    }

    fn max_pathname(&self) -> usize {
        self.raw().mxPathname.max(0) as usize
    }

    fn file_state_size(&self) -> usize {
        self.raw().szOsFile.max(0) as usize
    }

    fn open(&self, name: Option<&SqliteFilename>, flags: OpenFlags) -> Result<(SqliteFile, OpenFlags)> {
        let words = self.file_state_size().div_ceil(mem::size_of::<u64>()).max(1);
        let mut storage = vec![0u64; words].into_boxed_slice();
        let slot = NonNull::from(&mut storage[0]).cast::<ffi::sqlite3_file>();
        // SAFETY: the boxed storage is large enough, 8-byte aligned, and moves
        // into the returned handle without its heap allocation moving.
        let (mut file, used) = unsafe { self.open_in_place(slot, name, flags) }?;
        file.storage = Some(storage);
        Ok((file, used))
    }

    fn delete(&self, name: &str, sync_dir: bool) -> Result<()> {
        let x_delete = self.raw().xDelete.ok_or(VfsError::Misuse("delegate has no xDelete"))?;
        let name = Self::c_name(name)?;
        // SAFETY: valid VFS and NUL-terminated name.
        check(unsafe { x_delete(self.vfs.as_ptr(), name.as_ptr(), sync_dir as c_int) })
    }

    fn access(&self, name: &str, check_kind: AccessCheck) -> Result<bool> {
        let x_access = self.raw().xAccess.ok_or(VfsError::Misuse("delegate has no xAccess"))?;
        let name = Self::c_name(name)?;
        let mut out: c_int = 0;
        // SAFETY: valid VFS, NUL-terminated name, and a live out pointer.
        check(unsafe { x_access(self.vfs.as_ptr(), name.as_ptr(), check_kind.to_raw(), &mut out) })?;
        Ok(out != 0)
    }

    fn full_pathname(&self, name: &str, capacity: usize) -> Result<String> {
        let x_full = self
            .raw()
            .xFullPathname
            .ok_or(VfsError::Misuse("delegate has no xFullPathname"))?;
        let name = Self::c_name(name)?;
        let mut buf = vec![0 as c_char; capacity.max(1)];
        let len = c_int::try_from(buf.len()).map_err(|_| VfsError::Misuse("pathname capacity"))?;
        // SAFETY: `buf` holds `len` bytes.
        check(unsafe { x_full(self.vfs.as_ptr(), name.as_ptr(), len, buf.as_mut_ptr()) })?;
        Ok(c_buffer_to_string(&buf))
    }

    fn dl_open(&self, path: &str) -> Option<DlHandle> {
        let x_dl_open = self.raw().xDlOpen?;
        let path = CString::new(path).ok()?;
        // SAFETY: valid VFS and NUL-terminated path.
        NonNull::new(unsafe { x_dl_open(self.vfs.as_ptr(), path.as_ptr()) }).map(DlHandle)
    }

    fn dl_error(&self, capacity: usize) -> String {
        let Some(x_dl_error) = self.raw().xDlError else {
            return String::new();
        };
        let mut buf = vec![0 as c_char; capacity.max(1)];
        let len = c_int::try_from(buf.len()).unwrap_or(c_int::MAX);
        // SAFETY: `buf` holds at least `len` bytes.
        unsafe { x_dl_error(self.vfs.as_ptr(), len, buf.as_mut_ptr()) };
        c_buffer_to_string(&buf)
    }

    fn dl_sym(&self, handle: DlHandle, symbol: &str) -> Option<DlSymbol> {
        let x_dl_sym = self.raw().xDlSym?;
        let symbol = CString::new(symbol).ok()?;
        // SAFETY: `handle` came from this VFS's xDlOpen.
        let found = unsafe { x_dl_sym(self.vfs.as_ptr(), handle.0.as_ptr(), symbol.as_ptr()) }?;
        NonNull::new(found as *mut c_void).map(DlSymbol)
    }

    fn dl_close(&self, handle: DlHandle) {
        if let Some(x_dl_close) = self.raw().xDlClose {
            // SAFETY: `handle` came from this VFS's xDlOpen.
            unsafe { x_dl_close(self.vfs.as_ptr(), handle.0.as_ptr()) };
        }
    }

    fn randomness(&self, dst: &mut [u8]) -> usize {
        let Some(x_randomness) = self.raw().xRandomness else {
            return 0;
        };
        let len = c_int::try_from(dst.len()).unwrap_or(c_int::MAX);
        // SAFETY: `dst` holds at least `len` bytes.
        let written = unsafe { x_randomness(self.vfs.as_ptr(), len, dst.as_mut_ptr().cast()) };
        written.max(0) as usize
    }

    fn sleep(&self, duration: Duration) -> Duration {
        let Some(x_sleep) = self.raw().xSleep else {
            return Duration::ZERO;
        };
        let micros = c_int::try_from(duration.as_micros()).unwrap_or(c_int::MAX);
        // SAFETY: valid VFS.
        let slept = unsafe { x_sleep(self.vfs.as_ptr(), micros) };
        Duration::from_micros(slept.max(0) as u64)
    }

    fn current_time(&self) -> Result<f64> {
        let x_time = self
            .raw()
            .xCurrentTime
            .ok_or(VfsError::Misuse("delegate has no xCurrentTime"))?;
        let mut out = 0.0f64;
        // SAFETY: valid VFS and out pointer.
        check(unsafe { x_time(self.vfs.as_ptr(), &mut out) })?;
        Ok(out)
    }

    fn current_time_millis(&self) -> Result<i64> {
        let raw = self.raw();
        match raw.xCurrentTimeInt64 {
            Some(x_time) if raw.iVersion >= 2 => {
                let mut out: ffi::sqlite3_int64 = 0;
                // SAFETY: valid VFS and out pointer.
                check(unsafe { x_time(self.vfs.as_ptr(), &mut out) })?;
                Ok(out)
            }
            _ => self.current_time().map(|day| (day * 86_400_000.0) as i64),
        }
    }

    fn last_error(&self, capacity: usize) -> (i32, String) {
        let Some(x_last_error) = self.raw().xGetLastError else {
            return (0, String::new());
        };
        let mut buf = vec![0 as c_char; capacity.max(1)];
        let len = c_int::try_from(buf.len()).unwrap_or(c_int::MAX);
        // SAFETY: `buf` holds at least `len` bytes.
        let code = unsafe { x_last_error(self.vfs.as_ptr(), len, buf.as_mut_ptr()) };
        (code, c_buffer_to_string(&buf))
    }
}

/// A `sqlite3_file` opened by a delegate VFS.
///
/// Calls go through the file's own method table; results pass through as
/// [`VfsError::Sqlite`] with the delegate's code.
pub struct SqliteFile {
    file: NonNull<ffi::sqlite3_file>,
    storage: Option<Box<[u64]>>,
    open: bool,
}

impl SqliteFile {
    fn methods(&self) -> Result<&ffi::sqlite3_io_methods> {
        if !self.open {
            return Err(VfsError::Misuse("delegate file is closed"));
        }
        // SAFETY: an open file has a non-null method table that outlives it.
        unsafe { (*self.file.as_ptr()).pMethods.as_ref() }
            .ok_or(VfsError::Misuse("delegate file has no methods"))
    }

    fn version(&self) -> c_int {
        self.methods().map_or(0, |methods| methods.iVersion)
    }

    /// Whether the handle owns its state rather than living inside the
    /// engine's file slot.
    pub fn is_heap_allocated(&self) -> bool {
        self.storage.is_some()
    }
}

macro_rules! method {
    ($self:ident, $name:ident) => {
        $self
            .methods()?
            .$name
            .ok_or(VfsError::Misuse(concat!("delegate file has no ", stringify!($name))))?
    };
}

impl FileHandle for SqliteFile {
    fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        let x_close = method!(self, xClose);
        self.open = false;
        // SAFETY: the file is open and closed exactly once.
        check(unsafe { x_close(self.file.as_ptr()) })
    }

    fn read_at(&mut self, off: u64, dst: &mut [u8]) -> Result<()> {
        let x_read = method!(self, xRead);
        let len = c_int::try_from(dst.len()).map_err(|_| VfsError::Misuse("read too large"))?;
        // SAFETY: `dst` is writable for `len` bytes.
        let rc = unsafe { x_read(self.file.as_ptr(), dst.as_mut_ptr().cast(), len, off as i64) };
        if rc == codes::SQLITE_IOERR_SHORT_READ {
            return Err(VfsError::ShortRead);
        }
        check(rc)
    }

    fn write_at(&mut self, off: u64, src: &[u8]) -> Result<()> {
        let x_write = method!(self, xWrite);
        let len = c_int::try_from(src.len()).map_err(|_| VfsError::Misuse("write too large"))?;
        // SAFETY: `src` is readable for `len` bytes.
        check(unsafe { x_write(self.file.as_ptr(), src.as_ptr().cast(), len, off as i64) })
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        let x_truncate = method!(self, xTruncate);
        // SAFETY: open file.
        check(unsafe { x_truncate(self.file.as_ptr(), len as i64) })
    }

    fn sync(&mut self, flags: SyncFlags) -> Result<()> {
        let x_sync = method!(self, xSync);
        // SAFETY: open file.
        check(unsafe { x_sync(self.file.as_ptr(), flags.bits()) })
    }

    fn file_size(&mut self) -> Result<u64> {
        let x_file_size = method!(self, xFileSize);
        let mut size: ffi::sqlite3_int64 = 0;
        // SAFETY: open file and live out pointer.
        check(unsafe { x_file_size(self.file.as_ptr(), &mut size) })?;
        Ok(size.max(0) as u64)
    }

    fn lock(&mut self, level: LockLevel) -> Result<()> {
        let x_lock = method!(self, xLock);
        // SAFETY: open file.
        check(unsafe { x_lock(self.file.as_ptr(), level.to_raw()) })
    }

    fn unlock(&mut self, level: LockLevel) -> Result<()> {
        let x_unlock = method!(self, xUnlock);
        // SAFETY: open file.
        check(unsafe { x_unlock(self.file.as_ptr(), level.to_raw()) })
    }

    fn check_reserved_lock(&mut self) -> Result<bool> {
        let x_check = method!(self, xCheckReservedLock);
        let mut out: c_int = 0;
        // SAFETY: open file and live out pointer.
        check(unsafe { x_check(self.file.as_ptr(), &mut out) })?;
        Ok(out != 0)
    }

    fn file_control(&mut self, request: &mut FileControl<'_>) -> Result<()> {
        let x_file_control = method!(self, xFileControl);
        match request {
            FileControl::VfsName(out) => {
                let mut name: *mut c_char = ptr::null_mut();
                // SAFETY: VFSNAME writes an engine-allocated string or nothing.
                let rc = unsafe {
                    x_file_control(
                        self.file.as_ptr(),
                        codes::SQLITE_FCNTL_VFSNAME,
                        (&mut name as *mut *mut c_char).cast(),
                    )
                };
                if !name.is_null() {
                    // SAFETY: allocated by the engine; freed here after copying.
                    unsafe {
                        **out = Some(CStr::from_ptr(name).to_string_lossy().into_owned());
                        ffi::sqlite3_free(name.cast());
                    }
                }
                check(rc)
            }
            FileControl::Raw { op, arg } => {
                // SAFETY: `arg` is owned by the engine and meant for this op.
                check(unsafe { x_file_control(self.file.as_ptr(), *op, *arg) })
            }
        }
    }

    fn sector_size(&mut self) -> u32 {
        let Ok(methods) = self.methods() else {
            return 0;
        };
        match methods.xSectorSize {
            // SAFETY: open file.
            Some(x_sector) => unsafe { x_sector(self.file.as_ptr()) }.max(0) as u32,
            None => 0,
        }
    }

    fn device_characteristics(&mut self) -> IoCapabilities {
        let Ok(methods) = self.methods() else {
            return IoCapabilities::empty();
        };
        match methods.xDeviceCharacteristics {
            // SAFETY: open file.
            Some(x_caps) => IoCapabilities::from_bits_retain(unsafe { x_caps(self.file.as_ptr()) }),
            None => IoCapabilities::empty(),
        }
    }

    fn shm_map(
        &mut self,
        region: u32,
        region_size: u32,
        extend: bool,
    ) -> Result<Option<NonNull<u8>>> {
        if !self.supports_shared_memory() {
            return Err(VfsError::ShmMap);
        }
        let x_shm_map = method!(self, xShmMap);
        let region = c_int::try_from(region).map_err(|_| VfsError::ShmMap)?;
        let size = c_int::try_from(region_size).map_err(|_| VfsError::ShmMap)?;
        let mut out: *mut c_void = ptr::null_mut();
        // SAFETY: open file and live out pointer.
        check(unsafe { x_shm_map(self.file.as_ptr(), region, size, extend as c_int, &mut out) })?;
        Ok(NonNull::new(out.cast()))
    }

    fn shm_lock(&mut self, offset: u32, n: u32, flags: ShmLockFlags) -> Result<()> {
        if !self.supports_shared_memory() {
            return Err(VfsError::ShmLock);
        }
        let x_shm_lock = method!(self, xShmLock);
        // SAFETY: open file.
        check(unsafe { x_shm_lock(self.file.as_ptr(), offset as c_int, n as c_int, flags.bits()) })
    }

    fn shm_barrier(&mut self) {
        if !self.supports_shared_memory() {
            return;
        }
        if let Ok(Some(x_barrier)) = self.methods().map(|methods| methods.xShmBarrier) {
            // SAFETY: open file.
            unsafe { x_barrier(self.file.as_ptr()) };
        }
    }

    fn shm_unmap(&mut self, delete: bool) -> Result<()> {
        if !self.supports_shared_memory() {
            return Ok(());
        }
        let x_shm_unmap = method!(self, xShmUnmap);
        // SAFETY: open file.
        check(unsafe { x_shm_unmap(self.file.as_ptr(), delete as c_int) })
    }

    fn fetch(&mut self, off: u64, len: usize) -> Result<Option<NonNull<u8>>> {
        if self.version() < 3 {
            return Ok(None);
        }
        let x_fetch = method!(self, xFetch);
        let len = c_int::try_from(len).map_err(|_| VfsError::Misuse("fetch too large"))?;
        let mut out: *mut c_void = ptr::null_mut();
        // SAFETY: open file and live out pointer.
        check(unsafe { x_fetch(self.file.as_ptr(), off as i64, len, &mut out) })?;
        Ok(NonNull::new(out.cast()))
    }

    fn unfetch(&mut self, off: u64, page: Option<NonNull<u8>>) -> Result<()> {
        if self.version() < 3 {
            return Ok(());
        }
        let x_unfetch = method!(self, xUnfetch);
        let page = page.map_or(ptr::null_mut(), |page| page.as_ptr().cast());
        // SAFETY: `page` came from this file's xFetch or is null.
        check(unsafe { x_unfetch(self.file.as_ptr(), off as i64, page) })
    }

    fn supports_shared_memory(&self) -> bool {
        self.methods()
            .is_ok_and(|methods| methods.iVersion >= 2 && methods.xShmMap.is_some())
    }
}

impl Drop for SqliteFile {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Copies a NUL-terminated buffer into an owned string.
fn c_buffer_to_string(buf: &[c_char]) -> String {
    let bytes: Vec<u8> = buf
        .iter()
        .take_while(|&&ch| ch != 0)
        .map(|&ch| ch as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}
