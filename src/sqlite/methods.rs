#![allow(unsafe_code)]

//! `sqlite3_vfs` and `sqlite3_io_methods` callbacks.
//!
//! Every callback recovers the Rust object behind the engine's pointer, calls
//! the safe layer, and folds the result back into a status code through
//! [`crate::VfsError::code`].

use std::ffi::{c_char, c_int, c_void, CStr};
use std::mem;
use std::ptr::{self, NonNull};
use std::slice;
use std::time::Duration;

use rusqlite::ffi;
use tracing::warn;

use super::provider::{SqliteFile, SqliteFilename};
use super::Registered;
use crate::primitives::region::RegionSource;
use crate::provider::{
    AccessCheck, DlHandle, FileControl, FileHandle, LockLevel, OpenFlags, ShmLockFlags,
    StorageProvider, SyncFlags,
};
use crate::types::{codes, into_rc};
use crate::vfs::VfsFile;

/// The engine's per-file slot: our state, followed by the delegate's.
#[repr(C)]
pub(crate) struct FileSlot {
    base: ffi::sqlite3_file,
    state: SlotState,
}

enum SlotState {
    Open(VfsFile<'static, SqliteFile>),
    Closed,
}

impl FileSlot {
    /// Bytes the engine must reserve per file, delegate included.
    pub(crate) fn state_size(delegate: usize) -> usize {
        mem::size_of::<FileSlot>() + delegate
    }

    /// Where the delegate's `sqlite3_file` lives inside the slot.
    unsafe fn delegate_slot(slot: *mut ffi::sqlite3_file) -> *mut ffi::sqlite3_file {
        unsafe { slot.cast::<FileSlot>().add(1).cast() }
    }
}

fn with_file(
    file: *mut ffi::sqlite3_file,
    call: impl FnOnce(&mut VfsFile<'static, SqliteFile>) -> c_int,
) -> c_int {
    // SAFETY: the engine only invokes file methods on slots written by
    // `x_open`, one call at a time.
    let Some(slot) = (unsafe { file.cast::<FileSlot>().as_mut() }) else {
        return codes::SQLITE_MISUSE;
    };
    match &mut slot.state {
        SlotState::Open(file) => call(file),
        SlotState::Closed => codes::SQLITE_MISUSE,
    }
}

unsafe fn registered<'r, R: RegionSource<'static>>(vfs: *mut ffi::sqlite3_vfs) -> &'r Registered<R> {
    unsafe { &*(*vfs).pAppData.cast::<Registered<R>>() }
}

unsafe fn text<'t>(raw: *const c_char) -> std::borrow::Cow<'t, str> {
    if raw.is_null() {
        return std::borrow::Cow::Borrowed("");
    }
    unsafe { CStr::from_ptr(raw) }.to_string_lossy()
}

/// Writes `value` NUL-terminated into `out`, which holds `capacity` bytes.
unsafe fn write_text(out: *mut c_char, capacity: c_int, value: &str) {
    if out.is_null() || capacity <= 0 {
        return;
    }
    let len = value.len().min(capacity as usize - 1);
    unsafe {
        ptr::copy_nonoverlapping(value.as_ptr(), out.cast::<u8>(), len);
        *out.add(len) = 0;
    }
}

pub(crate) fn vfs_methods<R: RegionSource<'static>>(
    registered: *mut c_void,
    name: *const c_char,
    state_size: usize,
    max_pathname: usize,
) -> ffi::sqlite3_vfs {
    ffi::sqlite3_vfs {
        iVersion: 2,
        szOsFile: c_int::try_from(state_size).unwrap_or(c_int::MAX),
        mxPathname: c_int::try_from(max_pathname).unwrap_or(c_int::MAX),
        pNext: ptr::null_mut(),
        zName: name,
        pAppData: registered,
        xOpen: Some(x_open::<R>),
        xDelete: Some(x_delete::<R>),
        xAccess: Some(x_access::<R>),
        xFullPathname: Some(x_full_pathname::<R>),
        xDlOpen: Some(x_dl_open::<R>),
        xDlError: Some(x_dl_error::<R>),
        xDlSym: Some(x_dl_sym::<R>),
        xDlClose: Some(x_dl_close::<R>),
        xRandomness: Some(x_randomness::<R>),
        xSleep: Some(x_sleep::<R>),
        xCurrentTime: Some(x_current_time::<R>),
        xGetLastError: Some(x_get_last_error::<R>),
        xCurrentTimeInt64: Some(x_current_time_int64::<R>),
        xSetSystemCall: None,
        xGetSystemCall: None,
        xNextSystemCall: None,
    }
}

unsafe extern "C" fn x_open<R: RegionSource<'static>>(
    vfs: *mut ffi::sqlite3_vfs,
    name: ffi::sqlite3_filename,
    out: *mut ffi::sqlite3_file,
    flags: c_int,
    out_flags: *mut c_int,
) -> c_int {
    let registered = unsafe { registered::<R>(vfs) };
    let name = unsafe { SqliteFilename::from_raw(name) };
    let Some(sub) = NonNull::new(unsafe { FileSlot::delegate_slot(out) }) else {
        return codes::SQLITE_MISUSE;
    };
    let flags = OpenFlags::from_bits_retain(flags);
    let opened = registered.vfs().open_with(name.as_ref(), flags, |name, flags| {
        // SAFETY: the engine reserved `szOsFile` bytes at `out`, so the
        // delegate slot after our own state is large enough.
        unsafe { registered.vfs().delegate().open_in_place(sub, name, flags) }
    });
    match opened {
        Ok((file, used)) => {
            if !out_flags.is_null() {
                unsafe { out_flags.write(used.bits()) };
            }
            let methods: &'static ffi::sqlite3_io_methods =
                if file.is_memory_backed() || file.supports_shared_memory() {
                    &IO_METHODS_V3
                } else {
                    &IO_METHODS_V1
                };
            let slot = FileSlot {
                base: ffi::sqlite3_file { pMethods: methods },
                state: SlotState::Open(file),
            };
            unsafe { out.cast::<FileSlot>().write(slot) };
            codes::SQLITE_OK
        }
        Err(err) => {
            warn!(error = %err, flags = flags.bits(), "memvfs.xOpen failed");
            unsafe { (*out).pMethods = ptr::null() };
            err.code()
        }
    }
}

unsafe extern "C" fn x_delete<R: RegionSource<'static>>(
    vfs: *mut ffi::sqlite3_vfs,
    name: *const c_char,
    sync_dir: c_int,
) -> c_int {
    let registered = unsafe { registered::<R>(vfs) };
    let name = unsafe { text(name) };
    into_rc(registered.vfs().delete(&name, sync_dir != 0))
}

unsafe extern "C" fn x_access<R: RegionSource<'static>>(
    vfs: *mut ffi::sqlite3_vfs,
    name: *const c_char,
    flags: c_int,
    out: *mut c_int,
) -> c_int {
    let registered = unsafe { registered::<R>(vfs) };
    let Some(check) = AccessCheck::from_raw(flags) else {
        return codes::SQLITE_MISUSE;
    };
    let name = unsafe { text(name) };
    match registered.vfs().access(&name, check) {
        Ok(found) => {
            unsafe { out.write(found as c_int) };
            codes::SQLITE_OK
        }
        Err(err) => err.code(),
    }
}

unsafe extern "C" fn x_full_pathname<R: RegionSource<'static>>(
    vfs: *mut ffi::sqlite3_vfs,
    name: *const c_char,
    capacity: c_int,
    out: *mut c_char,
) -> c_int {
    let registered = unsafe { registered::<R>(vfs) };
    let name = unsafe { text(name) };
    match registered.vfs().full_pathname(&name, capacity.max(0) as usize) {
        Ok(full) => {
            unsafe { write_text(out, capacity, &full) };
            codes::SQLITE_OK
        }
        Err(err) => err.code(),
    }
}

unsafe extern "C" fn x_dl_open<R: RegionSource<'static>>(
    vfs: *mut ffi::sqlite3_vfs,
    path: *const c_char,
) -> *mut c_void {
    let registered = unsafe { registered::<R>(vfs) };
    let path = unsafe { text(path) };
    registered
        .vfs()
        .dl_open(&path)
        .map_or(ptr::null_mut(), |handle| handle.0.as_ptr())
}

unsafe extern "C" fn x_dl_error<R: RegionSource<'static>>(
    vfs: *mut ffi::sqlite3_vfs,
    capacity: c_int,
    out: *mut c_char,
) {
    let registered = unsafe { registered::<R>(vfs) };
    let message = registered.vfs().dl_error(capacity.max(0) as usize);
    unsafe { write_text(out, capacity, &message) };
}

type DlSymbolFn = unsafe extern "C" fn(*mut ffi::sqlite3_vfs, *mut c_void, *const c_char);

unsafe extern "C" fn x_dl_sym<R: RegionSource<'static>>(
    vfs: *mut ffi::sqlite3_vfs,
    handle: *mut c_void,
    symbol: *const c_char,
) -> Option<DlSymbolFn> {
    let registered = unsafe { registered::<R>(vfs) };
    let handle = DlHandle(NonNull::new(handle)?);
    let symbol = unsafe { text(symbol) };
    let found = registered.vfs().dl_sym(handle, &symbol)?;
    // SAFETY: the engine casts the address back to the extension entry
    // point's real signature before calling it.
    Some(unsafe { mem::transmute::<*mut c_void, DlSymbolFn>(found.0.as_ptr()) })
}

unsafe extern "C" fn x_dl_close<R: RegionSource<'static>>(
    vfs: *mut ffi::sqlite3_vfs,
    handle: *mut c_void,
) {
    let registered = unsafe { registered::<R>(vfs) };
    if let Some(handle) = NonNull::new(handle) {
        registered.vfs().dl_close(DlHandle(handle));
    }
}

unsafe extern "C" fn x_randomness<R: RegionSource<'static>>(
    vfs: *mut ffi::sqlite3_vfs,
    len: c_int,
    out: *mut c_char,
) -> c_int {
    let registered = unsafe { registered::<R>(vfs) };
    if out.is_null() || len <= 0 {
        return 0;
    }
    let dst = unsafe { slice::from_raw_parts_mut(out.cast::<u8>(), len as usize) };
    registered.vfs().randomness(dst) as c_int
}

unsafe extern "C" fn x_sleep<R: RegionSource<'static>>(
    vfs: *mut ffi::sqlite3_vfs,
    micros: c_int,
) -> c_int {
    let registered = unsafe { registered::<R>(vfs) };
    let slept = registered
        .vfs()
        .sleep(Duration::from_micros(micros.max(0) as u64));
    c_int::try_from(slept.as_micros()).unwrap_or(c_int::MAX)
}

unsafe extern "C" fn x_current_time<R: RegionSource<'static>>(
    vfs: *mut ffi::sqlite3_vfs,
    out: *mut f64,
) -> c_int {
    let registered = unsafe { registered::<R>(vfs) };
    match registered.vfs().current_time() {
        Ok(day) => {
            unsafe { out.write(day) };
            codes::SQLITE_OK
        }
        Err(err) => err.code(),
    }
}

unsafe extern "C" fn x_current_time_int64<R: RegionSource<'static>>(
    vfs: *mut ffi::sqlite3_vfs,
    out: *mut ffi::sqlite3_int64,
) -> c_int {
    let registered = unsafe { registered::<R>(vfs) };
    match registered.vfs().current_time_millis() {
        Ok(ms) => {
            unsafe { out.write(ms) };
            codes::SQLITE_OK
        }
        Err(err) => err.code(),
    }
}

unsafe extern "C" fn x_get_last_error<R: RegionSource<'static>>(
    vfs: *mut ffi::sqlite3_vfs,
    capacity: c_int,
    out: *mut c_char,
) -> c_int {
    let registered = unsafe { registered::<R>(vfs) };
    let (code, message) = registered.vfs().last_error(capacity.max(0) as usize);
    unsafe { write_text(out, capacity, &message) };
    code
}

const BASE_METHODS: ffi::sqlite3_io_methods = ffi::sqlite3_io_methods {
    iVersion: 1,
    xClose: Some(x_close),
    xRead: Some(x_read),
    xWrite: Some(x_write),
    xTruncate: Some(x_truncate),
    xSync: Some(x_sync),
    xFileSize: Some(x_file_size),
    xLock: Some(x_lock),
    xUnlock: Some(x_unlock),
    xCheckReservedLock: Some(x_check_reserved_lock),
    xFileControl: Some(x_file_control),
    xSectorSize: Some(x_sector_size),
    xDeviceCharacteristics: Some(x_device_characteristics),
    xShmMap: None,
    xShmLock: None,
    xShmBarrier: None,
    xShmUnmap: None,
    xFetch: None,
    xUnfetch: None,
};

static IO_METHODS_V1: ffi::sqlite3_io_methods = BASE_METHODS;

static IO_METHODS_V3: ffi::sqlite3_io_methods = ffi::sqlite3_io_methods {
    iVersion: 3,
    xShmMap: Some(x_shm_map),
    xShmLock: Some(x_shm_lock),
    xShmBarrier: Some(x_shm_barrier),
    xShmUnmap: Some(x_shm_unmap),
    xFetch: Some(x_fetch),
    xUnfetch: Some(x_unfetch),
    ..BASE_METHODS
};

unsafe extern "C" fn x_close(file: *mut ffi::sqlite3_file) -> c_int {
    // SAFETY: see `with_file`.
    let Some(slot) = (unsafe { file.cast::<FileSlot>().as_mut() }) else {
        return codes::SQLITE_MISUSE;
    };
    match mem::replace(&mut slot.state, SlotState::Closed) {
        SlotState::Open(mut file) => into_rc(file.close()),
        SlotState::Closed => codes::SQLITE_OK,
    }
}

unsafe extern "C" fn x_read(
    file: *mut ffi::sqlite3_file,
    dst: *mut c_void,
    len: c_int,
    off: ffi::sqlite3_int64,
) -> c_int {
    if dst.is_null() || len < 0 || off < 0 {
        return codes::SQLITE_IOERR_READ;
    }
    let dst = unsafe { slice::from_raw_parts_mut(dst.cast::<u8>(), len as usize) };
    with_file(file, |file| into_rc(file.read_at(off as u64, dst)))
}

unsafe extern "C" fn x_write(
    file: *mut ffi::sqlite3_file,
    src: *const c_void,
    len: c_int,
    off: ffi::sqlite3_int64,
) -> c_int {
    if src.is_null() || len < 0 || off < 0 {
        return codes::SQLITE_MISUSE;
    }
    let src = unsafe { slice::from_raw_parts(src.cast::<u8>(), len as usize) };
    with_file(file, |file| into_rc(file.write_at(off as u64, src)))
}

unsafe extern "C" fn x_truncate(file: *mut ffi::sqlite3_file, len: ffi::sqlite3_int64) -> c_int {
    if len < 0 {
        return codes::SQLITE_MISUSE;
    }
    with_file(file, |file| into_rc(file.truncate(len as u64)))
}

unsafe extern "C" fn x_sync(file: *mut ffi::sqlite3_file, flags: c_int) -> c_int {
    with_file(file, |file| into_rc(file.sync(SyncFlags::from_bits_retain(flags))))
}

unsafe extern "C" fn x_file_size(
    file: *mut ffi::sqlite3_file,
    out: *mut ffi::sqlite3_int64,
) -> c_int {
    with_file(file, |file| match file.file_size() {
        Ok(size) => {
            unsafe { out.write(size as ffi::sqlite3_int64) };
            codes::SQLITE_OK
        }
        Err(err) => err.code(),
    })
}

unsafe extern "C" fn x_lock(file: *mut ffi::sqlite3_file, level: c_int) -> c_int {
    let Some(level) = LockLevel::from_raw(level) else {
        return codes::SQLITE_MISUSE;
    };
    with_file(file, |file| into_rc(file.lock(level)))
}

unsafe extern "C" fn x_unlock(file: *mut ffi::sqlite3_file, level: c_int) -> c_int {
    let Some(level) = LockLevel::from_raw(level) else {
        return codes::SQLITE_MISUSE;
    };
    with_file(file, |file| into_rc(file.unlock(level)))
}

unsafe extern "C" fn x_check_reserved_lock(file: *mut ffi::sqlite3_file, out: *mut c_int) -> c_int {
    with_file(file, |file| match file.check_reserved_lock() {
        Ok(reserved) => {
            unsafe { out.write(reserved as c_int) };
            codes::SQLITE_OK
        }
        Err(err) => err.code(),
    })
}

unsafe extern "C" fn x_file_control(
    file: *mut ffi::sqlite3_file,
    op: c_int,
    arg: *mut c_void,
) -> c_int {
    with_file(file, |file| {
        if op != codes::SQLITE_FCNTL_VFSNAME {
            return into_rc(file.file_control(&mut FileControl::Raw { op, arg }));
        }
        let mut name = None;
        if let Err(err) = file.file_control(&mut FileControl::VfsName(&mut name)) {
            return err.code();
        }
        let Some(name) = name.and_then(|name| std::ffi::CString::new(name).ok()) else {
            return codes::SQLITE_OK;
        };
        if !arg.is_null() {
            // SAFETY: VFSNAME passes a `char **` that receives an engine
            // allocation the caller frees.
            unsafe {
                let out = arg.cast::<*mut c_char>();
                if !(*out).is_null() {
                    ffi::sqlite3_free((*out).cast());
                }
                *out = ffi::sqlite3_mprintf(c"%s".as_ptr(), name.as_ptr());
            }
        }
        codes::SQLITE_OK
    })
}

unsafe extern "C" fn x_sector_size(file: *mut ffi::sqlite3_file) -> c_int {
    with_file(file, |file| c_int::try_from(file.sector_size()).unwrap_or(c_int::MAX))
}

unsafe extern "C" fn x_device_characteristics(file: *mut ffi::sqlite3_file) -> c_int {
    with_file(file, |file| file.device_characteristics().bits())
}

unsafe extern "C" fn x_shm_map(
    file: *mut ffi::sqlite3_file,
    region: c_int,
    region_size: c_int,
    extend: c_int,
    out: *mut *mut c_void,
) -> c_int {
    if region < 0 || region_size < 0 {
        return codes::SQLITE_MISUSE;
    }
    with_file(file, |file| {
        match file.shm_map(region as u32, region_size as u32, extend != 0) {
            Ok(mapped) => {
                let mapped = mapped.map_or(ptr::null_mut(), |page| page.as_ptr().cast());
                unsafe { out.write(mapped) };
                codes::SQLITE_OK
            }
            Err(err) => err.code(),
        }
    })
}

unsafe extern "C" fn x_shm_lock(
    file: *mut ffi::sqlite3_file,
    offset: c_int,
    n: c_int,
    flags: c_int,
) -> c_int {
    if offset < 0 || n < 0 {
        return codes::SQLITE_MISUSE;
    }
    let flags = ShmLockFlags::from_bits_retain(flags);
    with_file(file, |file| into_rc(file.shm_lock(offset as u32, n as u32, flags)))
}

unsafe extern "C" fn x_shm_barrier(file: *mut ffi::sqlite3_file) {
    with_file(file, |file| {
        file.shm_barrier();
        codes::SQLITE_OK
    });
}

unsafe extern "C" fn x_shm_unmap(file: *mut ffi::sqlite3_file, delete: c_int) -> c_int {
    with_file(file, |file| into_rc(file.shm_unmap(delete != 0)))
}

unsafe extern "C" fn x_fetch(
    file: *mut ffi::sqlite3_file,
    off: ffi::sqlite3_int64,
    len: c_int,
    out: *mut *mut c_void,
) -> c_int {
    unsafe { out.write(ptr::null_mut()) };
    if off < 0 || len <= 0 {
        return codes::SQLITE_OK;
    }
    with_file(file, |file| match file.fetch(off as u64, len as usize) {
        Ok(page) => {
            let page = page.map_or(ptr::null_mut(), |page| page.as_ptr().cast());
            unsafe { out.write(page) };
            codes::SQLITE_OK
        }
        Err(err) => err.code(),
    })
}

unsafe extern "C" fn x_unfetch(
    file: *mut ffi::sqlite3_file,
    off: ffi::sqlite3_int64,
    page: *mut c_void,
) -> c_int {
    let page = NonNull::new(page.cast::<u8>());
    with_file(file, |file| into_rc(file.unfetch(off.max(0) as u64, page)))
}
