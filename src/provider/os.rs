#![allow(unsafe_code)]

//! Storage provider over the operating system's file system.

use std::ffi::{CStr, CString};
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::thread;
use std::time::Duration;

use rand::RngCore;
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::{
    bounded, julian_day, AccessCheck, DlHandle, DlSymbol, OpenFlags, StorageProvider,
    UriParameters, UriPath, UNIX_EPOCH_JULIAN_MS,
};
use crate::primitives::io::OsFile;
use crate::types::{codes, Result, VfsError};

/// Default longest pathname accepted by [`OsProvider`].
pub const DEFAULT_MAX_PATHNAME: usize = 1024;

/// Provider backed by `std::fs`, `rand` and the system clock.
#[derive(Debug, Clone)]
pub struct OsProvider {
    name: String,
    max_pathname: usize,
}

impl Default for OsProvider {
    fn default() -> Self {
        Self {
            name: "os".to_owned(),
            max_pathname: DEFAULT_MAX_PATHNAME,
        }
    }
}

impl OsProvider {
    /// Creates the provider with its default name and pathname limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the longest accepted pathname.
    pub fn with_max_pathname(mut self, max_pathname: usize) -> Self {
        self.max_pathname = max_pathname;
        self
    }

    fn open_path(path: &Path, flags: OpenFlags) -> io::Result<(fs::File, OpenFlags)> {
        let writable = flags.contains(OpenFlags::READ_WRITE);
        let mut options = OpenOptions::new();
        options.read(true).write(writable);
        if flags.contains(OpenFlags::CREATE) {
            if flags.contains(OpenFlags::EXCLUSIVE) {
                options.create_new(true);
            } else {
                options.create(true);
            }
        }
        match options.open(path) {
            Ok(file) => Ok((file, flags)),
            Err(err)
                if err.kind() == ErrorKind::PermissionDenied
                    && writable
                    && !flags.contains(OpenFlags::CREATE) =>
            {
                debug!(path = %path.display(), "os.open falling back to read-only");
                let file = OpenOptions::new().read(true).open(path)?;
                let used = (flags - OpenFlags::READ_WRITE) | OpenFlags::READ_ONLY;
                Ok((file, used))
            }
            Err(err) => Err(err),
        }
    }
}

impl StorageProvider for OsProvider {
    type Path = UriPath;
    type File = OsFile;

    fn name(&self) -> &str {
        &self.name
    }

    fn max_pathname(&self) -> usize {
        self.max_pathname
    }

    fn file_state_size(&self) -> usize {
        std::mem::size_of::<OsFile>()
    }

    fn open(&self, name: Option<&UriPath>, flags: OpenFlags) -> Result<(OsFile, OpenFlags)> {
        let Some(name) = name else {
            let file = tempfile::tempfile().map_err(|err| {
                warn!(error = %err, "os.open temporary file failed");
                VfsError::CantOpen("temporary file")
            })?;
            return Ok((OsFile::new(file, None, false), flags));
        };
        let path = PathBuf::from(name.path());
        let (file, used) = Self::open_path(&path, flags).map_err(|err| {
            warn!(path = %path.display(), error = %err, "os.open failed");
            VfsError::CantOpen("os open failed")
        })?;
        debug!(path = %path.display(), flags = ?used, "os.open");
        let delete_on_close = flags.contains(OpenFlags::DELETE_ON_CLOSE);
        Ok((OsFile::new(file, Some(path), delete_on_close), used))
    }

    fn delete(&self, name: &str, sync_dir: bool) -> Result<()> {
        let path = Path::new(name);
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(VfsError::from_code(codes::SQLITE_IOERR_DELETE_NOENT));
            }
            Err(err) => return Err(err.into()),
        }
        #[cfg(unix)]
        if sync_dir {
            let parent = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            fs::File::open(parent)?.sync_all()?;
        }
        #[cfg(not(unix))]
        let _ = sync_dir;
        Ok(())
    }

    fn access(&self, name: &str, check: AccessCheck) -> Result<bool> {
        let metadata = match fs::metadata(name) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        Ok(match check {
            AccessCheck::Exists | AccessCheck::Read => true,
            AccessCheck::ReadWrite => !metadata.permissions().readonly(),
        })
    }

    fn full_pathname(&self, name: &str, capacity: usize) -> Result<String> {
        let path = Path::new(name);
        let full = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        let full = full.to_string_lossy().into_owned();
        if full.len() >= capacity {
            return Err(VfsError::CantOpen("pathname too long"));
        }
        Ok(full)
    }

    #[cfg(unix)]
    fn dl_open(&self, path: &str) -> Option<DlHandle> {
        let path = CString::new(path).ok()?;
        // SAFETY: `path` is a valid NUL-terminated string.
        let handle = unsafe { libc::dlopen(path.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL) };
        NonNull::new(handle).map(DlHandle)
    }

    #[cfg(not(unix))]
    fn dl_open(&self, _path: &str) -> Option<DlHandle> {
        None
    }

    #[cfg(unix)]
    fn dl_error(&self, capacity: usize) -> String {
        // SAFETY: `dlerror` returns null or a NUL-terminated string owned by
        // the loader, valid until the next loader call on this thread.
        let message = unsafe {
            let raw = libc::dlerror();
            if raw.is_null() {
                return String::new();
            }
            CStr::from_ptr(raw).to_string_lossy().into_owned()
        };
        bounded(&message, capacity)
    }

    #[cfg(not(unix))]
    fn dl_error(&self, capacity: usize) -> String {
        bounded("dynamic loading unsupported", capacity)
    }

    #[cfg(unix)]
    fn dl_sym(&self, handle: DlHandle, symbol: &str) -> Option<DlSymbol> {
        let symbol = CString::new(symbol).ok()?;
        // SAFETY: `handle` came from `dlopen` and `symbol` is NUL-terminated.
        let address = unsafe { libc::dlsym(handle.0.as_ptr(), symbol.as_ptr()) };
        NonNull::new(address).map(DlSymbol)
    }

    #[cfg(not(unix))]
    fn dl_sym(&self, _handle: DlHandle, _symbol: &str) -> Option<DlSymbol> {
        None
    }

    #[cfg(unix)]
    fn dl_close(&self, handle: DlHandle) {
        // SAFETY: `handle` came from `dlopen`.
        unsafe {
            libc::dlclose(handle.0.as_ptr());
        }
    }

    #[cfg(not(unix))]
    fn dl_close(&self, _handle: DlHandle) {}

    fn randomness(&self, dst: &mut [u8]) -> usize {
        rand::thread_rng().fill_bytes(dst);
        dst.len()
    }

    fn sleep(&self, duration: Duration) -> Duration {
        thread::sleep(duration);
        duration
    }

    fn current_time(&self) -> Result<f64> {
        Ok(julian_day(self.current_time_millis()?))
    }

    fn current_time_millis(&self) -> Result<i64> {
        let unix_ms = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        let unix_ms = i64::try_from(unix_ms).map_err(|_| VfsError::Misuse("clock overflow"))?;
        Ok(UNIX_EPOCH_JULIAN_MS + unix_ms)
    }

    fn last_error(&self, capacity: usize) -> (i32, String) {
        let err = io::Error::last_os_error();
        let code = err.raw_os_error().unwrap_or(0);
        (code, bounded(&err.to_string(), capacity))
    }
}
