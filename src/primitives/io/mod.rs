//! Positioned file I/O on operating-system files.
//!
//! [`OsFile`] is the file handle of the operating-system provider: plain
//! `std::fs::File` positioned reads and writes. Lock levels are tracked per
//! handle and never taken on the file itself, so two handles on one path do
//! not exclude each other.

use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    ptr::NonNull,
};

use tracing::{debug, trace, warn};

use crate::provider::{
    FileControl, FileHandle, IoCapabilities, LockLevel, ShmLockFlags, SyncFlags,
};
use crate::types::{Result, VfsError};

const SECTOR_SIZE: u32 = 4096;

#[cfg(unix)]
/// Unix positioned I/O using `pread`/`pwrite` semantics.
pub mod stdio_unix {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::unix::fs::FileExt,
    };

    /// Reads into `dst` at `off` until it is full or the file ends, returning
    /// the number of bytes read.
    pub fn read_full(file: &File, mut off: u64, dst: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < dst.len() {
            match file.read_at(&mut dst[filled..], off) {
                Ok(0) => break,
                Ok(read) => {
                    filled += read;
                    off += read as u64;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(filled)
    }

    /// Writes all of `src` at `off`.
    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.write_at(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "write_at wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

#[cfg(windows)]
/// Windows positioned I/O using `seek_read`/`seek_write` semantics.
pub mod stdio_win {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::windows::fs::FileExt,
    };

    /// Reads into `dst` at `off` until it is full or the file ends, returning
    /// the number of bytes read.
    pub fn read_full(file: &File, mut off: u64, dst: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < dst.len() {
            match file.seek_read(&mut dst[filled..], off) {
                Ok(0) => break,
                Ok(read) => {
                    filled += read;
                    off += read as u64;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(filled)
    }

    /// Writes all of `src` at `off`.
    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.seek_write(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "seek_write wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

/// An open operating-system file.
#[derive(Debug)]
pub struct OsFile {
    file: File,
    path: Option<PathBuf>,
    delete_on_close: bool,
    lock: LockLevel,
    closed: bool,
}

impl OsFile {
    /// Wraps an open file. `path` is removed on close when `delete_on_close`
    /// is set.
    pub fn new(file: File, path: Option<PathBuf>, delete_on_close: bool) -> Self {
        Self {
            file,
            path,
            delete_on_close,
            lock: LockLevel::None,
            closed: false,
        }
    }

    /// Path the file was opened from, if it has one.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Lock level currently held.
    pub fn lock_level(&self) -> LockLevel {
        self.lock
    }

    #[cfg(unix)]
    fn read_full(&self, off: u64, dst: &mut [u8]) -> io::Result<usize> {
        stdio_unix::read_full(&self.file, off, dst)
    }

    #[cfg(windows)]
    fn read_full(&self, off: u64, dst: &mut [u8]) -> io::Result<usize> {
        stdio_win::read_full(&self.file, off, dst)
    }

    #[cfg(unix)]
    fn write_all(&self, off: u64, src: &[u8]) -> io::Result<()> {
        stdio_unix::write_all(&self.file, off, src)
    }

    #[cfg(windows)]
    fn write_all(&self, off: u64, src: &[u8]) -> io::Result<()> {
        stdio_win::write_all(&self.file, off, src)
    }

    #[cfg(not(any(unix, windows)))]
    fn read_full(&self, _off: u64, _dst: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "positioned reads unsupported on this platform",
        ))
    }

    #[cfg(not(any(unix, windows)))]
    fn write_all(&self, _off: u64, _src: &[u8]) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "positioned writes unsupported on this platform",
        ))
    }
}

impl FileHandle for OsFile {
    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.lock = LockLevel::None;
        if self.delete_on_close {
            if let Some(path) = &self.path {
                debug!(path = %path.display(), "os_file.close delete");
                match fs::remove_file(path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(())
    }

    fn read_at(&mut self, off: u64, dst: &mut [u8]) -> Result<()> {
        let read = self.read_full(off, dst)?;
        if read < dst.len() {
            trace!(off, wanted = dst.len(), read, "os_file.short_read");
            dst[read..].fill(0);
            return Err(VfsError::ShortRead);
        }
        Ok(())
    }

    fn write_at(&mut self, off: u64, src: &[u8]) -> Result<()> {
        self.write_all(off, src)?;
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    fn sync(&mut self, flags: SyncFlags) -> Result<()> {
        if flags.contains(SyncFlags::DATA_ONLY) {
            self.file.sync_data()?;
        } else {
            self.file.sync_all()?;
        }
        Ok(())
    }

    fn file_size(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn lock(&mut self, level: LockLevel) -> Result<()> {
        if level > self.lock {
            trace!(from = ?self.lock, to = ?level, "os_file.lock");
            self.lock = level;
        }
        Ok(())
    }

    fn unlock(&mut self, level: LockLevel) -> Result<()> {
        if level < self.lock {
            trace!(from = ?self.lock, to = ?level, "os_file.unlock");
            self.lock = level;
        }
        Ok(())
    }

    fn check_reserved_lock(&mut self) -> Result<bool> {
        Ok(self.lock >= LockLevel::Reserved)
    }

    fn file_control(&mut self, request: &mut FileControl<'_>) -> Result<()> {
        match request {
            FileControl::VfsName(out) => {
                **out = Some("os".to_owned());
                Ok(())
            }
            FileControl::Raw { .. } => Err(VfsError::NotFound),
        }
    }

    fn sector_size(&mut self) -> u32 {
        SECTOR_SIZE
    }

    fn device_characteristics(&mut self) -> IoCapabilities {
        IoCapabilities::POWERSAFE_OVERWRITE
    }

    fn shm_map(
        &mut self,
        _region: u32,
        _region_size: u32,
        _extend: bool,
    ) -> Result<Option<NonNull<u8>>> {
        Err(VfsError::ShmMap)
    }

    fn shm_lock(&mut self, _offset: u32, _n: u32, _flags: ShmLockFlags) -> Result<()> {
        Err(VfsError::ShmLock)
    }

    fn shm_barrier(&mut self) {}

    fn shm_unmap(&mut self, _delete: bool) -> Result<()> {
        Ok(())
    }

    fn fetch(&mut self, _off: u64, _len: usize) -> Result<Option<NonNull<u8>>> {
        Ok(None)
    }

    fn unfetch(&mut self, _off: u64, _page: Option<NonNull<u8>>) -> Result<()> {
        Ok(())
    }

    fn supports_shared_memory(&self) -> bool {
        false
    }
}

impl Drop for OsFile {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "os_file.drop close failed");
        }
    }
}
