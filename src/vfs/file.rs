#![forbid(unsafe_code)]

//! Dual-mode file handles.
//!
//! A [`VfsFile`] is fixed at open time as either memory-backed (the main
//! database, served from a lent region) or delegated (every other file,
//! forwarded verbatim to the underlying provider's handle).

use std::ptr::NonNull;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::checkpoint::CheckpointTrigger;
use super::config::MemoryFileConfig;
use super::durability::DurabilityLog;
use super::registry::RegistryLease;
use crate::primitives::region::MemoryRegion;
use crate::provider::{
    FileControl, FileHandle, IoCapabilities, LockLevel, ShmLockFlags, SyncFlags,
};
use crate::types::{DurabilityHandle, Result, VfsError};

/// Sector size reported for memory-backed files.
pub const MEMORY_SECTOR_SIZE: u32 = 1024;

/// Capabilities reported for memory-backed files.
pub const MEMORY_CAPABILITIES: IoCapabilities = IoCapabilities::ATOMIC
    .union(IoCapabilities::POWERSAFE_OVERWRITE)
    .union(IoCapabilities::SAFE_APPEND)
    .union(IoCapabilities::SEQUENTIAL);

/// The main database file served from a lent region.
///
/// The region is never allocated or freed here. The delegate handle is kept
/// open alongside it and closed with it.
pub struct MemoryFile<'a, F> {
    region: MemoryRegion<'a>,
    size: u64,
    trigger: CheckpointTrigger,
    durability: DurabilityHandle,
    log: Arc<dyn DurabilityLog>,
    delegate: F,
    name: String,
    lease: Option<RegistryLease>,
    closed: bool,
}

impl<'a, F: FileHandle> MemoryFile<'a, F> {
    pub(crate) fn new(
        config: &MemoryFileConfig,
        region: MemoryRegion<'a>,
        log: Arc<dyn DurabilityLog>,
        delegate: F,
        name: String,
        lease: RegistryLease,
    ) -> Self {
        Self {
            region,
            size: config.size,
            trigger: CheckpointTrigger::new(config.checkpoint_threshold, config.checkpoint_on_flush),
            durability: config.durability,
            log,
            delegate,
            name,
            lease: Some(lease),
            closed: false,
        }
    }

    /// Logical file length.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Fixed capacity of the backing region.
    pub fn capacity(&self) -> u64 {
        self.region.capacity() as u64
    }

    /// Address of the backing region.
    pub fn address(&self) -> usize {
        self.region.address()
    }

    /// Bytes written since the last checkpoint.
    pub fn unflushed(&self) -> u64 {
        self.trigger.unflushed()
    }

    /// Checkpoint policy and accounting.
    pub fn trigger(&self) -> &CheckpointTrigger {
        &self.trigger
    }

    /// Durability log session of the file.
    pub fn durability(&self) -> DurabilityHandle {
        self.durability
    }

    /// Name the file was opened under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The delegate handle opened alongside the region.
    pub fn delegate(&self) -> &F {
        &self.delegate
    }

    fn full(&self, end: u64) -> VfsError {
        VfsError::Full {
            end,
            capacity: self.capacity(),
        }
    }
}

impl<F: FileHandle> FileHandle for MemoryFile<'_, F> {
    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Err(err) = self.delegate.close() {
            warn!(name = %self.name, error = %err, "memory_file.close delegate failed");
        }
        if let Some(lease) = self.lease.take() {
            lease.release();
        }
        debug!(
            name = %self.name,
            size = self.size,
            unflushed = self.trigger.unflushed(),
            "memory_file.close"
        );
        Ok(())
    }

    fn read_at(&mut self, off: u64, dst: &mut [u8]) -> Result<()> {
        trace!(off, len = dst.len(), "memory_file.read");
        self.region.read(off, dst)
    }

    fn write_at(&mut self, off: u64, src: &[u8]) -> Result<()> {
        let end = off
            .checked_add(src.len() as u64)
            .ok_or_else(|| self.full(u64::MAX))?;
        if end > self.capacity() {
            return Err(self.full(end));
        }
        trace!(off, len = src.len(), "memory_file.write");
        self.region.write(off, src)?;
        self.size = self.size.max(end);
        self.trigger.record_write(src.len());
        self.trigger.after_write(self.log.as_ref(), self.durability)?;
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        if len > self.size {
            if len > self.capacity() {
                return Err(self.full(len));
            }
            let grow = usize::try_from(len - self.size).map_err(|_| self.full(len))?;
            self.region.zero(self.size, grow)?;
        }
        trace!(from = self.size, to = len, "memory_file.truncate");
        self.size = len;
        Ok(())
    }

    fn sync(&mut self, _flags: SyncFlags) -> Result<()> {
        self.trigger.on_sync(self.log.as_ref(), self.durability)?;
        Ok(())
    }

    fn file_size(&mut self) -> Result<u64> {
        Ok(self.size)
    }

    fn lock(&mut self, _level: LockLevel) -> Result<()> {
        Ok(())
    }

    fn unlock(&mut self, _level: LockLevel) -> Result<()> {
        Ok(())
    }

    fn check_reserved_lock(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn file_control(&mut self, request: &mut FileControl<'_>) -> Result<()> {
        match request {
            FileControl::VfsName(out) => {
                **out = Some(format!("memvfs({:#x},{})", self.address(), self.size));
                Ok(())
            }
            FileControl::Raw { .. } => Err(VfsError::NotFound),
        }
    }

    fn sector_size(&mut self) -> u32 {
        MEMORY_SECTOR_SIZE
    }

    fn device_characteristics(&mut self) -> IoCapabilities {
        MEMORY_CAPABILITIES
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

    fn fetch(&mut self, off: u64, len: usize) -> Result<Option<NonNull<u8>>> {
        Ok(self.region.page(off, len))
    }

    fn unfetch(&mut self, _off: u64, _page: Option<NonNull<u8>>) -> Result<()> {
        Ok(())
    }

    fn supports_shared_memory(&self) -> bool {
        false
    }
}

/// A file opened through the memory VFS.
pub enum VfsFile<'a, F> {
    /// The main database, served from a lent region.
    MemoryBacked(MemoryFile<'a, F>),
    /// Any other file, forwarded to the underlying provider.
    Delegated(F),
}

impl<'a, F: FileHandle> VfsFile<'a, F> {
    /// Whether the file is served from memory.
    pub fn is_memory_backed(&self) -> bool {
        matches!(self, VfsFile::MemoryBacked(_))
    }

    /// The memory-backed state, if any.
    pub fn as_memory(&self) -> Option<&MemoryFile<'a, F>> {
        match self {
            VfsFile::MemoryBacked(file) => Some(file),
            VfsFile::Delegated(_) => None,
        }
    }

    /// The underlying provider's handle, present in both modes.
    pub fn delegate(&self) -> &F {
        match self {
            VfsFile::MemoryBacked(file) => file.delegate(),
            VfsFile::Delegated(file) => file,
        }
    }
}

macro_rules! dispatch {
    ($self:expr, $file:ident => $call:expr) => {
        match $self {
            VfsFile::MemoryBacked($file) => $call,
            VfsFile::Delegated($file) => $call,
        }
    };
}

impl<F: FileHandle> FileHandle for VfsFile<'_, F> {
    fn close(&mut self) -> Result<()> {
        dispatch!(self, file => file.close())
    }

    fn read_at(&mut self, off: u64, dst: &mut [u8]) -> Result<()> {
        dispatch!(self, file => file.read_at(off, dst))
    }

    fn write_at(&mut self, off: u64, src: &[u8]) -> Result<()> {
        dispatch!(self, file => file.write_at(off, src))
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        dispatch!(self, file => file.truncate(len))
    }

    fn sync(&mut self, flags: SyncFlags) -> Result<()> {
        dispatch!(self, file => file.sync(flags))
    }

    fn file_size(&mut self) -> Result<u64> {
        dispatch!(self, file => file.file_size())
    }

    fn lock(&mut self, level: LockLevel) -> Result<()> {
        dispatch!(self, file => file.lock(level))
    }

    fn unlock(&mut self, level: LockLevel) -> Result<()> {
        dispatch!(self, file => file.unlock(level))
    }

    fn check_reserved_lock(&mut self) -> Result<bool> {
        dispatch!(self, file => file.check_reserved_lock())
    }

    fn file_control(&mut self, request: &mut FileControl<'_>) -> Result<()> {
        dispatch!(self, file => file.file_control(request))
    }

    fn sector_size(&mut self) -> u32 {
        dispatch!(self, file => file.sector_size())
    }

    fn device_characteristics(&mut self) -> IoCapabilities {
        dispatch!(self, file => file.device_characteristics())
    }

    fn shm_map(
        &mut self,
        region: u32,
        region_size: u32,
        extend: bool,
    ) -> Result<Option<NonNull<u8>>> {
        dispatch!(self, file => file.shm_map(region, region_size, extend))
    }

    fn shm_lock(&mut self, offset: u32, n: u32, flags: ShmLockFlags) -> Result<()> {
        dispatch!(self, file => file.shm_lock(offset, n, flags))
    }

    fn shm_barrier(&mut self) {
        dispatch!(self, file => file.shm_barrier())
    }

    fn shm_unmap(&mut self, delete: bool) -> Result<()> {
        dispatch!(self, file => file.shm_unmap(delete))
    }

    fn fetch(&mut self, off: u64, len: usize) -> Result<Option<NonNull<u8>>> {
        dispatch!(self, file => file.fetch(off, len))
    }

    fn unfetch(&mut self, off: u64, page: Option<NonNull<u8>>) -> Result<()> {
        dispatch!(self, file => file.unfetch(off, page))
    }

    fn supports_shared_memory(&self) -> bool {
        dispatch!(self, file => file.supports_shared_memory())
    }
}
