//! The memory VFS: a storage provider that serves the main database file from
//! application memory and forwards everything else to another provider.
//!
//! [`MemVfs`] wraps a delegate [`StorageProvider`]. Open requests that carry
//! the main-database flag are parsed for `ptr`/`sz`/`max`/`fd` parameters and
//! become [`VfsFile::MemoryBacked`]; every other request is opened by the
//! delegate and wrapped as [`VfsFile::Delegated`]. Provider-level services
//! (delete, dynamic loading, randomness, sleep, clock, last error) go straight
//! to the delegate.

use std::marker::PhantomData;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::primitives::region::{LentRegions, MemoryRegion, RegionSource};
use crate::provider::{
    bounded, AccessCheck, DlHandle, DlSymbol, FileHandle, OpenFlags, StorageProvider,
    UriParameters,
};
use crate::types::{Result, VfsError};

pub mod checkpoint;
pub mod config;
pub mod durability;
pub mod file;
pub mod registry;

pub use checkpoint::{Checkpoint, CheckpointTrigger};
pub use config::MemoryFileConfig;
pub use durability::{DurabilityLog, RecordingLog};
pub use file::{MemoryFile, VfsFile};
pub use registry::{MainDbEntry, Registry, RegistryLease};

/// Name the provider registers under unless configured otherwise.
pub const DEFAULT_VFS_NAME: &str = "memvfs";
/// Longest pathname accepted unless configured otherwise.
pub const DEFAULT_MAX_PATHNAME: usize = 1024;

/// Provider-level configuration.
///
/// Deserializable so tools can read it from a TOML `[vfs]` table.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct VfsOptions {
    /// Name the provider is known by.
    pub name: String,
    /// Longest pathname accepted.
    pub max_pathname: usize,
    /// Whether registration makes the provider the engine's default. On by
    /// default; ordinary opens without `ptr=` then fail with `CantOpen`.
    pub make_default: bool,
}

impl Default for VfsOptions {
    fn default() -> Self {
        Self {
            name: DEFAULT_VFS_NAME.to_owned(),
            max_pathname: DEFAULT_MAX_PATHNAME,
            make_default: true,
        }
    }
}

impl VfsOptions {
    /// Sets the provider name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the longest accepted pathname.
    pub fn with_max_pathname(mut self, max_pathname: usize) -> Self {
        self.max_pathname = max_pathname;
        self
    }

    /// Makes registration install the provider as the default.
    pub fn make_default(mut self, make_default: bool) -> Self {
        self.make_default = make_default;
        self
    }
}

/// Identity and sizing of a constructed provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VfsDescriptor {
    /// Name the provider is known by.
    pub name: String,
    /// Longest pathname accepted.
    pub max_pathname: usize,
    /// Per-file state: this layer's handle plus the delegate's state.
    pub file_state_size: usize,
}

/// Storage provider that serves main databases from lent memory.
pub struct MemVfs<'a, P, R = LentRegions<'a>>
where
    P: StorageProvider,
    R: RegionSource<'a>,
{
    descriptor: VfsDescriptor,
    delegate: P,
    regions: Arc<R>,
    log: Arc<dyn DurabilityLog>,
    registry: Registry,
    _regions: PhantomData<fn() -> MemoryRegion<'a>>,
}

impl<'a, P, R> MemVfs<'a, P, R>
where
    P: StorageProvider,
    R: RegionSource<'a>,
{
    /// Wraps `delegate`, resolving `ptr=` addresses through `regions` and
    /// committing checkpoints to `log`.
    pub fn new(
        options: VfsOptions,
        delegate: P,
        regions: Arc<R>,
        log: Arc<dyn DurabilityLog>,
    ) -> Self {
        let descriptor = VfsDescriptor {
            name: options.name,
            max_pathname: options.max_pathname,
            file_state_size: mem::size_of::<VfsFile<'a, P::File>>() + delegate.file_state_size(),
        };
        debug!(
            name = %descriptor.name,
            delegate = delegate.name(),
            file_state_size = descriptor.file_state_size,
            "memvfs.new"
        );
        Self {
            descriptor,
            delegate,
            regions,
            log,
            registry: Registry::new(),
            _regions: PhantomData,
        }
    }

    /// Identity and sizing of the provider.
    pub fn descriptor(&self) -> &VfsDescriptor {
        &self.descriptor
    }

    /// The provider every non-special-cased call goes to.
    pub fn delegate(&self) -> &P {
        &self.delegate
    }

    /// Source of memory regions for `ptr=` addresses.
    pub fn regions(&self) -> &Arc<R> {
        &self.regions
    }

    /// Durability log receiving checkpoints.
    pub fn log(&self) -> &Arc<dyn DurabilityLog> {
        &self.log
    }

    /// Main databases currently served from memory.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Opens `name`, using `open_delegate` to open the delegate sub-handle.
    ///
    /// This is [`StorageProvider::open`] with the delegate's open step
    /// supplied by the caller, for hosts that must place the delegate's state
    /// in storage they own.
    pub fn open_with<F, O>(
        &self,
        name: Option<&P::Path>,
        flags: OpenFlags,
        open_delegate: O,
    ) -> Result<(VfsFile<'a, F>, OpenFlags)>
    where
        F: FileHandle,
        O: FnOnce(Option<&P::Path>, OpenFlags) -> Result<(F, OpenFlags)>,
    {
        if !flags.is_main_db() {
            let (file, used) = open_delegate(name, flags)?;
            return Ok((VfsFile::Delegated(file), used));
        }

        let path = name.ok_or(VfsError::CantOpen("main database without a name"))?;
        let config = MemoryFileConfig::parse(path)?;
        let capacity = usize::try_from(config.capacity)
            .map_err(|_| VfsError::CantOpen("max parameter exceeds the address space"))?;
        let region = self
            .regions
            .resolve(config.address, capacity)
            .ok_or(VfsError::CantOpen("ptr parameter does not name a lent region"))?;

        self.log.start(config.durability).map_err(|err| {
            warn!(error = %err, "memvfs.open durability start failed");
            VfsError::Internal(err)
        })?;

        let (delegate, used) = open_delegate(name, flags)?;
        let ident = path.path().to_owned();
        let lease = self
            .registry
            .register(&ident, config.address, config.capacity);
        debug!(name = %ident, %config, "memvfs.open memory-backed");
        let file = MemoryFile::new(&config, region, self.log.clone(), delegate, ident, lease);
        Ok((VfsFile::MemoryBacked(file), used))
    }
}

impl<'a, P, R> StorageProvider for MemVfs<'a, P, R>
where
    P: StorageProvider,
    R: RegionSource<'a>,
{
    type Path = P::Path;
    type File = VfsFile<'a, P::File>;

    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn max_pathname(&self) -> usize {
        self.descriptor.max_pathname
    }

    fn file_state_size(&self) -> usize {
        self.descriptor.file_state_size
    }

    fn open(&self, name: Option<&P::Path>, flags: OpenFlags) -> Result<(Self::File, OpenFlags)> {
        self.open_with(name, flags, |name, flags| self.delegate.open(name, flags))
    }

    fn delete(&self, name: &str, sync_dir: bool) -> Result<()> {
        self.delegate.delete(name, sync_dir)
    }

    fn access(&self, name: &str, check: AccessCheck) -> Result<bool> {
        if self.registry.contains(name) {
            return Ok(true);
        }
        self.delegate.access(name, check)
    }

    fn full_pathname(&self, name: &str, capacity: usize) -> Result<String> {
        Ok(bounded(name, capacity))
    }

    fn dl_open(&self, path: &str) -> Option<DlHandle> {
        self.delegate.dl_open(path)
    }

    fn dl_error(&self, capacity: usize) -> String {
        self.delegate.dl_error(capacity)
    }

    fn dl_sym(&self, handle: DlHandle, symbol: &str) -> Option<DlSymbol> {
        self.delegate.dl_sym(handle, symbol)
    }

    fn dl_close(&self, handle: DlHandle) {
        self.delegate.dl_close(handle)
    }

    fn randomness(&self, dst: &mut [u8]) -> usize {
        self.delegate.randomness(dst)
    }

    fn sleep(&self, duration: Duration) -> Duration {
        self.delegate.sleep(duration)
    }

    fn current_time(&self) -> Result<f64> {
        self.delegate.current_time()
    }

    fn current_time_millis(&self) -> Result<i64> {
        self.delegate.current_time_millis()
    }

    fn last_error(&self, capacity: usize) -> (i32, String) {
        self.delegate.last_error(capacity)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::primitives::io::OsFile;
    use crate::provider::os::OsProvider;
    use crate::provider::{SyncFlags, UriPath};
    use crate::types::{codes, DurabilityHandle};

    /// Counts delegate access calls so tests can prove they were skipped.
    #[derive(Default)]
    struct CountingProvider {
        os: OsProvider,
        accesses: AtomicUsize,
    }

    impl StorageProvider for CountingProvider {
        type Path = UriPath;
        type File = OsFile;

        fn name(&self) -> &str {
            "counting"
        }
        fn max_pathname(&self) -> usize {
            self.os.max_pathname()
        }
        fn file_state_size(&self) -> usize {
            self.os.file_state_size()
        }
        fn open(&self, _name: Option<&UriPath>, flags: OpenFlags) -> Result<(OsFile, OpenFlags)> {
            self.os.open(None, flags)
        }
        fn delete(&self, name: &str, sync_dir: bool) -> Result<()> {
            self.os.delete(name, sync_dir)
        }
        fn access(&self, name: &str, check: AccessCheck) -> Result<bool> {
            self.accesses.fetch_add(1, Ordering::SeqCst);
            self.os.access(name, check)
        }
        fn full_pathname(&self, name: &str, capacity: usize) -> Result<String> {
            self.os.full_pathname(name, capacity)
        }
        fn dl_open(&self, path: &str) -> Option<DlHandle> {
            self.os.dl_open(path)
        }
        fn dl_error(&self, capacity: usize) -> String {
            self.os.dl_error(capacity)
        }
        fn dl_sym(&self, handle: DlHandle, symbol: &str) -> Option<DlSymbol> {
            self.os.dl_sym(handle, symbol)
        }
        fn dl_close(&self, handle: DlHandle) {
            self.os.dl_close(handle)
        }
        fn randomness(&self, dst: &mut [u8]) -> usize {
            self.os.randomness(dst)
        }
        fn sleep(&self, duration: Duration) -> Duration {
            duration
        }
        fn current_time(&self) -> Result<f64> {
            self.os.current_time()
        }
        fn current_time_millis(&self) -> Result<i64> {
            self.os.current_time_millis()
        }
        fn last_error(&self, capacity: usize) -> (i32, String) {
            self.os.last_error(capacity)
        }
    }

    const MAIN: OpenFlags = OpenFlags::READ_WRITE
        .union(OpenFlags::CREATE)
        .union(OpenFlags::MAIN_DB);

    fn vfs<'a>(
        regions: Arc<LentRegions<'a>>,
        log: Arc<RecordingLog>,
    ) -> MemVfs<'a, CountingProvider, LentRegions<'a>> {
        MemVfs::new(VfsOptions::default(), CountingProvider::default(), regions, log)
    }

    fn handle(raw: i64) -> DurabilityHandle {
        DurabilityHandle::new(raw).unwrap()
    }

    #[test]
    fn scenario_write_threshold_commits_once_crossed() {
        let mut buf = vec![0u8; 4096];
        let regions = Arc::new(LentRegions::new());
        let address = regions.lend(&mut buf);
        let log = Arc::new(RecordingLog::new());
        let vfs = vfs(regions.clone(), log.clone());

        let uri = UriPath::parse(&format!(
            "file:/scenario-a.db?ptr={address:#x}&sz=0&max=4096&fd=7&threshold=100"
        ));
        let (mut file, _) = vfs.open(Some(&uri), MAIN).unwrap();
        assert!(file.is_memory_backed());
        assert_eq!(log.starts(handle(7)), 1);

        file.write_at(0, &[1u8; 50]).unwrap();
        assert_eq!(file.as_memory().unwrap().unflushed(), 50);
        assert_eq!(log.commits(handle(7)), 0);

        file.write_at(50, &[2u8; 60]).unwrap();
        let memory = file.as_memory().unwrap();
        assert_eq!(log.commits(handle(7)), 1);
        assert_eq!(memory.unflushed(), 0);
        assert_eq!(memory.size(), 110);
        file.close().unwrap();

        let image = regions.copy_out(address, 110).unwrap();
        assert!(image[..50].iter().all(|&b| b == 1));
        assert!(image[50..].iter().all(|&b| b == 2));
    }

    #[test]
    fn scenario_write_past_capacity_is_full() {
        let mut buf = vec![0u8; 10];
        let regions = Arc::new(LentRegions::new());
        let address = regions.lend(&mut buf);
        let vfs = vfs(regions, Arc::new(RecordingLog::new()));
        let uri = UriPath::parse(&format!("file:/b.db?ptr={address}&sz=10&max=10&fd=1"));
        let (mut file, _) = vfs.open(Some(&uri), MAIN).unwrap();
        let err = file.write_at(8, &[0u8; 5]).unwrap_err();
        assert_eq!(err.code(), codes::SQLITE_FULL);
        assert_eq!(file.file_size().unwrap(), 10);
    }

    #[test]
    fn scenario_zero_durability_handle_cannot_open() {
        let mut buf = vec![0u8; 64];
        let regions = Arc::new(LentRegions::new());
        let address = regions.lend(&mut buf);
        let log = Arc::new(RecordingLog::new());
        let vfs = vfs(regions, log.clone());
        let uri = UriPath::parse(&format!("file:/c.db?ptr={address}&sz=0&max=64&fd=0"));
        let err = vfs.open(Some(&uri), MAIN).err().unwrap();
        assert_eq!(err.code(), codes::SQLITE_CANTOPEN);
        assert!(vfs.registry().is_empty());
    }

    #[test]
    fn scenario_sync_without_flush_checkpoints_keeps_counter() {
        let mut buf = vec![0u8; 1024];
        let regions = Arc::new(LentRegions::new());
        let address = regions.lend(&mut buf);
        let log = Arc::new(RecordingLog::new());
        let vfs = vfs(regions, log.clone());
        let uri = UriPath::parse(&format!(
            "file:/d.db?ptr={address}&sz=0&max=1024&fd=4&ckptOnSync=0"
        ));
        let (mut file, _) = vfs.open(Some(&uri), MAIN).unwrap();
        file.write_at(0, &[5u8; 500]).unwrap();
        file.sync(SyncFlags::FULL).unwrap();
        assert_eq!(log.commits(handle(4)), 0);
        assert_eq!(file.as_memory().unwrap().unflushed(), 500);
    }

    #[test]
    fn scenario_access_reports_open_main_database_without_delegate() {
        let mut buf = vec![0u8; 64];
        let regions = Arc::new(LentRegions::new());
        let address = regions.lend(&mut buf);
        let vfs = vfs(regions, Arc::new(RecordingLog::new()));
        let uri = UriPath::parse(&format!("file:/nowhere/e.db?ptr={address}&sz=0&max=64&fd=2"));
        let (mut file, _) = vfs.open(Some(&uri), MAIN).unwrap();

        assert!(vfs.access("/nowhere/e.db", AccessCheck::Exists).unwrap());
        assert_eq!(vfs.delegate().accesses.load(Ordering::SeqCst), 0);

        assert!(!vfs.access("/nowhere/e.db-journal", AccessCheck::Exists).unwrap());
        assert_eq!(vfs.delegate().accesses.load(Ordering::SeqCst), 1);

        file.close().unwrap();
        assert!(!vfs.access("/nowhere/e.db", AccessCheck::Exists).unwrap());
    }

    #[test]
    fn durability_start_failure_is_internal() {
        let mut buf = vec![0u8; 64];
        let regions = Arc::new(LentRegions::new());
        let address = regions.lend(&mut buf);
        let log = Arc::new(RecordingLog::new());
        log.fail_starts(handle(3));
        let vfs = vfs(regions, log);
        let uri = UriPath::parse(&format!("file:/f.db?ptr={address}&sz=0&max=64&fd=3"));
        let err = vfs.open(Some(&uri), MAIN).err().unwrap();
        assert_eq!(err.code(), codes::SQLITE_INTERNAL);
    }

    #[test]
    fn unlent_address_cannot_open() {
        let regions = Arc::new(LentRegions::new());
        let vfs = vfs(regions, Arc::new(RecordingLog::new()));
        let uri = UriPath::parse("file:/g.db?ptr=0x1000&sz=0&max=64&fd=3");
        let err = vfs.open(Some(&uri), MAIN).err().unwrap();
        assert!(matches!(err, VfsError::CantOpen(_)));
    }

    #[test]
    fn capacity_beyond_the_lent_buffer_cannot_open() {
        let mut buf = vec![0u8; 64];
        let regions = Arc::new(LentRegions::new());
        let address = regions.lend(&mut buf);
        let vfs = vfs(regions, Arc::new(RecordingLog::new()));
        let uri = UriPath::parse(&format!("file:/h.db?ptr={address}&sz=0&max=65&fd=3"));
        assert!(vfs.open(Some(&uri), MAIN).is_err());
    }

    #[test]
    fn non_main_files_are_delegated() {
        let regions = Arc::new(LentRegions::new());
        let vfs = vfs(regions, Arc::new(RecordingLog::new()));
        let flags = OpenFlags::READ_WRITE | OpenFlags::CREATE | OpenFlags::MAIN_JOURNAL;
        let uri = UriPath::new("/whatever-journal");
        let (mut file, used) = vfs.open(Some(&uri), flags).unwrap();
        assert_eq!(used, flags);
        assert!(!file.is_memory_backed());
        file.write_at(0, b"abc").unwrap();
        assert_eq!(file.file_size().unwrap(), 3);
        assert!(file.supports_shared_memory() == file.delegate().supports_shared_memory());
    }

    #[test]
    fn full_pathname_returns_the_name_bounded() {
        let vfs = vfs(Arc::new(LentRegions::new()), Arc::new(RecordingLog::new()));
        assert_eq!(vfs.full_pathname("rel/db", 64).unwrap(), "rel/db");
        assert_eq!(vfs.full_pathname("abcdef", 4).unwrap(), "abc");
    }

    #[test]
    fn descriptor_reflects_options() {
        let options = VfsOptions::default()
            .with_name("memvfs-test")
            .with_max_pathname(512);
        let vfs: MemVfs<'_, CountingProvider> = MemVfs::new(
            options,
            CountingProvider::default(),
            Arc::new(LentRegions::new()),
            Arc::new(RecordingLog::new()),
        );
        assert_eq!(vfs.name(), "memvfs-test");
        assert_eq!(vfs.max_pathname(), 512);
        assert!(vfs.descriptor().file_state_size > mem::size_of::<OsFile>());
    }

    #[test]
    fn options_load_from_toml() {
        assert!(VfsOptions::default().make_default);
        let options: VfsOptions =
            toml::from_str("name = \"mem\"\nmake_default = false\n").unwrap();
        assert_eq!(options.name, "mem");
        assert!(!options.make_default);
        assert_eq!(options.max_pathname, DEFAULT_MAX_PATHNAME);
        assert!(toml::from_str::<VfsOptions>("bogus = 1").is_err());
    }
}
