#![allow(missing_docs)]

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use memvfs::provider::{AccessCheck, LockLevel, SyncFlags};
use memvfs::types::codes;
use memvfs::{
    DurabilityHandle, FileHandle, LentRegions, MemVfs, MemoryFileConfig, OpenFlags, OsProvider,
    RecordingLog, StorageProvider, UriPath, VfsOptions,
};
use tempfile::tempdir;

const MAIN: OpenFlags = OpenFlags::READ_WRITE
    .union(OpenFlags::CREATE)
    .union(OpenFlags::MAIN_DB);
const JOURNAL: OpenFlags = OpenFlags::READ_WRITE
    .union(OpenFlags::CREATE)
    .union(OpenFlags::MAIN_JOURNAL);

fn handle(raw: i64) -> DurabilityHandle {
    DurabilityHandle::new(raw).expect("non-zero handle")
}

fn os_vfs<'a>(
    regions: Arc<LentRegions<'a>>,
    log: Arc<RecordingLog>,
) -> MemVfs<'a, OsProvider, LentRegions<'a>> {
    MemVfs::new(VfsOptions::default(), OsProvider::new(), regions, log)
}

#[test]
fn journal_files_land_on_disk() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let vfs = os_vfs(Arc::new(LentRegions::new()), Arc::new(RecordingLog::new()));
    let journal = dir.path().join("app.db-journal");
    let name = UriPath::new(journal.to_str().unwrap());

    let (mut file, used) = vfs.open(Some(&name), JOURNAL)?;
    assert_eq!(used, JOURNAL);
    assert!(!file.is_memory_backed());
    file.write_at(0, b"rollback journal")?;
    file.sync(SyncFlags::NORMAL)?;
    assert_eq!(file.file_size()?, 16);
    file.close()?;

    assert_eq!(std::fs::read(&journal)?, b"rollback journal");
    assert!(vfs.access(journal.to_str().unwrap(), AccessCheck::Exists)?);
    vfs.delete(journal.to_str().unwrap(), true)?;
    assert!(!journal.exists());
    let err = vfs.delete(journal.to_str().unwrap(), false).unwrap_err();
    assert_eq!(err.code(), codes::SQLITE_IOERR_DELETE_NOENT);
    Ok(())
}

#[test]
fn main_database_never_touches_its_disk_file() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let path = dir.path().join("main.db");
    let mut buf = vec![0u8; 8192];
    let regions = Arc::new(LentRegions::new());
    let address = regions.lend(&mut buf);
    let log = Arc::new(RecordingLog::new());
    let vfs = os_vfs(regions.clone(), log.clone());

    let config = MemoryFileConfig::new(address, 0, 8192, handle(9));
    let name = config.to_uri(path.to_str().unwrap());
    let (mut file, _) = vfs.open(Some(&name), MAIN)?;
    assert!(file.is_memory_backed());
    assert!(path.exists(), "delegate opened alongside the region");

    file.write_at(0, &[0x5A; 4096])?;
    file.lock(LockLevel::Exclusive)?;
    file.sync(SyncFlags::FULL)?;
    file.unlock(LockLevel::None)?;
    assert_eq!(log.commits(handle(9)), 1);
    assert!(vfs.access(path.to_str().unwrap(), AccessCheck::ReadWrite)?);
    file.close()?;

    assert_eq!(std::fs::metadata(&path)?.len(), 0);
    let image = regions.copy_out(address, 4096).unwrap();
    assert!(image.iter().all(|&b| b == 0x5A));
    Ok(())
}

#[test]
fn existing_image_is_served_from_the_region() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let path = dir.path().join("seeded.db");
    let mut buf = vec![0u8; 1024];
    buf[..5].copy_from_slice(b"hello");
    let regions = Arc::new(LentRegions::new());
    let address = regions.lend(&mut buf);
    let vfs = os_vfs(regions, Arc::new(RecordingLog::new()));

    let config = MemoryFileConfig::new(address, 5, 1024, handle(2));
    let (mut file, _) = vfs.open(Some(&config.to_uri(path.to_str().unwrap())), MAIN)?;
    assert_eq!(file.file_size()?, 5);
    let mut out = [0u8; 5];
    file.read_at(0, &mut out)?;
    assert_eq!(&out, b"hello");
    file.truncate(0)?;
    assert_eq!(file.file_size()?, 0);
    Ok(())
}

#[test]
fn temporary_files_without_names_are_delegated() -> Result<(), Box<dyn Error>> {
    let vfs = os_vfs(Arc::new(LentRegions::new()), Arc::new(RecordingLog::new()));
    let flags = OpenFlags::READ_WRITE
        | OpenFlags::CREATE
        | OpenFlags::DELETE_ON_CLOSE
        | OpenFlags::TEMP_JOURNAL;
    let (mut file, _) = vfs.open(None, flags)?;
    assert!(!file.is_memory_backed());
    file.write_at(10, b"x")?;
    assert_eq!(file.file_size()?, 11);
    file.close()?;
    Ok(())
}

#[test]
fn main_database_without_a_name_cannot_open() {
    let vfs = os_vfs(Arc::new(LentRegions::new()), Arc::new(RecordingLog::new()));
    let err = vfs.open(None, MAIN).err().expect("nameless main database");
    assert_eq!(err.code(), codes::SQLITE_CANTOPEN);
}

#[test]
fn provider_services_come_from_the_delegate() -> Result<(), Box<dyn Error>> {
    let vfs = os_vfs(Arc::new(LentRegions::new()), Arc::new(RecordingLog::new()));
    assert_eq!(vfs.name(), "memvfs");

    let mut noise = [0u8; 64];
    assert_eq!(vfs.randomness(&mut noise), 64);
    assert!(noise.iter().any(|&b| b != 0));

    let days = vfs.current_time()?;
    let millis = vfs.current_time_millis()?;
    assert!(days > 2_440_587.5, "after the Unix epoch");
    assert!((millis as f64 / 86_400_000.0 - days).abs() < 0.01);

    assert_eq!(vfs.sleep(Duration::from_millis(1)), Duration::from_millis(1));
    assert!(vfs.dl_open("/definitely/not/a/library.so").is_none());
    Ok(())
}

#[test]
fn full_pathname_does_not_resolve_relative_names() -> Result<(), Box<dyn Error>> {
    let vfs = os_vfs(Arc::new(LentRegions::new()), Arc::new(RecordingLog::new()));
    assert_eq!(vfs.full_pathname("relative.db", 1024)?, "relative.db");
    assert_eq!(vfs.full_pathname("relative.db", 4)?, "rel");
    Ok(())
}
