#![allow(missing_docs)]

use std::error::Error;
use std::path::Path;
use std::sync::Arc;

use memvfs::{
    register, DurabilityHandle, LentRegions, MemoryFileConfig, RecordingLog, Registered,
    SqliteProvider, StorageProvider, VfsOptions,
};
use rusqlite::{Connection, OpenFlags};
use tempfile::tempdir;

const HEADER: &[u8] = b"SQLite format 3\0";
const CAPACITY: usize = 1 << 20;

fn open_default(
    registered: &Registered<LentRegions<'static>>,
    path: &Path,
    raw_handle: i64,
) -> Result<(Connection, usize), Box<dyn Error>> {
    let buf: &'static mut [u8] = Box::leak(vec![0u8; CAPACITY].into_boxed_slice());
    let address = registered.regions().lend(buf);
    let durability = DurabilityHandle::new(raw_handle).ok_or("zero handle")?;
    let config = MemoryFileConfig::new(address, 0, CAPACITY as u64, durability);
    let uri = config.to_uri(path.to_str().ok_or("utf-8 path")?).to_string();
    let conn = Connection::open_with_flags(
        uri,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI,
    )?;
    Ok((conn, address))
}

// One test per binary: default registration changes process-wide state.
#[test]
fn default_registration_serves_plain_opens() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let first = register(VfsOptions::default(), Arc::new(RecordingLog::new()))?;
    assert_eq!(first.name(), "memvfs");
    let default = SqliteProvider::default_vfs()?;
    assert!(std::ptr::eq(default.as_ptr(), first.as_ptr()));
    assert_eq!(default.name(), "memvfs");

    let path = dir.path().join("plain.db");
    let (conn, address) = open_default(first, &path, 5)?;
    conn.execute_batch("CREATE TABLE t(x); INSERT INTO t VALUES (1), (2);")?;
    let image = first.regions().copy_out(address, HEADER.len()).ok_or("region")?;
    assert_eq!(image, HEADER);
    assert_eq!(std::fs::metadata(&path)?.len(), 0);
    assert_eq!(first.registry().len(), 1);
    drop(conn);

    // A later default must delegate to the OS VFS, not to the first memory VFS.
    let second = register(
        VfsOptions::default().with_name("memvfs-second"),
        Arc::new(RecordingLog::new()),
    )?;
    assert_eq!(SqliteProvider::default_vfs()?.name(), "memvfs-second");
    assert_eq!(second.vfs().delegate().name(), first.vfs().delegate().name());
    assert_ne!(second.vfs().delegate().name(), "memvfs");

    let path = dir.path().join("second.db");
    let (conn, address) = open_default(second, &path, 6)?;
    conn.execute_batch("CREATE TABLE u(y);")?;
    let count: i64 =
        conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get(0))?;
    assert_eq!(count, 1);
    let image = second.regions().copy_out(address, HEADER.len()).ok_or("region")?;
    assert_eq!(image, HEADER);
    assert_eq!(std::fs::metadata(&path)?.len(), 0);
    Ok(())
}
