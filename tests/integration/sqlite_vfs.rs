#![allow(missing_docs)]

use std::error::Error;
use std::path::Path;
use std::sync::Arc;

use memvfs::{
    register, DurabilityHandle, LentRegions, MemoryFileConfig, RecordingLog, Registered,
    VfsOptions,
};
use rusqlite::{Connection, ErrorCode, OpenFlags};
use tempfile::tempdir;

const HEADER: &[u8] = b"SQLite format 3\0";

struct Harness {
    registered: &'static Registered<LentRegions<'static>>,
    log: Arc<RecordingLog>,
}

impl Harness {
    fn new(name: &str) -> Self {
        let log = Arc::new(RecordingLog::new());
        let options = VfsOptions::default().with_name(name).make_default(false);
        let registered = register(options, log.clone()).expect("register memory vfs");
        Self { registered, log }
    }

    fn lend(&self, capacity: usize) -> usize {
        let buf: &'static mut [u8] = Box::leak(vec![0u8; capacity].into_boxed_slice());
        self.registered.regions().lend(buf)
    }

    fn open(&self, path: &Path, config: &MemoryFileConfig) -> rusqlite::Result<Connection> {
        let uri = config.to_uri(path.to_str().expect("utf-8 path")).to_string();
        Connection::open_with_flags_and_vfs(
            uri,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
            self.registered.name(),
        )
    }
}

fn handle(raw: i64) -> DurabilityHandle {
    DurabilityHandle::new(raw).expect("non-zero handle")
}

fn image_len(conn: &Connection) -> rusqlite::Result<usize> {
    let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
    let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
    Ok((page_size * page_count) as usize)
}

#[test]
fn database_lives_in_the_lent_buffer() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new("memvfs-it-basic");
    let dir = tempdir()?;
    let path = dir.path().join("basic.db");
    let capacity = 1 << 20;
    let address = harness.lend(capacity);
    let config = MemoryFileConfig::new(address, 0, capacity as u64, handle(3));

    let conn = harness.open(&path, &config)?;
    conn.execute_batch(
        "CREATE TABLE kv(k TEXT PRIMARY KEY, v INTEGER);
         INSERT INTO kv VALUES ('a', 1), ('b', 2), ('c', 3);",
    )?;
    let total: i64 = conn.query_row("SELECT sum(v) FROM kv", [], |row| row.get(0))?;
    assert_eq!(total, 6);
    let len = image_len(&conn)?;
    assert!(harness.registered.registry().contains(path.to_str().unwrap()));
    conn.close().map_err(|(_, err)| err)?;

    let image = harness
        .registered
        .regions()
        .copy_out(address, len)
        .expect("lent buffer");
    assert_eq!(&image[..HEADER.len()], HEADER);
    assert_eq!(std::fs::metadata(&path)?.len(), 0, "real file never written");
    assert!(harness.log.commits(handle(3)) > 0, "syncs checkpoint by default");
    assert!(!harness.registered.registry().contains(path.to_str().unwrap()));
    Ok(())
}

#[test]
fn reopening_with_the_image_size_sees_committed_rows() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new("memvfs-it-reopen");
    let dir = tempdir()?;
    let path = dir.path().join("reopen.db");
    let capacity = 256 * 1024;
    let address = harness.lend(capacity);

    let config = MemoryFileConfig::new(address, 0, capacity as u64, handle(5));
    let conn = harness.open(&path, &config)?;
    conn.execute_batch("CREATE TABLE t(x); INSERT INTO t VALUES (42);")?;
    let len = image_len(&conn)?;
    conn.close().map_err(|(_, err)| err)?;

    let config = MemoryFileConfig::new(address, len as u64, capacity as u64, handle(5));
    let conn = harness.open(&path, &config)?;
    let x: i64 = conn.query_row("SELECT x FROM t", [], |row| row.get(0))?;
    assert_eq!(x, 42);
    assert_eq!(harness.log.starts(handle(5)), 2);
    Ok(())
}

#[test]
fn zero_durability_handle_refuses_to_open() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new("memvfs-it-nofd");
    let dir = tempdir()?;
    let path = dir.path().join("nofd.db");
    let address = harness.lend(4096);
    let uri = format!("file:{}?ptr={address:#x}&sz=0&max=4096&fd=0", path.display());

    let err = Connection::open_with_flags_and_vfs(
        uri,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI,
        harness.registered.name(),
    )
    .err()
    .expect("open must fail");
    assert_eq!(err.sqlite_error_code(), Some(ErrorCode::CannotOpen));
    Ok(())
}

#[test]
fn unlent_address_refuses_to_open() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new("memvfs-it-unlent");
    let dir = tempdir()?;
    let path = dir.path().join("unlent.db");
    let uri = format!("file:{}?ptr=0x1000&sz=0&max=4096&fd=3", path.display());

    let err = Connection::open_with_flags_and_vfs(
        uri,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI,
        harness.registered.name(),
    )
    .err()
    .expect("open must fail");
    assert_eq!(err.sqlite_error_code(), Some(ErrorCode::CannotOpen));
    Ok(())
}

#[test]
fn filling_the_buffer_reports_full() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new("memvfs-it-full");
    let dir = tempdir()?;
    let path = dir.path().join("full.db");
    let capacity = 16 * 1024;
    let address = harness.lend(capacity);
    let config = MemoryFileConfig::new(address, 0, capacity as u64, handle(8));

    let conn = harness.open(&path, &config)?;
    conn.execute_batch("PRAGMA page_size = 1024; CREATE TABLE blobs(b BLOB);")?;
    let mut full = None;
    for _ in 0..64 {
        if let Err(err) = conn.execute("INSERT INTO blobs VALUES (zeroblob(900))", []) {
            full = Some(err);
            break;
        }
    }
    let err = full.expect("buffer must fill up");
    assert_eq!(err.sqlite_error_code(), Some(ErrorCode::DiskFull));
    assert!(image_len(&conn)? <= capacity);
    Ok(())
}

#[test]
fn write_threshold_commits_without_sync_checkpoints() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new("memvfs-it-threshold");
    let dir = tempdir()?;
    let path = dir.path().join("threshold.db");
    let capacity = 1 << 20;
    let address = harness.lend(capacity);
    let config = MemoryFileConfig::new(address, 0, capacity as u64, handle(12))
        .with_threshold(8 * 1024)
        .with_checkpoint_on_flush(false);

    let conn = harness.open(&path, &config)?;
    conn.execute_batch("CREATE TABLE t(b BLOB);")?;
    conn.execute_batch(
        "BEGIN;
         INSERT INTO t SELECT zeroblob(1000) FROM (SELECT 1 UNION ALL SELECT 2 UNION ALL SELECT 3
             UNION ALL SELECT 4 UNION ALL SELECT 5 UNION ALL SELECT 6 UNION ALL SELECT 7
             UNION ALL SELECT 8 UNION ALL SELECT 9 UNION ALL SELECT 10 UNION ALL SELECT 11
             UNION ALL SELECT 12 UNION ALL SELECT 13 UNION ALL SELECT 14 UNION ALL SELECT 15
             UNION ALL SELECT 16 UNION ALL SELECT 17 UNION ALL SELECT 18 UNION ALL SELECT 19
             UNION ALL SELECT 20);
         COMMIT;",
    )?;
    assert!(harness.log.commits(handle(12)) >= 1);
    Ok(())
}

#[test]
fn failed_checkpoint_surfaces_as_an_error() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new("memvfs-it-snapshot");
    let dir = tempdir()?;
    let path = dir.path().join("snapshot.db");
    let capacity = 1 << 20;
    let address = harness.lend(capacity);
    let config = MemoryFileConfig::new(address, 0, capacity as u64, handle(21));

    let conn = harness.open(&path, &config)?;
    harness.log.fail_commits(handle(21));
    let err = conn
        .execute_batch("CREATE TABLE t(x); INSERT INTO t VALUES (1);")
        .err()
        .expect("sync checkpoint fails");
    assert!(err.sqlite_error_code().is_some());
    assert_eq!(harness.log.commits(handle(21)), 0);
    Ok(())
}

#[test]
fn journals_go_through_the_default_vfs() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new("memvfs-it-journal");
    let dir = tempdir()?;
    let path = dir.path().join("journal.db");
    let capacity = 1 << 20;
    let address = harness.lend(capacity);
    let config = MemoryFileConfig::new(address, 0, capacity as u64, handle(30));

    let conn = harness.open(&path, &config)?;
    conn.execute_batch(
        "PRAGMA journal_mode = PERSIST; CREATE TABLE t(x); INSERT INTO t VALUES (1);",
    )?;
    let journal = dir.path().join("journal.db-journal");
    assert!(journal.exists(), "persisted journal is a real file");
    Ok(())
}
