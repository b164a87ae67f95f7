#![allow(missing_docs)]

use std::path::PathBuf;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

fn scratch(name: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join(format!("{name}.db"));
    (dir, path)
}

fn exec(db: &PathBuf, sql: &str) {
    cargo_bin_cmd!("memvfs")
        .arg("exec")
        .arg(db)
        .arg(sql)
        .assert()
        .success();
}

fn json(stdout: &[u8]) -> Value {
    serde_json::from_slice(stdout).expect("json output")
}

#[test]
fn exec_writes_the_image_back() {
    let (_dir, db) = scratch("exec");
    let output = cargo_bin_cmd!("memvfs")
        .arg("exec")
        .arg(&db)
        .arg("CREATE TABLE people(name TEXT); INSERT INTO people VALUES ('ada'), ('lin');")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let stdout = String::from_utf8_lossy(&output);
    assert!(stdout.contains("Image written back"), "{stdout}");

    let bytes = std::fs::read(&db).expect("database file");
    assert!(bytes.starts_with(b"SQLite format 3\0"));
    let conn = rusqlite::Connection::open(&db).expect("plain open");
    let count: i64 = conn
        .query_row("SELECT count(*) FROM people", [], |row| row.get(0))
        .expect("count");
    assert_eq!(count, 2);
}

#[test]
fn query_reads_a_previously_written_image() {
    let (_dir, db) = scratch("query");
    exec(&db, "CREATE TABLE t(a INTEGER, b TEXT); INSERT INTO t VALUES (1, 'x'), (2, NULL);");

    let output = cargo_bin_cmd!("memvfs")
        .arg("query")
        .arg(&db)
        .arg("SELECT a, b FROM t ORDER BY a")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let stdout = String::from_utf8_lossy(&output);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines, ["a|b", "1|x", "2|"]);
}

#[test]
fn query_json_reports_rows_and_session() {
    let (_dir, db) = scratch("query-json");
    exec(&db, "CREATE TABLE blobs(b BLOB); INSERT INTO blobs VALUES (x'00ff');");

    let output = cargo_bin_cmd!("memvfs")
        .args(["--format", "json", "query"])
        .arg(&db)
        .arg("SELECT b FROM blobs")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report = json(&output);
    assert_eq!(report["columns"], serde_json::json!(["b"]));
    assert_eq!(report["rows"][0][0], "x'00ff'");
    assert_eq!(report["vfs"], "memvfs");
    assert!(report["loaded_bytes"].as_u64().unwrap() > 0);
}

#[test]
fn dry_run_leaves_the_file_alone() {
    let (_dir, db) = scratch("dry-run");
    exec(&db, "CREATE TABLE t(x);");
    let before = std::fs::read(&db).expect("seeded");

    cargo_bin_cmd!("memvfs")
        .arg("exec")
        .arg(&db)
        .arg("--dry-run")
        .arg("INSERT INTO t VALUES (1); CREATE TABLE u(y);")
        .assert()
        .success();
    assert_eq!(std::fs::read(&db).expect("unchanged"), before);
}

#[test]
fn info_lists_tables_without_writing() {
    let (_dir, db) = scratch("info");
    exec(&db, "CREATE TABLE beta(x); CREATE TABLE alpha(y);");
    let before = std::fs::read(&db).expect("seeded");

    let output = cargo_bin_cmd!("memvfs")
        .args(["--format", "json", "info"])
        .arg(&db)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report = json(&output);
    assert_eq!(report["tables"], serde_json::json!(["alpha", "beta"]));
    assert_eq!(report["persisted"], false);
    assert_eq!(
        report["image_bytes"].as_u64().unwrap(),
        report["page_size"].as_u64().unwrap() * report["page_count"].as_u64().unwrap()
    );
    assert_eq!(std::fs::read(&db).expect("unchanged"), before);
}

#[test]
fn undersized_buffer_is_rejected() {
    let (_dir, db) = scratch("small");
    exec(&db, "CREATE TABLE t(x); INSERT INTO t VALUES (zeroblob(20000));");

    let output = cargo_bin_cmd!("memvfs")
        .arg("info")
        .arg(&db)
        .args(["--capacity", "4096"])
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    let stderr = String::from_utf8_lossy(&output);
    assert!(stderr.contains("more than the 4096-byte buffer"), "{stderr}");
}

#[test]
fn zero_session_is_rejected() {
    let (_dir, db) = scratch("zero");
    cargo_bin_cmd!("memvfs")
        .arg("exec")
        .arg(&db)
        .args(["--fd", "0"])
        .arg("SELECT 1")
        .assert()
        .failure();
}

#[test]
fn config_file_names_the_vfs() {
    let (dir, db) = scratch("config");
    let config = dir.path().join("memvfs.toml");
    std::fs::write(
        &config,
        "[vfs]\nname = \"memvfs-configured\"\n\n[memory]\ncapacity = 1048576\n",
    )
    .expect("config");

    let output = cargo_bin_cmd!("memvfs")
        .arg("--config")
        .arg(&config)
        .args(["--format", "json", "exec"])
        .arg(&db)
        .arg("CREATE TABLE t(x)")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report = json(&output);
    assert_eq!(report["vfs"], "memvfs-configured");
    assert_eq!(report["capacity"], 1_048_576);
    assert_eq!(report["persisted"], true);
}
