//! Binary entry point for the memvfs CLI.
//!
//! Loads a database file into a process-owned buffer, runs SQL against it
//! through the memory VFS, and writes the image back.
#![forbid(unsafe_code)]

#[path = "memvfs/config.rs"]
mod config;

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use clap::{Args, Parser, Subcommand, ValueEnum};
use memvfs::{register, DurabilityHandle, MemoryFileConfig, RecordingLog, Registered};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use tracing_subscriber::{fmt, EnvFilter};

use config::{CliConfig, ConfigError, MemorySettings};

#[derive(Parser, Debug)]
#[command(
    name = "memvfs",
    version,
    about = "Run SQL against a database served from memory",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "FILE",
        env = "MEMVFS_CONFIG",
        help = "TOML file with [vfs] and [memory] tables"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct MemoryArgs {
    #[arg(value_name = "DB")]
    db_path: PathBuf,

    #[arg(long, value_name = "BYTES", help = "Capacity of the in-memory buffer")]
    capacity: Option<u64>,

    #[arg(
        long,
        value_name = "BYTES",
        help = "Checkpoint after this many unflushed bytes (0 disables)"
    )]
    threshold: Option<u64>,

    #[arg(long, help = "Do not checkpoint when the engine syncs")]
    no_ckpt_on_sync: bool,

    #[arg(long, value_name = "N", help = "Durability log session")]
    fd: Option<i64>,

    #[arg(long, help = "Leave the database file untouched")]
    dry_run: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Execute SQL statements and persist the result")]
    Exec {
        #[command(flatten)]
        memory: MemoryArgs,

        #[arg(value_name = "SQL")]
        sql: String,
    },

    #[command(about = "Run a query and print its rows")]
    Query {
        #[command(flatten)]
        memory: MemoryArgs,

        #[arg(value_name = "SQL")]
        sql: String,
    },

    #[command(about = "Describe the database image")]
    Info {
        #[command(flatten)]
        memory: MemoryArgs,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Vfs(#[from] memvfs::VfsError),
    #[error("sql: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{path} holds {len} bytes, more than the {capacity}-byte buffer")]
    TooLarge {
        path: PathBuf,
        len: u64,
        capacity: u64,
    },
    #[error("database image of {len} bytes exceeds the lent buffer")]
    ImageOutOfRange { len: u64 },
}

#[derive(Serialize)]
struct SessionReport {
    database: String,
    vfs: String,
    capacity: u64,
    loaded_bytes: u64,
    image_bytes: u64,
    commits: u64,
    persisted: bool,
}

#[derive(Serialize)]
struct QueryReport {
    columns: Vec<String>,
    rows: Vec<Vec<serde_json::Value>>,
    #[serde(flatten)]
    session: SessionReport,
}

#[derive(Serialize)]
struct InfoReport {
    page_size: u64,
    page_count: u64,
    journal_mode: String,
    tables: Vec<String>,
    #[serde(flatten)]
    session: SessionReport,
}

fn main() {
    install_tracing_subscriber();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn install_tracing_subscriber() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
    });
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.clone())?;
    let log = Arc::new(RecordingLog::new());
    let registered = register(config.vfs().clone(), log.clone())?;

    match cli.command {
        Command::Exec { memory, sql } => {
            let settings = build_memory_settings(config.memory(), &memory)?;
            let session = Session::open(registered, &log, &memory.db_path, &settings)?;
            session.conn()?.execute_batch(&sql)?;
            let report = session.finish(memory.dry_run)?;
            emit(cli.format, &report, || print_session_text(&report))?;
        }
        Command::Query { memory, sql } => {
            let settings = build_memory_settings(config.memory(), &memory)?;
            let session = Session::open(registered, &log, &memory.db_path, &settings)?;
            let (columns, rows) = run_query(session.conn()?, &sql)?;
            let session = session.finish(memory.dry_run)?;
            let report = QueryReport {
                columns,
                rows,
                session,
            };
            emit(cli.format, &report, || print_query_text(&report))?;
        }
        Command::Info { memory } => {
            let settings = build_memory_settings(config.memory(), &memory)?;
            let session = Session::open(registered, &log, &memory.db_path, &settings)?;
            let conn = session.conn()?;
            let page_size: u64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
            let page_count: u64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
            let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
            let mut stmt =
                conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
            let tables = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            drop(stmt);
            let session = session.finish(true)?;
            let report = InfoReport {
                page_size,
                page_count,
                journal_mode,
                tables,
                session,
            };
            emit(cli.format, &report, || print_info_text(&report))?;
        }
    }

    Ok(())
}

fn build_memory_settings(
    base: &MemorySettings,
    args: &MemoryArgs,
) -> Result<MemorySettings, ConfigError> {
    let mut settings = base.clone();
    if let Some(capacity) = args.capacity {
        settings.capacity = capacity;
    }
    if let Some(threshold) = args.threshold {
        settings.threshold = threshold;
    }
    if args.no_ckpt_on_sync {
        settings.ckpt_on_sync = false;
    }
    if let Some(fd) = args.fd {
        settings.fd = fd;
    }
    if settings.fd == 0 {
        return Err(ConfigError::ZeroSession);
    }
    Ok(settings)
}

/// One database loaded into a lent buffer and opened through the VFS.
struct Session<'r> {
    registered: &'r Registered,
    log: &'r RecordingLog,
    path: PathBuf,
    address: usize,
    capacity: u64,
    loaded: u64,
    durability: DurabilityHandle,
    conn: Option<Connection>,
}

impl<'r> Session<'r> {
    fn open(
        registered: &'r Registered,
        log: &'r RecordingLog,
        path: &Path,
        settings: &MemorySettings,
    ) -> Result<Self, CliError> {
        let durability = DurabilityHandle::new(settings.fd).ok_or(ConfigError::ZeroSession)?;
        let path = std::path::absolute(path).map_err(|source| CliError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let image = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(CliError::Io { path, source }),
        };
        let loaded = image.len() as u64;
        if loaded > settings.capacity {
            return Err(CliError::TooLarge {
                path,
                len: loaded,
                capacity: settings.capacity,
            });
        }
        let capacity_bytes = usize::try_from(settings.capacity).map_err(|_| CliError::TooLarge {
            path: path.clone(),
            len: loaded,
            capacity: settings.capacity,
        })?;

        let buffer: &'static mut [u8] = Box::leak(vec![0u8; capacity_bytes].into_boxed_slice());
        buffer[..image.len()].copy_from_slice(&image);
        let address = registered.regions().lend(buffer);

        let config = MemoryFileConfig::new(address, loaded, settings.capacity, durability)
            .with_threshold(settings.threshold)
            .with_checkpoint_on_flush(settings.ckpt_on_sync);
        let uri = config.to_uri(&path.to_string_lossy()).to_string();
        debug!(%uri, "memvfs.cli open");
        let conn = Connection::open_with_flags_and_vfs(
            &uri,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
            registered.name(),
        )?;
        info!(path = %path.display(), loaded, capacity = settings.capacity, "memvfs.cli loaded");
        Ok(Self {
            registered,
            log,
            path,
            address,
            capacity: settings.capacity,
            loaded,
            durability,
            conn: Some(conn),
        })
    }

    fn conn(&self) -> Result<&Connection, CliError> {
        self.conn
            .as_ref()
            .ok_or(CliError::Vfs(memvfs::VfsError::Misuse("session already finished")))
    }

    /// Closes the connection and writes the image back unless `dry_run`.
    fn finish(mut self, dry_run: bool) -> Result<SessionReport, CliError> {
        let conn = self
            .conn
            .take()
            .ok_or(CliError::Vfs(memvfs::VfsError::Misuse("session already finished")))?;
        let page_size: u64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
        let page_count: u64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        conn.close().map_err(|(_, err)| err)?;

        let image_bytes = page_size.saturating_mul(page_count);
        let persisted = !dry_run && image_bytes > 0;
        if persisted {
            let len = usize::try_from(image_bytes)
                .map_err(|_| CliError::ImageOutOfRange { len: image_bytes })?;
            let image = self
                .registered
                .regions()
                .copy_out(self.address, len)
                .ok_or(CliError::ImageOutOfRange { len: image_bytes })?;
            fs::write(&self.path, image).map_err(|source| CliError::Io {
                path: self.path.clone(),
                source,
            })?;
            info!(path = %self.path.display(), image_bytes, "memvfs.cli persisted");
        }

        Ok(SessionReport {
            database: self.path.display().to_string(),
            vfs: self.registered.name().to_owned(),
            capacity: self.capacity,
            loaded_bytes: self.loaded,
            image_bytes,
            commits: self.log.commits(self.durability),
            persisted,
        })
    }
}

fn run_query(
    conn: &Connection,
    sql: &str,
) -> Result<(Vec<String>, Vec<Vec<serde_json::Value>>), CliError> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_owned).collect();
    let width = columns.len();
    let mut rows = Vec::new();
    let mut cursor = stmt.query([])?;
    while let Some(row) = cursor.next()? {
        let mut values = Vec::with_capacity(width);
        for idx in 0..width {
            values.push(json_value(row.get_ref(idx)?));
        }
        rows.push(values);
    }
    Ok((columns, rows))
}

fn json_value(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(int) => int.into(),
        ValueRef::Real(real) => serde_json::Number::from_f64(real)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(text) => String::from_utf8_lossy(text).into_owned().into(),
        ValueRef::Blob(blob) => format!("x'{}'", hex::encode(blob)).into(),
    }
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_session_text(report: &SessionReport) {
    println!("Database: {}", report.database);
    println!(
        "  vfs={} capacity={} loaded_bytes={} image_bytes={} commits={}",
        report.vfs, report.capacity, report.loaded_bytes, report.image_bytes, report.commits
    );
    if report.persisted {
        println!("Image written back to {}.", report.database);
    } else {
        println!("Database file left untouched.");
    }
}

fn print_query_text(report: &QueryReport) {
    println!("{}", report.columns.join("|"));
    for row in &report.rows {
        let cells: Vec<String> = row
            .iter()
            .map(|value| match value {
                serde_json::Value::Null => String::new(),
                serde_json::Value::String(text) => text.clone(),
                other => other.to_string(),
            })
            .collect();
        println!("{}", cells.join("|"));
    }
}

fn print_info_text(report: &InfoReport) {
    println!("Database: {}", report.session.database);
    println!(
        "  page_size={} page_count={} journal_mode={} image_bytes={} capacity={}",
        report.page_size,
        report.page_count,
        report.journal_mode,
        report.session.image_bytes,
        report.session.capacity
    );
    if report.tables.is_empty() {
        println!("Tables: (none)");
    } else {
        println!("Tables: {}", report.tables.join(", "));
    }
}
