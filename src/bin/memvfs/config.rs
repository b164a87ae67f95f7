use memvfs::VfsOptions;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default buffer capacity when neither the config nor the flags set one.
pub const DEFAULT_CAPACITY: u64 = 16 * 1024 * 1024;
/// Default durability log session.
pub const DEFAULT_SESSION: i64 = 1;

/// Settings for the memory-backed database a command opens.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct MemorySettings {
    pub capacity: u64,
    pub threshold: u64,
    pub ckpt_on_sync: bool,
    pub fd: i64,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            threshold: 0,
            ckpt_on_sync: true,
            fd: DEFAULT_SESSION,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    vfs: VfsOptions,
    memory: MemorySettings,
}

/// Configuration loaded from `--config`, before flag overrides.
#[derive(Debug, Default)]
pub struct CliConfig {
    path: Option<PathBuf>,
    data: RawConfig,
}

impl CliConfig {
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let data = match explicit.as_ref() {
            Some(path) => read_file(path)?,
            None => RawConfig::default(),
        };
        Ok(Self {
            path: explicit,
            data,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn vfs(&self) -> &VfsOptions {
        &self.data.vfs
    }

    pub fn memory(&self) -> &MemorySettings {
        &self.data.memory
    }
}

fn read_file(path: &Path) -> Result<RawConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read CLI config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse CLI config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("durability session must be non-zero")]
    ZeroSession,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_config_uses_defaults() {
        let config = CliConfig::load(None).unwrap();
        assert!(config.path().is_none());
        assert_eq!(config.vfs(), &VfsOptions::default());
        assert_eq!(config.memory(), &MemorySettings::default());
    }

    #[test]
    fn reads_vfs_and_memory_tables() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[vfs]\nname = \"mem-cli\"\n\n[memory]\ncapacity = 4096\nthreshold = 100\nckpt_on_sync = false"
        )
        .unwrap();
        let config = CliConfig::load(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.vfs().name, "mem-cli");
        assert_eq!(config.memory().capacity, 4096);
        assert_eq!(config.memory().threshold, 100);
        assert!(!config.memory().ckpt_on_sync);
        assert_eq!(config.memory().fd, DEFAULT_SESSION);
    }

    #[test]
    fn unreadable_config_is_an_error() {
        let err = CliConfig::load(Some(PathBuf::from("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
