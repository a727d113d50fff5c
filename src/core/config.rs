// src/core/config.rs
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Tunables for the durability layer. Loadable from a TOML file; every
/// field has a default so a missing file or empty table works.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Path of the write-ahead log file.
    #[serde(default = "default_wal_file_path")]
    pub wal_file_path: String,

    /// Whether every log flush also syncs the file to stable storage.
    /// Disabling this trades durability for test speed.
    #[serde(default = "default_sync_on_flush")]
    pub sync_on_flush: bool,
}

fn default_wal_file_path() -> String {
    "basalt.wal".to_owned()
}

fn default_sync_on_flush() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self { wal_file_path: default_wal_file_path(), sync_on_flush: default_sync_on_flush() }
    }
}

impl Config {
    /// Loads configuration from a TOML file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.wal_file_path, "basalt.wal");
        assert!(config.sync_on_flush);
    }

    #[test]
    fn test_load_from_file_with_partial_contents() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "wal_file_path = \"custom.wal\"").unwrap();
        let config = Config::load_from_file(file.path()).unwrap();
        assert_eq!(config.wal_file_path, "custom.wal");
        assert!(config.sync_on_flush, "unspecified fields take their defaults");
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "wal_file = \"typo.wal\"").unwrap();
        assert!(matches!(
            Config::load_from_file(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }
}
