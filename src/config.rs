//! Runtime configuration, reloadable via the control-plane ReloadConfig
//! command.

use crate::error::{AdapterError, AdapterResult};
use serde::Deserialize;
use std::path::Path;

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_transfer_length() -> u32 {
    2 * 1024 * 1024
}

fn default_max_outstanding_io() -> u32 {
    64
}

fn default_cleaner_interval_secs() -> u64 {
    5
}

/// Adapter-wide tunables, loaded from TOML and re-read on ReloadConfig.
///
/// Every field has a default so a missing or partial config file still
/// produces a usable configuration; `ReloadConfig` only ever touches
/// these process-wide defaults, never a live device's negotiated
/// properties.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AdapterConfig {
    pub log_level: String,
    pub default_max_transfer_length: u32,
    pub default_max_outstanding_io: u32,
    pub cleaner_interval_secs: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        AdapterConfig {
            log_level: default_log_level(),
            default_max_transfer_length: default_max_transfer_length(),
            default_max_outstanding_io: default_max_outstanding_io(),
            cleaner_interval_secs: default_cleaner_interval_secs(),
        }
    }
}

impl AdapterConfig {
    /// Parses configuration from a TOML document.
    pub fn from_toml_str(text: &str) -> AdapterResult<Self> {
        toml::from_str(text).map_err(|e| AdapterError::Config(e.to_string()))
    }

    /// Reads and parses a configuration file. A missing file is not an
    /// error: it yields the default configuration, the same way the
    /// adapter behaves before any config file has ever been written.
    pub fn from_file(path: &Path) -> AdapterResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml_str(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(AdapterError::Io(e)),
        }
    }
}
