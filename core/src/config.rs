//! Session configuration.
//!
//! Values come from defaults, then an optional JSON file, then environment
//! overrides: `NEARPEER_LOCAL_NAME`, `NEARPEER_CHUNK_SIZE`,
//! `NEARPEER_EVENT_LOG_CAPACITY`, `NEARPEER_SPOOL_DIR`.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default payload chunk size: 64KB
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Largest chunk a frame may carry
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Default event log retention
pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 500;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for {key}: {value}")]
    InvalidOverride { key: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Name announced in connection requests when not advertising.
    #[serde(default = "default_local_name")]
    pub local_name: String,
    /// Payload chunk size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Number of event log entries retained.
    #[serde(default = "default_event_log_capacity")]
    pub event_log_capacity: usize,
    /// Directory incoming file payloads are spooled to.
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,
}

fn default_local_name() -> String {
    format!("User-{}", rand::thread_rng().gen_range(0..9999))
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_event_log_capacity() -> usize {
    DEFAULT_EVENT_LOG_CAPACITY
}

fn default_spool_dir() -> PathBuf {
    std::env::temp_dir()
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            local_name: default_local_name(),
            chunk_size: default_chunk_size(),
            event_log_capacity: default_event_log_capacity(),
            spool_dir: default_spool_dir(),
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file (if it exists) and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            serde_json::from_str(&raw)?
        } else {
            tracing::debug!("No config at {:?}, using defaults", path);
            SessionConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in `load`).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("NEARPEER_LOCAL_NAME") {
            self.local_name = name;
        }
        if let Some(v) = lookup("NEARPEER_CHUNK_SIZE") {
            self.chunk_size = parse_override("NEARPEER_CHUNK_SIZE", v)?;
        }
        if let Some(v) = lookup("NEARPEER_EVENT_LOG_CAPACITY") {
            self.event_log_capacity = parse_override("NEARPEER_EVENT_LOG_CAPACITY", v)?;
        }
        if let Some(dir) = lookup("NEARPEER_SPOOL_DIR") {
            self.spool_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.local_name.trim().is_empty() {
            return Err(ConfigError::Invalid("local_name must not be empty".into()));
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "chunk_size must be between 1 and {} bytes, got {}",
                MAX_CHUNK_SIZE, self.chunk_size
            )));
        }
        Ok(())
    }
}

fn parse_override(key: &'static str, value: String) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| ConfigError::InvalidOverride { key, value })
}
