//! Daemon configuration, loaded from TOML.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::project::ProjectEntry;
use crate::types::FileType;

pub const DEFAULT_BIND: &str = "127.0.0.1:9780";
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub heartbeat: HeartbeatConfig,
    pub debounce: DebounceConfig,
    pub projects: Vec<ProjectEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Liveness probing. The timeout is global, not per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            timeout_ms: 30_000,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Quiet windows per artifact category.
///
/// Frequently appended files get short windows, the structured task file a
/// long one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    pub structured_ms: u64,
    pub markdown_ms: u64,
    pub log_ms: u64,
    pub run_ms: u64,
    /// Paths matching no pattern. The directory watcher drops those before
    /// debouncing; this applies to callers feeding a debouncer directly.
    pub unknown_ms: u64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            structured_ms: 300,
            markdown_ms: 100,
            log_ms: 50,
            run_ms: 100,
            unknown_ms: 100,
        }
    }
}

impl DebounceConfig {
    /// Same window for every category. Handy in tests.
    pub fn uniform(ms: u64) -> Self {
        Self {
            structured_ms: ms,
            markdown_ms: ms,
            log_ms: ms,
            run_ms: ms,
            unknown_ms: ms,
        }
    }

    pub fn window_for(&self, file_type: FileType) -> Duration {
        let ms = match file_type {
            FileType::Prd => self.structured_ms,
            FileType::Progress | FileType::Guardrails => self.markdown_ms,
            FileType::ActivityLog | FileType::ErrorLog => self.log_ms,
            FileType::Run => self.run_ms,
            FileType::Unknown => self.unknown_ms,
        };
        Duration::from_millis(ms)
    }
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_connections == 0 {
            return Err(ConfigError::Invalid("server.max_connections must be > 0".into()));
        }
        if self.heartbeat.interval_ms == 0 || self.heartbeat.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.interval_ms and heartbeat.timeout_ms must be > 0".into(),
            ));
        }
        let d = &self.debounce;
        if [d.structured_ms, d.markdown_ms, d.log_ms, d.run_ms, d.unknown_ms].contains(&0) {
            return Err(ConfigError::Invalid("debounce windows must be > 0".into()));
        }

        let mut seen = HashSet::new();
        for project in &self.projects {
            if project.id.is_empty() {
                return Err(ConfigError::Invalid("project id must not be empty".into()));
            }
            if !seen.insert(project.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate project id: {}", project.id)));
            }
        }
        Ok(())
    }
}
