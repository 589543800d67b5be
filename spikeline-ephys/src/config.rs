//! Workflow configuration loading
//!
//! Settings come from a TOML file resolved in priority order: explicit
//! `--config` path, then the `SPIKELINE_CONFIG` environment variable, then
//! `./spikeline.toml`. When none is present every field falls back to its
//! default, which is enough for a scratch database in the working directory.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use spikeline_core::{Error, Result, StoreConfig};
use tracing::{debug, info};

use crate::schema::EphysMode;

pub const CONFIG_ENV: &str = "SPIKELINE_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "spikeline.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub data: DataConfig,
    /// Schema shape; changing it against an existing database requires a
    /// fresh file or a different table prefix
    #[serde(default)]
    pub mode: EphysMode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    #[serde(default)]
    pub table_prefix: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataConfig {
    /// Root directories searched for session data, in order
    #[serde(default)]
    pub root_dirs: Vec<PathBuf>,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("spikeline.db")
}

fn default_max_connections() -> u32 {
    5
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: default_db_path(),
            table_prefix: String::new(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        WorkflowConfig {
            database: DatabaseConfig::default(),
            data: DataConfig::default(),
            mode: EphysMode::default(),
        }
    }
}

impl WorkflowConfig {
    /// Load configuration, trying the explicit path, then the environment
    /// variable, then the conventional file name in the working directory.
    pub fn load(explicit: Option<&Path>) -> Result<WorkflowConfig> {
        if let Some(path) = explicit {
            info!("Loading configuration from {}", path.display());
            return Self::from_file(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            info!("Loading configuration from {} ({})", path, CONFIG_ENV);
            return Self::from_file(Path::new(&path));
        }
        let fallback = Path::new(DEFAULT_CONFIG_FILE);
        if fallback.exists() {
            info!("Loading configuration from ./{}", DEFAULT_CONFIG_FILE);
            return Self::from_file(fallback);
        }
        debug!("No configuration file found, using defaults");
        Ok(WorkflowConfig::default())
    }

    pub fn from_file(path: &Path) -> Result<WorkflowConfig> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| {
            Error::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Store settings derived from this configuration
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            db_path: Some(self.database.path.clone()),
            table_prefix: self.database.table_prefix.clone(),
            max_connections: self.database.max_connections,
            busy_timeout_ms: self.database.busy_timeout_ms,
        }
    }
}
