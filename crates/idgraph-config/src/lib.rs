//! # idgraph-config
//!
//! Configuration management for the idgraph identity store.
//!
//! Loads configuration from:
//! 1. `~/.idgraph/config.toml` (global)
//! 2. `.idgraph/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)
//!
//! There is no process-wide instance: callers load a [`Config`] once at
//! startup and hand the relevant sections to the components they build.

pub mod logging;
pub mod testing;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

pub use logging::{init_logging, LogLevel};

/// Default storage root for the filesystem view
pub const DEFAULT_STORAGE_ROOT: &str = "~/.idgraph/storage";

/// Default number of bucket-fetch workers used by the startup load
pub const DEFAULT_LOAD_WORKERS: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub identity: IdentityConfig,
    pub mounts: Vec<MountConfig>,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Global config (~/.idgraph/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                config = Self::from_file(&global_path)?;
            }
        }

        // 2. Project config (.idgraph/config.toml) overrides global
        let project_path = Path::new(".idgraph/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            let project_config = Self::from_file(project_path)?;
            config.merge(project_config);
        }

        // 3. Environment overrides
        config.apply_env_overrides();

        Ok(config)
    }

    /// Parse a single TOML file without applying any overrides
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Global config path: ~/.idgraph/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".idgraph/config.toml"))
    }

    /// Merge a project config over this one.
    ///
    /// Storage and identity sections are replaced wholesale when the
    /// project sets anything non-default; mounts are appended, with the
    /// project entry winning on a duplicate accessor.
    pub fn merge(&mut self, other: Config) {
        if other.storage != StorageConfig::default() {
            self.storage = other.storage;
        }
        if other.identity != IdentityConfig::default() {
            self.identity = other.identity;
        }
        for mount in other.mounts {
            self.mounts.retain(|m| m.accessor != mount.accessor);
            self.mounts.push(mount);
        }
        if other.logging != LoggingConfig::default() {
            self.logging = other.logging;
        }
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("IDGRAPH_STORAGE_ROOT") {
            self.storage.root = PathBuf::from(root);
        }
        if let Ok(workers) = std::env::var("IDGRAPH_LOAD_WORKERS") {
            if let Ok(n) = workers.parse() {
                self.identity.load_workers = n;
            }
        }
        if let Ok(level) = std::env::var("IDGRAPH_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Storage root with a leading `~/` expanded to the home directory
    pub fn storage_root(&self) -> PathBuf {
        expand_home(&self.storage.root)
    }

    /// Generate default config TOML string
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Config::default())?)
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|h| h.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

/// Which storage view backs the bucketed store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Memory,
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory of the filesystem view
    pub root: PathBuf,
    /// Backend kind
    pub backend: StorageBackend,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_STORAGE_ROOT),
            backend: StorageBackend::File,
        }
    }
}

/// Identity store tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Storage prefix holding entity buckets
    pub entity_prefix: String,
    /// Storage prefix holding group buckets
    pub group_prefix: String,
    /// Concurrent bucket fetches during the startup load
    pub load_workers: usize,
    /// Upper bound on member_entity_ids per group
    pub max_member_entities: usize,
    /// Metadata keys may not start with this prefix
    pub reserved_metadata_prefix: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            entity_prefix: "packer/buckets/".to_string(),
            group_prefix: "packer/group/buckets/".to_string(),
            load_workers: DEFAULT_LOAD_WORKERS,
            max_member_entities: 512,
            reserved_metadata_prefix: "idgraph-".to_string(),
        }
    }
}

/// One entry of the static mount table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    pub accessor: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub path: String,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// error, warn, info, debug or trace
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn log_level(&self) -> LogLevel {
        LogLevel::parse(&self.level).unwrap_or(LogLevel::Warn)
    }
}
