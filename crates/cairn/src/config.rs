//! Configuration for a cairn workspace.
//!
//! Stored as `.cairn/config.yaml`. Relative paths are resolved against the
//! workspace root (the directory containing `.cairn/`).

use crate::error::{Error, Result};
use crate::store::pool::PoolConfig;
use crate::sync::ConflictPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// Name of the cairn directory
pub const CAIRN_DIR_NAME: &str = ".cairn";

/// Name of the configuration file
pub const CONFIG_FILE_NAME: &str = "config.yaml";

/// Default flat file
pub const DEFAULT_SYNC_FILE: &str = "ISSUES.md";

/// Maximum project id length
pub const MAX_PROJECT_LENGTH: usize = 64;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CairnConfig {
    /// Project mirrored by the flat file
    pub project: String,

    /// Structured store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Sync settings
    #[serde(default)]
    pub sync: SyncConfig,
}

/// `store` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file
    pub path: PathBuf,

    /// Connection pool sizing
    pub pool: PoolSettings,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: Path::new(CAIRN_DIR_NAME).join("cairn.db"),
            pool: PoolSettings::default(),
        }
    }
}

/// Pool sizing in YAML-friendly units.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolSettings {
    /// Connections opened eagerly and never retired
    pub min_connections: usize,
    /// Upper bound on open connections
    pub max_connections: usize,
    /// How long `acquire` waits before failing
    pub acquire_timeout_ms: u64,
    /// How long a connection above the minimum may sit idle
    pub idle_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        let defaults = PoolConfig::default();
        Self {
            min_connections: defaults.min_connections,
            max_connections: defaults.max_connections,
            acquire_timeout_ms: u64::try_from(defaults.acquire_timeout.as_millis()).unwrap_or(u64::MAX),
            idle_timeout_ms: u64::try_from(defaults.idle_timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl From<PoolSettings> for PoolConfig {
    fn from(settings: PoolSettings) -> Self {
        Self {
            min_connections: settings.min_connections,
            max_connections: settings.max_connections,
            acquire_timeout: Duration::from_millis(settings.acquire_timeout_ms),
            idle_timeout: Duration::from_millis(settings.idle_timeout_ms),
        }
    }
}

/// `sync` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    /// The flat Markdown file
    pub file: PathBuf,
    /// Snapshot of the last successful pass
    pub snapshot: PathBuf,
    /// Conflict policy
    pub policy: ConflictPolicy,
    /// Debounce window for `watch`
    pub debounce_ms: u64,
    /// Author recorded on issues created from the file
    pub default_author: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from(DEFAULT_SYNC_FILE),
            snapshot: Path::new(CAIRN_DIR_NAME).join("snapshot.jsonl"),
            policy: ConflictPolicy::default(),
            debounce_ms: 300,
            default_author: "cairn".to_string(),
        }
    }
}

impl CairnConfig {
    /// Default configuration for a project.
    pub fn new(project: &str) -> Self {
        Self {
            project: project.to_string(),
            store: StoreConfig::default(),
            sync: SyncConfig::default(),
        }
    }

    /// Load and validate configuration from a file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the file cannot be read and `Error::Config` if
    /// it is not valid YAML or fails validation.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        let config: Self =
            serde_yaml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_yaml::to_string(self).map_err(|e| Error::Config(format!("YAML error: {e}")))?;
        fs::write(path, content).await?;
        Ok(())
    }

    /// Check every setting.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        validate_project(&self.project)?;
        self.pool_config().validate()?;
        if self.sync.debounce_ms == 0 {
            return Err(Error::Config("sync.debounce_ms must be positive".to_string()));
        }
        if self.sync.default_author.trim().is_empty() {
            return Err(Error::Config("sync.default_author cannot be empty".to_string()));
        }
        if self.sync.file == self.sync.snapshot {
            return Err(Error::Config(
                "sync.file and sync.snapshot must be different files".to_string(),
            ));
        }
        Ok(())
    }

    /// Pool configuration.
    #[must_use]
    pub fn pool_config(&self) -> PoolConfig {
        self.store.pool.into()
    }

    /// Debounce window for the watch loop.
    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.sync.debounce_ms)
    }

    /// Database path resolved against `root`.
    #[must_use]
    pub fn store_path(&self, root: &Path) -> PathBuf {
        root.join(&self.store.path)
    }

    /// Flat file path resolved against `root`.
    #[must_use]
    pub fn sync_file(&self, root: &Path) -> PathBuf {
        root.join(&self.sync.file)
    }

    /// Snapshot path resolved against `root`.
    #[must_use]
    pub fn snapshot_path(&self, root: &Path) -> PathBuf {
        root.join(&self.sync.snapshot)
    }
}

/// Validate a project id: 1-64 ASCII letters, digits, `-` or `_`.
///
/// # Errors
///
/// Returns `Error::Config` describing the problem.
pub fn validate_project(project: &str) -> Result<()> {
    if project.is_empty() {
        return Err(Error::Config("project cannot be empty".to_string()));
    }
    if project.len() > MAX_PROJECT_LENGTH {
        return Err(Error::Config(format!(
            "project cannot exceed {MAX_PROJECT_LENGTH} characters"
        )));
    }
    if !project
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::Config(
            "project must contain only letters, digits, '-' or '_'".to_string(),
        ));
    }
    Ok(())
}
