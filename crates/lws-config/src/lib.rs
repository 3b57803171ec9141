//! # lws-config
//!
//! Configuration management for the local workspace engine.
//!
//! Loads configuration from:
//! 1. `~/.lws/config.toml` (global)
//! 2. `.lws/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only snapshot)
pub fn config() -> Config {
    match CONFIG.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    match CONFIG.write() {
        Ok(mut guard) => *guard = new_config,
        Err(poisoned) => *poisoned.into_inner() = new_config,
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML render error: {0}")]
    TomlRender(#[from] toml::ser::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub metadata: MetadataConfig,
    pub baseline: BaselineConfig,
    pub reconcile: ReconcileConfig,
    pub limits: LimitsConfig,
    pub lock: LockConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Load global config (~/.lws/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                config = Self::load_file(&global_path)?;
            }
        }

        // 2. Load project config (.lws/config.toml) - overrides global
        let project_path = Path::new(".lws/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            let project_config = Self::load_file(project_path)?;
            config.merge(project_config);
        }

        // 3. Apply environment variable overrides
        config.apply_env_overrides();

        Ok(config)
    }

    /// Parse a single TOML file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Global config path: ~/.lws/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".lws/config.toml"))
    }

    /// Merge another config (project overrides). Only values that differ
    /// from the defaults replace ours.
    pub fn merge(&mut self, other: Config) {
        let defaults = Config::default();
        if other.metadata != defaults.metadata {
            self.metadata = other.metadata;
        }
        if other.baseline != defaults.baseline {
            self.baseline = other.baseline;
        }
        if other.reconcile != defaults.reconcile {
            self.reconcile = other.reconcile;
        }
        if other.limits != defaults.limits {
            self.limits = other.limits;
        }
        if other.lock != defaults.lock {
            self.lock = other.lock;
        }
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("LWS_METADATA_ROOT") {
            self.metadata.root = PathBuf::from(path);
        }
        if let Ok(threads) = std::env::var("LWS_BASELINE_THREADS") {
            if let Ok(n) = threads.parse() {
                self.baseline.threads = Some(n);
            }
        }
        if let Ok(secs) = std::env::var("LWS_RECONCILE_WINDOW_SECS") {
            if let Ok(n) = secs.parse() {
                self.reconcile.freshness_window_secs = n;
            }
        }
        if let Ok(max) = std::env::var("LWS_MAX_SERVER_PATH") {
            if let Ok(n) = max.parse() {
                self.limits.max_server_path = n;
            }
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Config::default())?)
    }

    /// Metadata directory of one workspace beneath the metadata root.
    pub fn workspace_metadata_dir(&self, workspace: &str, owner: &str) -> PathBuf {
        self.metadata.root.join(format!("{};{}", workspace, owner))
    }
}

/// Where workspace metadata tables live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Root directory holding one folder per workspace
    pub root: PathBuf,
    /// Reserved: reuse tables cached in memory between transactions
    pub allow_cached_loads: bool,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            root: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".lws/workspaces"),
            allow_cached_loads: true,
        }
    }
}

/// Baseline content store settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    /// Gzip baselines written from local disk
    pub compress: bool,
    /// Compression pool threads (None = auto)
    pub threads: Option<usize>,
    /// Download pool threads (None = auto)
    pub download_threads: Option<usize>,
    /// Streaming buffer size for decompression
    pub decompress_buffer: usize,
    /// Mount points that count as their own partition
    pub mount_points: Vec<PathBuf>,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            compress: true,
            threads: None,
            download_threads: None,
            decompress_buffer: 4096,
            mount_points: Vec::new(),
        }
    }
}

/// Reconcile optimisation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// How long a cached server signature is trusted without a round trip
    pub freshness_window_secs: u64,
}

impl ReconcileConfig {
    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_secs)
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            freshness_window_secs: 8,
        }
    }
}

/// Hard limits enforced on pend operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum server path length in UTF-16 code units
    pub max_server_path: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_server_path: 259,
        }
    }
}

/// Workspace lock behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Long-running holders hand the lock to waiters between transactions
    pub yield_on_contention: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            yield_on_contention: true,
        }
    }
}
