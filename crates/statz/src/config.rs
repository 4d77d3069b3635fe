//! Configuration management for the Statz service.
//!
//! Settings live in a TOML file that is created with defaults on first run.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use statz_core::{MergePolicy, RefreshMode, StatKind, StatzConfig};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub flush: FlushSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub stats: StatsSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushSettings {
    /// Milliseconds between periodic flushes
    #[serde(default = "default_flush_interval")]
    pub interval_ms: u64,
    /// Failed attempts tolerated before an update is dropped
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_flush_interval() -> u64 {
    5000
}

fn default_max_retries() -> u32 {
    3
}

impl Default for FlushSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_flush_interval(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default)]
    pub refresh: RefreshMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default)]
    pub backend: StorageBackend,
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("statz.db")
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_database_path(),
        }
    }
}

/// Logging system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    pub json_format: bool,
    /// Optional file receiving a copy of every log line
    pub file_path: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSettings {
    /// Master switch; when false no statistic is recorded
    #[serde(default = "default_true")]
    pub tracking_enabled: bool,
    /// Statistic names that are never recorded, e.g. "VOTES"
    #[serde(default)]
    pub disabled: Vec<String>,
    /// Per-statistic merge policy overrides
    #[serde(default)]
    pub merge_policy: BTreeMap<String, MergePolicy>,
}

fn default_true() -> bool {
    true
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            tracking_enabled: true,
            disabled: Vec::new(),
            merge_policy: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file, writing the defaults there
    /// first if it does not exist.
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let config: AppConfig =
                toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.flush.interval_ms == 0 {
            bail!("flush.interval_ms must be greater than zero");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            bail!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            );
        }

        if self.storage.backend == StorageBackend::Sqlite && self.storage.path.as_os_str().is_empty() {
            bail!("storage.path cannot be empty with the sqlite backend");
        }

        // Unknown statistic names surface here rather than at startup.
        self.to_statz_config()?;
        Ok(())
    }

    /// Converts into the library's settings.
    pub fn to_statz_config(&self) -> Result<StatzConfig> {
        let disabled_stats = self
            .stats
            .disabled
            .iter()
            .map(|name| name.parse::<StatKind>().map_err(|e| anyhow!("stats.disabled: {e}")))
            .collect::<Result<Vec<_>>>()?;

        let merge_overrides = self
            .stats
            .merge_policy
            .iter()
            .map(|(name, policy)| {
                name.parse::<StatKind>()
                    .map(|kind| (kind, *policy))
                    .map_err(|e| anyhow!("stats.merge_policy: {e}"))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        let config = StatzConfig {
            flush_interval: Duration::from_millis(self.flush.interval_ms),
            max_retries: self.flush.max_retries,
            cache_refresh: self.cache.refresh,
            tracking_enabled: self.stats.tracking_enabled,
            disabled_stats,
            merge_overrides,
        };
        config.build_registry()?;
        Ok(config)
    }
}
