//! Configuration loading for postindex.
//!
//! Layered config: defaults -> config file -> env vars -> CLI flags.
//! The default config file lives at ~/.config/postindex/config.toml.

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File};
use directories::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};

use crate::error::TypesError;

/// Reconciliation engine tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Upper bound on events fetched per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Retries for a transient fetch failure before the store halts
    #[serde(default = "default_max_retries")]
    pub max_fetch_retries: u32,

    /// Retries for a failed batch commit before the store halts
    #[serde(default = "default_max_retries")]
    pub max_commit_retries: u32,

    /// First backoff delay for fetch/commit retries
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Cap on any single backoff delay
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Stop a run after this many batches (None = until drained)
    #[serde(default)]
    pub max_batches_per_run: Option<usize>,
}

fn default_batch_size() -> usize {
    100
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_fetch_retries: default_max_retries(),
            max_commit_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            max_batches_per_run: None,
        }
    }
}

impl EngineSettings {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("engine.batch_size must be > 0".to_string());
        }
        if self.retry_base_delay_ms == 0 {
            return Err("engine.retry_base_delay_ms must be > 0".to_string());
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(format!(
                "engine.retry_max_delay_ms ({}) must be >= retry_base_delay_ms ({})",
                self.retry_max_delay_ms, self.retry_base_delay_ms
            ));
        }
        Ok(())
    }
}

/// Multi-store scheduling settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Parallel store workers (0 = number of available CPUs)
    #[serde(default)]
    pub max_concurrency: usize,

    /// Cron expression for auto-sync (6-field, seconds first)
    #[serde(default = "default_sync_cron")]
    pub sync_cron: String,

    /// IANA timezone for the cron schedule
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Max random delay before each scheduled sync
    #[serde(default)]
    pub jitter_secs: u64,

    /// Time allowed for in-flight runs to finish on shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_sync_cron() -> String {
    "0 */5 * * * *".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 0,
            sync_cron: default_sync_cron(),
            timezone: default_timezone(),
            jitter_secs: 0,
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl SchedulerSettings {
    /// Worker limit with `0` resolved to the available parallelism.
    pub fn effective_concurrency(&self) -> usize {
        if self.max_concurrency > 0 {
            return self.max_concurrency;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Path to the SQLite catalog database
    #[serde(default = "default_catalog_path")]
    pub catalog_path: String,

    /// Directory under which store roots are created by default
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub engine: EngineSettings,

    #[serde(default)]
    pub scheduler: SchedulerSettings,
}

fn data_local_dir() -> PathBuf {
    ProjectDirs::from("", "", "postindex")
        .map(|p| p.data_local_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./data"))
}

fn default_catalog_path() -> String {
    data_local_dir()
        .join("catalog.db")
        .to_string_lossy()
        .to_string()
}

fn default_data_dir() -> String {
    data_local_dir().join("stores").to_string_lossy().to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            catalog_path: default_catalog_path(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            engine: EngineSettings::default(),
            scheduler: SchedulerSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings with layered precedence:
    /// 1. Built-in defaults
    /// 2. Config file (~/.config/postindex/config.toml)
    /// 3. CLI-specified config file (optional)
    /// 4. Environment variables (POSTINDEX_*, nested keys joined with `__`)
    ///
    /// CLI flags should be applied by the caller after this returns.
    pub fn load(cli_config_path: Option<&str>) -> Result<Self, TypesError> {
        let config_dir = ProjectDirs::from("", "", "postindex")
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let default_config_path = config_dir.join("config");

        let mut builder = Config::builder()
            .set_default("catalog_path", default_catalog_path())
            .map_err(|e| TypesError::Config(e.to_string()))?
            .set_default("data_dir", default_data_dir())
            .map_err(|e| TypesError::Config(e.to_string()))?
            .set_default("log_level", default_log_level())
            .map_err(|e| TypesError::Config(e.to_string()))?
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        if let Some(path) = cli_config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // Format: POSTINDEX_LOG_LEVEL, POSTINDEX_ENGINE__BATCH_SIZE, ...
        builder = builder.add_source(
            Environment::with_prefix("POSTINDEX")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| TypesError::Config(e.to_string()))?;

        let settings: Settings = config
            .try_deserialize()
            .map_err(|e| TypesError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), TypesError> {
        self.engine.validate().map_err(TypesError::Config)
    }

    /// Catalog path with a leading `~/` expanded.
    pub fn expanded_catalog_path(&self) -> PathBuf {
        expand_home(&self.catalog_path)
    }

    /// Data dir with a leading `~/` expanded.
    pub fn expanded_data_dir(&self) -> PathBuf {
        expand_home(&self.data_dir)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(dirs) = BaseDirs::new() {
            return dirs.home_dir().join(rest);
        }
    }
    PathBuf::from(path)
}
