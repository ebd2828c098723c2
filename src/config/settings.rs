//! Configuration settings structures for cronlease
//!
//! This module defines all configuration structures that can be loaded from
//! TOML files and environment variables.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::error::ConfigError;
use crate::logger::{ConsoleConfig, FileConfig, LogFormat, LoggerConfig};

// ============================================================================
// Default value functions
// ============================================================================

fn default_app_name() -> String {
    "cronlease".to_string()
}

fn default_app_version() -> String {
    crate::pkg_version().to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_path() -> String {
    "logs/cronlease.log".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_polling_interval() -> u64 {
    5
}

fn default_executor_thread() -> usize {
    25
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_signal_fetch_interval() -> u64 {
    30
}

fn default_worker_count_update_interval() -> u64 {
    60
}

fn default_monitor_interval() -> u64 {
    20
}

fn default_executor_shutdown_timeout() -> u64 {
    300
}

fn default_other_thread_shutdown_timeout() -> u64 {
    120
}

// ============================================================================
// Application Configuration
// ============================================================================

/// Application metadata configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,

    /// Application version
    #[serde(default = "default_app_version")]
    pub version: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            version: default_app_version(),
        }
    }
}

// ============================================================================
// Database Configuration
// ============================================================================

/// Database connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL
    #[serde(default)]
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of idle connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection checkout timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,

    /// Run bundled migrations before the worker starts
    #[serde(default)]
    pub auto_migrate: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connection_timeout: default_connection_timeout(),
            auto_migrate: false,
        }
    }
}

// ============================================================================
// Logger Configuration
// ============================================================================

/// Console output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleSettings {
    /// Whether console output is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Whether to use colored output (only applies on a terminal)
    #[serde(default = "default_true")]
    pub colored: bool,
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            colored: default_true(),
        }
    }
}

/// File output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSettings {
    /// Whether file output is enabled
    #[serde(default)]
    pub enabled: bool,

    /// Path to the log file
    #[serde(default = "default_log_path")]
    pub path: String,

    /// Whether to append to existing file
    #[serde(default = "default_true")]
    pub append: bool,

    /// Log format: "full", "compact", or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for FileSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_log_path(),
            append: default_true(),
            format: default_log_format(),
        }
    }
}

/// Logger configuration settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggerSettings {
    /// Log level or filter directive, e.g. "info" or "cronlease=debug"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Console output settings
    #[serde(default)]
    pub console: ConsoleSettings,

    /// File output settings
    #[serde(default)]
    pub file: FileSettings,
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            console: ConsoleSettings::default(),
            file: FileSettings::default(),
        }
    }
}

impl LoggerSettings {
    /// Convert LoggerSettings to the runtime LoggerConfig
    pub fn into_logger_config(self) -> Result<LoggerConfig, ConfigError> {
        let console_config = ConsoleConfig::new(self.console.enabled, self.console.colored);
        let file_config = self.file.into_file_config()?;

        LoggerConfig::new(console_config, file_config, self.level).map_err(|e| {
            ConfigError::ValidationError {
                field: "logger".to_string(),
                message: e.to_string(),
            }
        })
    }
}

impl FileSettings {
    /// Convert FileSettings to FileConfig
    pub fn into_file_config(self) -> Result<FileConfig, ConfigError> {
        let format = self
            .format
            .parse::<LogFormat>()
            .map_err(|e| ConfigError::ValidationError {
                field: "logger.file.format".to_string(),
                message: e.to_string(),
            })?;

        Ok(FileConfig {
            enabled: self.enabled,
            path: PathBuf::from(self.path),
            append: self.append,
            format,
        })
    }
}

// ============================================================================
// Worker Configuration
// ============================================================================

/// Worker process settings as they appear in the `[worker]` table.
///
/// Intervals and timeouts are whole seconds. `executor_queue` and
/// `fetch_records` are derived from `executor_thread` when left unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Identity written to the heartbeat table; resolved from the host when unset
    #[serde(default)]
    pub worker_id: Option<String>,

    /// Seconds between poll cycles when nothing was leased
    #[serde(default = "default_polling_interval")]
    pub polling_interval: u64,

    /// Dispatcher concurrency; 1 executes every record inline
    #[serde(default = "default_executor_thread")]
    pub executor_thread: usize,

    /// Dispatcher queue capacity (default: 2 x executor_thread)
    #[serde(default)]
    pub executor_queue: Option<usize>,

    /// Lease batch size per poll (default: 3 x executor_thread)
    #[serde(default)]
    pub fetch_records: Option<usize>,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,

    #[serde(default = "default_signal_fetch_interval")]
    pub signal_fetch_interval: u64,

    #[serde(default = "default_worker_count_update_interval")]
    pub worker_count_update_interval: u64,

    #[serde(default = "default_monitor_interval")]
    pub monitor_interval: u64,

    #[serde(default = "default_executor_shutdown_timeout")]
    pub executor_shutdown_timeout: u64,

    #[serde(default = "default_other_thread_shutdown_timeout")]
    pub other_thread_shutdown_timeout: u64,

    /// Schedulable type names to poll; empty polls every registered type
    #[serde(default)]
    pub model_names: Vec<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            worker_id: None,
            polling_interval: default_polling_interval(),
            executor_thread: default_executor_thread(),
            executor_queue: None,
            fetch_records: None,
            heartbeat_interval: default_heartbeat_interval(),
            signal_fetch_interval: default_signal_fetch_interval(),
            worker_count_update_interval: default_worker_count_update_interval(),
            monitor_interval: default_monitor_interval(),
            executor_shutdown_timeout: default_executor_shutdown_timeout(),
            other_thread_shutdown_timeout: default_other_thread_shutdown_timeout(),
            model_names: Vec::new(),
        }
    }
}

/// Runtime worker configuration handed to the supervisor, pollers and dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub polling_interval: Duration,
    pub executor_thread: usize,
    pub executor_queue: usize,
    pub fetch_records: usize,
    pub heartbeat_interval: Duration,
    pub signal_fetch_interval: Duration,
    pub worker_count_update_interval: Duration,
    pub monitor_interval: Duration,
    pub executor_shutdown_timeout: Duration,
    pub other_thread_shutdown_timeout: Duration,
    pub model_names: Vec<String>,
}

impl WorkerSettings {
    /// Resolve defaults and convert into the runtime [`WorkerConfig`].
    pub fn into_worker_config(self) -> Result<WorkerConfig, ConfigError> {
        self.validate()?;

        let worker_id = match self.worker_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => crate::worker::default_worker_id(),
        };

        Ok(WorkerConfig {
            worker_id,
            polling_interval: Duration::from_secs(self.polling_interval),
            executor_thread: self.executor_thread,
            executor_queue: self.executor_queue.unwrap_or(self.executor_thread * 2),
            fetch_records: self.fetch_records.unwrap_or(self.executor_thread * 3),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval),
            signal_fetch_interval: Duration::from_secs(self.signal_fetch_interval),
            worker_count_update_interval: Duration::from_secs(self.worker_count_update_interval),
            monitor_interval: Duration::from_secs(self.monitor_interval),
            executor_shutdown_timeout: Duration::from_secs(self.executor_shutdown_timeout),
            other_thread_shutdown_timeout: Duration::from_secs(
                self.other_thread_shutdown_timeout,
            ),
            model_names: self.model_names,
        })
    }
}

impl WorkerConfig {
    /// Configuration with every default and an explicit worker id.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        let defaults = WorkerSettings::default();
        Self {
            worker_id: worker_id.into(),
            polling_interval: Duration::from_secs(defaults.polling_interval),
            executor_thread: defaults.executor_thread,
            executor_queue: defaults.executor_thread * 2,
            fetch_records: defaults.executor_thread * 3,
            heartbeat_interval: Duration::from_secs(defaults.heartbeat_interval),
            signal_fetch_interval: Duration::from_secs(defaults.signal_fetch_interval),
            worker_count_update_interval: Duration::from_secs(
                defaults.worker_count_update_interval,
            ),
            monitor_interval: Duration::from_secs(defaults.monitor_interval),
            executor_shutdown_timeout: Duration::from_secs(defaults.executor_shutdown_timeout),
            other_thread_shutdown_timeout: Duration::from_secs(
                defaults.other_thread_shutdown_timeout,
            ),
            model_names: Vec::new(),
        }
    }

    /// Heartbeats older than this are treated as dead peers.
    pub fn alive_threshold(&self) -> Duration {
        self.heartbeat_interval * 5
    }
}

// ============================================================================
// Main Settings Structure
// ============================================================================

/// Complete application settings
///
/// This structure represents the entire configuration that can be loaded
/// from TOML files and environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Application information
    #[serde(default)]
    pub application: ApplicationConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logger configuration
    #[serde(default)]
    pub logger: LoggerSettings,

    /// Worker configuration
    #[serde(default)]
    pub worker: WorkerSettings,
}
