//! Configuration validation logic
//!
//! This module provides validation methods for all configuration structures
//! to ensure configuration values are within acceptable ranges and formats.

use crate::config::error::ConfigError;
use crate::config::settings::{
    DatabaseConfig, FileSettings, LoggerSettings, Settings, WorkerSettings,
};

/// Valid log levels
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid log formats
const VALID_LOG_FORMATS: &[&str] = &["full", "compact", "json"];

impl DatabaseConfig {
    /// Validate database configuration
    ///
    /// # Validation Rules
    /// - URL must not be empty and must use a postgres scheme
    /// - Max and min connections must be greater than 0
    /// - Min connections must not exceed max connections
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::validation(
                "database.url",
                "Database URL is required. Please specify a valid database connection string.",
            ));
        }

        if !(self.url.starts_with("postgres://") || self.url.starts_with("postgresql://")) {
            return Err(ConfigError::validation(
                "database.url",
                "Invalid database URL format. Expected format: postgres://[user:password@]host[:port]/database",
            ));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::validation(
                "database.max_connections",
                "Max connections must be greater than 0.",
            ));
        }

        if self.min_connections == 0 {
            return Err(ConfigError::validation(
                "database.min_connections",
                "Min connections must be greater than 0.",
            ));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::ValidationError {
                field: "database.min_connections".to_string(),
                message: format!(
                    "Min connections ({}) cannot exceed max connections ({}).",
                    self.min_connections, self.max_connections
                ),
            });
        }

        Ok(())
    }
}

impl FileSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.path.trim().is_empty() {
            return Err(ConfigError::validation(
                "logger.file.path",
                "File path is required when file logging is enabled.",
            ));
        }

        if !VALID_LOG_FORMATS.contains(&self.format.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError {
                field: "logger.file.format".to_string(),
                message: format!(
                    "Invalid log format '{}'. Valid formats are: {}",
                    self.format,
                    VALID_LOG_FORMATS.join(", ")
                ),
            });
        }

        Ok(())
    }
}

impl LoggerSettings {
    /// Validate logger settings
    ///
    /// Plain levels are checked against the known set; anything containing
    /// `=` or `,` is treated as an `EnvFilter` directive and left to the logger.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let is_directive = self.level.contains('=') || self.level.contains(',');
        if !is_directive && !VALID_LOG_LEVELS.contains(&self.level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError {
                field: "logger.level".to_string(),
                message: format!(
                    "Invalid log level '{}'. Valid levels are: {}",
                    self.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        if !self.console.enabled && !self.file.enabled {
            return Err(ConfigError::validation(
                "logger",
                "At least one output (console or file) must be enabled.",
            ));
        }

        self.file.validate()?;

        Ok(())
    }
}

impl WorkerSettings {
    /// Validate worker settings
    ///
    /// # Validation Rules
    /// - executor_thread, polling and loop intervals must be greater than 0
    /// - explicit executor_queue / fetch_records must be greater than 0
    /// - worker_id, when given, must not contain whitespace
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executor_thread == 0 {
            return Err(ConfigError::validation(
                "worker.executor_thread",
                "Executor thread count must be greater than 0.",
            ));
        }

        if self.executor_queue == Some(0) {
            return Err(ConfigError::validation(
                "worker.executor_queue",
                "Executor queue capacity must be greater than 0.",
            ));
        }

        if self.fetch_records == Some(0) {
            return Err(ConfigError::validation(
                "worker.fetch_records",
                "Fetch size must be greater than 0.",
            ));
        }

        for (field, value) in [
            ("worker.polling_interval", self.polling_interval),
            ("worker.heartbeat_interval", self.heartbeat_interval),
            ("worker.signal_fetch_interval", self.signal_fetch_interval),
            (
                "worker.worker_count_update_interval",
                self.worker_count_update_interval,
            ),
            ("worker.monitor_interval", self.monitor_interval),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError {
                    field: field.to_string(),
                    message: "Interval must be greater than 0 seconds.".to_string(),
                });
            }
        }

        if let Some(id) = &self.worker_id
            && id.chars().any(char::is_whitespace)
        {
            return Err(ConfigError::ValidationError {
                field: "worker.worker_id".to_string(),
                message: format!("Worker id '{}' must not contain whitespace.", id),
            });
        }

        Ok(())
    }
}

impl Settings {
    /// Validate all configuration settings
    ///
    /// Returns the first validation error encountered.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.database.validate()?;
        self.logger.validate()?;
        self.worker.validate()?;
        Ok(())
    }
}
