//! Configuration merger for CLI arguments and config files
//!
//! This module handles merging CLI argument overrides with file-based configuration,
//! implementing the configuration precedence logic.

use super::parser::{Cli, Commands};
use crate::config::error::ConfigError;
use crate::config::{ConfigLoader, settings::Settings};

/// Configuration merger that handles CLI argument integration with file-based configuration
///
/// CLI arguments override configuration file values, which override defaults.
pub struct ConfigurationMerger {
    base_config: Settings,
}

impl ConfigurationMerger {
    /// Create a new configuration merger with base configuration
    pub fn new(base_config: Settings) -> Self {
        Self { base_config }
    }

    /// Load the base configuration for the parsed arguments
    ///
    /// `--config` replaces the layered files, `--env` replaces the detected
    /// environment overlay. Validation is deferred to [`Self::merge_cli_args`]
    /// so that command-line overrides can repair an incomplete file.
    ///
    /// # Errors
    /// Returns ConfigError if a file cannot be read or deserialized
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let loader = match &cli.config {
            Some(path) => ConfigLoader::from_file(path),
            None => ConfigLoader::new()?,
        };
        let loader = match &cli.env {
            Some(env) => loader.with_environment(env.clone().into()),
            None => loader,
        };

        Ok(Self::new(loader.load_unvalidated()?))
    }

    /// Merge CLI arguments with the base configuration
    ///
    /// Command-specific arguments win over global flags, which win over the
    /// file values. The merged settings are validated before being returned.
    pub fn merge_cli_args(&self, cli: &Cli) -> Result<Settings, ConfigError> {
        let mut config = self.base_config.clone();

        Self::apply_global_overrides(&mut config, cli);

        if let Some(ref command) = cli.command {
            Self::apply_command_overrides(&mut config, command);
        }

        config.validate()?;

        Ok(config)
    }

    fn apply_global_overrides(config: &mut Settings, cli: &Cli) {
        if cli.verbose {
            config.logger.level = "debug".to_string();
        } else if cli.quiet {
            config.logger.level = "error".to_string();
        }
    }

    fn apply_command_overrides(config: &mut Settings, command: &Commands) {
        if let Commands::Run {
            worker_id,
            polling_interval,
            concurrency,
            fetch_records,
            log_level,
            models,
        } = command
        {
            let worker = &mut config.worker;
            if let Some(id) = worker_id {
                worker.worker_id = Some(id.clone());
            }
            if let Some(secs) = polling_interval {
                worker.polling_interval = *secs;
            }
            if let Some(threads) = concurrency {
                worker.executor_thread = *threads;
            }
            if let Some(fetch) = fetch_records {
                worker.fetch_records = Some(*fetch);
            }
            if !models.is_empty() {
                worker.model_names = models.clone();
            }
            if let Some(level) = log_level {
                config.logger.level = level.clone().into();
            }
        }
    }

    /// Get the current configuration (useful for inspection)
    pub fn config(&self) -> &Settings {
        &self.base_config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    fn create_valid_base_config() -> Settings {
        let mut config = Settings::default();
        config.database.url = "postgres://localhost/test".to_string();
        config
    }

    fn merge(args: &[&str]) -> Result<Settings, ConfigError> {
        let cli = Cli::try_parse_from(args).unwrap();
        ConfigurationMerger::new(create_valid_base_config()).merge_cli_args(&cli)
    }

    #[test]
    fn test_configuration_merger_new() {
        let base_config = Settings::default();
        let merger = ConfigurationMerger::new(base_config.clone());
        assert_eq!(merger.config(), &base_config);
    }

    #[test]
    fn test_verbose_and_quiet_flags() {
        assert_eq!(merge(&["cronlease", "--verbose"]).unwrap().logger.level, "debug");
        assert_eq!(merge(&["cronlease", "--quiet"]).unwrap().logger.level, "error");
    }

    #[test]
    fn test_run_overrides_worker_settings() {
        let merged = merge(&[
            "cronlease",
            "run",
            "--worker-id",
            "batch-1",
            "--polling-interval",
            "2",
            "-n",
            "4",
            "--fetch-records",
            "12",
            "Report",
        ])
        .unwrap();

        assert_eq!(merged.worker.worker_id.as_deref(), Some("batch-1"));
        assert_eq!(merged.worker.polling_interval, 2);
        assert_eq!(merged.worker.executor_thread, 4);
        assert_eq!(merged.worker.fetch_records, Some(12));
        assert_eq!(merged.worker.model_names, vec!["Report"]);
    }

    #[test]
    fn test_run_without_overrides_keeps_file_values() {
        let merged = merge(&["cronlease", "run"]).unwrap();
        assert_eq!(merged.worker, create_valid_base_config().worker);
    }

    #[test]
    fn test_command_log_level_overrides_global() {
        let merged = merge(&["cronlease", "--verbose", "run", "--log-level", "warn"]).unwrap();
        assert_eq!(merged.logger.level, "warn");
    }

    #[test]
    fn test_merge_validates_result() {
        let cli = Cli::try_parse_from(["cronlease", "workers"]).unwrap();
        let merger = ConfigurationMerger::new(Settings::default());
        assert!(merger.merge_cli_args(&cli).is_err());
    }

    #[test]
    fn test_from_cli_reads_config_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[database]
url = "postgres://localhost/from_file"

[worker]
polling_interval = 7
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let cli = Cli::try_parse_from(["cronlease", "--config", path.as_str(), "run"]).unwrap();
        let settings = ConfigurationMerger::from_cli(&cli)
            .unwrap()
            .merge_cli_args(&cli)
            .unwrap();

        assert_eq!(settings.database.url, "postgres://localhost/from_file");
        assert_eq!(settings.worker.polling_interval, 7);
    }
}
