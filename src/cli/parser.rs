//! CLI argument parsing with clap
//!
//! This module defines the command-line interface structure using clap,
//! including all commands, arguments, and their documentation.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::models::SignalKind;

// Include shadow-rs generated build information
use shadow_rs::shadow;
shadow!(build);

/// Distributed cron scheduling over a shared Postgres database
#[derive(Parser, Debug)]
#[command(name = "cronlease")]
#[command(about = "Distributed cron scheduling over a shared Postgres database")]
#[command(long_about = "
cronlease turns rows of your own tables into cron-scheduled, retryable jobs.
Worker processes lease due rows through Postgres row locks, run them, and
coordinate with each other through heartbeat and signal tables.

EXAMPLES:
    # Start a worker polling every registered type
    cronlease run

    # Start a worker for two types with 8 concurrent executions
    cronlease run --concurrency 8 Notification Report

    # Use a custom configuration file
    cronlease --config /etc/cronlease/production.toml run

    # Apply the system table migrations
    cronlease migrate

    # List live workers and recent signals
    cronlease workers
    cronlease signals --limit 50

    # Put a worker into quiet mode, then stop it
    cronlease signal 10.0.0.12 TSTP
    cronlease signal 10.0.0.12 TERM
")]
#[command(version = build::CLAP_LONG_VERSION)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration file path
    ///
    /// Load this TOML file instead of the layered files under `config/`.
    /// Environment variable overrides still apply.
    ///
    /// Example: --config /etc/cronlease/production.toml
    #[arg(short, long, value_name = "FILE", value_parser = super::validation::validate_config_file_path)]
    pub config: Option<PathBuf>,

    /// Override environment detection
    ///
    /// Selects the `{env}.toml` overlay. Available values: development (dev),
    /// staging, production (prod), test
    #[arg(short, long, value_enum)]
    pub env: Option<Environment>,

    /// Enable verbose logging
    ///
    /// Cannot be used with --quiet.
    #[arg(short, long)]
    pub verbose: bool,

    /// Suppress non-error output
    ///
    /// Cannot be used with --verbose.
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a worker (default)
    ///
    /// Polls the registered schedulable types until stopped by SIGTERM,
    /// SIGINT or a remote TERM signal. SIGTSTP and SIGCONT toggle quiet mode.
    ///
    /// Examples:
    ///   cronlease run                          # Poll every registered type
    ///   cronlease run Report                   # Poll only Report
    ///   cronlease run --worker-id batch-1      # Explicit heartbeat identity
    Run {
        /// Worker identity in the heartbeat table
        ///
        /// Default: first non-loopback local address
        #[arg(long, value_name = "ID", value_parser = super::validation::validate_worker_id)]
        worker_id: Option<String>,

        /// Seconds between poll cycles
        #[arg(long, value_name = "SECS", value_parser = super::validation::validate_positive_u64)]
        polling_interval: Option<u64>,

        /// Number of records executed concurrently; 1 runs inline
        #[arg(short = 'n', long, value_name = "N", value_parser = super::validation::validate_positive_usize)]
        concurrency: Option<usize>,

        /// Records leased per poll
        #[arg(long, value_name = "N", value_parser = super::validation::validate_positive_usize)]
        fetch_records: Option<usize>,

        /// Log level override
        ///
        /// Available levels: error, warn, info, debug, trace
        #[arg(long, value_enum)]
        log_level: Option<LogLevel>,

        /// Schedulable type names to poll (default: all registered)
        #[arg(value_name = "MODEL")]
        models: Vec<String>,
    },
    /// Database migration operations
    ///
    /// Manage the worker, signal and execution tables.
    ///
    /// Examples:
    ///   cronlease migrate                    # Apply all pending migrations
    ///   cronlease migrate --dry-run          # Show pending migrations without applying
    ///   cronlease migrate --rollback 1       # Rollback the last migration
    Migrate {
        /// Show pending migrations without applying
        #[arg(long, conflicts_with = "rollback")]
        dry_run: bool,

        /// Number of migrations to rollback
        ///
        /// Must be between 1 and 100. Cannot be used with --dry-run.
        #[arg(long, value_name = "STEPS", conflicts_with = "dry_run", value_parser = super::validation::validate_rollback_steps)]
        rollback: Option<u32>,
    },
    /// List live workers
    Workers,
    /// List recently sent signals
    Signals {
        /// Maximum number of signals to show
        #[arg(long, default_value_t = 20, value_parser = super::validation::validate_list_limit)]
        limit: i64,
    },
    /// Send a signal to a worker
    ///
    /// TSTP enters quiet mode, CONT resumes, USR1 logs a status snapshot
    /// and TERM stops the worker.
    Signal {
        /// Target worker id
        #[arg(value_parser = super::validation::validate_worker_id)]
        worker_id: String,

        /// TERM, USR1, CONT or TSTP (a SIG prefix is accepted)
        #[arg(value_parser = super::validation::validate_signal)]
        signal: SignalKind,
    },
}

/// Environment options
#[derive(ValueEnum, Clone, Debug)]
pub enum Environment {
    #[value(name = "development", alias = "dev")]
    Development,
    #[value(name = "staging")]
    Staging,
    #[value(name = "production", alias = "prod")]
    Production,
    #[value(name = "test")]
    Test,
}

/// Log level options
#[derive(ValueEnum, Clone, Debug)]
pub enum LogLevel {
    #[value(name = "error")]
    Error,
    #[value(name = "warn", alias = "warning")]
    Warn,
    #[value(name = "info")]
    Info,
    #[value(name = "debug")]
    Debug,
    #[value(name = "trace")]
    Trace,
}

impl Cli {
    /// Validate argument combinations clap cannot express
    pub fn validate(&self) -> Result<(), String> {
        if let Some(Commands::Run {
            concurrency: Some(concurrency),
            fetch_records: Some(fetch_records),
            ..
        }) = &self.command
            && fetch_records < concurrency
        {
            return Err(format!(
                "--fetch-records ({}) should not be smaller than --concurrency ({})",
                fetch_records, concurrency
            ));
        }

        if let Some(Commands::Migrate {
            dry_run: true,
            rollback: Some(_),
        }) = &self.command
        {
            return Err("Cannot use --dry-run and --rollback together".to_string());
        }

        if self.verbose && self.quiet {
            return Err("Cannot use --verbose and --quiet together".to_string());
        }

        Ok(())
    }

    /// Get detailed help for validation errors
    pub fn get_validation_help() -> &'static str {
        r#"
Common validation errors and solutions:

Worker options:
  - --worker-id must not be empty or contain whitespace
  - --polling-interval, --concurrency and --fetch-records must be positive
  - Example: run --concurrency 8 --fetch-records 24

Signals:
  - One of TERM, USR1, CONT, TSTP
  - Example: signal 10.0.0.12 TSTP

Configuration file validation:
  - File must exist and be readable
  - File must be in TOML format
  - Example: --config /path/to/config.toml

Migration rollback validation:
  - Steps must be between 1 and 100
  - Cannot be used with --dry-run
  - Example: --rollback 3

For more help, use: cronlease help <subcommand>
"#
    }
}

impl From<LogLevel> for String {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => "error".to_string(),
            LogLevel::Warn => "warn".to_string(),
            LogLevel::Info => "info".to_string(),
            LogLevel::Debug => "debug".to_string(),
            LogLevel::Trace => "trace".to_string(),
        }
    }
}

impl From<Environment> for crate::config::Environment {
    fn from(env: Environment) -> Self {
        match env {
            Environment::Development => crate::config::Environment::Development,
            Environment::Staging => crate::config::Environment::Staging,
            Environment::Production => crate::config::Environment::Production,
            Environment::Test => crate::config::Environment::Test,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_version_flag() {
        let err = Cli::try_parse_from(["cronlease", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }

    #[test]
    fn test_default_behavior() {
        let cli = Cli::try_parse_from(["cronlease"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.verbose);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_run_command() {
        let cli = Cli::try_parse_from([
            "cronlease",
            "run",
            "--worker-id",
            "batch-1",
            "-n",
            "4",
            "--polling-interval",
            "2",
            "Report",
            "Notification",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Run {
                worker_id,
                polling_interval,
                concurrency,
                fetch_records,
                models,
                ..
            }) => {
                assert_eq!(worker_id.as_deref(), Some("batch-1"));
                assert_eq!(polling_interval, Some(2));
                assert_eq!(concurrency, Some(4));
                assert_eq!(fetch_records, None);
                assert_eq!(models, vec!["Report", "Notification"]);
            }
            other => panic!("Expected Run command, got {other:?}"),
        }
    }

    #[test]
    fn test_run_rejects_zero_concurrency() {
        assert!(Cli::try_parse_from(["cronlease", "run", "-n", "0"]).is_err());
    }

    #[test]
    fn test_signal_command() {
        let cli = Cli::try_parse_from(["cronlease", "signal", "10.0.0.12", "sigtstp"]).unwrap();
        match cli.command {
            Some(Commands::Signal { worker_id, signal }) => {
                assert_eq!(worker_id, "10.0.0.12");
                assert_eq!(signal, SignalKind::Tstp);
            }
            other => panic!("Expected Signal command, got {other:?}"),
        }
        assert!(Cli::try_parse_from(["cronlease", "signal", "w1", "HUP"]).is_err());
    }

    #[test]
    fn test_signals_default_limit() {
        let cli = Cli::try_parse_from(["cronlease", "signals"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Signals { limit: 20 })));
    }

    #[test]
    fn test_fetch_smaller_than_concurrency_is_invalid() {
        let cli = Cli::try_parse_from([
            "cronlease",
            "run",
            "--concurrency",
            "8",
            "--fetch-records",
            "2",
        ])
        .unwrap();
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_conflicting_verbose_quiet() {
        let err = Cli::try_parse_from(["cronlease", "--verbose", "--quiet"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }
}
