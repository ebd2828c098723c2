//! Command executor for dispatching CLI commands
//!
//! This module provides the main entry point for executing CLI commands
//! after parsing and configuration loading.

use super::handlers::{
    MigrateCommandHandler, RegistryBuilder, RunCommandHandler, SignalCommandHandler,
    WorkersCommandHandler,
};
use super::parser::{Cli, Commands};
use crate::config::settings::Settings;
use crate::error::{AppError, AppResult};

/// Execute a CLI command with the given settings
///
/// No subcommand means `run`. Only `run` needs `registry`; binaries that
/// embed cronlease pass their own builder, the stock binary passes `None`.
///
/// # Errors
/// Returns errors from command handlers or validation failures
pub async fn execute_command(
    cli: &Cli,
    settings: Settings,
    registry: Option<&dyn RegistryBuilder>,
) -> AppResult<()> {
    validate_command_args(cli)?;

    match &cli.command {
        Some(Commands::Run { .. }) | None => RunCommandHandler::new(settings).execute(registry).await,
        Some(Commands::Migrate { dry_run, rollback }) => {
            MigrateCommandHandler::new(settings)
                .execute(*dry_run, *rollback)
                .await
        }
        Some(Commands::Workers) => WorkersCommandHandler::new(settings).execute().await,
        Some(Commands::Signals { limit }) => SignalCommandHandler::new(settings).list(*limit).await,
        Some(Commands::Signal { worker_id, signal }) => {
            SignalCommandHandler::new(settings)
                .send(worker_id, *signal)
                .await
        }
    }
}

/// Validate command arguments before execution
fn validate_command_args(cli: &Cli) -> AppResult<()> {
    cli.validate().map_err(|msg| AppError::Validation {
        field: "cli_arguments".to_string(),
        reason: msg,
    })?;

    if let Some(Commands::Migrate {
        rollback: Some(steps),
        ..
    }) = &cli.command
        && *steps > 50
    {
        tracing::warn!(
            steps,
            "Rolling back many migrations at once; consider smaller steps"
        );
    }

    Ok(())
}
