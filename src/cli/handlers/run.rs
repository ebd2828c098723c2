//! Run command handler
//!
//! Connects to the database, asks the embedding application for its
//! schedulable types and runs a worker until it is stopped.

use async_trait::async_trait;

use crate::config::WorkerConfig;
use crate::config::settings::Settings;
use crate::db::{AsyncDbPool, establish_async_connection_pool, run_migrations};
use crate::error::{AppError, AppResult};
use crate::jobs::{EngineContext, ErrorHandlers, JobRegistry, JobResult};
use crate::repositories::Repositories;
use crate::worker::{Worker, WorkerHandle};

/// Supplies the schedulable types a worker polls.
///
/// Applications embedding cronlease implement this to register a
/// [`crate::jobs::JobExecutor`] per table, usually backed by
/// [`crate::repositories::PgScheduleRepository`] on the shared pool.
#[async_trait]
pub trait RegistryBuilder: Send + Sync {
    async fn build(&self, pool: &AsyncDbPool, ctx: &EngineContext) -> JobResult<JobRegistry>;

    /// Global error handlers for both record failures and poll failures.
    fn error_handlers(&self) -> ErrorHandlers {
        ErrorHandlers::new()
    }
}

/// Handler for the run command
pub struct RunCommandHandler {
    config: Settings,
}

impl RunCommandHandler {
    pub fn new(config: Settings) -> Self {
        Self { config }
    }

    /// Run a worker until SIGTERM, SIGINT or a remote TERM signal
    ///
    /// # Errors
    /// - No registry builder was supplied
    /// - Invalid worker settings
    /// - Database connection or migration errors
    /// - Unknown or missing schedulable types
    pub async fn execute(&self, builder: Option<&dyn RegistryBuilder>) -> AppResult<()> {
        let Some(builder) = builder else {
            return Err(AppError::Validation {
                field: "models".to_string(),
                reason: "No schedulable types are registered in this binary; \
                         embed cronlease and pass a RegistryBuilder to execute_command"
                    .to_string(),
            });
        };

        let worker_config = self.config.worker.clone().into_worker_config()?;
        let pool = establish_async_connection_pool(&self.config.database).await?;

        if self.config.database.auto_migrate {
            let applied = run_migrations(&self.config.database.url).await?;
            if !applied.is_empty() {
                tracing::info!(migrations = ?applied, "Applied pending migrations");
            }
        }

        let repositories = Repositories::new(pool.clone());
        let handlers = builder.error_handlers();
        let ctx = EngineContext::new(worker_config.worker_id.clone(), repositories.executions.clone())
            .with_handlers(handlers.clone());
        let registry = builder.build(&pool, &ctx).await?;

        let handle = start_worker(worker_config, registry, &repositories, handlers)?;
        tracing::info!(
            worker_id = handle.worker_id(),
            models = ?handle.model_names(),
            "Worker started"
        );
        handle.wait().await;
        tracing::info!(worker_id = handle.worker_id(), "Worker stopped");

        Ok(())
    }

    /// Get the configuration
    pub fn config(&self) -> &Settings {
        &self.config
    }
}

fn start_worker(
    config: WorkerConfig,
    registry: JobRegistry,
    repositories: &Repositories,
    handlers: ErrorHandlers,
) -> AppResult<WorkerHandle> {
    let handle = Worker::new(config, registry, repositories.fleet.clone())
        .with_handlers(handlers)
        .start()?;
    Ok(handle)
}
