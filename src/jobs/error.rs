use thiserror::Error;

use crate::error::AppError;
use crate::jobs::types::JobFailure;

#[derive(Debug, Error)]
pub enum JobError {
    /// The record's lease belongs to another worker or has expired
    #[error("{type_name}#{id} is not leased by worker {worker_id}")]
    NotLeased {
        type_name: String,
        id: i64,
        worker_id: String,
    },

    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    /// Not an IANA timezone name
    #[error("Unknown timezone: {0}")]
    InvalidTimezone(String),

    /// Bulk unlock was called without any id or owner filter
    #[error("Refusing to unlock every row of {0} without a filter")]
    UnfilteredUnlock(String),

    /// The callback failed and the record was rescheduled for a retry
    #[error("Execution failed: {0}")]
    Callback(#[source] JobFailure),

    /// `execute_now` hit a record whose lease is still live
    #[error("{type_name}#{id} is still executing")]
    StillExecuting { type_name: String, id: i64 },

    #[error("Unknown schedulable type: {0}")]
    UnknownType(String),

    /// The worker was started with an empty selection
    #[error("No schedulable types to poll")]
    NothingToPoll,

    #[error(transparent)]
    App(#[from] AppError),
}

impl JobError {
    pub(crate) fn not_found(type_name: &str, id: i64) -> Self {
        JobError::App(AppError::NotFound {
            entity: type_name.to_string(),
            field: "id".to_string(),
            value: id.to_string(),
        })
    }

    /// The callback failure itself, or this error described as one.
    pub fn to_failure(&self) -> JobFailure {
        match self {
            JobError::Callback(failure) => failure.clone(),
            other => JobFailure::from_error(other),
        }
    }
}

pub type JobResult<T> = Result<T, JobError>;

impl From<JobError> for AppError {
    fn from(error: JobError) -> Self {
        match error {
            JobError::App(inner) => inner,
            other => AppError::Internal {
                source: anyhow::Error::from(other),
            },
        }
    }
}
