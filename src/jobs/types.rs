use std::any::Any;

use serde::{Deserialize, Serialize};

use crate::jobs::schedulable::ScheduleState;
use crate::models::ExecutionStatus;

/// Name recorded in `last_error_name` when a callback aborts.
pub const ABORT_ERROR_NAME: &str = "AbortExecution";

/// How a callback finished; failures are reported through [`JobFailure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Done; reschedule from cron and release the lease.
    Ok,
    /// Done, but keep the lease and schedule untouched until the application
    /// calls `reset` itself. Nothing reclaims the record automatically.
    OkWithoutReset,
    /// Transient problem; try again after the backoff.
    Retry,
    /// Skip this cycle without retrying.
    Abort,
}

/// Error reported by a callback, persisted as `last_error_name` / `last_error_reason`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Short error class, e.g. `Timeout` or `Panic`
    pub name: String,
    /// Human readable message
    pub reason: String,
}

impl JobFailure {
    pub fn new(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Named after the error's type, e.g. `Error` for `std::io::Error`.
    pub fn from_error<E>(error: E) -> Self
    where
        E: std::error::Error,
    {
        Self::new(short_type_name::<E>(), error.to_string())
    }

    pub fn abort() -> Self {
        Self::new(ABORT_ERROR_NAME, "execution aborted by callback")
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let reason = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "callback panicked".to_string()
        };
        Self::new("Panic", reason)
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.reason)
    }
}

impl std::error::Error for JobFailure {}

impl From<anyhow::Error> for JobFailure {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast_ref::<JobFailure>() {
            Some(failure) => failure.clone(),
            None => Self::new("Error", format!("{:#}", error)),
        }
    }
}

fn short_type_name<E>() -> String {
    let full = std::any::type_name::<E>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// What the callback sees about the run it is part of.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub type_name: &'static str,
    /// Primary key of the record being run
    pub id: i64,
    pub worker_id: String,
    /// Snapshot of the schedule columns at lease time
    pub state: ScheduleState,
}

/// Result of [`crate::jobs::JobExecutor::execute_one`] when no error propagates.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// Rescheduled from cron and released
    Completed,
    /// Callback returned `OkWithoutReset`; the lease is still held
    Deferred,
    /// Failed or asked to retry; due again after the backoff
    Retried,
    /// Cycle skipped; rescheduled from cron
    Aborted,
    /// Retries were exhausted; handlers ran and the record was reset
    GaveUp(JobFailure),
}

impl ExecutionOutcome {
    pub fn execution_status(&self) -> ExecutionStatus {
        match self {
            ExecutionOutcome::Completed | ExecutionOutcome::Deferred => {
                ExecutionStatus::Completed
            }
            ExecutionOutcome::Retried => ExecutionStatus::Retrying,
            ExecutionOutcome::Aborted => ExecutionStatus::Aborted,
            ExecutionOutcome::GaveUp(_) => ExecutionStatus::Failed,
        }
    }
}
