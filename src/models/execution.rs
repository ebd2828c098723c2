//! Execution audit rows, one per run of a schedulable record.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};

use crate::schema::cronlease_executions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, DbEnum)]
#[db_enum(existing_type_path = "crate::schema::sql_types::ExecutionStatus")]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Callback started, no outcome written yet
    Executing,
    Completed,
    /// Retries exhausted
    Failed,
    /// Failed, another attempt is scheduled
    Retrying,
    Aborted,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Executing)
    }
}

/// References its schedule by `(schedule_type, schedule_id)` with no foreign key.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(table_name = cronlease_executions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ExecutionRecord {
    pub id: i64,
    pub schedule_type: String,
    pub schedule_id: i64,
    pub worker_id: String,
    pub executed_at: DateTime<Utc>,
    /// `None` while the run is executing
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub error_name: Option<String>,
    pub error_reason: Option<String>,
}

/// Opening row, written with status `executing` before the callback runs.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = cronlease_executions)]
pub struct NewExecution {
    pub schedule_type: String,
    pub schedule_id: i64,
    pub worker_id: String,
    pub executed_at: DateTime<Utc>,
    pub status: ExecutionStatus,
}

/// Terminal update, applied once per run.
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = cronlease_executions)]
pub struct FinishExecution {
    pub completed_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub error_name: Option<String>,
    pub error_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_executing_is_open() {
        assert!(!ExecutionStatus::Executing.is_terminal());
        for status in [
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Retrying,
            ExecutionStatus::Aborted,
        ] {
            assert!(status.is_terminal());
        }
    }
}
