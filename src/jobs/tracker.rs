//! Audit rows in `cronlease_executions`, one per tracked run.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::jobs::error::JobResult;
use crate::jobs::types::{ExecutionOutcome, JobFailure};
use crate::models::{ExecutionStatus, FinishExecution, NewExecution};
use crate::repositories::ExecutionRepository;

#[derive(Clone)]
pub struct ExecutionTracker {
    repo: Arc<dyn ExecutionRepository>,
    type_name: &'static str,
}

impl ExecutionTracker {
    pub fn new(repo: Arc<dyn ExecutionRepository>, type_name: &'static str) -> Self {
        Self { repo, type_name }
    }

    /// Open an `executing` row. A storage failure is logged and the run
    /// continues untracked.
    pub async fn start(
        &self,
        schedule_id: i64,
        worker_id: &str,
        executed_at: DateTime<Utc>,
    ) -> Option<i64> {
        let execution = NewExecution {
            schedule_type: self.type_name.to_string(),
            schedule_id,
            worker_id: worker_id.to_string(),
            executed_at,
            status: ExecutionStatus::Executing,
        };

        match self.repo.create(execution).await {
            Ok(record) => Some(record.id),
            Err(e) => {
                tracing::error!(
                    model = self.type_name,
                    id = schedule_id,
                    error = %e,
                    "Failed to create execution record, running untracked"
                );
                None
            }
        }
    }

    /// Write the terminal status for the run's result.
    pub async fn finish(
        &self,
        execution_id: Option<i64>,
        result: &JobResult<ExecutionOutcome>,
        completed_at: DateTime<Utc>,
    ) {
        let Some(execution_id) = execution_id else {
            return;
        };

        let update = Self::terminal_update(result, completed_at);
        if let Err(e) = self.repo.finish(execution_id, update).await {
            tracing::error!(
                model = self.type_name,
                execution_id,
                error = %e,
                "Failed to finalize execution record"
            );
        }
    }

    fn terminal_update(
        result: &JobResult<ExecutionOutcome>,
        completed_at: DateTime<Utc>,
    ) -> FinishExecution {
        let failed = |failure: JobFailure| FinishExecution {
            completed_at,
            status: ExecutionStatus::Failed,
            error_name: Some(failure.name),
            error_reason: Some(failure.reason),
        };

        match result {
            Ok(ExecutionOutcome::GaveUp(failure)) => failed(failure.clone()),
            Ok(outcome) => FinishExecution {
                completed_at,
                status: outcome.execution_status(),
                error_name: None,
                error_reason: None,
            },
            Err(e) => failed(e.to_failure()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::error::JobError;
    use crate::repositories::MemoryExecutionRepository;
    use chrono::TimeZone;

    fn at(m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2017, 6, 18, 1, m, 0).unwrap()
    }

    #[tokio::test]
    async fn test_each_result_maps_to_one_terminal_status() {
        let cases: Vec<(JobResult<ExecutionOutcome>, ExecutionStatus, Option<&str>)> = vec![
            (Ok(ExecutionOutcome::Completed), ExecutionStatus::Completed, None),
            (Ok(ExecutionOutcome::Deferred), ExecutionStatus::Completed, None),
            (Ok(ExecutionOutcome::Retried), ExecutionStatus::Retrying, None),
            (Ok(ExecutionOutcome::Aborted), ExecutionStatus::Aborted, None),
            (
                Ok(ExecutionOutcome::GaveUp(JobFailure::new("Timeout", "slow"))),
                ExecutionStatus::Failed,
                Some("Timeout"),
            ),
            (
                Err(JobError::Callback(JobFailure::new("Boom", "bad"))),
                ExecutionStatus::Failed,
                Some("Boom"),
            ),
        ];

        let repo = Arc::new(MemoryExecutionRepository::new());
        let tracker = ExecutionTracker::new(repo.clone(), "Report");
        for (i, (result, status, error_name)) in cases.into_iter().enumerate() {
            let id = tracker.start(i as i64, "w1", at(0)).await;
            tracker.finish(id, &result, at(1)).await;

            let record = repo.find(id.unwrap()).await.unwrap();
            assert_eq!(record.status, status);
            assert_eq!(record.completed_at, Some(at(1)));
            assert_eq!(record.error_name.as_deref(), error_name);
        }
        assert!(repo.open_executions().is_empty());
    }
}
