//! Storage seams of the engine.
//!
//! Every backend implements these traits; the engine never talks to a
//! connection directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::AppResult;
use crate::jobs::{NewSchedule, ScheduleState, ScheduledRecord};
use crate::models::{
    ExecutionRecord, FinishExecution, NewExecution, NewSignal, SignalRecord, WorkerRecord,
};

/// Selects the rows a bulk unlock may touch. At least one filter is required.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnlockFilter {
    pub ids: Option<Vec<i64>>,
    pub locked_by: Option<String>,
}

impl UnlockFilter {
    pub fn ids(ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            ids: Some(ids.into_iter().collect()),
            locked_by: None,
        }
    }

    pub fn locked_by(worker_id: impl Into<String>) -> Self {
        Self {
            ids: None,
            locked_by: Some(worker_id.into()),
        }
    }

    pub fn and_locked_by(mut self, worker_id: impl Into<String>) -> Self {
        self.locked_by = Some(worker_id.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_none() && self.locked_by.is_none()
    }

    pub fn matches(&self, id: i64, state: &ScheduleState) -> bool {
        !self.is_empty()
            && self.ids.as_ref().is_none_or(|ids| ids.contains(&id))
            && self
                .locked_by
                .as_ref()
                .is_none_or(|w| state.locked_by.as_ref() == Some(w))
    }
}

/// Gauges published by the monitor loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleStats {
    pub executable_count: i64,
    /// Smallest non-zero `execute_lock`
    pub oldest_lock: Option<i64>,
    /// Earliest `next_execute_at` among candidates
    pub oldest_due: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ScheduleRepository<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    /// Candidate ids ordered by `next_execute_at`, without taking row locks.
    async fn candidate_ids(&self, now: DateTime<Utc>, limit: i64) -> AppResult<Vec<i64>>;

    /// Lock the row, re-check candidacy and write the lease. `None` when a
    /// peer won the race or the row is gone.
    async fn try_lease(
        &self,
        id: i64,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<ScheduledRecord<T>>>;

    /// Write the lease regardless of schedule or existing lease.
    async fn force_lease(
        &self,
        id: i64,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<ScheduledRecord<T>>>;

    async fn find(&self, id: i64) -> AppResult<Option<ScheduledRecord<T>>>;

    async fn insert(&self, record: &NewSchedule<T>) -> AppResult<ScheduledRecord<T>>;

    /// Persist engine-owned columns only; user columns are left alone.
    async fn save_state(&self, id: i64, state: &ScheduleState) -> AppResult<()>;

    /// Clear leases on matching rows and return how many were cleared.
    async fn unlock_all(&self, filter: &UnlockFilter) -> AppResult<usize>;

    async fn stats(&self, now: DateTime<Utc>) -> AppResult<ScheduleStats>;
}

#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    async fn create(&self, execution: NewExecution) -> AppResult<ExecutionRecord>;

    async fn finish(&self, id: i64, update: FinishExecution) -> AppResult<()>;

    async fn find(&self, id: i64) -> AppResult<ExecutionRecord>;

    /// Newest first.
    async fn recent(&self, schedule_type: &str, limit: i64) -> AppResult<Vec<ExecutionRecord>>;

    async fn for_schedule(
        &self,
        schedule_type: &str,
        schedule_id: i64,
        limit: i64,
    ) -> AppResult<Vec<ExecutionRecord>>;
}

#[async_trait]
pub trait FleetRepository: Send + Sync {
    /// Insert or replace the worker's row.
    async fn heartbeat(&self, worker: &WorkerRecord) -> AppResult<()>;

    async fn unregister(&self, worker_id: &str) -> AppResult<bool>;

    async fn alive_workers(&self, since: DateTime<Utc>) -> AppResult<Vec<WorkerRecord>>;

    async fn send_signal(&self, signal: NewSignal) -> AppResult<SignalRecord>;

    /// Oldest unreceived signal for the worker sent at or after `since`.
    async fn pending_signal(
        &self,
        worker_id: &str,
        since: DateTime<Utc>,
    ) -> AppResult<Option<SignalRecord>>;

    /// Mark received if nobody else did; `false` when already claimed.
    async fn claim_signal(&self, id: i64, received_at: DateTime<Utc>) -> AppResult<bool>;

    /// Newest first.
    async fn recent_signals(&self, limit: i64) -> AppResult<Vec<SignalRecord>>;
}
