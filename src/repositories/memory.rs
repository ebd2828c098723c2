//! In-process backends for tests and single-process embedding.
//!
//! A `DashMap` shard guard stands in for the row lock: the re-check and the
//! lease write happen while `get_mut` holds the entry.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::error::{AppError, AppResult};
use crate::jobs::{ExecutableCondition, NewSchedule, ScheduleOptions, ScheduleState, ScheduledRecord};
use crate::models::{
    ExecutionRecord, ExecutionStatus, FinishExecution, NewExecution, NewSignal, SignalRecord,
    WorkerRecord,
};
use crate::repositories::traits::{
    ExecutionRepository, FleetRepository, ScheduleRepository, ScheduleStats, UnlockFilter,
};

pub struct MemoryScheduleRepository<T> {
    rows: Arc<DashMap<i64, ScheduledRecord<T>>>,
    next_id: Arc<AtomicI64>,
    options: Arc<ScheduleOptions<T>>,
}

impl<T> Clone for MemoryScheduleRepository<T> {
    fn clone(&self) -> Self {
        Self {
            rows: Arc::clone(&self.rows),
            next_id: Arc::clone(&self.next_id),
            options: Arc::clone(&self.options),
        }
    }
}

impl<T> MemoryScheduleRepository<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// SQL conditions cannot be evaluated here and are rejected.
    pub fn new(options: ScheduleOptions<T>) -> AppResult<Self> {
        options.validate()?;
        if let Some(sql) = options.sql_conditions().next() {
            return Err(AppError::validation(
                "executable_conditions",
                format!("SQL condition '{}' needs the Postgres backend", sql),
            ));
        }

        Ok(Self {
            rows: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicI64::new(0)),
            options: Arc::new(options),
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Every row ordered by id.
    pub fn snapshot(&self) -> Vec<ScheduledRecord<T>> {
        let mut rows: Vec<_> = self.rows.iter().map(|r| r.value().clone()).collect();
        rows.sort_by_key(|r| r.id);
        rows
    }

    fn passes(&self, record: &ScheduledRecord<T>) -> bool {
        self.options.executable_conditions.iter().all(|c| match c {
            ExecutableCondition::Predicate(f) => f(record),
            ExecutableCondition::Sql(_) => false,
        })
    }
}

#[async_trait]
impl<T> ScheduleRepository<T> for MemoryScheduleRepository<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn candidate_ids(&self, now: DateTime<Utc>, limit: i64) -> AppResult<Vec<i64>> {
        let timeout = self.options.lock_timeout();
        let mut due: Vec<(DateTime<Utc>, i64)> = self
            .rows
            .iter()
            .filter(|r| r.state.is_candidate(now, timeout))
            .filter_map(|r| r.state.next_execute_at.map(|t| (t, r.id)))
            .collect();
        due.sort();

        Ok(due
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|(_, id)| id)
            .collect())
    }

    async fn try_lease(
        &self,
        id: i64,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<ScheduledRecord<T>>> {
        let Some(mut row) = self.rows.get_mut(&id) else {
            return Ok(None);
        };
        if !row.state.is_candidate(now, self.options.lock_timeout()) || !self.passes(&row) {
            return Ok(None);
        }
        row.state.lock(worker_id, now);
        Ok(Some(row.clone()))
    }

    async fn force_lease(
        &self,
        id: i64,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<ScheduledRecord<T>>> {
        Ok(self.rows.get_mut(&id).map(|mut row| {
            row.state.lock(worker_id, now);
            row.clone()
        }))
    }

    async fn find(&self, id: i64) -> AppResult<Option<ScheduledRecord<T>>> {
        Ok(self.rows.get(&id).map(|r| r.value().clone()))
    }

    async fn insert(&self, record: &NewSchedule<T>) -> AppResult<ScheduledRecord<T>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = record.state.clone();
        self.options.columns.mask(&mut state);

        let stored = ScheduledRecord {
            id,
            state,
            payload: record.payload.clone(),
        };
        self.rows.insert(id, stored.clone());
        Ok(stored)
    }

    async fn save_state(&self, id: i64, state: &ScheduleState) -> AppResult<()> {
        let mut row = self.rows.get_mut(&id).ok_or_else(|| AppError::NotFound {
            entity: self.options.table_name.clone(),
            field: "id".to_string(),
            value: id.to_string(),
        })?;
        let mut state = state.clone();
        self.options.columns.mask(&mut state);
        row.state = state;
        Ok(())
    }

    async fn unlock_all(&self, filter: &UnlockFilter) -> AppResult<usize> {
        if filter.is_empty() {
            return Err(AppError::validation("filter", "unlock requires an id or owner filter"));
        }

        let mut cleared = 0;
        for mut row in self.rows.iter_mut() {
            let id = row.id;
            if filter.matches(id, &row.state) {
                row.state.unlock();
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn stats(&self, now: DateTime<Utc>) -> AppResult<ScheduleStats> {
        let timeout = self.options.lock_timeout();
        let mut stats = ScheduleStats::default();

        for row in self.rows.iter() {
            if row.state.execute_lock > 0 {
                stats.oldest_lock = Some(
                    stats
                        .oldest_lock
                        .map_or(row.state.execute_lock, |l| l.min(row.state.execute_lock)),
                );
            }
            if row.state.is_candidate(now, timeout) {
                stats.executable_count += 1;
                if let Some(next) = row.state.next_execute_at {
                    stats.oldest_due = Some(stats.oldest_due.map_or(next, |d| d.min(next)));
                }
            }
        }
        Ok(stats)
    }
}

#[derive(Clone, Default)]
pub struct MemoryExecutionRepository {
    rows: Arc<DashMap<i64, ExecutionRecord>>,
    next_id: Arc<AtomicI64>,
}

impl MemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn newest_first(&self, keep: impl Fn(&ExecutionRecord) -> bool, limit: i64) -> Vec<ExecutionRecord> {
        let mut rows: Vec<ExecutionRecord> = self
            .rows
            .iter()
            .filter(|r| keep(r.value()))
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by(|a, b| b.executed_at.cmp(&a.executed_at).then(b.id.cmp(&a.id)));
        rows.truncate(usize::try_from(limit).unwrap_or(0));
        rows
    }
}

#[async_trait]
impl ExecutionRepository for MemoryExecutionRepository {
    async fn create(&self, execution: NewExecution) -> AppResult<ExecutionRecord> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let record = ExecutionRecord {
            id,
            schedule_type: execution.schedule_type,
            schedule_id: execution.schedule_id,
            worker_id: execution.worker_id,
            executed_at: execution.executed_at,
            completed_at: None,
            status: execution.status,
            error_name: None,
            error_reason: None,
        };
        self.rows.insert(id, record.clone());
        Ok(record)
    }

    async fn finish(&self, id: i64, update: FinishExecution) -> AppResult<()> {
        let mut row = self.rows.get_mut(&id).ok_or_else(|| AppError::NotFound {
            entity: "Execution".to_string(),
            field: "id".to_string(),
            value: id.to_string(),
        })?;
        row.completed_at = Some(update.completed_at);
        row.status = update.status;
        // AsChangeset skips `None` fields; mirror that
        if update.error_name.is_some() {
            row.error_name = update.error_name;
        }
        if update.error_reason.is_some() {
            row.error_reason = update.error_reason;
        }
        Ok(())
    }

    async fn find(&self, id: i64) -> AppResult<ExecutionRecord> {
        self.rows
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or_else(|| AppError::NotFound {
                entity: "Execution".to_string(),
                field: "id".to_string(),
                value: id.to_string(),
            })
    }

    async fn recent(&self, schedule_type: &str, limit: i64) -> AppResult<Vec<ExecutionRecord>> {
        Ok(self.newest_first(|r| r.schedule_type == schedule_type, limit))
    }

    async fn for_schedule(
        &self,
        schedule_type: &str,
        schedule_id: i64,
        limit: i64,
    ) -> AppResult<Vec<ExecutionRecord>> {
        Ok(self.newest_first(
            |r| r.schedule_type == schedule_type && r.schedule_id == schedule_id,
            limit,
        ))
    }
}

impl MemoryExecutionRepository {
    /// Runs still marked executing.
    pub fn open_executions(&self) -> Vec<ExecutionRecord> {
        self.newest_first(|r| r.status == ExecutionStatus::Executing, i64::MAX)
    }
}

#[derive(Clone, Default)]
pub struct MemoryFleetRepository {
    workers: Arc<DashMap<String, WorkerRecord>>,
    signals: Arc<DashMap<i64, SignalRecord>>,
    next_signal_id: Arc<AtomicI64>,
    heartbeat_failure: Arc<Mutex<Option<String>>>,
}

impl MemoryFleetRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every heartbeat fail with the given message, or succeed again with `None`.
    pub fn fail_heartbeats(&self, message: Option<&str>) {
        *self
            .heartbeat_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = message.map(str::to_string);
    }

    pub fn worker(&self, worker_id: &str) -> Option<WorkerRecord> {
        self.workers.get(worker_id).map(|w| w.value().clone())
    }
}

#[async_trait]
impl FleetRepository for MemoryFleetRepository {
    async fn heartbeat(&self, worker: &WorkerRecord) -> AppResult<()> {
        let failure = self
            .heartbeat_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(message) = failure {
            return Err(AppError::Transient {
                operation: "heartbeat".to_string(),
                source: anyhow::Error::msg(message),
            });
        }

        self.workers.insert(worker.worker_id.clone(), worker.clone());
        Ok(())
    }

    async fn unregister(&self, worker_id: &str) -> AppResult<bool> {
        Ok(self.workers.remove(worker_id).is_some())
    }

    async fn alive_workers(&self, since: DateTime<Utc>) -> AppResult<Vec<WorkerRecord>> {
        let mut alive: Vec<WorkerRecord> = self
            .workers
            .iter()
            .filter(|w| w.is_alive(since))
            .map(|w| w.value().clone())
            .collect();
        alive.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(alive)
    }

    async fn send_signal(&self, signal: NewSignal) -> AppResult<SignalRecord> {
        let id = self.next_signal_id.fetch_add(1, Ordering::SeqCst) + 1;
        let record = SignalRecord {
            id,
            worker_id: signal.worker_id,
            signal: signal.signal,
            sent_at: signal.sent_at,
            received_at: None,
        };
        self.signals.insert(id, record.clone());
        Ok(record)
    }

    async fn pending_signal(
        &self,
        worker_id: &str,
        since: DateTime<Utc>,
    ) -> AppResult<Option<SignalRecord>> {
        Ok(self
            .signals
            .iter()
            .filter(|s| s.worker_id == worker_id && s.received_at.is_none() && s.sent_at >= since)
            .map(|s| s.value().clone())
            .min_by_key(|s| (s.sent_at, s.id)))
    }

    async fn claim_signal(&self, id: i64, received_at: DateTime<Utc>) -> AppResult<bool> {
        Ok(match self.signals.get_mut(&id) {
            Some(mut signal) if signal.received_at.is_none() => {
                signal.received_at = Some(received_at);
                true
            }
            _ => false,
        })
    }

    async fn recent_signals(&self, limit: i64) -> AppResult<Vec<SignalRecord>> {
        let mut signals: Vec<SignalRecord> = self.signals.iter().map(|s| s.value().clone()).collect();
        signals.sort_by(|a, b| b.sent_at.cmp(&a.sent_at).then(b.id.cmp(&a.id)));
        signals.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(signals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExecutorStatus, SignalKind};
    use chrono::{Duration, TimeZone};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2017, 6, 18, h, m, s).unwrap()
    }

    fn due_state(next: DateTime<Utc>) -> ScheduleState {
        ScheduleState {
            next_execute_at: Some(next),
            ..ScheduleState::default()
        }
    }

    async fn repo_with(states: Vec<ScheduleState>) -> MemoryScheduleRepository<String> {
        let repo = MemoryScheduleRepository::new(ScheduleOptions::new("reports")).unwrap();
        for (i, state) in states.into_iter().enumerate() {
            repo.insert(&NewSchedule::new(format!("r{}", i + 1), state))
                .await
                .unwrap();
        }
        repo
    }

    #[tokio::test]
    async fn test_candidates_ordered_by_due_time() {
        let repo = repo_with(vec![
            due_state(at(1, 5, 0)),
            due_state(at(1, 1, 0)),
            due_state(at(2, 0, 0)),
        ])
        .await;

        let ids = repo.candidate_ids(at(1, 10, 0), 10).await.unwrap();
        assert_eq!(ids, vec![2, 1]);
        assert_eq!(repo.candidate_ids(at(1, 10, 0), 1).await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_leased_rows_are_hidden_until_expiry() {
        let repo = repo_with(vec![due_state(at(1, 0, 0))]).await;
        let now = at(1, 0, 0);

        assert!(repo.try_lease(1, "w1", now).await.unwrap().is_some());
        assert!(repo.try_lease(1, "w2", now).await.unwrap().is_none());
        assert!(repo.candidate_ids(now, 10).await.unwrap().is_empty());

        let later = now + Duration::seconds(601);
        assert_eq!(repo.candidate_ids(later, 10).await.unwrap(), vec![1]);
        let stolen = repo.try_lease(1, "w2", later).await.unwrap().unwrap();
        assert_eq!(stolen.state.locked_by.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn test_predicate_conditions_checked_at_lease() {
        let options = ScheduleOptions::<String>::new("reports")
            .executable_if(|r| r.payload != "paused");
        let repo = MemoryScheduleRepository::new(options).unwrap();
        repo.insert(&NewSchedule::new("paused".to_string(), due_state(at(1, 0, 0))))
            .await
            .unwrap();

        assert!(repo.try_lease(1, "w1", at(1, 0, 0)).await.unwrap().is_none());
    }

    #[test]
    fn test_sql_conditions_rejected() {
        let options = ScheduleOptions::<String>::new("reports").executable_if_sql("paused = false");
        assert!(MemoryScheduleRepository::new(options).is_err());
    }

    #[tokio::test]
    async fn test_unlock_all_requires_filter() {
        let repo = repo_with(vec![due_state(at(1, 0, 0)), due_state(at(1, 0, 0))]).await;
        let now = at(1, 0, 0);
        repo.try_lease(1, "w1", now).await.unwrap();
        repo.try_lease(2, "w2", now).await.unwrap();

        assert!(repo.unlock_all(&UnlockFilter::default()).await.is_err());
        assert_eq!(repo.unlock_all(&UnlockFilter::locked_by("w1")).await.unwrap(), 1);

        let rows = repo.snapshot();
        assert_eq!(rows[0].state.execute_lock, 0);
        assert_eq!(rows[0].state.locked_by, None);
        assert_eq!(rows[1].state.locked_by.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn test_stats() {
        let repo = repo_with(vec![
            due_state(at(1, 0, 0)),
            due_state(at(1, 5, 0)),
            due_state(at(3, 0, 0)),
        ])
        .await;
        repo.try_lease(2, "w1", at(1, 6, 0)).await.unwrap();

        let stats = repo.stats(at(1, 10, 0)).await.unwrap();
        assert_eq!(stats.executable_count, 1);
        assert_eq!(stats.oldest_due, Some(at(1, 0, 0)));
        assert_eq!(stats.oldest_lock, Some(at(1, 6, 0).timestamp()));
    }

    #[tokio::test]
    async fn test_signal_claim_is_compare_and_set() {
        let fleet = MemoryFleetRepository::new();
        let sent = fleet
            .send_signal(NewSignal {
                worker_id: "w1".to_string(),
                signal: SignalKind::Tstp,
                sent_at: at(1, 0, 0),
            })
            .await
            .unwrap();

        let pending = fleet.pending_signal("w1", at(0, 55, 0)).await.unwrap().unwrap();
        assert_eq!(pending.id, sent.id);
        assert!(fleet.pending_signal("w1", at(1, 0, 1)).await.unwrap().is_none());

        assert!(fleet.claim_signal(sent.id, at(1, 0, 5)).await.unwrap());
        assert!(!fleet.claim_signal(sent.id, at(1, 0, 6)).await.unwrap());
        assert!(fleet.pending_signal("w1", at(0, 55, 0)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_alive_workers_window() {
        let fleet = MemoryFleetRepository::new();
        for (id, beat) in [("a", at(1, 0, 0)), ("b", at(0, 54, 59))] {
            fleet
                .heartbeat(&WorkerRecord {
                    worker_id: id.to_string(),
                    max_thread_size: 1,
                    current_executing_size: 0,
                    current_queue_size: 0,
                    executor_status: ExecutorStatus::Running,
                    polling_model_names: WorkerRecord::encode_model_names(&[]),
                    last_heartbeated_at: beat,
                })
                .await
                .unwrap();
        }

        let since = at(1, 0, 0) - Duration::seconds(300);
        let alive = fleet.alive_workers(since).await.unwrap();
        assert_eq!(alive.len(), 1);
        assert_eq!(alive[0].worker_id, "a");
    }
}
