//! Execution state machine for one schedulable type.
//!
//! A leased record runs its callback once; the outcome decides whether it is
//! rescheduled from cron, retried after a backoff, or given up on. Every path
//! that leaves the executing state clears the lease.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::Instrument;
use uuid::Uuid;

use crate::jobs::context::EngineContext;
use crate::jobs::error::{JobError, JobResult};
use crate::jobs::lease::{LeaseBatch, lease_batch};
use crate::jobs::schedulable::{
    ExecuteNow, NewSchedule, Schedulable, ScheduleOptions, ScheduleState, ScheduledRecord,
};
use crate::jobs::tracker::ExecutionTracker;
use crate::jobs::types::{ExecutionContext, ExecutionOutcome, JobFailure, Outcome};
use crate::models::ExecutionRecord;
use crate::repositories::{ScheduleRepository, ScheduleStats, UnlockFilter};

pub struct JobExecutor<T: Schedulable> {
    repo: Arc<dyn ScheduleRepository<T>>,
    options: Arc<ScheduleOptions<T>>,
    ctx: EngineContext,
    tracker: Option<ExecutionTracker>,
}

impl<T: Schedulable> Clone for JobExecutor<T> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
            options: Arc::clone(&self.options),
            ctx: self.ctx.clone(),
            tracker: self.tracker.clone(),
        }
    }
}

impl<T: Schedulable> JobExecutor<T> {
    pub fn new(repo: Arc<dyn ScheduleRepository<T>>, ctx: EngineContext) -> JobResult<Self> {
        let options = T::options();
        options.validate()?;

        let tracker = options
            .track_execution
            .then(|| ExecutionTracker::new(Arc::clone(&ctx.executions), T::TYPE_NAME));

        Ok(Self {
            repo,
            options: Arc::new(options),
            ctx,
            tracker,
        })
    }

    pub fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    pub fn options(&self) -> &ScheduleOptions<T> {
        &self.options
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    fn now(&self) -> DateTime<Utc> {
        self.ctx.clock.now()
    }

    pub async fn find(&self, id: i64) -> JobResult<ScheduledRecord<T>> {
        self.repo
            .find(id)
            .await?
            .ok_or_else(|| JobError::not_found(T::TYPE_NAME, id))
    }

    /// Lease up to `limit` due records for this worker.
    pub async fn lease(&self, limit: usize, worker_count: usize) -> JobResult<LeaseBatch<T>> {
        Ok(lease_batch(
            self.repo.as_ref(),
            T::TYPE_NAME,
            &self.ctx.worker_id,
            self.now(),
            limit,
            worker_count,
        )
        .await?)
    }

    /// Run the callback for a record leased by this worker and apply its outcome.
    ///
    /// A failure that is going to be retried is returned as
    /// [`JobError::Callback`]; a failure past the retry limit runs the error
    /// handlers and returns [`ExecutionOutcome::GaveUp`].
    pub async fn execute_one(&self, record: ScheduledRecord<T>) -> JobResult<ExecutionOutcome> {
        let started = self.now();
        if !record
            .state
            .is_leased_by(&self.ctx.worker_id, started, self.options.lock_timeout())
        {
            return Err(JobError::NotLeased {
                type_name: T::TYPE_NAME.to_string(),
                id: record.id,
                worker_id: self.ctx.worker_id.clone(),
            });
        }

        let execution_id = match &self.tracker {
            Some(tracker) => tracker.start(record.id, &self.ctx.worker_id, started).await,
            None => None,
        };

        let span = tracing::info_span!(
            "execute",
            model = T::TYPE_NAME,
            id = record.id,
            cycle = record.state.current_cycle_id.as_deref().unwrap_or("-"),
        );
        let ctx = ExecutionContext {
            type_name: T::TYPE_NAME,
            id: record.id,
            worker_id: self.ctx.worker_id.clone(),
            state: record.state.clone(),
        };
        let result = AssertUnwindSafe(record.payload.execute(&ctx))
            .catch_unwind()
            .instrument(span)
            .await
            .unwrap_or_else(|payload| Err(JobFailure::from_panic(payload)));

        let mut record = record;
        let outcome = self.apply(&mut record, result).await;

        if let Some(tracker) = &self.tracker {
            tracker.finish(execution_id, &outcome, self.now()).await;
        }

        match &outcome {
            Ok(o) => tracing::debug!(model = T::TYPE_NAME, id = record.id, outcome = ?o, "Executed"),
            Err(e) => tracing::warn!(model = T::TYPE_NAME, id = record.id, error = %e, "Execution failed"),
        }
        outcome
    }

    async fn apply(
        &self,
        record: &mut ScheduledRecord<T>,
        result: Result<Outcome, JobFailure>,
    ) -> JobResult<ExecutionOutcome> {
        match result {
            Ok(Outcome::Ok) => {
                self.reset(record, true).await?;
                Ok(ExecutionOutcome::Completed)
            }
            Ok(Outcome::OkWithoutReset) => Ok(ExecutionOutcome::Deferred),
            Ok(Outcome::Retry) => {
                self.retry(record, false).await?;
                Ok(ExecutionOutcome::Retried)
            }
            Ok(Outcome::Abort) => {
                self.abort(record).await?;
                Ok(ExecutionOutcome::Aborted)
            }
            Err(failure) => self.retry_or_reset(record, failure).await,
        }
    }

    /// Finish the cycle: next run from cron, lease cleared, retries zeroed
    /// and a new cycle id. `last_error_*` is kept.
    pub async fn reset(
        &self,
        record: &mut ScheduledRecord<T>,
        update_last_executed_at: bool,
    ) -> JobResult<()> {
        let now = self.now();
        let mut state = record.state.clone();
        state.next_execute_at = state.calculate_next_execute_at(now)?;
        state.unlock();
        state.retry_count = 0;
        state.current_cycle_id = Some(Uuid::new_v4().to_string());
        if update_last_executed_at {
            state.last_executed_at = Some(now);
        }

        self.save(record, state).await
    }

    /// Reschedule after the backoff, or right away with `immediately`.
    pub async fn retry(&self, record: &mut ScheduledRecord<T>, immediately: bool) -> JobResult<()> {
        let now = self.now();
        let mut state = record.state.clone();
        state.next_execute_at = Some(if immediately {
            now
        } else {
            now + self.options.backoff(state.retry_count)
        });
        state.unlock();
        state.retry_count += 1;

        self.save(record, state).await
    }

    /// Record the failure, then retry while under the limit or give up.
    pub async fn retry_or_reset(
        &self,
        record: &mut ScheduledRecord<T>,
        failure: JobFailure,
    ) -> JobResult<ExecutionOutcome> {
        record.state.record_error(&failure, self.now());

        if record.state.retry_count < self.options.retry_limit {
            self.retry(record, false).await?;
            tracing::warn!(
                model = T::TYPE_NAME,
                id = record.id,
                retry_count = record.state.retry_count,
                next_execute_at = ?record.state.next_execute_at,
                error = %failure,
                "Execution failed, retrying"
            );
            return Err(JobError::Callback(failure));
        }

        tracing::error!(
            model = T::TYPE_NAME,
            id = record.id,
            retry_limit = self.options.retry_limit,
            error = %failure,
            "Retry limit reached, giving up on this cycle"
        );
        self.ctx.handlers.invoke_for_record(
            &self.options.error_handlers,
            &failure,
            T::TYPE_NAME,
            record,
        );
        self.reset(record, false).await?;
        Ok(ExecutionOutcome::GaveUp(failure))
    }

    /// Skip this cycle without retrying.
    pub async fn abort(&self, record: &mut ScheduledRecord<T>) -> JobResult<()> {
        record.state.record_error(&JobFailure::abort(), self.now());
        self.reset(record, false).await
    }

    /// Fill in the schedule of a record that is about to be created.
    pub fn activate_schedule(&self, state: &mut ScheduleState) -> JobResult<()> {
        let now = self.now();
        if state.started_at.is_none() {
            state.started_at = Some(now);
        }
        if state.next_execute_at.is_none() {
            state.next_execute_at = state.calculate_next_execute_at(now)?;
        } else {
            // still reject malformed cron or timezone values
            state.calculate_next_execute_at(now)?;
        }
        if state.current_cycle_id.is_none() {
            state.current_cycle_id = Some(Uuid::new_v4().to_string());
        }
        Ok(())
    }

    /// Activate and insert a new record.
    pub async fn create(&self, payload: T, state: ScheduleState) -> JobResult<ScheduledRecord<T>> {
        let mut state = state;
        self.activate_schedule(&mut state)?;
        Ok(self.repo.insert(&NewSchedule::new(payload, state)).await?)
    }

    /// Lease the record regardless of its schedule and run it now. Unsaved
    /// records are inserted already leased.
    pub async fn execute_now(
        &self,
        target: impl Into<ExecuteNow<T>>,
    ) -> JobResult<ExecutionOutcome> {
        let now = self.now();
        let record = match target.into() {
            ExecuteNow::Persisted(record) => self
                .repo
                .force_lease(record.id, &self.ctx.worker_id, now)
                .await?
                .ok_or_else(|| JobError::not_found(T::TYPE_NAME, record.id))?,
            ExecuteNow::Unsaved(mut new) => {
                if new.state.next_execute_at.is_none() {
                    new.state.next_execute_at = Some(now);
                }
                if new.state.current_cycle_id.is_none() {
                    new.state.current_cycle_id = Some(Uuid::new_v4().to_string());
                }
                new.state.lock(&self.ctx.worker_id, now);
                self.repo.insert(&new).await?
            }
        };

        self.execute_one(record).await
    }

    /// Clear leases on matching rows; an empty filter is refused.
    pub async fn unlock_all(&self, filter: &UnlockFilter) -> JobResult<usize> {
        if filter.is_empty() {
            return Err(JobError::UnfilteredUnlock(self.options.table_name.clone()));
        }
        let cleared = self.repo.unlock_all(filter).await?;
        tracing::info!(model = T::TYPE_NAME, cleared, filter = ?filter, "Unlocked records");
        Ok(cleared)
    }

    pub async fn stats(&self) -> JobResult<ScheduleStats> {
        Ok(self.repo.stats(self.now()).await?)
    }

    pub async fn recent_executions(&self, limit: i64) -> JobResult<Vec<ExecutionRecord>> {
        Ok(self.ctx.executions.recent(T::TYPE_NAME, limit).await?)
    }

    /// Re-run the record an execution belongs to as soon as possible.
    /// Refused while the record may still be executing.
    pub async fn retry_execution(&self, execution_id: i64) -> JobResult<ScheduledRecord<T>> {
        let execution = self.ctx.executions.find(execution_id).await?;
        if execution.schedule_type != T::TYPE_NAME {
            return Err(JobError::UnknownType(execution.schedule_type));
        }

        let mut record = self.find(execution.schedule_id).await?;
        if record
            .state
            .assume_executing(self.now(), self.options.lock_timeout())
        {
            return Err(JobError::StillExecuting {
                type_name: T::TYPE_NAME.to_string(),
                id: record.id,
            });
        }

        self.retry(&mut record, true).await?;
        Ok(record)
    }

    async fn save(&self, record: &mut ScheduledRecord<T>, state: ScheduleState) -> JobResult<()> {
        self.repo.save_state(record.id, &state).await?;
        record.state = state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use serde::{Deserialize, Serialize};

    use crate::jobs::clock::{Clock, ManualClock};
    use crate::jobs::handlers::ErrorHandlers;
    use crate::models::ExecutionStatus;
    use crate::repositories::{ExecutionRepository, MemoryExecutionRepository, MemoryScheduleRepository};

    static GAVE_UP: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Report {
        behaviour: String,
    }

    #[async_trait]
    impl Schedulable for Report {
        const TYPE_NAME: &'static str = "Report";

        fn options() -> ScheduleOptions<Self> {
            ScheduleOptions::new("reports")
                .retry_limit(2)
                .track_execution(true)
                .on_error(|_: &JobFailure, record: &ScheduledRecord<Report>| {
                    if record.payload.behaviour == "fail" {
                        GAVE_UP.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(())
                })
        }

        async fn execute(&self, _ctx: &ExecutionContext) -> Result<Outcome, JobFailure> {
            match self.behaviour.as_str() {
                "ok" => Ok(Outcome::Ok),
                "defer" => Ok(Outcome::OkWithoutReset),
                "retry" => Ok(Outcome::Retry),
                "abort" => Ok(Outcome::Abort),
                "panic" => panic!("callback exploded"),
                _ => Err(JobFailure::new("Boom", "callback failed")),
            }
        }
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2017, 6, 18, h, m, s).unwrap()
    }

    struct Harness {
        executor: JobExecutor<Report>,
        repo: Arc<MemoryScheduleRepository<Report>>,
        executions: Arc<MemoryExecutionRepository>,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let repo = Arc::new(MemoryScheduleRepository::new(Report::options()).unwrap());
        let executions = Arc::new(MemoryExecutionRepository::new());
        let clock = Arc::new(ManualClock::new(at(1, 0, 0)));
        let ctx = EngineContext::new("w1", executions.clone()).with_clock(clock.clone());
        let executor = JobExecutor::new(repo.clone(), ctx).unwrap();
        Harness {
            executor,
            repo,
            executions,
            clock,
        }
    }

    async fn leased(h: &Harness, behaviour: &str) -> ScheduledRecord<Report> {
        let record = h
            .executor
            .create(
                Report {
                    behaviour: behaviour.to_string(),
                },
                ScheduleState::with_cron("0,30 * * * *"),
            )
            .await
            .unwrap();
        h.clock.set(at(1, 30, 0));
        h.repo
            .try_lease(record.id, "w1", h.clock.now())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_activates_schedule() {
        let h = harness();
        let record = h
            .executor
            .create(
                Report {
                    behaviour: "ok".to_string(),
                },
                ScheduleState::with_cron("0,30 * * * *"),
            )
            .await
            .unwrap();
        assert_eq!(record.state.next_execute_at, Some(at(1, 30, 0)));
        assert_eq!(record.state.started_at, Some(at(1, 0, 0)));
        assert!(record.state.current_cycle_id.is_some());
    }

    #[tokio::test]
    async fn test_create_rejects_bad_cron() {
        let h = harness();
        let err = h
            .executor
            .create(
                Report {
                    behaviour: "ok".to_string(),
                },
                ScheduleState::with_cron("every day"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidCron { .. }));
        assert!(h.repo.is_empty());
    }

    #[tokio::test]
    async fn test_ok_resets_from_cron() {
        let h = harness();
        let record = leased(&h, "ok").await;
        let cycle = record.state.current_cycle_id.clone();

        let outcome = h.executor.execute_one(record).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed);

        let stored = h.executor.find(1).await.unwrap();
        assert_eq!(stored.state.next_execute_at, Some(at(2, 0, 0)));
        assert_eq!(stored.state.execute_lock, 0);
        assert_eq!(stored.state.locked_by, None);
        assert_eq!(stored.state.last_executed_at, Some(at(1, 30, 0)));
        assert_ne!(stored.state.current_cycle_id, cycle);

        let runs = h.executions.recent("Report", 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_not_leased_is_refused() {
        let h = harness();
        let mut record = leased(&h, "ok").await;
        record.state.locked_by = Some("w2".to_string());
        let err = h.executor.execute_one(record).await.unwrap_err();
        assert!(matches!(err, JobError::NotLeased { id: 1, .. }));
    }

    #[tokio::test]
    async fn test_failure_retries_with_backoff_then_gives_up() {
        let h = harness();
        GAVE_UP.store(0, Ordering::SeqCst);
        let record = leased(&h, "fail").await;
        let original = record.state.next_execute_at.unwrap();

        let err = h.executor.execute_one(record).await.unwrap_err();
        assert!(matches!(err, JobError::Callback(ref f) if f.name == "Boom"));
        let stored = h.executor.find(1).await.unwrap();
        assert_eq!(stored.state.retry_count, 1);
        assert_eq!(stored.state.next_execute_at, Some(original + Duration::seconds(4)));
        assert_eq!(stored.state.execute_lock, 0);
        assert_eq!(stored.state.last_error_name.as_deref(), Some("Boom"));

        // second failure is still under the limit of 2
        h.clock.set(at(1, 30, 4));
        let record = h.repo.try_lease(1, "w1", h.clock.now()).await.unwrap().unwrap();
        assert!(h.executor.execute_one(record).await.is_err());
        assert_eq!(h.executor.find(1).await.unwrap().state.retry_count, 2);

        h.clock.set(at(1, 30, 8));
        let record = h.repo.try_lease(1, "w1", h.clock.now()).await.unwrap().unwrap();
        let outcome = h.executor.execute_one(record).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::GaveUp(_)));
        assert_eq!(GAVE_UP.load(Ordering::SeqCst), 1);

        let stored = h.executor.find(1).await.unwrap();
        assert_eq!(stored.state.retry_count, 0);
        assert_eq!(stored.state.next_execute_at, Some(at(2, 0, 0)));
        assert_eq!(stored.state.last_executed_at, None);
        assert_eq!(stored.state.last_error_name.as_deref(), Some("Boom"));

        let statuses: Vec<_> = h
            .executions
            .recent("Report", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.status)
            .collect();
        assert!(statuses.iter().all(|s| *s == ExecutionStatus::Failed));
        assert_eq!(statuses.len(), 3);
    }

    #[tokio::test]
    async fn test_abort_resets_without_retry() {
        let h = harness();
        let record = leased(&h, "abort").await;

        let outcome = h.executor.execute_one(record).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Aborted);

        let stored = h.executor.find(1).await.unwrap();
        assert_eq!(stored.state.retry_count, 0);
        assert_eq!(stored.state.last_error_name.as_deref(), Some("AbortExecution"));
        assert_eq!(stored.state.next_execute_at, Some(at(2, 0, 0)));
        assert_eq!(stored.state.last_executed_at, None);
        assert_eq!(stored.state.execute_lock, 0);
    }

    #[tokio::test]
    async fn test_retry_outcome_reschedules() {
        let h = harness();
        let record = leased(&h, "retry").await;

        assert_eq!(
            h.executor.execute_one(record).await.unwrap(),
            ExecutionOutcome::Retried
        );
        let stored = h.executor.find(1).await.unwrap();
        assert_eq!(stored.state.retry_count, 1);
        assert_eq!(stored.state.next_execute_at, Some(at(1, 30, 4)));
        assert_eq!(h.executions.recent("Report", 1).await.unwrap()[0].status, ExecutionStatus::Retrying);
    }

    #[tokio::test]
    async fn test_ok_without_reset_keeps_lease() {
        let h = harness();
        let record = leased(&h, "defer").await;

        assert_eq!(
            h.executor.execute_one(record).await.unwrap(),
            ExecutionOutcome::Deferred
        );
        let mut stored = h.executor.find(1).await.unwrap();
        assert_eq!(stored.state.locked_by.as_deref(), Some("w1"));
        assert_eq!(stored.state.next_execute_at, Some(at(1, 30, 0)));

        h.executor.reset(&mut stored, true).await.unwrap();
        assert_eq!(h.executor.find(1).await.unwrap().state.execute_lock, 0);
    }

    #[tokio::test]
    async fn test_panic_is_a_failure() {
        let h = harness();
        let record = leased(&h, "panic").await;

        let err = h.executor.execute_one(record).await.unwrap_err();
        assert!(matches!(err, JobError::Callback(ref f) if f.name == "Panic"));
        assert_eq!(h.executor.find(1).await.unwrap().state.execute_lock, 0);
    }

    #[tokio::test]
    async fn test_execute_now_inserts_and_runs() {
        let h = harness();
        let outcome = h
            .executor
            .execute_now(NewSchedule::new(
                Report {
                    behaviour: "ok".to_string(),
                },
                ScheduleState::default(),
            ))
            .await
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed);

        let stored = h.executor.find(1).await.unwrap();
        // no cron: never rescheduled
        assert_eq!(stored.state.next_execute_at, None);
        assert_eq!(stored.state.last_executed_at, Some(at(1, 0, 0)));
    }

    #[tokio::test]
    async fn test_execute_now_ignores_schedule() {
        let h = harness();
        let record = h
            .executor
            .create(
                Report {
                    behaviour: "ok".to_string(),
                },
                ScheduleState::with_cron("0 0 1 1 *"),
            )
            .await
            .unwrap();

        let outcome = h.executor.execute_now(record).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed);
    }

    #[tokio::test]
    async fn test_unlock_all_refuses_empty_filter() {
        let h = harness();
        let err = h.executor.unlock_all(&UnlockFilter::default()).await.unwrap_err();
        assert!(matches!(err, JobError::UnfilteredUnlock(_)));
    }

    #[tokio::test]
    async fn test_retry_execution_refused_while_locked() {
        let h = harness();
        let record = leased(&h, "defer").await;
        h.executor.execute_one(record).await.unwrap();
        let execution_id = h.executions.recent("Report", 1).await.unwrap()[0].id;

        let err = h.executor.retry_execution(execution_id).await.unwrap_err();
        assert!(matches!(err, JobError::StillExecuting { .. }));

        h.clock.advance(Duration::seconds(601));
        let record = h.executor.retry_execution(execution_id).await.unwrap();
        assert_eq!(record.state.next_execute_at, Some(h.clock.now()));
        assert_eq!(record.state.execute_lock, 0);
    }

    #[tokio::test]
    async fn test_global_handlers_see_give_up() {
        let repo = Arc::new(MemoryScheduleRepository::new(Report::options()).unwrap());
        let clock = Arc::new(ManualClock::new(at(1, 30, 0)));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let ctx = EngineContext::new("w1", Arc::new(MemoryExecutionRepository::new()))
            .with_clock(clock.clone())
            .with_handlers(ErrorHandlers::new().with_handler(move |f, r| {
                sink.lock().unwrap().push((f.name.clone(), r.cloned()));
                Ok(())
            }));
        let executor = JobExecutor::new(repo.clone(), ctx).unwrap();

        let mut state = ScheduleState::with_cron("0,30 * * * *");
        state.retry_count = 2;
        state.next_execute_at = Some(at(1, 30, 0));
        let record = repo
            .insert(&NewSchedule::new(
                Report {
                    behaviour: "fail-global".to_string(),
                },
                state,
            ))
            .await
            .unwrap();
        let record = repo.try_lease(record.id, "w1", clock.now()).await.unwrap().unwrap();

        executor.execute_one(record).await.unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1.as_ref().map(|r| r.id), Some(1));
    }

    #[test]
    fn test_options_defaults() {
        let options = ScheduleOptions::<Report>::new("reports");
        assert_eq!(options.retry_limit, 10);
        assert_eq!(options.retry_interval, StdDuration::from_secs(4));
        assert_eq!(options.execute_lock_timeout, StdDuration::from_secs(600));
    }
}
