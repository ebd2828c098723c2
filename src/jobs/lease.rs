//! Two-phase batch leasing.
//!
//! Candidate ids are read without locks, then each row is locked, re-checked
//! and leased in its own short transaction. Only one row lock is held at a
//! time and a peer that wins a row just makes us skip it.

use chrono::{DateTime, Utc};

use crate::error::AppResult;
use crate::jobs::schedulable::ScheduledRecord;
use crate::repositories::ScheduleRepository;

#[derive(Debug)]
pub struct LeaseBatch<T> {
    /// Rows leased for the caller, in candidate order.
    pub records: Vec<ScheduledRecord<T>>,
    /// The candidate scan found rows. Rows rejected at lock time keep this
    /// set, so callers also stop on an empty batch.
    pub maybe_more: bool,
}

/// Lease up to `limit` rows for `worker_id`.
///
/// The candidate scan over-fetches `limit * worker_count` ids to absorb
/// races with peers polling the same table. A row error is logged and
/// skipped once something is leased; before that it is returned.
pub async fn lease_batch<T, R>(
    repo: &R,
    type_name: &str,
    worker_id: &str,
    now: DateTime<Utc>,
    limit: usize,
    worker_count: usize,
) -> AppResult<LeaseBatch<T>>
where
    T: Send + Sync + 'static,
    R: ScheduleRepository<T> + ?Sized,
{
    if limit == 0 {
        return Ok(LeaseBatch {
            records: Vec::new(),
            maybe_more: false,
        });
    }

    let scan = limit.saturating_mul(worker_count.max(1));
    let candidates = repo
        .candidate_ids(now, i64::try_from(scan).unwrap_or(i64::MAX))
        .await?;
    let maybe_more = !candidates.is_empty();

    let mut records = Vec::with_capacity(limit.min(candidates.len()));
    for id in candidates {
        if records.len() >= limit {
            break;
        }

        match repo.try_lease(id, worker_id, now).await {
            Ok(Some(record)) => records.push(record),
            Ok(None) => {
                tracing::debug!(
                    model = type_name,
                    id,
                    "Candidate taken by a peer or not executable, skipping"
                );
            }
            Err(e) if records.is_empty() => return Err(e),
            Err(e) => {
                tracing::warn!(
                    model = type_name,
                    id,
                    transient = e.is_transient(),
                    error = %e,
                    "Failed to lease row, skipping"
                );
            }
        }
    }

    tracing::debug!(
        model = type_name,
        worker_id,
        leased = records.len(),
        maybe_more,
        "Lease batch finished"
    );

    Ok(LeaseBatch {
        records,
        maybe_more,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::TimeZone;

    use crate::error::AppError;
    use crate::jobs::{NewSchedule, ScheduleOptions, ScheduleState};
    use crate::repositories::{MemoryScheduleRepository, ScheduleStats, UnlockFilter};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2017, 6, 18, 1, 10, 0).unwrap()
    }

    async fn seeded(count: usize) -> MemoryScheduleRepository<String> {
        let repo = MemoryScheduleRepository::new(ScheduleOptions::new("reports")).unwrap();
        for i in 0..count {
            let state = ScheduleState {
                next_execute_at: Some(now()),
                ..ScheduleState::default()
            };
            repo.insert(&NewSchedule::new(format!("r{i}"), state))
                .await
                .unwrap();
        }
        repo
    }

    #[tokio::test]
    async fn test_stops_at_limit() {
        let repo = seeded(5).await;
        let batch = lease_batch(&repo, "Report", "w1", now(), 2, 1).await.unwrap();
        assert_eq!(batch.records.len(), 2);
        assert!(batch.maybe_more);

        let rest = lease_batch(&repo, "Report", "w1", now(), 10, 1).await.unwrap();
        assert_eq!(rest.records.len(), 3);

        let empty = lease_batch(&repo, "Report", "w1", now(), 10, 1).await.unwrap();
        assert!(empty.records.is_empty());
        assert!(!empty.maybe_more);
    }

    #[tokio::test]
    async fn test_rows_failing_predicates_stay_candidates() {
        let options = ScheduleOptions::new("reports")
            .executable_if(|r: &ScheduledRecord<String>| r.payload != "blocked");
        let repo = MemoryScheduleRepository::new(options).unwrap();
        for payload in ["blocked", "blocked"] {
            let state = ScheduleState {
                next_execute_at: Some(now()),
                ..ScheduleState::default()
            };
            repo.insert(&NewSchedule::new(payload.to_string(), state))
                .await
                .unwrap();
        }

        let batch = lease_batch(&repo, "Report", "w1", now(), 2, 1).await.unwrap();
        assert!(batch.records.is_empty());
        assert!(batch.maybe_more);
        assert_eq!(repo.candidate_ids(now(), 10).await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_workers_never_share_a_row() {
        let repo = Arc::new(seeded(40).await);

        let mut tasks = Vec::new();
        for w in 0..4 {
            let repo = Arc::clone(&repo);
            tasks.push(tokio::spawn(async move {
                let worker = format!("w{w}");
                let mut leased = Vec::new();
                loop {
                    let batch = lease_batch(repo.as_ref(), "Report", &worker, now(), 3, 4)
                        .await
                        .unwrap();
                    leased.extend(batch.records.into_iter().map(|r| r.id));
                    let left = repo.candidate_ids(now(), 1).await.unwrap();
                    if left.is_empty() {
                        break;
                    }
                }
                leased
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for task in tasks {
            for id in task.await.unwrap() {
                total += 1;
                assert!(seen.insert(id), "row {id} leased twice");
            }
        }
        assert_eq!(total, 40);
    }

    /// Fails every lease attempt after the first `ok` ones.
    struct Flaky {
        inner: MemoryScheduleRepository<String>,
        ok: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ScheduleRepository<String> for Flaky {
        async fn candidate_ids(&self, now: DateTime<Utc>, limit: i64) -> AppResult<Vec<i64>> {
            self.inner.candidate_ids(now, limit).await
        }
        async fn try_lease(
            &self,
            id: i64,
            worker_id: &str,
            now: DateTime<Utc>,
        ) -> AppResult<Option<ScheduledRecord<String>>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= self.ok {
                return Err(AppError::Transient {
                    operation: "lock candidate row".to_string(),
                    source: anyhow::anyhow!("deadlock detected"),
                });
            }
            self.inner.try_lease(id, worker_id, now).await
        }
        async fn force_lease(
            &self,
            id: i64,
            worker_id: &str,
            now: DateTime<Utc>,
        ) -> AppResult<Option<ScheduledRecord<String>>> {
            self.inner.force_lease(id, worker_id, now).await
        }
        async fn find(&self, id: i64) -> AppResult<Option<ScheduledRecord<String>>> {
            self.inner.find(id).await
        }
        async fn insert(&self, record: &NewSchedule<String>) -> AppResult<ScheduledRecord<String>> {
            self.inner.insert(record).await
        }
        async fn save_state(&self, id: i64, state: &ScheduleState) -> AppResult<()> {
            self.inner.save_state(id, state).await
        }
        async fn unlock_all(&self, filter: &UnlockFilter) -> AppResult<usize> {
            self.inner.unlock_all(filter).await
        }
        async fn stats(&self, now: DateTime<Utc>) -> AppResult<ScheduleStats> {
            self.inner.stats(now).await
        }
    }

    #[tokio::test]
    async fn test_row_errors_skipped_after_progress() {
        let repo = Flaky {
            inner: seeded(3).await,
            ok: 1,
            calls: AtomicUsize::new(0),
        };
        let batch = lease_batch(&repo, "Report", "w1", now(), 3, 1).await.unwrap();
        assert_eq!(batch.records.len(), 1);
    }

    #[tokio::test]
    async fn test_error_without_progress_propagates() {
        let repo = Flaky {
            inner: seeded(3).await,
            ok: 0,
            calls: AtomicUsize::new(0),
        };
        let err = lease_batch(&repo, "Report", "w1", now(), 3, 1).await.unwrap_err();
        assert!(err.is_transient());
    }
}
