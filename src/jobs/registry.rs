use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::jobs::error::{JobError, JobResult};
use crate::jobs::executor::JobExecutor;
use crate::jobs::schedulable::Schedulable;
use crate::jobs::types::ExecutionOutcome;
use crate::repositories::{ScheduleStats, UnlockFilter};

/// One leased record, ready to run on the dispatcher.
pub struct WorkUnit {
    pub type_name: &'static str,
    /// Primary key of the leased row
    pub id: i64,
    /// Executes the callback and applies its outcome
    pub run: BoxFuture<'static, JobResult<ExecutionOutcome>>,
}

impl std::fmt::Debug for WorkUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkUnit")
            .field("type_name", &self.type_name)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Type-erased [`LeaseBatch`](crate::jobs::LeaseBatch).
#[derive(Debug)]
pub struct LeasedBatch {
    pub units: Vec<WorkUnit>,
    /// Poll again before the next tick.
    pub maybe_more: bool,
}

/// Type-erased executor as seen by a poller.
#[async_trait]
pub trait PollSource: Send + Sync {
    fn type_name(&self) -> &'static str;

    async fn lease(&self, limit: usize, worker_count: usize) -> JobResult<LeasedBatch>;

    /// Give back leases this worker took but cannot run.
    async fn release(&self, ids: Vec<i64>) -> JobResult<usize>;

    async fn stats(&self) -> JobResult<ScheduleStats>;
}

#[async_trait]
impl<T: Schedulable> PollSource for JobExecutor<T> {
    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    async fn lease(&self, limit: usize, worker_count: usize) -> JobResult<LeasedBatch> {
        let batch = JobExecutor::lease(self, limit, worker_count).await?;
        let units = batch
            .records
            .into_iter()
            .map(|record| {
                let executor = self.clone();
                WorkUnit {
                    type_name: T::TYPE_NAME,
                    id: record.id,
                    run: async move { executor.execute_one(record).await }.boxed(),
                }
            })
            .collect();

        Ok(LeasedBatch {
            units,
            maybe_more: batch.maybe_more,
        })
    }

    async fn release(&self, ids: Vec<i64>) -> JobResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let filter = UnlockFilter::ids(ids).and_locked_by(self.context().worker_id.clone());
        self.unlock_all(&filter).await
    }

    async fn stats(&self) -> JobResult<ScheduleStats> {
        JobExecutor::stats(self).await
    }
}

/// Registered schedulable types by name.
#[derive(Clone, Default)]
pub struct JobRegistry {
    sources: BTreeMap<&'static str, Arc<dyn PollSource>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor; a later registration of the same type replaces it.
    pub fn register<T: Schedulable>(&mut self, executor: JobExecutor<T>) -> &mut Self {
        self.insert(Arc::new(executor))
    }

    pub fn insert(&mut self, source: Arc<dyn PollSource>) -> &mut Self {
        if self.sources.insert(source.type_name(), source).is_some() {
            tracing::warn!("Schedulable type registered twice, keeping the latest");
        }
        self
    }

    pub fn names(&self) -> Vec<String> {
        self.sources.keys().map(|n| n.to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn get(&self, type_name: &str) -> Option<Arc<dyn PollSource>> {
        self.sources.get(type_name).cloned()
    }

    /// Sources for the requested names, or every source when none are given.
    pub fn sources(&self, model_names: &[String]) -> JobResult<Vec<Arc<dyn PollSource>>> {
        if model_names.is_empty() {
            return Ok(self.sources.values().cloned().collect());
        }

        let mut selected: Vec<Arc<dyn PollSource>> = Vec::with_capacity(model_names.len());
        for name in model_names {
            let source = self
                .get(name)
                .ok_or_else(|| JobError::UnknownType(name.clone()))?;
            if !selected.iter().any(|s| s.type_name() == source.type_name()) {
                selected.push(source);
            }
        }
        Ok(selected)
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("types", &self.sources.keys().collect::<Vec<_>>())
            .finish()
    }
}
