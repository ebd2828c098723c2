use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel_async::RunQueryDsl;

use crate::db::AsyncDbPool;
use crate::error::{AppError, AppResult};
use crate::models::{NewSignal, SignalRecord, WorkerRecord};
use crate::repositories::traits::FleetRepository;
use crate::schema::{cronlease_signals, cronlease_workers};

/// Worker heartbeats and the remote signal channel.
#[derive(Clone)]
pub struct PgFleetRepository {
    pool: AsyncDbPool,
}

impl PgFleetRepository {
    pub fn new(pool: AsyncDbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FleetRepository for PgFleetRepository {
    async fn heartbeat(&self, worker: &WorkerRecord) -> AppResult<()> {
        let mut conn = self.pool.get().await.map_err(AppError::pool)?;

        diesel::insert_into(cronlease_workers::table)
            .values(worker)
            .on_conflict(cronlease_workers::worker_id)
            .do_update()
            .set((
                cronlease_workers::max_thread_size.eq(excluded(cronlease_workers::max_thread_size)),
                cronlease_workers::current_executing_size
                    .eq(excluded(cronlease_workers::current_executing_size)),
                cronlease_workers::current_queue_size
                    .eq(excluded(cronlease_workers::current_queue_size)),
                cronlease_workers::executor_status.eq(excluded(cronlease_workers::executor_status)),
                cronlease_workers::polling_model_names
                    .eq(excluded(cronlease_workers::polling_model_names)),
                cronlease_workers::last_heartbeated_at
                    .eq(excluded(cronlease_workers::last_heartbeated_at)),
            ))
            .execute(&mut conn)
            .await
            .map_err(AppError::from)?;

        Ok(())
    }

    async fn unregister(&self, worker_id: &str) -> AppResult<bool> {
        let mut conn = self.pool.get().await.map_err(AppError::pool)?;

        let deleted = diesel::delete(cronlease_workers::table.find(worker_id))
            .execute(&mut conn)
            .await
            .map_err(AppError::from)?;

        Ok(deleted > 0)
    }

    async fn alive_workers(&self, since: DateTime<Utc>) -> AppResult<Vec<WorkerRecord>> {
        let mut conn = self.pool.get().await.map_err(AppError::pool)?;

        cronlease_workers::table
            .filter(cronlease_workers::last_heartbeated_at.ge(since))
            .order(cronlease_workers::worker_id.asc())
            .select(WorkerRecord::as_select())
            .load(&mut conn)
            .await
            .map_err(AppError::from)
    }

    async fn send_signal(&self, signal: NewSignal) -> AppResult<SignalRecord> {
        let mut conn = self.pool.get().await.map_err(AppError::pool)?;

        diesel::insert_into(cronlease_signals::table)
            .values(&signal)
            .returning(SignalRecord::as_returning())
            .get_result(&mut conn)
            .await
            .map_err(AppError::from)
    }

    async fn pending_signal(
        &self,
        worker_id: &str,
        since: DateTime<Utc>,
    ) -> AppResult<Option<SignalRecord>> {
        let mut conn = self.pool.get().await.map_err(AppError::pool)?;

        cronlease_signals::table
            .filter(cronlease_signals::worker_id.eq(worker_id))
            .filter(cronlease_signals::received_at.is_null())
            .filter(cronlease_signals::sent_at.ge(since))
            .order((cronlease_signals::sent_at.asc(), cronlease_signals::id.asc()))
            .select(SignalRecord::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(AppError::from)
    }

    async fn claim_signal(&self, id: i64, received_at: DateTime<Utc>) -> AppResult<bool> {
        let mut conn = self.pool.get().await.map_err(AppError::pool)?;

        let claimed = diesel::update(
            cronlease_signals::table
                .find(id)
                .filter(cronlease_signals::received_at.is_null()),
        )
        .set(cronlease_signals::received_at.eq(received_at))
        .execute(&mut conn)
        .await
        .map_err(AppError::from)?;

        Ok(claimed == 1)
    }

    async fn recent_signals(&self, limit: i64) -> AppResult<Vec<SignalRecord>> {
        let mut conn = self.pool.get().await.map_err(AppError::pool)?;

        cronlease_signals::table
            .order((cronlease_signals::sent_at.desc(), cronlease_signals::id.desc()))
            .limit(limit)
            .select(SignalRecord::as_select())
            .load(&mut conn)
            .await
            .map_err(AppError::from)
    }
}
