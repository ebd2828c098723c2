use async_trait::async_trait;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use crate::db::AsyncDbPool;
use crate::error::{AppError, AppResult};
use crate::models::{ExecutionRecord, FinishExecution, NewExecution};
use crate::repositories::traits::ExecutionRepository;
use crate::schema::cronlease_executions;

#[derive(Clone)]
pub struct PgExecutionRepository {
    pool: AsyncDbPool,
}

impl PgExecutionRepository {
    pub fn new(pool: AsyncDbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExecutionRepository for PgExecutionRepository {
    async fn create(&self, execution: NewExecution) -> AppResult<ExecutionRecord> {
        let mut conn = self.pool.get().await.map_err(AppError::pool)?;

        diesel::insert_into(cronlease_executions::table)
            .values(&execution)
            .returning(ExecutionRecord::as_returning())
            .get_result(&mut conn)
            .await
            .map_err(AppError::from)
    }

    async fn finish(&self, id: i64, update: FinishExecution) -> AppResult<()> {
        let mut conn = self.pool.get().await.map_err(AppError::pool)?;

        let updated = diesel::update(cronlease_executions::table.find(id))
            .set(&update)
            .execute(&mut conn)
            .await
            .map_err(AppError::from)?;

        if updated == 0 {
            return Err(AppError::NotFound {
                entity: "Execution".to_string(),
                field: "id".to_string(),
                value: id.to_string(),
            });
        }
        Ok(())
    }

    async fn find(&self, id: i64) -> AppResult<ExecutionRecord> {
        let mut conn = self.pool.get().await.map_err(AppError::pool)?;

        cronlease_executions::table
            .find(id)
            .select(ExecutionRecord::as_select())
            .first(&mut conn)
            .await
            .map_err(|e| match e {
                diesel::result::Error::NotFound => AppError::NotFound {
                    entity: "Execution".to_string(),
                    field: "id".to_string(),
                    value: id.to_string(),
                },
                _ => AppError::from(e),
            })
    }

    async fn recent(&self, schedule_type: &str, limit: i64) -> AppResult<Vec<ExecutionRecord>> {
        let mut conn = self.pool.get().await.map_err(AppError::pool)?;

        cronlease_executions::table
            .filter(cronlease_executions::schedule_type.eq(schedule_type))
            .order((
                cronlease_executions::executed_at.desc(),
                cronlease_executions::id.desc(),
            ))
            .limit(limit)
            .select(ExecutionRecord::as_select())
            .load(&mut conn)
            .await
            .map_err(AppError::from)
    }

    async fn for_schedule(
        &self,
        schedule_type: &str,
        schedule_id: i64,
        limit: i64,
    ) -> AppResult<Vec<ExecutionRecord>> {
        let mut conn = self.pool.get().await.map_err(AppError::pool)?;

        cronlease_executions::table
            .filter(cronlease_executions::schedule_type.eq(schedule_type))
            .filter(cronlease_executions::schedule_id.eq(schedule_id))
            .order((
                cronlease_executions::executed_at.desc(),
                cronlease_executions::id.desc(),
            ))
            .limit(limit)
            .select(ExecutionRecord::as_select())
            .load(&mut conn)
            .await
            .map_err(AppError::from)
    }
}
