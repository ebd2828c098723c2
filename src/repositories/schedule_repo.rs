//! Postgres storage for user schedulable tables.
//!
//! Table and column names are only known at registration, so queries are
//! assembled once from the validated [`ColumnMap`] and always quote their
//! identifiers. Rows are read as `to_jsonb(t)` and written through
//! `jsonb_populate_record`, which keeps the column types in the database.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::OptionalExtension;
use diesel::QueryableByName;
use diesel::pg::Pg;
use diesel::sql_types::{Array, BigInt, Jsonb, Nullable, Text, Timestamptz};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};

use crate::db::AsyncDbPool;
use crate::error::{AppError, AppResult, DatabaseErrorConverter};
use crate::jobs::schedulable::is_identifier;
use crate::jobs::{Column, ColumnMap, NewSchedule, ScheduleOptions, ScheduleState, ScheduledRecord};
use crate::repositories::traits::{ScheduleRepository, ScheduleStats, UnlockFilter};

#[derive(QueryableByName)]
struct IdRow {
    #[diesel(sql_type = BigInt)]
    id: i64,
}

#[derive(QueryableByName)]
struct RecordRow {
    #[diesel(sql_type = Jsonb)]
    record: JsonValue,
}

#[derive(QueryableByName)]
struct ColumnNameRow {
    #[diesel(sql_type = Text)]
    column_name: String,
}

#[derive(QueryableByName)]
struct StatsRow {
    #[diesel(sql_type = BigInt)]
    executable_count: i64,
    #[diesel(sql_type = Nullable<BigInt>)]
    oldest_lock: Option<i64>,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    oldest_due: Option<DateTime<Utc>>,
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier)
}

fn db_error(operation: &'static str) -> impl Fn(diesel::result::Error) -> AppError {
    move |e| DatabaseErrorConverter::convert_diesel_error(e, operation)
}

/// Statements prepared from the column map at construction.
#[derive(Debug, Clone)]
struct Statements {
    candidate_ids: String,
    lock_candidate: String,
    write_lease: String,
    find: String,
    save_state: String,
    unlock: String,
    stats: String,
}

impl Statements {
    fn build(table: &str, columns: &ColumnMap, sql_conditions: &[String]) -> AppResult<Self> {
        let col = |c: Column| {
            columns
                .physical(c)
                .map(quote)
                .ok_or_else(|| AppError::validation(c.default_name(), "required column is not mapped"))
        };
        let (id, next, started, finished, lock, locked_by) = (
            col(Column::Id)?,
            col(Column::NextExecuteAt)?,
            col(Column::StartedAt)?,
            col(Column::FinishedAt)?,
            col(Column::ExecuteLock)?,
            col(Column::LockedBy)?,
        );
        let table = quote(table);

        // $1 = now, $2 = now - lock timeout in unix seconds
        let mut candidate = format!(
            "{next} <= $1 AND ({started} IS NULL OR {started} <= $1) \
             AND ({finished} IS NULL OR {finished} > $1) \
             AND ({lock} = 0 OR {lock} < $2)"
        );
        for condition in sql_conditions {
            candidate.push_str(&format!(" AND ({condition})"));
        }

        let state_columns: Vec<String> = columns
            .present()
            .filter(|(c, _)| *c != Column::Id)
            .map(|(_, name)| quote(name))
            .collect();
        let state_columns = state_columns.join(", ");

        Ok(Self {
            candidate_ids: format!(
                "SELECT t.{id}::bigint AS id FROM {table} AS t WHERE {candidate} \
                 ORDER BY t.{next} ASC LIMIT $3"
            ),
            lock_candidate: format!(
                "SELECT to_jsonb(t) AS record FROM {table} AS t \
                 WHERE t.{id} = $3 AND {candidate} FOR UPDATE"
            ),
            write_lease: format!(
                "UPDATE {table} AS t SET {lock} = $1, {locked_by} = $2 \
                 WHERE t.{id} = $3 RETURNING to_jsonb(t) AS record"
            ),
            find: format!("SELECT to_jsonb(t) AS record FROM {table} AS t WHERE t.{id} = $1"),
            save_state: format!(
                "UPDATE {table} SET ({state_columns}) = \
                 (SELECT {state_columns} FROM jsonb_populate_record(NULL::{table}, $1)) \
                 WHERE {id} = $2"
            ),
            unlock: format!("UPDATE {table} SET {lock} = 0, {locked_by} = NULL WHERE TRUE"),
            stats: format!(
                "SELECT COUNT(*) FILTER (WHERE {candidate}) AS executable_count, \
                 MIN({lock}) FILTER (WHERE {lock} > 0) AS oldest_lock, \
                 MIN({next}) FILTER (WHERE {candidate}) AS oldest_due \
                 FROM {table} AS t"
            ),
        })
    }
}

pub struct PgScheduleRepository<T> {
    pool: AsyncDbPool,
    options: ScheduleOptions<T>,
    statements: Statements,
}

impl<T> Clone for PgScheduleRepository<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            options: self.options.clone(),
            statements: self.statements.clone(),
        }
    }
}

impl<T> PgScheduleRepository<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Validate the options, detect which optional columns the table has and
    /// prepare the statements.
    pub async fn connect(pool: AsyncDbPool, options: ScheduleOptions<T>) -> AppResult<Self> {
        options.validate()?;

        let existing = Self::existing_columns(&pool, &options.table_name).await?;
        if existing.is_empty() {
            return Err(AppError::NotFound {
                entity: "table".to_string(),
                field: "name".to_string(),
                value: options.table_name.clone(),
            });
        }

        let mut options = options;
        options.columns = options
            .columns
            .clone()
            .retain_present(&options.table_name, &existing)?;

        let sql_conditions: Vec<String> = options.sql_conditions().map(str::to_string).collect();
        let statements = Statements::build(&options.table_name, &options.columns, &sql_conditions)?;

        tracing::debug!(
            table = %options.table_name,
            columns = ?options.columns.present().map(|(_, n)| n).collect::<Vec<_>>(),
            "Prepared schedule repository"
        );

        Ok(Self {
            pool,
            options,
            statements,
        })
    }

    /// Effective column map after presence detection.
    pub fn columns(&self) -> &ColumnMap {
        &self.options.columns
    }

    async fn existing_columns(pool: &AsyncDbPool, table_name: &str) -> AppResult<HashSet<String>> {
        let mut conn = pool.get().await.map_err(AppError::pool)?;

        let rows: Vec<ColumnNameRow> = diesel::sql_query(
            "SELECT column_name::text AS column_name FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1",
        )
        .bind::<Text, _>(table_name)
        .load(&mut conn)
        .await
        .map_err(db_error("detect schedule columns"))?;

        Ok(rows.into_iter().map(|r| r.column_name).collect())
    }

    fn lock_cutoff(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp() - self.options.lock_timeout().num_seconds()
    }

    fn decode(&self, row: JsonValue) -> AppResult<ScheduledRecord<T>> {
        let JsonValue::Object(map) = row else {
            return Err(AppError::Internal {
                source: anyhow::anyhow!("{} row is not a JSON object", self.options.table_name),
            });
        };
        let (id, state) = self.options.columns.state_from_row(&map)?;
        let payload = serde_json::from_value(JsonValue::Object(map)).map_err(|e| {
            AppError::validation(
                self.options.table_name.clone(),
                format!("row {} does not match the payload type: {}", id, e),
            )
        })?;
        Ok(ScheduledRecord { id, state, payload })
    }

    fn insert_row(&self, record: &NewSchedule<T>) -> AppResult<Map<String, JsonValue>> {
        let mut row = match serde_json::to_value(&record.payload) {
            Ok(JsonValue::Object(map)) => map,
            Ok(JsonValue::Null) => Map::new(),
            Ok(other) => {
                return Err(AppError::validation(
                    self.options.table_name.clone(),
                    format!("payload must serialize to an object, got {}", other),
                ));
            }
            Err(e) => return Err(AppError::from(anyhow::Error::from(e))),
        };

        if let Some(id) = self.options.columns.physical(Column::Id) {
            row.remove(id);
        }
        row.extend(self.options.columns.state_to_row(&record.state));

        if let Some(bad) = row.keys().find(|k| !is_identifier(k)) {
            return Err(AppError::validation(
                bad.clone(),
                "payload field is not a valid column name",
            ));
        }
        Ok(row)
    }
}

#[async_trait]
impl<T> ScheduleRepository<T> for PgScheduleRepository<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn candidate_ids(&self, now: DateTime<Utc>, limit: i64) -> AppResult<Vec<i64>> {
        let mut conn = self.pool.get().await.map_err(AppError::pool)?;

        let rows: Vec<IdRow> = diesel::sql_query(&self.statements.candidate_ids)
            .bind::<Timestamptz, _>(now)
            .bind::<BigInt, _>(self.lock_cutoff(now))
            .bind::<BigInt, _>(limit)
            .load(&mut conn)
            .await
            .map_err(db_error("select candidate ids"))?;

        Ok(rows.into_iter().map(|r| r.id).collect())
    }

    async fn try_lease(
        &self,
        id: i64,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<ScheduledRecord<T>>> {
        let mut conn = self.pool.get().await.map_err(AppError::pool)?;
        let cutoff = self.lock_cutoff(now);
        let statements = &self.statements;

        conn.transaction::<_, AppError, _>(|conn| {
            async move {
                let locked: Option<RecordRow> = diesel::sql_query(&statements.lock_candidate)
                    .bind::<Timestamptz, _>(now)
                    .bind::<BigInt, _>(cutoff)
                    .bind::<BigInt, _>(id)
                    .get_result(conn)
                    .await
                    .optional()
                    .map_err(db_error("lock candidate row"))?;

                let Some(locked) = locked else {
                    return Ok(None);
                };
                if !self.options.passes_predicates(&self.decode(locked.record)?) {
                    return Ok(None);
                }

                let leased: RecordRow = diesel::sql_query(&statements.write_lease)
                    .bind::<BigInt, _>(now.timestamp())
                    .bind::<Text, _>(worker_id)
                    .bind::<BigInt, _>(id)
                    .get_result(conn)
                    .await
                    .map_err(db_error("write lease"))?;

                self.decode(leased.record).map(Some)
            }
            .scope_boxed()
        })
        .await
    }

    async fn force_lease(
        &self,
        id: i64,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<ScheduledRecord<T>>> {
        let mut conn = self.pool.get().await.map_err(AppError::pool)?;

        let leased: Option<RecordRow> = diesel::sql_query(&self.statements.write_lease)
            .bind::<BigInt, _>(now.timestamp())
            .bind::<Text, _>(worker_id)
            .bind::<BigInt, _>(id)
            .get_result(&mut conn)
            .await
            .optional()
            .map_err(db_error("force lease"))?;

        leased.map(|row| self.decode(row.record)).transpose()
    }

    async fn find(&self, id: i64) -> AppResult<Option<ScheduledRecord<T>>> {
        let mut conn = self.pool.get().await.map_err(AppError::pool)?;

        let row: Option<RecordRow> = diesel::sql_query(&self.statements.find)
            .bind::<BigInt, _>(id)
            .get_result(&mut conn)
            .await
            .optional()
            .map_err(db_error("find schedule"))?;

        row.map(|row| self.decode(row.record)).transpose()
    }

    async fn insert(&self, record: &NewSchedule<T>) -> AppResult<ScheduledRecord<T>> {
        let row = self.insert_row(record)?;
        let columns: Vec<String> = row.keys().map(|k| quote(k)).collect();
        let columns = columns.join(", ");
        let table = quote(&self.options.table_name);
        let sql = format!(
            "INSERT INTO {table} AS t ({columns}) \
             SELECT {columns} FROM jsonb_populate_record(NULL::{table}, $1) \
             RETURNING to_jsonb(t) AS record"
        );

        let mut conn = self.pool.get().await.map_err(AppError::pool)?;
        let inserted: RecordRow = diesel::sql_query(sql)
            .bind::<Jsonb, _>(JsonValue::Object(row))
            .get_result(&mut conn)
            .await
            .map_err(db_error("insert schedule"))?;

        self.decode(inserted.record)
    }

    async fn save_state(&self, id: i64, state: &ScheduleState) -> AppResult<()> {
        let row = self.options.columns.state_to_row(state);
        let mut conn = self.pool.get().await.map_err(AppError::pool)?;

        let updated = diesel::sql_query(&self.statements.save_state)
            .bind::<Jsonb, _>(JsonValue::Object(row))
            .bind::<BigInt, _>(id)
            .execute(&mut conn)
            .await
            .map_err(db_error("save schedule state"))?;

        if updated == 0 {
            return Err(AppError::NotFound {
                entity: self.options.table_name.clone(),
                field: "id".to_string(),
                value: id.to_string(),
            });
        }
        Ok(())
    }

    async fn unlock_all(&self, filter: &UnlockFilter) -> AppResult<usize> {
        if filter.is_empty() {
            return Err(AppError::validation("filter", "unlock requires an id or owner filter"));
        }
        if filter.ids.as_ref().is_some_and(|ids| ids.is_empty()) {
            return Ok(0);
        }

        let id = quote(self.options.columns.physical(Column::Id).unwrap_or("id"));
        let locked_by = quote(
            self.options
                .columns
                .physical(Column::LockedBy)
                .unwrap_or("locked_by"),
        );

        let mut sql = self.statements.unlock.clone();
        let mut param = 0;
        if filter.ids.is_some() {
            param += 1;
            sql.push_str(&format!(" AND {id} = ANY(${param})"));
        }
        if filter.locked_by.is_some() {
            param += 1;
            sql.push_str(&format!(" AND {locked_by} = ${param}"));
        }

        let mut query = diesel::sql_query(sql).into_boxed::<Pg>();
        if let Some(ids) = &filter.ids {
            query = query.bind::<Array<BigInt>, _>(ids.clone());
        }
        if let Some(worker_id) = &filter.locked_by {
            query = query.bind::<Text, _>(worker_id.clone());
        }

        let mut conn = self.pool.get().await.map_err(AppError::pool)?;
        query
            .execute(&mut conn)
            .await
            .map_err(db_error("unlock schedules"))
    }

    async fn stats(&self, now: DateTime<Utc>) -> AppResult<ScheduleStats> {
        let mut conn = self.pool.get().await.map_err(AppError::pool)?;

        let row: StatsRow = diesel::sql_query(&self.statements.stats)
            .bind::<Timestamptz, _>(now)
            .bind::<BigInt, _>(self.lock_cutoff(now))
            .get_result(&mut conn)
            .await
            .map_err(db_error("collect schedule stats"))?;

        Ok(ScheduleStats {
            executable_count: row.executable_count,
            oldest_lock: row.oldest_lock,
            oldest_due: row.oldest_due,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_statements_quote_identifiers_and_append_conditions() {
        let columns = ColumnMap::default()
            .with(Column::NextExecuteAt, "run_at")
            .without(Column::CurrentCycleId);
        let statements = Statements::build(
            "reports",
            &columns,
            &["\"paused\" = false".to_string()],
        )
        .unwrap();

        assert!(statements.candidate_ids.contains("FROM \"reports\" AS t"));
        assert!(statements.candidate_ids.contains("\"run_at\" <= $1"));
        assert!(statements.candidate_ids.contains("ORDER BY t.\"run_at\" ASC LIMIT $3"));
        assert!(statements.candidate_ids.contains("AND (\"paused\" = false)"));
        assert!(statements.lock_candidate.ends_with("FOR UPDATE"));
        assert!(!statements.save_state.contains("current_cycle_id"));
        assert!(!statements.save_state.contains("\"id\","));
        assert!(statements.save_state.contains("jsonb_populate_record(NULL::\"reports\", $1)"));
    }

    #[test]
    fn test_lease_expiry_matches_record_rule() {
        // lock + timeout < now  <=>  lock < now - timeout
        let now = Utc::now();
        let timeout = Duration::seconds(600);
        let cutoff = now.timestamp() - timeout.num_seconds();
        for lock in [cutoff - 1, cutoff, cutoff + 1] {
            let state = ScheduleState {
                execute_lock: lock,
                ..ScheduleState::default()
            };
            assert_eq!(lock < cutoff, state.lease_expired(now, timeout));
        }
    }
}
