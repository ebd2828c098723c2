//! Schedulable record model: the standard scheduling columns, the per-type
//! options and the trait user types implement.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, LazyLock};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use chrono_tz::Tz;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::AppError;
use crate::jobs::cron::{CronSchedule, parse_timezone};
use crate::jobs::error::{JobError, JobResult};
use crate::jobs::handlers::RecordErrorHandler;
use crate::jobs::types::{ExecutionContext, JobFailure, Outcome};

pub const DEFAULT_RETRY_LIMIT: i32 = 10;
pub const DEFAULT_RETRY_INTERVAL: StdDuration = StdDuration::from_secs(4);
pub const DEFAULT_EXECUTE_LOCK_TIMEOUT: StdDuration = StdDuration::from_secs(600);

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$")
        .unwrap_or_else(|e| panic!("invalid identifier regex: {e}"))
});

pub(crate) fn is_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

/// Engine-owned columns of a schedulable row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleState {
    /// `None` for records that only run through `execute_now`
    pub cron: Option<String>,
    /// IANA name the cron is evaluated in, UTC when unset
    pub timezone: Option<String>,
    pub next_execute_at: Option<DateTime<Utc>>,
    /// Active window start; no run is offered before it
    pub started_at: Option<DateTime<Utc>>,
    /// Active window end, exclusive
    pub finished_at: Option<DateTime<Utc>>,
    /// Unix seconds at lease time, `0` when unlocked
    pub execute_lock: i64,
    /// Worker id that holds the lease
    pub locked_by: Option<String>,
    /// Failures since the last successful run
    pub retry_count: i32,
    pub last_error_name: Option<String>,
    pub last_error_reason: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
    pub last_executed_at: Option<DateTime<Utc>>,
    /// Fresh UUID per scheduled run, shared by its retries
    pub current_cycle_id: Option<String>,
}

impl ScheduleState {
    pub fn with_cron(cron: impl Into<String>) -> Self {
        Self {
            cron: Some(cron.into()),
            ..Self::default()
        }
    }

    pub fn lease_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.execute_lock == 0 || self.execute_lock + timeout.num_seconds() < now.timestamp()
    }

    pub fn is_locked(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        !self.lease_expired(now, timeout)
    }

    /// Some worker may still be running the callback.
    pub fn assume_executing(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.is_locked(now, timeout)
    }

    pub fn is_leased_by(&self, worker_id: &str, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.locked_by.as_deref() == Some(worker_id) && self.is_locked(now, timeout)
    }

    /// Due, inside its active window and not held by a live lease.
    pub fn is_candidate(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.next_execute_at.is_some_and(|t| t <= now)
            && self.started_at.is_none_or(|t| t <= now)
            && self.finished_at.is_none_or(|t| t > now)
            && self.lease_expired(now, timeout)
    }

    /// How late the pending run is, zero when not yet due.
    pub fn delay_sec(&self, now: DateTime<Utc>) -> i64 {
        self.next_execute_at
            .map(|t| (now - t).num_seconds().max(0))
            .unwrap_or(0)
    }

    /// Seconds until a live lease expires.
    pub fn time_to_unlock(&self, now: DateTime<Utc>, timeout: Duration) -> Option<i64> {
        self.is_locked(now, timeout)
            .then(|| self.execute_lock + timeout.num_seconds() - now.timestamp())
    }

    pub fn lock(&mut self, worker_id: &str, now: DateTime<Utc>) {
        self.execute_lock = now.timestamp();
        self.locked_by = Some(worker_id.to_string());
    }

    pub fn unlock(&mut self) {
        self.execute_lock = 0;
        self.locked_by = None;
    }

    pub fn record_error(&mut self, failure: &JobFailure, now: DateTime<Utc>) {
        self.last_error_name = Some(failure.name.clone());
        self.last_error_reason = Some(failure.reason.clone());
        self.last_error_time = Some(now);
    }

    pub fn tz(&self) -> JobResult<Tz> {
        parse_timezone(self.timezone.as_deref())
    }

    /// Next run from cron, or `None` for manual records and finished windows.
    pub fn calculate_next_execute_at(&self, now: DateTime<Utc>) -> JobResult<Option<DateTime<Utc>>> {
        let Some(expression) = self.cron.as_deref().filter(|c| !c.trim().is_empty()) else {
            return Ok(None);
        };
        let schedule = CronSchedule::parse(expression)?;
        Ok(schedule.next_execute_at(self.tz()?, now, self.started_at, self.finished_at))
    }
}

/// A persisted row: id, engine columns and the user's own columns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledRecord<T> {
    pub id: i64,
    pub state: ScheduleState,
    /// The user's columns
    pub payload: T,
}

/// A row that has not been inserted yet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewSchedule<T> {
    pub state: ScheduleState,
    pub payload: T,
}

impl<T> NewSchedule<T> {
    pub fn new(payload: T, state: ScheduleState) -> Self {
        Self { state, payload }
    }
}

/// Target of `execute_now`; unsaved records are inserted first.
#[derive(Debug, Clone)]
pub enum ExecuteNow<T> {
    /// Run by id; the record must not be leased by a live worker
    Persisted(ScheduledRecord<T>),
    /// Insert, then run
    Unsaved(NewSchedule<T>),
}

impl<T> From<ScheduledRecord<T>> for ExecuteNow<T> {
    fn from(record: ScheduledRecord<T>) -> Self {
        ExecuteNow::Persisted(record)
    }
}

impl<T> From<NewSchedule<T>> for ExecuteNow<T> {
    fn from(record: NewSchedule<T>) -> Self {
        ExecuteNow::Unsaved(record)
    }
}

// ============================================================================
// Column map
// ============================================================================

/// Logical engine column; the physical name comes from [`ColumnMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Column {
    /// Primary key, always present
    Id,
    Cron,
    Timezone,
    NextExecuteAt,
    StartedAt,
    FinishedAt,
    ExecuteLock,
    LockedBy,
    RetryCount,
    LastErrorName,
    LastErrorReason,
    LastErrorTime,
    LastExecutedAt,
    CurrentCycleId,
}

impl Column {
    pub const ALL: [Column; 14] = [
        Column::Id,
        Column::Cron,
        Column::Timezone,
        Column::NextExecuteAt,
        Column::StartedAt,
        Column::FinishedAt,
        Column::ExecuteLock,
        Column::LockedBy,
        Column::RetryCount,
        Column::LastErrorName,
        Column::LastErrorReason,
        Column::LastErrorTime,
        Column::LastExecutedAt,
        Column::CurrentCycleId,
    ];

    pub fn default_name(&self) -> &'static str {
        match self {
            Column::Id => "id",
            Column::Cron => "cron",
            Column::Timezone => "timezone",
            Column::NextExecuteAt => "next_execute_at",
            Column::StartedAt => "started_at",
            Column::FinishedAt => "finished_at",
            Column::ExecuteLock => "execute_lock",
            Column::LockedBy => "locked_by",
            Column::RetryCount => "retry_count",
            Column::LastErrorName => "last_error_name",
            Column::LastErrorReason => "last_error_reason",
            Column::LastErrorTime => "last_error_time",
            Column::LastExecutedAt => "last_executed_at",
            Column::CurrentCycleId => "current_cycle_id",
        }
    }

    /// Optional columns may be missing from the table and are skipped on writes.
    pub fn is_optional(&self) -> bool {
        matches!(
            self,
            Column::LastErrorName
                | Column::LastErrorReason
                | Column::LastErrorTime
                | Column::LastExecutedAt
                | Column::CurrentCycleId
        )
    }

    fn read(&self, state: &ScheduleState) -> JsonValue {
        fn ts(value: Option<DateTime<Utc>>) -> JsonValue {
            value
                .map(|t| JsonValue::String(t.to_rfc3339()))
                .unwrap_or(JsonValue::Null)
        }
        fn text(value: &Option<String>) -> JsonValue {
            value.clone().map(JsonValue::String).unwrap_or(JsonValue::Null)
        }

        match self {
            Column::Id => JsonValue::Null,
            Column::Cron => text(&state.cron),
            Column::Timezone => text(&state.timezone),
            Column::NextExecuteAt => ts(state.next_execute_at),
            Column::StartedAt => ts(state.started_at),
            Column::FinishedAt => ts(state.finished_at),
            Column::ExecuteLock => JsonValue::from(state.execute_lock),
            Column::LockedBy => text(&state.locked_by),
            Column::RetryCount => JsonValue::from(state.retry_count),
            Column::LastErrorName => text(&state.last_error_name),
            Column::LastErrorReason => text(&state.last_error_reason),
            Column::LastErrorTime => ts(state.last_error_time),
            Column::LastExecutedAt => ts(state.last_executed_at),
            Column::CurrentCycleId => text(&state.current_cycle_id),
        }
    }

    fn write(&self, state: &mut ScheduleState, value: &JsonValue) -> Result<(), String> {
        match self {
            Column::Id => {}
            Column::Cron => state.cron = json_text(value)?,
            Column::Timezone => state.timezone = json_text(value)?,
            Column::NextExecuteAt => state.next_execute_at = json_time(value)?,
            Column::StartedAt => state.started_at = json_time(value)?,
            Column::FinishedAt => state.finished_at = json_time(value)?,
            Column::ExecuteLock => state.execute_lock = json_int(value)?.unwrap_or(0),
            Column::LockedBy => state.locked_by = json_text(value)?,
            Column::RetryCount => {
                state.retry_count = json_int(value)?
                    .map(i32::try_from)
                    .transpose()
                    .map_err(|e| e.to_string())?
                    .unwrap_or(0)
            }
            Column::LastErrorName => state.last_error_name = json_text(value)?,
            Column::LastErrorReason => state.last_error_reason = json_text(value)?,
            Column::LastErrorTime => state.last_error_time = json_time(value)?,
            Column::LastExecutedAt => state.last_executed_at = json_time(value)?,
            Column::CurrentCycleId => state.current_cycle_id = json_text(value)?,
        }
        Ok(())
    }

    fn clear(&self, state: &mut ScheduleState) {
        match self {
            Column::LastErrorName => state.last_error_name = None,
            Column::LastErrorReason => state.last_error_reason = None,
            Column::LastErrorTime => state.last_error_time = None,
            Column::LastExecutedAt => state.last_executed_at = None,
            Column::CurrentCycleId => state.current_cycle_id = None,
            _ => {}
        }
    }
}

fn json_text(value: &JsonValue) -> Result<Option<String>, String> {
    match value {
        JsonValue::Null => Ok(None),
        JsonValue::String(s) => Ok(Some(s.clone())),
        other => Ok(Some(other.to_string())),
    }
}

fn json_int(value: &JsonValue) -> Result<Option<i64>, String> {
    match value {
        JsonValue::Null => Ok(None),
        JsonValue::Number(n) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| format!("{} is not an integer", n)),
        JsonValue::String(s) => s.parse().map(Some).map_err(|_| format!("'{}' is not an integer", s)),
        other => Err(format!("{} is not an integer", other)),
    }
}

// `timestamp without time zone` columns come back without an offset and are read as UTC
fn json_time(value: &JsonValue) -> Result<Option<DateTime<Utc>>, String> {
    match value {
        JsonValue::Null => Ok(None),
        JsonValue::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").map(|t| t.and_utc()))
            .map(Some)
            .map_err(|e| format!("'{}' is not a timestamp: {}", s, e)),
        other => Err(format!("{} is not a timestamp", other)),
    }
}

/// Logical column to physical column mapping for one schedulable type.
///
/// Optional columns map to `None` when the table does not have them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    names: BTreeMap<Column, Option<String>>,
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self {
            names: Column::ALL
                .iter()
                .map(|c| (*c, Some(c.default_name().to_string())))
                .collect(),
        }
    }
}

impl ColumnMap {
    /// Rename a column.
    pub fn with(mut self, column: Column, name: impl Into<String>) -> Self {
        self.names.insert(column, Some(name.into()));
        self
    }

    /// Declare an optional column absent. Required columns are rejected by
    /// [`ColumnMap::validate`].
    pub fn without(mut self, column: Column) -> Self {
        self.names.insert(column, None);
        self
    }

    pub fn physical(&self, column: Column) -> Option<&str> {
        self.names.get(&column).and_then(|n| n.as_deref())
    }

    pub fn is_present(&self, column: Column) -> bool {
        self.physical(column).is_some()
    }

    /// Present columns, in [`Column::ALL`] order.
    pub fn present(&self) -> impl Iterator<Item = (Column, &str)> + '_ {
        self.names
            .iter()
            .filter_map(|(c, n)| n.as_deref().map(|n| (*c, n)))
    }

    pub fn validate(&self, table_name: &str) -> Result<(), AppError> {
        if !is_identifier(table_name) {
            return Err(AppError::validation(
                "table_name",
                format!("'{}' is not a valid SQL identifier", table_name),
            ));
        }

        let mut seen = HashSet::new();
        for column in Column::ALL {
            match self.physical(column) {
                None if !column.is_optional() => {
                    return Err(AppError::validation(
                        column.default_name(),
                        format!("required column of {} cannot be removed", table_name),
                    ));
                }
                None => {}
                Some(name) if !is_identifier(name) => {
                    return Err(AppError::validation(
                        column.default_name(),
                        format!("'{}' is not a valid SQL identifier", name),
                    ));
                }
                Some(name) if !seen.insert(name) => {
                    return Err(AppError::validation(
                        column.default_name(),
                        format!("'{}' is mapped more than once in {}", name, table_name),
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Drop optional columns the table does not have; fail on missing required ones.
    pub fn retain_present(
        mut self,
        table_name: &str,
        existing: &HashSet<String>,
    ) -> Result<Self, AppError> {
        for column in Column::ALL {
            let Some(name) = self.physical(column) else {
                continue;
            };
            if existing.contains(name) {
                continue;
            }
            if column.is_optional() {
                self.names.insert(column, None);
            } else {
                return Err(AppError::validation(
                    column.default_name(),
                    format!("column '{}' does not exist in {}", name, table_name),
                ));
            }
        }
        Ok(self)
    }

    /// Forget values of optional columns the table cannot store.
    pub fn mask(&self, state: &mut ScheduleState) {
        for column in Column::ALL {
            if column.is_optional() && !self.is_present(column) {
                column.clear(state);
            }
        }
    }

    /// Engine columns of `state` keyed by physical name; the id is never included.
    pub fn state_to_row(&self, state: &ScheduleState) -> Map<String, JsonValue> {
        self.present()
            .filter(|(c, _)| *c != Column::Id)
            .map(|(c, name)| (name.to_string(), c.read(state)))
            .collect()
    }

    /// Read id and engine columns from a row rendered as a JSON object.
    pub fn state_from_row(&self, row: &Map<String, JsonValue>) -> Result<(i64, ScheduleState), AppError> {
        let id_name = self.physical(Column::Id).unwrap_or("id");
        let id = row
            .get(id_name)
            .map(json_int)
            .transpose()
            .map_err(|e| AppError::validation(id_name, e))?
            .flatten()
            .ok_or_else(|| AppError::validation(id_name, "row has no id"))?;

        let mut state = ScheduleState::default();
        for (column, name) in self.present() {
            if let Some(value) = row.get(name) {
                column
                    .write(&mut state, value)
                    .map_err(|e| AppError::validation(name, e))?;
            }
        }
        Ok((id, state))
    }
}

// ============================================================================
// Options
// ============================================================================

/// Extra candidacy filter applied on top of the standard predicate.
pub enum ExecutableCondition<T> {
    /// SQL boolean expression over the table's columns (Postgres backend)
    Sql(String),
    /// Evaluated on the locked row before the lease is written
    Predicate(Arc<dyn Fn(&ScheduledRecord<T>) -> bool + Send + Sync>),
}

impl<T> Clone for ExecutableCondition<T> {
    fn clone(&self) -> Self {
        match self {
            ExecutableCondition::Sql(sql) => ExecutableCondition::Sql(sql.clone()),
            ExecutableCondition::Predicate(f) => ExecutableCondition::Predicate(Arc::clone(f)),
        }
    }
}

impl<T> std::fmt::Debug for ExecutableCondition<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutableCondition::Sql(sql) => f.debug_tuple("Sql").field(sql).finish(),
            ExecutableCondition::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Per-type configuration, built once at registration.
pub struct ScheduleOptions<T> {
    pub table_name: String,
    pub columns: ColumnMap,
    /// Retries before a failure is given up on and the handlers run
    pub retry_limit: i32,
    pub retry_interval: StdDuration,
    /// Grow the retry delay with the retry count
    pub exponential_backoff: bool,
    /// How long a lease lives before another worker may take the row
    pub execute_lock_timeout: StdDuration,
    /// Write an execution record for every run
    pub track_execution: bool,
    /// Run when retries are exhausted, before the global handlers
    pub error_handlers: Vec<RecordErrorHandler<T>>,
    pub executable_conditions: Vec<ExecutableCondition<T>>,
}

impl<T> Clone for ScheduleOptions<T> {
    fn clone(&self) -> Self {
        Self {
            table_name: self.table_name.clone(),
            columns: self.columns.clone(),
            retry_limit: self.retry_limit,
            retry_interval: self.retry_interval,
            exponential_backoff: self.exponential_backoff,
            execute_lock_timeout: self.execute_lock_timeout,
            track_execution: self.track_execution,
            error_handlers: self.error_handlers.clone(),
            executable_conditions: self.executable_conditions.clone(),
        }
    }
}

impl<T> std::fmt::Debug for ScheduleOptions<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleOptions")
            .field("table_name", &self.table_name)
            .field("columns", &self.columns)
            .field("retry_limit", &self.retry_limit)
            .field("retry_interval", &self.retry_interval)
            .field("exponential_backoff", &self.exponential_backoff)
            .field("execute_lock_timeout", &self.execute_lock_timeout)
            .field("track_execution", &self.track_execution)
            .field("error_handlers", &self.error_handlers.len())
            .field("executable_conditions", &self.executable_conditions)
            .finish()
    }
}

impl<T> ScheduleOptions<T> {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            columns: ColumnMap::default(),
            retry_limit: DEFAULT_RETRY_LIMIT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            exponential_backoff: false,
            execute_lock_timeout: DEFAULT_EXECUTE_LOCK_TIMEOUT,
            track_execution: false,
            error_handlers: Vec::new(),
            executable_conditions: Vec::new(),
        }
    }

    pub fn retry_limit(mut self, limit: i32) -> Self {
        self.retry_limit = limit;
        self
    }

    pub fn retry_interval(mut self, interval: StdDuration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn exponential_backoff(mut self, enabled: bool) -> Self {
        self.exponential_backoff = enabled;
        self
    }

    pub fn execute_lock_timeout(mut self, timeout: StdDuration) -> Self {
        self.execute_lock_timeout = timeout;
        self
    }

    pub fn track_execution(mut self, enabled: bool) -> Self {
        self.track_execution = enabled;
        self
    }

    pub fn column(mut self, column: Column, name: impl Into<String>) -> Self {
        self.columns = self.columns.with(column, name);
        self
    }

    pub fn without_column(mut self, column: Column) -> Self {
        self.columns = self.columns.without(column);
        self
    }

    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&JobFailure, &ScheduledRecord<T>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.error_handlers.push(Arc::new(handler));
        self
    }

    pub fn executable_if_sql(mut self, condition: impl Into<String>) -> Self {
        self.executable_conditions
            .push(ExecutableCondition::Sql(condition.into()));
        self
    }

    pub fn executable_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ScheduledRecord<T>) -> bool + Send + Sync + 'static,
    {
        self.executable_conditions
            .push(ExecutableCondition::Predicate(Arc::new(predicate)));
        self
    }

    pub fn lock_timeout(&self) -> Duration {
        seconds(self.execute_lock_timeout)
    }

    /// Delay before a failed record becomes a candidate again, from the
    /// retry count before this failure is counted.
    pub fn backoff(&self, retry_count: i32) -> Duration {
        let interval = seconds(self.retry_interval);
        if self.exponential_backoff {
            interval * (2 * (retry_count - 1)).max(1)
        } else {
            interval
        }
    }

    /// Predicates evaluated in process after the row lock is taken.
    pub fn passes_predicates(&self, record: &ScheduledRecord<T>) -> bool {
        self.executable_conditions.iter().all(|c| match c {
            ExecutableCondition::Sql(_) => true,
            ExecutableCondition::Predicate(f) => f(record),
        })
    }

    pub fn sql_conditions(&self) -> impl Iterator<Item = &str> + '_ {
        self.executable_conditions.iter().filter_map(|c| match c {
            ExecutableCondition::Sql(sql) => Some(sql.as_str()),
            ExecutableCondition::Predicate(_) => None,
        })
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.retry_limit < 0 {
            return Err(AppError::validation("retry_limit", "must not be negative"));
        }
        if self.execute_lock_timeout.as_secs() == 0 {
            return Err(AppError::validation(
                "execute_lock_timeout",
                "must be at least one second",
            ));
        }
        self.columns.validate(&self.table_name)
    }
}

/// Whole seconds of `duration`, saturating at the largest span chrono holds.
pub(crate) fn seconds(duration: StdDuration) -> Duration {
    const MAX_SECS: i64 = i64::MAX / 1000;
    let secs = i64::try_from(duration.as_secs()).unwrap_or(MAX_SECS);
    Duration::seconds(secs.min(MAX_SECS))
}

/// A user type whose rows are cron-scheduled and executed by workers.
///
/// The payload is the row minus the engine columns; it is read from and
/// written to the table through serde, so field names are column names.
#[async_trait]
pub trait Schedulable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Name used in execution records, worker heartbeats and signals.
    const TYPE_NAME: &'static str;

    fn options() -> ScheduleOptions<Self>;

    async fn execute(&self, ctx: &ExecutionContext) -> Result<Outcome, JobFailure>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2017, 6, 18, h, m, s).unwrap()
    }

    #[test]
    fn test_lease_expiry_boundary() {
        let timeout = Duration::seconds(600);
        let now = at(1, 0, 0);
        let mut state = ScheduleState::default();
        assert!(state.lease_expired(now, timeout));

        state.execute_lock = now.timestamp() - 600;
        assert!(!state.lease_expired(now, timeout));
        state.execute_lock = now.timestamp() - 601;
        assert!(state.lease_expired(now, timeout));
    }

    #[test]
    fn test_candidate_respects_window() {
        let timeout = Duration::seconds(600);
        let now = at(1, 10, 0);
        let mut state = ScheduleState::with_cron("*/10 * * * *");
        state.next_execute_at = Some(at(1, 10, 0));
        assert!(state.is_candidate(now, timeout));

        state.finished_at = Some(at(1, 10, 0));
        assert!(!state.is_candidate(now, timeout));

        state.finished_at = None;
        state.started_at = Some(at(1, 10, 1));
        assert!(!state.is_candidate(now, timeout));

        state.started_at = None;
        state.lock("w1", at(1, 5, 0));
        assert!(!state.is_candidate(now, timeout));
        assert!(state.is_leased_by("w1", now, timeout));
        assert!(!state.is_leased_by("w2", now, timeout));
        assert_eq!(state.time_to_unlock(now, timeout), Some(300));
    }

    #[test]
    fn test_manual_record_has_no_next_run() {
        let state = ScheduleState::default();
        assert_eq!(state.calculate_next_execute_at(at(1, 0, 0)).unwrap(), None);
    }

    #[test]
    fn test_column_map_rejects_bad_identifiers() {
        let map = ColumnMap::default().with(Column::Cron, "cron; drop table x");
        assert!(map.validate("jobs").is_err());
        assert!(ColumnMap::default().validate("bad-name").is_err());
        assert!(ColumnMap::default().without(Column::ExecuteLock).validate("jobs").is_err());
        assert!(
            ColumnMap::default()
                .with(Column::Cron, "timezone")
                .validate("jobs")
                .is_err()
        );
        assert!(ColumnMap::default().without(Column::CurrentCycleId).validate("jobs").is_ok());
    }

    #[test]
    fn test_retain_present_drops_optional_columns() {
        let existing: HashSet<String> = Column::ALL
            .iter()
            .filter(|c| !c.is_optional())
            .map(|c| c.default_name().to_string())
            .chain(["last_error_name".to_string()])
            .collect();
        let map = ColumnMap::default().retain_present("jobs", &existing).unwrap();
        assert!(map.is_present(Column::LastErrorName));
        assert!(!map.is_present(Column::LastExecutedAt));

        let mut state = ScheduleState {
            last_executed_at: Some(at(1, 0, 0)),
            last_error_name: Some("Boom".to_string()),
            ..ScheduleState::default()
        };
        map.mask(&mut state);
        assert_eq!(state.last_executed_at, None);
        assert_eq!(state.last_error_name.as_deref(), Some("Boom"));

        let mut missing = existing.clone();
        missing.remove("locked_by");
        assert!(ColumnMap::default().retain_present("jobs", &missing).is_err());
    }

    #[test]
    fn test_row_conversion_uses_physical_names() {
        let map = ColumnMap::default().with(Column::NextExecuteAt, "run_at");
        let state = ScheduleState {
            cron: Some("0 * * * *".to_string()),
            next_execute_at: Some(at(2, 0, 0)),
            execute_lock: 42,
            retry_count: 3,
            ..ScheduleState::default()
        };
        let mut row = map.state_to_row(&state);
        assert!(row.contains_key("run_at"));
        assert!(!row.contains_key("next_execute_at"));
        assert!(!row.contains_key("id"));

        row.insert("id".to_string(), JsonValue::from(7));
        // Postgres renders timestamptz with an explicit offset
        row.insert(
            "started_at".to_string(),
            JsonValue::from("2017-06-18T10:00:00+09:00"),
        );
        let (id, decoded) = map.state_from_row(&row).unwrap();
        assert_eq!(id, 7);
        assert_eq!(decoded.next_execute_at, Some(at(2, 0, 0)));
        assert_eq!(decoded.started_at, Some(at(1, 0, 0)));
        assert_eq!(decoded.retry_count, 3);
    }

    #[test]
    fn test_backoff() {
        let options = ScheduleOptions::<()>::new("jobs");
        assert_eq!(options.backoff(0), Duration::seconds(4));
        assert_eq!(options.backoff(5), Duration::seconds(4));

        let options = options.exponential_backoff(true);
        assert_eq!(options.backoff(0), Duration::seconds(4));
        assert_eq!(options.backoff(1), Duration::seconds(4));
        assert_eq!(options.backoff(2), Duration::seconds(8));
        assert_eq!(options.backoff(4), Duration::seconds(24));
    }

    #[test]
    fn test_huge_durations_saturate() {
        let cap = Duration::seconds(i64::MAX / 1000);
        assert_eq!(seconds(StdDuration::from_secs(i64::MAX as u64 / 1000 + 1)), cap);
        assert_eq!(seconds(StdDuration::from_secs(i64::MAX as u64)), cap);
        assert_eq!(seconds(StdDuration::MAX), cap);

        let options = ScheduleOptions::<()>::new("jobs")
            .execute_lock_timeout(StdDuration::from_secs(u64::MAX / 2));
        assert_eq!(options.lock_timeout(), cap);
    }

    proptest! {
        #[test]
        fn prop_exponential_backoff_never_below_interval(count in 0i32..1000, interval in 1u64..3600) {
            let options = ScheduleOptions::<()>::new("jobs")
                .retry_interval(StdDuration::from_secs(interval))
                .exponential_backoff(true);
            prop_assert!(options.backoff(count) >= Duration::seconds(interval as i64));
        }

        #[test]
        fn prop_locked_and_expired_are_complementary(lock in 0i64..10_000, age in -100i64..2000) {
            let now = Utc.timestamp_opt(1_000_000 + lock, 0).unwrap() + Duration::seconds(age);
            let state = ScheduleState { execute_lock: if lock == 0 { 0 } else { 1_000_000 + lock }, ..ScheduleState::default() };
            let timeout = Duration::seconds(600);
            prop_assert_ne!(state.is_locked(now, timeout), state.lease_expired(now, timeout));
        }
    }
}
