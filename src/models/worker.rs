//! Worker heartbeat rows.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::schema::cronlease_workers;

/// Dispatcher state as published in the heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, DbEnum)]
#[db_enum(existing_type_path = "crate::schema::sql_types::ExecutorStatus")]
#[serde(rename_all = "lowercase")]
pub enum ExecutorStatus {
    Running,
    /// Pollers paused by TSTP; in-flight work continues
    Quiet,
    /// Draining in-flight work
    Shuttingdown,
    Shutdown,
}

impl std::fmt::Display for ExecutorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            ExecutorStatus::Running => "running",
            ExecutorStatus::Quiet => "quiet",
            ExecutorStatus::Shuttingdown => "shuttingdown",
            ExecutorStatus::Shutdown => "shutdown",
        })
    }
}

/// One row per live worker process, upserted on every heartbeat.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, AsChangeset, Serialize)]
#[diesel(table_name = cronlease_workers)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct WorkerRecord {
    pub worker_id: String,
    pub max_thread_size: i32,
    /// Units running on the dispatcher at heartbeat time
    pub current_executing_size: i32,
    /// Units waiting for a dispatcher task
    pub current_queue_size: i32,
    pub executor_status: ExecutorStatus,
    /// JSON array of polled type names
    pub polling_model_names: JsonValue,
    pub last_heartbeated_at: DateTime<Utc>,
}

impl WorkerRecord {
    /// Sorted, de-duplicated type names; two workers are peers iff these match.
    pub fn model_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .polling_model_names
            .as_array()
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names.dedup();
        names
    }

    pub fn encode_model_names(names: &[String]) -> JsonValue {
        let mut sorted = names.to_vec();
        sorted.sort();
        sorted.dedup();
        JsonValue::from(sorted)
    }

    /// Alive iff the last heartbeat is not older than `since` (inclusive).
    pub fn is_alive(&self, since: DateTime<Utc>) -> bool {
        self.last_heartbeated_at >= since
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn record(at: DateTime<Utc>, names: &[&str]) -> WorkerRecord {
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        WorkerRecord {
            worker_id: "w1".to_string(),
            max_thread_size: 25,
            current_executing_size: 0,
            current_queue_size: 0,
            executor_status: ExecutorStatus::Running,
            polling_model_names: WorkerRecord::encode_model_names(&names),
            last_heartbeated_at: at,
        }
    }

    #[test]
    fn test_model_names_are_sorted() {
        let at = Utc.with_ymd_and_hms(2017, 6, 18, 1, 0, 0).unwrap();
        let r = record(at, &["Report", "Notification", "Report"]);
        assert_eq!(r.model_names(), vec!["Notification", "Report"]);
    }

    proptest! {
        #[test]
        fn prop_liveness_window_is_inclusive(interval in 1i64..3600, offset in -10i64..10) {
            let now = Utc.with_ymd_and_hms(2017, 6, 18, 1, 0, 0).unwrap();
            let since = now - Duration::seconds(5 * interval);
            let beat = since + Duration::seconds(offset);
            let r = record(beat, &["Notification"]);
            prop_assert_eq!(r.is_alive(since), offset >= 0);
        }
    }
}
