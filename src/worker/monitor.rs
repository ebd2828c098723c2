//! Per-type gauges and fleet membership helpers.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::WorkerRecord;
use crate::repositories::ScheduleStats;

/// Gauges for one schedulable type, published by the fleet leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorEvent {
    pub model_name: String,
    /// Rows that are due and not leased
    pub executable_count: i64,
    /// Age of the oldest lease still held
    pub max_lock_duration_sec: i64,
    /// How far the most overdue candidate is behind its schedule
    pub max_latency_sec: i64,
}

impl MonitorEvent {
    pub fn from_stats(model_name: &str, stats: &ScheduleStats, now: DateTime<Utc>) -> Self {
        let max_lock_duration_sec = stats
            .oldest_lock
            .map_or(0, |lock| now.timestamp() - lock)
            .max(0);
        let max_latency_sec = stats
            .oldest_due
            .map_or(0, |due| (now - due).num_seconds())
            .max(0);

        Self {
            model_name: model_name.to_string(),
            executable_count: stats.executable_count,
            max_lock_duration_sec,
            max_latency_sec,
        }
    }
}

/// Alive workers polling exactly the same sorted set of types.
pub fn peers<'a>(alive: &'a [WorkerRecord], model_names: &[String]) -> Vec<&'a WorkerRecord> {
    let mut wanted = model_names.to_vec();
    wanted.sort();
    wanted.dedup();

    alive
        .iter()
        .filter(|w| w.model_names() == wanted)
        .collect()
}

/// Number of peers sharing this worker's type set, never below 1.
pub fn fleet_size(alive: &[WorkerRecord], model_names: &[String]) -> usize {
    peers(alive, model_names).len().max(1)
}

/// The peer with the lowest worker id reports for the fleet.
pub fn is_fleet_leader(worker_id: &str, alive: &[WorkerRecord], model_names: &[String]) -> bool {
    peers(alive, model_names)
        .iter()
        .map(|w| w.worker_id.as_str())
        .chain(std::iter::once(worker_id))
        .min()
        == Some(worker_id)
}
