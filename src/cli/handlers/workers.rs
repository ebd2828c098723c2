//! Workers command handler
//!
//! Lists the workers whose heartbeat is recent enough to count as alive.

use chrono::{DateTime, Utc};

use crate::config::settings::Settings;
use crate::db::establish_async_connection_pool;
use crate::error::AppResult;
use crate::models::WorkerRecord;
use crate::repositories::{FleetRepository, PgFleetRepository};

pub struct WorkersCommandHandler {
    config: Settings,
}

impl WorkersCommandHandler {
    pub fn new(config: Settings) -> Self {
        Self { config }
    }

    pub async fn execute(&self) -> AppResult<()> {
        let pool = establish_async_connection_pool(&self.config.database).await?;
        let fleet = PgFleetRepository::new(pool);

        for line in self.report(&fleet, Utc::now()).await? {
            println!("{}", line);
        }
        Ok(())
    }

    /// Table lines for every worker alive at `now`.
    async fn report(&self, fleet: &dyn FleetRepository, now: DateTime<Utc>) -> AppResult<Vec<String>> {
        let threshold = chrono::Duration::seconds(
            i64::try_from(self.config.worker.heartbeat_interval.saturating_mul(5)).unwrap_or(i64::MAX),
        );
        let since = now.checked_sub_signed(threshold).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let workers = fleet.alive_workers(since).await?;

        if workers.is_empty() {
            return Ok(vec!["No live workers".to_string()]);
        }

        let mut lines = Vec::with_capacity(workers.len() + 1);
        lines.push(format!(
            "{:<24} {:<13} {:>8} {:>8} {:>6} {:<20} MODELS",
            "WORKER", "STATUS", "THREADS", "RUNNING", "QUEUE", "HEARTBEAT"
        ));
        lines.extend(workers.iter().map(format_worker));
        Ok(lines)
    }
}

fn format_worker(worker: &WorkerRecord) -> String {
    format!(
        "{:<24} {:<13} {:>8} {:>8} {:>6} {:<20} {}",
        worker.worker_id,
        worker.executor_status,
        worker.max_thread_size,
        worker.current_executing_size,
        worker.current_queue_size,
        worker.last_heartbeated_at.format("%Y-%m-%d %H:%M:%S"),
        worker.model_names().join(",")
    )
}
