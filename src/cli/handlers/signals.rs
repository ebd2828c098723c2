//! Signal command handlers
//!
//! Writes signals into the shared signal table for a worker to pick up on
//! its next signal fetch, and lists what was recently sent.

use chrono::{DateTime, Utc};

use crate::config::settings::Settings;
use crate::db::establish_async_connection_pool;
use crate::error::AppResult;
use crate::models::{NewSignal, SignalKind, SignalRecord};
use crate::repositories::{FleetRepository, PgFleetRepository};

/// Handler for the `signal` and `signals` commands
pub struct SignalCommandHandler {
    config: Settings,
}

impl SignalCommandHandler {
    pub fn new(config: Settings) -> Self {
        Self { config }
    }

    /// Queue `signal` for `worker_id`
    ///
    /// The worker applies it within one signal fetch interval. Signals older
    /// than five minutes are ignored by the worker.
    pub async fn send(&self, worker_id: &str, signal: SignalKind) -> AppResult<()> {
        let fleet = self.fleet().await?;
        let record = send_signal(&fleet, worker_id, signal, Utc::now()).await?;

        println!(
            "✓ Sent {} to {} (signal id {})",
            record.signal, record.worker_id, record.id
        );
        if !self.is_alive(&fleet, worker_id).await? {
            println!("Warning: no live heartbeat from {}; the signal may never be received", worker_id);
        }
        Ok(())
    }

    /// Print the most recently sent signals, newest first
    pub async fn list(&self, limit: i64) -> AppResult<()> {
        let fleet = self.fleet().await?;
        let signals = fleet.recent_signals(limit).await?;

        if signals.is_empty() {
            println!("No signals sent");
            return Ok(());
        }

        println!("{:>8} {:<24} {:<6} {:<20} RECEIVED", "ID", "WORKER", "SIGNAL", "SENT");
        for signal in &signals {
            println!("{}", format_signal(signal));
        }
        Ok(())
    }

    async fn fleet(&self) -> AppResult<PgFleetRepository> {
        let pool = establish_async_connection_pool(&self.config.database).await?;
        Ok(PgFleetRepository::new(pool))
    }

    async fn is_alive(&self, fleet: &dyn FleetRepository, worker_id: &str) -> AppResult<bool> {
        let threshold = chrono::Duration::seconds(
            i64::try_from(self.config.worker.heartbeat_interval.saturating_mul(5)).unwrap_or(i64::MAX),
        );
        let since = Utc::now()
            .checked_sub_signed(threshold)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let alive = fleet.alive_workers(since).await?;
        Ok(alive.iter().any(|w| w.worker_id == worker_id))
    }
}

async fn send_signal(
    fleet: &dyn FleetRepository,
    worker_id: &str,
    signal: SignalKind,
    now: DateTime<Utc>,
) -> AppResult<SignalRecord> {
    let record = fleet
        .send_signal(NewSignal {
            worker_id: worker_id.to_string(),
            signal,
            sent_at: now,
        })
        .await?;
    tracing::info!(worker_id, %signal, signal_id = record.id, "Signal sent");
    Ok(record)
}

fn format_signal(signal: &SignalRecord) -> String {
    let received = signal
        .received_at
        .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "pending".to_string());
    format!(
        "{:>8} {:<24} {:<6} {:<20} {}",
        signal.id,
        signal.worker_id,
        signal.signal,
        signal.sent_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        received
    )
}
