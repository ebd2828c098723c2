//! Repository layer for schedulable tables and the shared system tables.
//!
//! Each concern has a trait in [`traits`], a Postgres implementation on the
//! shared bb8 pool, and an in-memory implementation in [`memory`].

mod execution_repo;
mod fleet_repo;
pub mod memory;
mod schedule_repo;
mod traits;

pub use execution_repo::PgExecutionRepository;
pub use fleet_repo::PgFleetRepository;
pub use memory::{MemoryExecutionRepository, MemoryFleetRepository, MemoryScheduleRepository};
pub use schedule_repo::PgScheduleRepository;
pub use traits::{
    ExecutionRepository, FleetRepository, ScheduleRepository, ScheduleStats, UnlockFilter,
};

use std::sync::Arc;

use crate::db::AsyncDbPool;

/// The system-table repositories a worker needs, cheap to clone.
#[derive(Clone)]
pub struct Repositories {
    pub executions: Arc<dyn ExecutionRepository>,
    pub fleet: Arc<dyn FleetRepository>,
}

impl Repositories {
    /// Postgres-backed repositories sharing one pool.
    pub fn new(pool: AsyncDbPool) -> Self {
        Self {
            executions: Arc::new(PgExecutionRepository::new(pool.clone())),
            fleet: Arc::new(PgFleetRepository::new(pool)),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            executions: Arc::new(MemoryExecutionRepository::new()),
            fleet: Arc::new(MemoryFleetRepository::new()),
        }
    }
}
