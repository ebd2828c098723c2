//! Scheduling engine: schedulable records, leasing and the execution state
//! machine.

pub mod clock;
mod context;
pub mod cron;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod lease;
pub mod registry;
pub mod schedulable;
pub mod tracker;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::EngineContext;
pub use cron::{CronSchedule, parse_timezone};
pub use error::{JobError, JobResult};
pub use executor::JobExecutor;
pub use handlers::{ErrorHandlers, GlobalErrorHandler, RecordErrorHandler, RecordRef};
pub use lease::{LeaseBatch, lease_batch};
pub use registry::{JobRegistry, LeasedBatch, PollSource, WorkUnit};
pub use schedulable::{
    Column, ColumnMap, ExecutableCondition, ExecuteNow, NewSchedule, Schedulable, ScheduleOptions,
    ScheduleState, ScheduledRecord,
};
pub use tracker::ExecutionTracker;
pub use types::{ABORT_ERROR_NAME, ExecutionContext, ExecutionOutcome, JobFailure, Outcome};
