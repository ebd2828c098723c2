//! Rows of the shared system tables.

mod execution;
mod signal;
mod worker;

pub use execution::{ExecutionRecord, ExecutionStatus, FinishExecution, NewExecution};
pub use signal::{NewSignal, SignalKind, SignalRecord};
pub use worker::{ExecutorStatus, WorkerRecord};
