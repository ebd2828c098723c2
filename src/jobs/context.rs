use std::sync::Arc;

use crate::jobs::clock::{Clock, SystemClock};
use crate::jobs::handlers::ErrorHandlers;
use crate::repositories::ExecutionRepository;

/// Process-wide collaborators shared by every executor of one worker.
#[derive(Clone)]
pub struct EngineContext {
    /// Written to `locked_by` on every lease this worker takes
    pub worker_id: String,
    pub clock: Arc<dyn Clock>,
    /// Global handlers, run after the per-type ones
    pub handlers: Arc<ErrorHandlers>,
    pub executions: Arc<dyn ExecutionRepository>,
}

impl EngineContext {
    pub fn new(worker_id: impl Into<String>, executions: Arc<dyn ExecutionRepository>) -> Self {
        Self {
            worker_id: worker_id.into(),
            clock: Arc::new(SystemClock),
            handlers: Arc::new(ErrorHandlers::new()),
            executions,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_handlers(mut self, handlers: ErrorHandlers) -> Self {
        self.handlers = Arc::new(handlers);
        self
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("worker_id", &self.worker_id)
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}
