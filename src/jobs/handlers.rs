//! Error handler chains.
//!
//! Handlers run after a record gives up and, for global handlers, after any
//! failure that escapes a poll cycle or a heartbeat. A handler that errors
//! or panics is logged and the chain continues.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::jobs::schedulable::ScheduledRecord;
use crate::jobs::types::JobFailure;

pub type RecordErrorHandler<T> =
    Arc<dyn Fn(&JobFailure, &ScheduledRecord<T>) -> anyhow::Result<()> + Send + Sync>;

pub type GlobalErrorHandler =
    Arc<dyn Fn(&JobFailure, Option<&RecordRef>) -> anyhow::Result<()> + Send + Sync>;

/// Type-erased pointer to the record a failure belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRef {
    /// Schedulable type name
    pub type_name: String,
    pub id: i64,
}

impl RecordRef {
    pub fn new(type_name: impl Into<String>, id: i64) -> Self {
        Self {
            type_name: type_name.into(),
            id,
        }
    }
}

#[derive(Clone, Default)]
pub struct ErrorHandlers {
    global: Vec<GlobalErrorHandler>,
}

impl std::fmt::Debug for ErrorHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorHandlers")
            .field("global", &self.global.len())
            .finish()
    }
}

impl ErrorHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&JobFailure, Option<&RecordRef>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.global.push(Arc::new(handler));
        self
    }

    pub fn len(&self) -> usize {
        self.global.len()
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_empty()
    }

    pub fn invoke(&self, failure: &JobFailure, record: Option<&RecordRef>) {
        for (index, handler) in self.global.iter().enumerate() {
            guarded(index, || handler(failure, record));
        }
    }

    /// Per-type handlers first, then the global chain.
    pub fn invoke_for_record<T>(
        &self,
        record_handlers: &[RecordErrorHandler<T>],
        failure: &JobFailure,
        type_name: &str,
        record: &ScheduledRecord<T>,
    ) {
        for (index, handler) in record_handlers.iter().enumerate() {
            guarded(index, || handler(failure, record));
        }
        self.invoke(failure, Some(&RecordRef::new(type_name, record.id)));
    }
}

fn guarded(index: usize, call: impl FnOnce() -> anyhow::Result<()>) {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!(handler = index, error = %format!("{:#}", e), "Error handler failed");
        }
        Err(payload) => {
            let failure = JobFailure::from_panic(payload);
            tracing::error!(handler = index, error = %failure, "Error handler panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::schedulable::ScheduleState;
    use std::sync::Mutex;

    #[test]
    fn test_chain_survives_failing_handlers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handlers = ErrorHandlers::new()
            .with_handler(|_, _| anyhow::bail!("handler bug"))
            .with_handler(|_, _| panic!("handler panic"))
            .with_handler(move |failure, record| {
                sink.lock()
                    .unwrap()
                    .push((failure.name.clone(), record.map(|r| r.id)));
                Ok(())
            });

        handlers.invoke(&JobFailure::new("Boom", "x"), Some(&RecordRef::new("Report", 3)));
        assert_eq!(*seen.lock().unwrap(), vec![("Boom".to_string(), Some(3))]);
    }

    #[test]
    fn test_record_handlers_run_before_global() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (order.clone(), order.clone());
        let record_handlers: Vec<RecordErrorHandler<String>> = vec![Arc::new(move |_, r| {
            a.lock().unwrap().push(format!("record:{}", r.payload));
            Ok(())
        })];
        let handlers = ErrorHandlers::new().with_handler(move |_, r| {
            b.lock().unwrap().push(format!("global:{}", r.map(|r| r.type_name.as_str()).unwrap_or("-")));
            Ok(())
        });
        let record = ScheduledRecord {
            id: 1,
            state: ScheduleState::default(),
            payload: "nightly".to_string(),
        };

        handlers.invoke_for_record(&record_handlers, &JobFailure::new("E", "r"), "Report", &record);
        assert_eq!(*order.lock().unwrap(), vec!["record:nightly", "global:Report"]);
    }
}
