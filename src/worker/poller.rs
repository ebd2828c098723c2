use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::jobs::{ErrorHandlers, PollSource, RecordRef, WorkUnit};
use crate::worker::dispatcher::{Dispatcher, Submission};

/// Leases due records of one type and hands them to the dispatcher.
pub struct Poller {
    source: Arc<dyn PollSource>,
    dispatcher: Arc<Dispatcher>,
    handlers: Arc<ErrorHandlers>,
    polling_interval: Duration,
    fetch_records: usize,
    fleet_size: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    quiet: AtomicBool,
}

impl Poller {
    pub fn new(
        source: Arc<dyn PollSource>,
        dispatcher: Arc<Dispatcher>,
        handlers: Arc<ErrorHandlers>,
        polling_interval: Duration,
        fetch_records: usize,
        fleet_size: Arc<AtomicUsize>,
        in_flight: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            source,
            dispatcher,
            handlers,
            polling_interval,
            fetch_records,
            fleet_size,
            in_flight,
            quiet: AtomicBool::new(false),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.source.type_name()
    }

    pub fn source(&self) -> &Arc<dyn PollSource> {
        &self.source
    }

    pub fn quiet(&self) {
        if !self.quiet.swap(true, Ordering::SeqCst) {
            tracing::info!(model = self.type_name(), "Poller is quiet");
        }
    }

    pub fn resume(&self) {
        if self.quiet.swap(false, Ordering::SeqCst) {
            tracing::info!(model = self.type_name(), "Poller resumed");
        }
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet.load(Ordering::SeqCst)
    }

    /// Poll every `polling_interval` until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            model = self.type_name(),
            interval_secs = self.polling_interval.as_secs_f64(),
            fetch_records = self.fetch_records,
            "Poller started"
        );

        let mut ticker = tokio::time::interval(self.polling_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.is_quiet() {
                continue;
            }
            self.poll_once(&cancel).await;
        }

        tracing::info!(model = self.type_name(), "Poller stopped");
    }

    /// Lease and dispatch until the table looks drained. Returns how many
    /// units were handed to the dispatcher.
    pub async fn poll_once(&self, cancel: &CancellationToken) -> usize {
        let mut dispatched = 0;

        while !cancel.is_cancelled() && !self.is_quiet() {
            let worker_count = self.fleet_size.load(Ordering::SeqCst).max(1);
            let batch = match self.source.lease(self.fetch_records, worker_count).await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(model = self.type_name(), error = %e, "Failed to lease records");
                    self.handlers.invoke(&e.to_failure(), None);
                    break;
                }
            };

            if batch.units.is_empty() {
                break;
            }
            dispatched += self.dispatch(batch.units).await;
            if !batch.maybe_more {
                break;
            }
            tokio::task::yield_now().await;
        }

        dispatched
    }

    async fn dispatch(&self, units: Vec<WorkUnit>) -> usize {
        let mut dispatched = 0;
        let mut rejected = Vec::new();

        for unit in units {
            match self.dispatcher.submit(self.track(unit)).await {
                Submission::Queued | Submission::RanInline => dispatched += 1,
                Submission::Rejected(unit) => rejected.push(unit.id),
            }
        }

        if !rejected.is_empty() {
            self.release(rejected).await;
        }
        dispatched
    }

    async fn release(&self, ids: Vec<i64>) {
        let count = ids.len();
        match self.source.release(ids).await {
            Ok(released) => tracing::info!(
                model = self.type_name(),
                rejected = count,
                released,
                "Released leases the dispatcher refused"
            ),
            Err(e) => tracing::error!(
                model = self.type_name(),
                rejected = count,
                error = %e,
                "Failed to release refused leases"
            ),
        }
    }

    /// Count the unit as in flight until it finishes or is dropped, and
    /// report its failure.
    fn track(&self, unit: WorkUnit) -> WorkUnit {
        let WorkUnit { type_name, id, run } = unit;
        let guard = InFlightGuard::new(Arc::clone(&self.in_flight));
        let handlers = Arc::clone(&self.handlers);

        let run = async move {
            let _guard = guard;
            let result = run.await;
            if let Err(e) = &result {
                tracing::error!(model = type_name, id, error = %e, "Execution failed");
                handlers.invoke(&e.to_failure(), Some(&RecordRef::new(type_name, id)));
            }
            result
        }
        .boxed();

        WorkUnit { type_name, id, run }
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("model", &self.type_name())
            .field("fetch_records", &self.fetch_records)
            .field("quiet", &self.is_quiet())
            .finish_non_exhaustive()
    }
}

struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
