//! Worker process lifecycle.
//!
//! A worker owns one poller per type, the shared dispatcher and the
//! heartbeat, signal, fleet-size and monitor loops. Everything stops on one
//! cancellation token and shuts down in a fixed order: pollers, dispatcher,
//! loops, then the heartbeat row.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::AppResult;
use crate::jobs::{Clock, ErrorHandlers, JobError, JobFailure, JobRegistry, JobResult, SystemClock};
use crate::models::{ExecutorStatus, SignalKind, WorkerRecord};
use crate::repositories::FleetRepository;
use crate::worker::dispatcher::Dispatcher;
use crate::worker::monitor::{MonitorEvent, fleet_size, is_fleet_leader};
use crate::worker::poller::Poller;

/// Signals older than this are ignored.
const SIGNAL_MAX_AGE_SECS: i64 = 300;

const MONITOR_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle of a [`Worker`], published on its status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Starting,
    Running,
    /// Pollers paused; heartbeats and signal fetches continue
    Quiet,
    /// Cancelled, waiting for in-flight units
    Stopping,
    Stopped,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            WorkerStatus::Starting => "starting",
            WorkerStatus::Running => "running",
            WorkerStatus::Quiet => "quiet",
            WorkerStatus::Stopping => "stopping",
            WorkerStatus::Stopped => "stopped",
        })
    }
}

pub struct Worker {
    config: WorkerConfig,
    registry: JobRegistry,
    fleet: Arc<dyn FleetRepository>,
    handlers: Arc<ErrorHandlers>,
    clock: Arc<dyn Clock>,
    os_signals: bool,
}

impl Worker {
    pub fn new(config: WorkerConfig, registry: JobRegistry, fleet: Arc<dyn FleetRepository>) -> Self {
        Self {
            config,
            registry,
            fleet,
            handlers: Arc::new(ErrorHandlers::new()),
            clock: Arc::new(SystemClock),
            os_signals: true,
        }
    }

    /// Global handlers for failures outside a single record's cycle.
    pub fn with_handlers(mut self, handlers: ErrorHandlers) -> Self {
        self.handlers = Arc::new(handlers);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Leave process signals to the embedding application.
    pub fn without_os_signals(mut self) -> Self {
        self.os_signals = false;
        self
    }

    /// Spawn the worker on the current tokio runtime.
    pub fn start(self) -> JobResult<WorkerHandle> {
        let sources = self.registry.sources(&self.config.model_names)?;
        if sources.is_empty() {
            return Err(JobError::NothingToPoll);
        }

        let dispatcher = Arc::new(Dispatcher::new(
            self.config.executor_thread,
            self.config.executor_queue,
        ));
        let fleet_size = Arc::new(AtomicUsize::new(1));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let pollers: Vec<Arc<Poller>> = sources
            .into_iter()
            .map(|source| {
                Arc::new(Poller::new(
                    source,
                    Arc::clone(&dispatcher),
                    Arc::clone(&self.handlers),
                    self.config.polling_interval,
                    self.config.fetch_records,
                    Arc::clone(&fleet_size),
                    Arc::clone(&in_flight),
                ))
            })
            .collect();

        let mut model_names: Vec<String> =
            pollers.iter().map(|p| p.type_name().to_string()).collect();
        model_names.sort();

        let (status, _) = watch::channel(WorkerStatus::Starting);
        let (monitor, _) = broadcast::channel(MONITOR_CHANNEL_CAPACITY);

        let shared = Arc::new(Shared {
            config: self.config,
            model_names,
            pollers,
            dispatcher,
            fleet: self.fleet,
            handlers: self.handlers,
            clock: self.clock,
            cancel: CancellationToken::new(),
            status,
            monitor,
            fleet_size,
            in_flight,
        });

        tokio::spawn(supervise(Arc::clone(&shared), self.os_signals));
        Ok(WorkerHandle { shared })
    }

    /// Start and wait until the worker has stopped.
    pub async fn run(self) -> JobResult<()> {
        let handle = self.start()?;
        handle.wait().await;
        Ok(())
    }
}

/// Control surface of a running worker.
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<Shared>,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> &str {
        &self.shared.config.worker_id
    }

    pub fn model_names(&self) -> &[String] {
        &self.shared.model_names
    }

    pub fn stop(&self) {
        self.shared.cancel.cancel();
    }

    pub fn quiet(&self) {
        self.shared.quiet();
    }

    pub fn resume(&self) {
        self.shared.resume();
    }

    pub fn is_quiet(&self) -> bool {
        self.shared.is_quiet()
    }

    pub fn status(&self) -> WorkerStatus {
        *self.shared.status.borrow()
    }

    pub fn fleet_size(&self) -> usize {
        self.shared.fleet_size.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    pub fn subscribe_monitor(&self) -> broadcast::Receiver<MonitorEvent> {
        self.shared.monitor.subscribe()
    }

    pub async fn wait(&self) {
        let mut status = self.shared.status.subscribe();
        let _ = status.wait_for(|s| *s == WorkerStatus::Stopped).await;
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("worker_id", &self.worker_id())
            .field("status", &self.status())
            .finish()
    }
}

struct Shared {
    config: WorkerConfig,
    model_names: Vec<String>,
    pollers: Vec<Arc<Poller>>,
    dispatcher: Arc<Dispatcher>,
    fleet: Arc<dyn FleetRepository>,
    handlers: Arc<ErrorHandlers>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    status: watch::Sender<WorkerStatus>,
    monitor: broadcast::Sender<MonitorEvent>,
    fleet_size: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
}

impl Shared {
    fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    fn quiet(&self) {
        for poller in &self.pollers {
            poller.quiet();
        }
        self.status.send_if_modified(|s| {
            let running = *s == WorkerStatus::Running;
            if running {
                *s = WorkerStatus::Quiet;
            }
            running
        });
    }

    fn resume(&self) {
        for poller in &self.pollers {
            poller.resume();
        }
        self.status.send_if_modified(|s| {
            let quiet = *s == WorkerStatus::Quiet;
            if quiet {
                *s = WorkerStatus::Running;
            }
            quiet
        });
    }

    fn is_quiet(&self) -> bool {
        self.pollers.iter().all(|p| p.is_quiet())
    }

    fn heartbeat_record(&self) -> WorkerRecord {
        let executor_status = match self.dispatcher.status() {
            ExecutorStatus::Running if self.is_quiet() => ExecutorStatus::Quiet,
            status => status,
        };

        WorkerRecord {
            worker_id: self.worker_id().to_string(),
            max_thread_size: clamp_i32(self.dispatcher.max_threads()),
            current_executing_size: clamp_i32(self.dispatcher.active()),
            current_queue_size: clamp_i32(self.dispatcher.queue_len()),
            executor_status,
            polling_model_names: WorkerRecord::encode_model_names(&self.model_names),
            last_heartbeated_at: self.clock.now(),
        }
    }

    async fn heartbeat(&self) -> AppResult<()> {
        self.fleet.heartbeat(&self.heartbeat_record()).await
    }

    /// Heartbeat pushed outside the regular loop; failures are only logged.
    async fn push_heartbeat(&self) {
        if let Err(e) = self.heartbeat().await {
            tracing::error!(worker_id = self.worker_id(), error = %e, "Failed to push heartbeat");
        }
    }

    /// Claim the oldest pending signal addressed to this worker.
    async fn fetch_signal(&self) -> AppResult<Option<SignalKind>> {
        let now = self.clock.now();
        let since = now - chrono::Duration::seconds(SIGNAL_MAX_AGE_SECS);
        let Some(signal) = self.fleet.pending_signal(self.worker_id(), since).await? else {
            return Ok(None);
        };

        if !self.fleet.claim_signal(signal.id, now).await? {
            tracing::debug!(signal_id = signal.id, "Signal already claimed");
            return Ok(None);
        }
        Ok(Some(signal.signal))
    }

    async fn handle_signal(&self, signal: SignalKind) {
        tracing::info!(worker_id = self.worker_id(), %signal, "Received signal");
        match signal {
            SignalKind::Tstp => {
                self.quiet();
                self.push_heartbeat().await;
            }
            SignalKind::Cont => {
                self.resume();
                self.push_heartbeat().await;
            }
            SignalKind::Usr1 => {
                self.log_snapshot();
                self.push_heartbeat().await;
            }
            SignalKind::Term => self.cancel.cancel(),
        }
    }

    fn log_snapshot(&self) {
        let status = *self.status.borrow();
        tracing::info!(
            worker_id = self.worker_id(),
            %status,
            executor_status = %self.dispatcher.status(),
            max_threads = self.dispatcher.max_threads(),
            active = self.dispatcher.active(),
            queued = self.dispatcher.queue_len(),
            in_flight = self.in_flight.load(Ordering::SeqCst),
            fleet_size = self.fleet_size.load(Ordering::SeqCst),
            models = ?self.model_names,
            "Worker status"
        );
    }

    async fn refresh_fleet_size(&self) -> AppResult<usize> {
        let since = window_start(self.clock.now(), self.config.alive_threshold());
        let alive = self.fleet.alive_workers(since).await?;
        let size = fleet_size(&alive, &self.model_names);
        let previous = self.fleet_size.swap(size, Ordering::SeqCst);
        if previous != size {
            tracing::info!(worker_id = self.worker_id(), previous, size, "Fleet size changed");
        }
        Ok(size)
    }

    /// Publish one event per type when someone listens and this worker
    /// leads its fleet. Returns how many events were sent.
    async fn publish_monitor_events(&self) -> AppResult<usize> {
        if self.monitor.receiver_count() == 0 {
            return Ok(0);
        }

        let now = self.clock.now();
        let alive = self
            .fleet
            .alive_workers(window_start(now, self.config.alive_threshold()))
            .await?;
        if !is_fleet_leader(self.worker_id(), &alive, &self.model_names) {
            return Ok(0);
        }

        let mut sent = 0;
        for poller in &self.pollers {
            match poller.source().stats().await {
                Ok(stats) => {
                    let event = MonitorEvent::from_stats(poller.type_name(), &stats, now);
                    if self.monitor.send(event).is_ok() {
                        sent += 1;
                    }
                }
                Err(e) => tracing::warn!(
                    model = poller.type_name(),
                    error = %e,
                    "Failed to collect monitor stats"
                ),
            }
        }
        Ok(sent)
    }

    async fn shutdown(&self, pollers: Vec<JoinHandle<()>>, loops: Vec<JoinHandle<()>>) {
        self.status.send_replace(WorkerStatus::Stopping);
        tracing::info!(worker_id = self.worker_id(), "Worker stopping");

        for task in pollers {
            if let Err(e) = task.await {
                tracing::error!(worker_id = self.worker_id(), error = %e, "Poller task failed");
            }
        }

        self.dispatcher
            .shutdown(self.config.executor_shutdown_timeout)
            .await;

        let aborts: Vec<_> = loops.iter().map(|task| task.abort_handle()).collect();
        let joined = tokio::time::timeout(
            self.config.other_thread_shutdown_timeout,
            futures::future::join_all(loops),
        )
        .await;
        if joined.is_err() {
            tracing::warn!(
                worker_id = self.worker_id(),
                "Background loops did not stop in time, aborting"
            );
            for abort in aborts {
                abort.abort();
            }
        }

        match self.fleet.unregister(self.worker_id()).await {
            Ok(_) => tracing::debug!(worker_id = self.worker_id(), "Heartbeat row removed"),
            Err(e) => tracing::error!(
                worker_id = self.worker_id(),
                error = %e,
                "Failed to remove heartbeat row"
            ),
        }

        self.status.send_replace(WorkerStatus::Stopped);
        tracing::info!(worker_id = self.worker_id(), "Worker stopped");
    }
}

async fn supervise(shared: Arc<Shared>, os_signals: bool) {
    tracing::info!(
        worker_id = shared.worker_id(),
        models = ?shared.model_names,
        executor_thread = shared.dispatcher.max_threads(),
        "Worker starting"
    );

    let mut loops = vec![
        tokio::spawn(heartbeat_loop(Arc::clone(&shared))),
        tokio::spawn(signal_loop(Arc::clone(&shared))),
        tokio::spawn(fleet_loop(Arc::clone(&shared))),
        tokio::spawn(monitor_loop(Arc::clone(&shared))),
    ];
    if os_signals {
        loops.push(tokio::spawn(os_signal_loop(Arc::clone(&shared))));
    }

    let pollers: Vec<JoinHandle<()>> = shared
        .pollers
        .iter()
        .map(|poller| tokio::spawn(Arc::clone(poller).run(shared.cancel.clone())))
        .collect();

    let quiet = shared.is_quiet();
    shared.status.send_if_modified(|s| {
        let starting = *s == WorkerStatus::Starting;
        if starting {
            *s = if quiet {
                WorkerStatus::Quiet
            } else {
                WorkerStatus::Running
            };
        }
        starting
    });
    tracing::info!(worker_id = shared.worker_id(), "Worker running");

    shared.cancel.cancelled().await;
    shared.shutdown(pollers, loops).await;
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn heartbeat_loop(shared: Arc<Shared>) {
    let mut ticker = ticker(shared.config.heartbeat_interval);
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(e) = shared.heartbeat().await {
            tracing::error!(
                worker_id = shared.worker_id(),
                error = %e,
                "Heartbeat failed, stopping worker"
            );
            shared.handlers.invoke(&JobFailure::from_error(&e), None);
            shared.cancel.cancel();
            break;
        }
    }
}

async fn signal_loop(shared: Arc<Shared>) {
    let mut ticker = ticker(shared.config.signal_fetch_interval);
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match shared.fetch_signal().await {
            Ok(Some(signal)) => shared.handle_signal(signal).await,
            Ok(None) => {}
            Err(e) => {
                tracing::error!(worker_id = shared.worker_id(), error = %e, "Failed to fetch signal");
                shared.handlers.invoke(&JobFailure::from_error(&e), None);
            }
        }
    }
}

async fn fleet_loop(shared: Arc<Shared>) {
    let mut ticker = ticker(shared.config.worker_count_update_interval);
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(e) = shared.refresh_fleet_size().await {
            tracing::warn!(worker_id = shared.worker_id(), error = %e, "Failed to refresh fleet size");
        }
    }
}

async fn monitor_loop(shared: Arc<Shared>) {
    let mut ticker = ticker(shared.config.monitor_interval);
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(e) = shared.publish_monitor_events().await {
            tracing::warn!(worker_id = shared.worker_id(), error = %e, "Monitor cycle failed");
        }
    }
}

#[cfg(unix)]
async fn os_signal_loop(shared: Arc<Shared>) {
    use tokio::signal::unix::{SignalKind as UnixSignal, signal};

    let streams = (|| {
        Ok::<_, std::io::Error>((
            signal(UnixSignal::terminate())?,
            signal(UnixSignal::interrupt())?,
            signal(UnixSignal::from_raw(libc::SIGTSTP))?,
            signal(UnixSignal::from_raw(libc::SIGCONT))?,
        ))
    })();
    let (mut term, mut int, mut tstp, mut cont) = match streams {
        Ok(streams) => streams,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install signal handlers");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = term.recv() => {
                tracing::info!("Received SIGTERM, stopping worker");
                shared.cancel.cancel();
            }
            _ = int.recv() => {
                tracing::info!("Received SIGINT, stopping worker");
                shared.cancel.cancel();
            }
            _ = tstp.recv() => {
                tracing::info!("Received SIGTSTP, entering quiet mode");
                shared.quiet();
            }
            _ = cont.recv() => {
                tracing::info!("Received SIGCONT, resuming");
                shared.resume();
            }
        }
    }
}

#[cfg(not(unix))]
async fn os_signal_loop(shared: Arc<Shared>) {
    tokio::select! {
        _ = shared.cancel.cancelled() => {}
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => {
                tracing::info!("Received Ctrl+C, stopping worker");
                shared.cancel.cancel();
            }
            Err(e) => tracing::warn!(error = %e, "Failed to install Ctrl+C handler"),
        },
    }
}

fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn clamp_i32(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}
