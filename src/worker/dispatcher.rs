//! Bounded executor shared by every poller of a worker.
//!
//! A full queue makes the submitting poller run the unit itself, which
//! throttles leasing to the rate units are actually processed.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use crate::jobs::WorkUnit;
use crate::models::ExecutorStatus;

/// What happened to a submitted unit.
#[derive(Debug)]
pub enum Submission {
    /// Accepted into the queue for a worker task.
    Queued,
    /// The queue was full or concurrency is 1; the caller ran it.
    RanInline,
    /// The dispatcher is shutting down; the unit was not run.
    Rejected(WorkUnit),
}

pub struct Dispatcher {
    max_threads: usize,
    sender: Mutex<Option<mpsc::Sender<WorkUnit>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    active: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
    status: watch::Sender<ExecutorStatus>,
}

impl Dispatcher {
    /// Spawn `max_threads` workers over a queue of `queue_capacity` units.
    /// With one thread no workers are spawned and every unit runs inline.
    pub fn new(max_threads: usize, queue_capacity: usize) -> Self {
        let max_threads = max_threads.max(1);
        let (sender, receiver) = mpsc::channel::<WorkUnit>(queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let active = Arc::new(AtomicUsize::new(0));
        let queued = Arc::new(AtomicUsize::new(0));

        let workers = if max_threads == 1 {
            Vec::new()
        } else {
            (0..max_threads)
                .map(|_| {
                    tokio::spawn(work(
                        Arc::clone(&receiver),
                        Arc::clone(&active),
                        Arc::clone(&queued),
                    ))
                })
                .collect()
        };

        let (status, _) = watch::channel(ExecutorStatus::Running);

        Self {
            max_threads,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            active,
            queued,
            status,
        }
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Units currently running, inline runs included.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn queue_len(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ExecutorStatus {
        *self.status.borrow()
    }

    pub async fn submit(&self, unit: WorkUnit) -> Submission {
        let sender = match self.sender.lock().await.as_ref() {
            Some(sender) => sender.clone(),
            None => return Submission::Rejected(unit),
        };

        if self.max_threads == 1 {
            run(unit, &self.active).await;
            return Submission::RanInline;
        }

        self.queued.fetch_add(1, Ordering::SeqCst);
        match sender.try_send(unit) {
            Ok(()) => Submission::Queued,
            Err(TrySendError::Full(unit)) => {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                tracing::debug!(
                    model = unit.type_name,
                    id = unit.id,
                    "Dispatcher queue full, running inline"
                );
                run(unit, &self.active).await;
                Submission::RanInline
            }
            Err(TrySendError::Closed(unit)) => {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                Submission::Rejected(unit)
            }
        }
    }

    /// Stop accepting units, let the workers drain the queue and wait for
    /// them up to `timeout`. Returns `false` when stragglers were abandoned.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.status.send_replace(ExecutorStatus::Shuttingdown);
        self.sender.lock().await.take();

        let workers = std::mem::take(&mut *self.workers.lock().await);
        let drained = tokio::time::timeout(timeout, futures::future::join_all(workers))
            .await
            .is_ok();
        if !drained {
            tracing::warn!(
                timeout_secs = timeout.as_secs(),
                active = self.active(),
                queued = self.queue_len(),
                "Dispatcher did not drain in time, abandoning running units"
            );
        }

        self.status.send_replace(ExecutorStatus::Shutdown);
        drained
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("max_threads", &self.max_threads)
            .field("active", &self.active())
            .field("queued", &self.queue_len())
            .field("status", &self.status())
            .finish()
    }
}

async fn work(
    receiver: Arc<Mutex<mpsc::Receiver<WorkUnit>>>,
    active: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
) {
    loop {
        let next = receiver.lock().await.recv().await;
        let Some(unit) = next else {
            break;
        };
        queued.fetch_sub(1, Ordering::SeqCst);
        run(unit, &active).await;
    }
}

// Outcomes are reported by whoever built the unit.
async fn run(unit: WorkUnit, active: &AtomicUsize) {
    let WorkUnit { type_name, id, run } = unit;

    active.fetch_add(1, Ordering::SeqCst);
    let result = AssertUnwindSafe(run).catch_unwind().await;
    active.fetch_sub(1, Ordering::SeqCst);

    if result.is_err() {
        tracing::error!(model = type_name, id, "Work unit panicked");
    }
}
