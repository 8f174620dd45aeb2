//! Download queue management
//!
//! Tasks are enqueued into a pending list and drained in batches by
//! [`Scheduler::process`], which starts them in priority order while keeping
//! at most `max_concurrent` transfers in flight.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use super::{Downloader, Task, TaskSnapshot, TaskStatus, Transfer, TransferSession};
use crate::progress::ProgressReporter;

pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// What [`Scheduler::cancel`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The task had not been drained yet and was dropped from the queue.
    Removed,
    /// The task belongs to a running batch; its token has been flipped.
    Signalled,
    NotFound,
}

/// Result of one [`Scheduler::process`] call.
#[derive(Debug)]
pub struct BatchReport {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Completed tasks whose file was already in place.
    pub skipped: usize,
    pub elapsed: Duration,
    pub tasks: Vec<Task>,
}

impl BatchReport {
    fn empty() -> Self {
        Self {
            total: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            skipped: 0,
            elapsed: Duration::ZERO,
            tasks: Vec::new(),
        }
    }

    fn record(&mut self, task: Task) {
        match task.status() {
            TaskStatus::Completed => {
                self.completed += 1;
                if task.skipped {
                    self.skipped += 1;
                }
            }
            TaskStatus::Cancelled => self.cancelled += 1,
            _ => self.failed += 1,
        }
        self.tasks.push(task);
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            total: self.total,
            completed: self.completed,
            failed: self.failed,
            cancelled: self.cancelled,
            skipped: self.skipped,
            elapsed_ms: self.elapsed.as_millis() as u64,
            tasks: self.tasks.iter().map(Task::snapshot).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub skipped: usize,
    pub elapsed_ms: u64,
    pub tasks: Vec<TaskSnapshot>,
}

struct ActiveEntry {
    token: CancellationToken,
    snapshot: TaskSnapshot,
}

type ActiveMap = Arc<Mutex<BTreeMap<Ulid, ActiveEntry>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Scheduler<T: Transfer = Downloader> {
    engine: T,
    pending: Mutex<Vec<Task>>,
    active: ActiveMap,
    /// Held for the whole of a batch; overlapping `process` calls queue up
    /// behind it so the concurrency limit holds across callers.
    running: AsyncMutex<()>,
}

impl<T: Transfer> Scheduler<T> {
    /// Build a scheduler around `engine`. `reporter` must be the one the
    /// engine reports through; the scheduler subscribes to it to keep
    /// [`Scheduler::list_active`] current.
    pub fn new(engine: T, reporter: &ProgressReporter) -> Self {
        let active: ActiveMap = Arc::default();
        {
            let active = active.clone();
            reporter.subscribe(move |task| {
                if let Some(entry) = lock(&active).get_mut(&task.id) {
                    entry.snapshot = task.snapshot();
                }
            });
        }
        Self {
            engine,
            pending: Mutex::new(Vec::new()),
            active,
            running: AsyncMutex::new(()),
        }
    }

    pub fn engine(&self) -> &T {
        &self.engine
    }

    pub fn enqueue(&self, task: Task) {
        info!(id = %task.id, url = %task.url, priority = task.priority, "Adding download to queue");
        debug!(id = %task.id, path = ?task.destination_path(), "Download destination");
        lock(&self.pending).push(task);
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn list_pending(&self) -> Vec<TaskSnapshot> {
        lock(&self.pending).iter().map(Task::snapshot).collect()
    }

    /// Snapshots of every task in the running batch that has not finished.
    pub fn list_active(&self) -> Vec<TaskSnapshot> {
        lock(&self.active)
            .values()
            .map(|entry| entry.snapshot.clone())
            .collect()
    }

    pub fn cancel(&self, filename: &str) -> CancelOutcome {
        {
            let mut pending = lock(&self.pending);
            let before = pending.len();
            pending.retain(|task| task.filename != filename);
            if pending.len() != before {
                info!(filename, removed = before - pending.len(), "Removed pending download");
                return CancelOutcome::Removed;
            }
        }

        let active = lock(&self.active);
        let mut signalled = false;
        for entry in active.values().filter(|e| e.snapshot.filename == filename) {
            entry.token.cancel();
            signalled = true;
        }
        if signalled {
            info!(filename, "Cancelling in-flight download");
            CancelOutcome::Signalled
        } else {
            warn!(filename, "Attempted to cancel non-existent download");
            CancelOutcome::NotFound
        }
    }

    /// Drain the pending list and run it to completion.
    ///
    /// Tasks start in descending priority order (stable for ties), each only
    /// once it holds one of `max_concurrent` slots. A failing task never stops
    /// its siblings. A call made while another batch runs waits for it, then
    /// drains whatever was enqueued in the meantime.
    pub async fn process(&self, max_concurrent: usize) -> BatchReport {
        let _running = self.running.lock().await;
        let started = Instant::now();
        let mut batch = std::mem::take(&mut *lock(&self.pending));
        if batch.is_empty() {
            debug!("Nothing to process");
            return BatchReport::empty();
        }
        batch.sort_by(|a, b| b.priority.cmp(&a.priority));

        let max_concurrent = max_concurrent.max(1);
        let mut report = BatchReport::empty();
        report.total = batch.len();
        info!(tasks = batch.len(), max_concurrent, "Processing download batch");

        let session = match self.engine.open_session(max_concurrent) {
            Ok(session) => Arc::new(session),
            Err(e) => {
                error!(error = %e, "Could not open transfer session");
                for mut task in batch {
                    task.last_error = Some(e.to_string());
                    let _ = task.transition(TaskStatus::Cancelled);
                    report.record(task);
                }
                report.elapsed = started.elapsed();
                return report;
            }
        };

        {
            let mut active = lock(&self.active);
            for task in &batch {
                active.insert(
                    task.id,
                    ActiveEntry {
                        token: task.cancellation_token(),
                        snapshot: task.snapshot(),
                    },
                );
            }
        }

        let slots = Arc::new(Semaphore::new(max_concurrent));
        let mut ids = Vec::with_capacity(batch.len());
        let mut handles = Vec::with_capacity(batch.len());

        for mut task in batch {
            let permit = match slots.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            if task.is_cancel_requested() {
                info!(id = %task.id, filename = %task.filename, "Cancelled before start");
                let _ = task.transition(TaskStatus::Cancelled);
                lock(&self.active).remove(&task.id);
                report.record(task);
                continue;
            }

            debug!(id = %task.id, priority = task.priority, "Starting download task");
            let session = session.clone();
            let active = self.active.clone();
            ids.push(task.id);
            handles.push(tokio::spawn(async move {
                session.transfer(&mut task).await;
                drop(permit);
                lock(&active).remove(&task.id);
                task
            }));
        }

        let joined = futures::future::join_all(handles).await;
        for (id, joined) in ids.into_iter().zip(joined) {
            match joined {
                Ok(task) => report.record(task),
                Err(e) => {
                    error!(id = %id, error = %e, "Download task panicked");
                    lock(&self.active).remove(&id);
                    report.failed += 1;
                }
            }
        }
        drop(session);

        report.elapsed = started.elapsed();
        info!(
            total = report.total,
            completed = report.completed,
            failed = report.failed,
            cancelled = report.cancelled,
            skipped = report.skipped,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Download batch finished"
        );
        report
    }
}
