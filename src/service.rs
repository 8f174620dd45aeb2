//! The asset service: scheduler, storage and registry wired together.
//!
//! Callers hand it tasks or requests, run [`AssetService::process`], and get
//! back a batch report whose completed tasks already sit in canonical storage
//! with a registry entry.

use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::download::{
    BatchReport, CancelOutcome, DownloadError, Downloader, Scheduler, Task, TaskRequest,
    TaskSnapshot, TaskStatus, Transfer,
};
use crate::progress::ProgressReporter;
use crate::storage::{
    AssetEntry, AssetRegistry, DedupReport, StorageError, StorageLayout, StorageManager,
    UsageReport,
};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Counts for the presentation layer.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub active: usize,
    pub downloading: usize,
    pub retrying: usize,
}

pub struct AssetService<T: Transfer = Downloader> {
    scheduler: Scheduler<T>,
    storage: StorageManager,
    registry: Arc<Mutex<AssetRegistry>>,
    max_concurrent: usize,
    default_max_retries: Option<u32>,
}

impl AssetService<Downloader> {
    pub fn from_config(config: &Config) -> Result<Self, ServiceError> {
        let reporter = ProgressReporter::new();
        reporter.log_milestones();
        let engine = Downloader::new(config.download.downloader_config(), reporter.clone());
        let storage = StorageManager::new(config.storage.root());
        Ok(Self::new(engine, &reporter, storage)?
            .with_max_concurrent(config.download.max_concurrent)
            .with_default_max_retries(config.download.max_retries))
    }
}

impl<T: Transfer> AssetService<T> {
    /// Initialize storage under `storage` and load its registry.
    pub fn new(
        engine: T,
        reporter: &ProgressReporter,
        storage: StorageManager,
    ) -> Result<Self, ServiceError> {
        storage.initialize()?;
        let registry = AssetRegistry::load(storage.registry_path())?;
        debug!(assets = registry.len(), "Loaded asset registry");
        Ok(Self {
            scheduler: Scheduler::new(engine, reporter),
            storage,
            registry: Arc::new(Mutex::new(registry)),
            max_concurrent: crate::download::DEFAULT_MAX_CONCURRENT,
            default_max_retries: None,
        })
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    /// Retry budget for requests that do not carry their own.
    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = Some(max_retries);
        self
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    pub fn scheduler(&self) -> &Scheduler<T> {
        &self.scheduler
    }

    /// Queue a task. Its canonical file, if any, is offered to the pre-check
    /// as a stored copy; the transfer itself never writes there.
    pub fn enqueue(&self, mut task: Task) -> TaskSnapshot {
        let canonical = self.storage.route(task.asset_type);
        if task.destination != canonical && task.stored_copy.is_none() {
            task.stored_copy = Some(canonical.join(&task.filename));
        }
        let snapshot = task.snapshot();
        self.scheduler.enqueue(task);
        snapshot
    }

    /// Build a task from a request, staging it in its own directory under
    /// `cache/downloads`.
    pub fn submit(&self, request: TaskRequest) -> TaskSnapshot {
        let explicit_retries = request.max_retries.is_some();
        let downloads = self.storage.layout().downloads_dir();
        let mut task = request.into_task(&downloads);
        task.destination = downloads.join(task.id.to_string());
        if let (false, Some(max)) = (explicit_retries, self.default_max_retries) {
            task.max_retries = max;
        }
        self.enqueue(task)
    }

    pub fn cancel(&self, filename: &str) -> CancelOutcome {
        self.scheduler.cancel(filename)
    }

    pub fn list_active(&self) -> Vec<TaskSnapshot> {
        self.scheduler.list_active()
    }

    pub fn list_pending(&self) -> Vec<TaskSnapshot> {
        self.scheduler.list_pending()
    }

    pub fn stats(&self) -> QueueStats {
        let active = self.scheduler.list_active();
        QueueStats {
            pending: self.scheduler.pending_len(),
            active: active.len(),
            downloading: active
                .iter()
                .filter(|t| t.status == TaskStatus::Downloading)
                .count(),
            retrying: active.iter().filter(|t| t.status == TaskStatus::Retry).count(),
        }
    }

    /// Run every queued task, then move completed files into canonical
    /// storage and record them in the registry.
    pub async fn process(&self) -> Result<BatchReport, ServiceError> {
        let mut report = self.scheduler.process(self.max_concurrent).await;
        if report.tasks.is_empty() {
            return Ok(report);
        }

        let storage = self.storage.clone();
        let registry = self.registry.clone();
        let tasks = std::mem::take(&mut report.tasks);
        report.tasks =
            tokio::task::spawn_blocking(move || settle(&storage, &registry, tasks)).await?;
        Ok(report)
    }

    pub async fn usage(&self) -> Result<UsageReport, ServiceError> {
        let storage = self.storage.clone();
        Ok(tokio::task::spawn_blocking(move || storage.usage()).await??)
    }

    /// Deduplicate storage and drop registry entries for removed files.
    pub async fn deduplicate(&self) -> Result<DedupReport, ServiceError> {
        let storage = self.storage.clone();
        let registry = self.registry.clone();
        let report = tokio::task::spawn_blocking(move || -> Result<DedupReport, StorageError> {
            let report = storage.deduplicate()?;
            let removed: Vec<_> = report.duplicates.iter().map(|d| d.removed.clone()).collect();
            let mut registry = lock_registry(&registry);
            if registry.forget_paths(&removed) > 0 {
                registry.save()?;
            }
            Ok(report)
        })
        .await??;
        Ok(report)
    }

    pub fn registry(&self) -> AssetRegistry {
        lock_registry(&self.registry).clone()
    }
}

fn lock_registry(registry: &Mutex<AssetRegistry>) -> std::sync::MutexGuard<'_, AssetRegistry> {
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Organize completed tasks and record them, then drop emptied staging
/// directories. Failures are attached to the task and logged; they never drop
/// it from the report.
fn settle(storage: &StorageManager, registry: &Mutex<AssetRegistry>, mut tasks: Vec<Task>) -> Vec<Task> {
    let mut registry = lock_registry(registry);
    let mut recorded = 0;

    for task in tasks.iter_mut() {
        let staged_in = task.destination.clone();
        if task.status() == TaskStatus::Completed {
            match storage.organize(&task.destination_path(), task.asset_type) {
                Ok(placed) => {
                    if let Some(dir) = placed.parent() {
                        task.destination = dir.to_path_buf();
                    }
                    registry.record(
                        "models",
                        StorageLayout::model_subdir(task.asset_type),
                        &task.filename,
                        AssetEntry::from_task(task, placed),
                    );
                    recorded += 1;
                }
                Err(e) => {
                    error!(filename = %task.filename, error = %e, "Failed to organize download");
                    task.last_error = Some(format!("organize failed: {e}"));
                }
            }
        }
        discard_staging_dir(storage, &staged_in);
    }

    if recorded > 0 {
        if let Err(e) = registry.save() {
            warn!(error = %e, "Failed to save asset registry");
        }
    }
    info!(recorded, "Settled download batch");
    tasks
}

/// Remove a per-task directory under `cache/downloads` if nothing is left in it.
fn discard_staging_dir(storage: &StorageManager, dir: &Path) {
    if dir.parent() != Some(storage.layout().downloads_dir().as_path()) {
        return;
    }
    match std::fs::remove_dir(dir) {
        Ok(()) => debug!(path = ?dir, "Removed staging directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = ?dir, error = %e, "Kept staging directory"),
    }
}
