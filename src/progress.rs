//! Progress callbacks.
//!
//! The transfer engine calls [`ProgressReporter::report`] after every chunk
//! with the live task. Observers (UI, logging, the scheduler's active list)
//! subscribe closures; none of them can mutate the task.

use std::sync::{Arc, RwLock};

use tracing::{info, trace};

use crate::download::Task;

type Callback = Arc<dyn Fn(&Task) + Send + Sync>;

/// Cheap to clone; clones share the same subscriber list.
#[derive(Clone, Default)]
pub struct ProgressReporter {
    callbacks: Arc<RwLock<Vec<Callback>>>,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("subscribers", &self.len())
            .finish()
    }
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&Task) + Send + Sync + 'static,
    {
        match self.callbacks.write() {
            Ok(mut callbacks) => callbacks.push(Arc::new(callback)),
            Err(poisoned) => poisoned.into_inner().push(Arc::new(callback)),
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.read().map(|c| c.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn report(&self, task: &Task) {
        // Snapshot the list so a callback may subscribe without deadlocking.
        let callbacks: Vec<Callback> = match self.callbacks.read() {
            Ok(callbacks) => callbacks.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for callback in callbacks {
            callback(task);
        }
    }

    /// Subscribe a tracing logger that emits one `info` line per quarter of
    /// progress and traces everything else.
    pub fn log_milestones(&self) {
        let last: Arc<RwLock<std::collections::HashMap<ulid::Ulid, u8>>> = Arc::default();
        self.subscribe(move |task| {
            if task.total_size.is_none() {
                trace!(
                    id = %task.id,
                    bytes = task.bytes_written,
                    "Download progress (size unknown)"
                );
                return;
            }
            let quarter = (task.progress / 25.0).floor() as u8;
            let Ok(mut seen) = last.write() else {
                return;
            };
            let previous = seen.entry(task.id).or_insert(0);
            if quarter > *previous {
                *previous = quarter;
                info!(
                    id = %task.id,
                    filename = %task.filename,
                    percentage = format_args!("{:.1}%", task.progress),
                    bytes = task.bytes_written,
                    total = task.total_size,
                    "Download milestone"
                );
            }
            if quarter >= 4 {
                seen.remove(&task.id);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::AssetType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_every_subscriber_is_called() {
        let reporter = ProgressReporter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = calls.clone();
            reporter.subscribe(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        let task = Task::new("https://example.com/a.bin", "/tmp", AssetType::Other);
        reporter.report(&task);
        reporter.report(&task);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(reporter.len(), 3);
    }

    #[test]
    fn test_clones_share_subscribers() {
        let reporter = ProgressReporter::new();
        let clone = reporter.clone();
        let seen = Arc::new(RwLock::new(Vec::new()));
        {
            let seen = seen.clone();
            clone.subscribe(move |task| seen.write().unwrap().push(task.filename.clone()));
        }
        let task = Task::new("https://example.com/b.bin", "/tmp", AssetType::Other);
        reporter.report(&task);
        assert_eq!(*seen.read().unwrap(), vec!["b.bin".to_string()]);
    }

    #[test]
    fn test_milestone_logger_does_not_panic_without_total() {
        let reporter = ProgressReporter::new();
        reporter.log_milestones();
        let mut task = Task::new("https://example.com/c.bin", "/tmp", AssetType::Other);
        reporter.report(&task);
        task.total_size = Some(100);
        for written in [10, 30, 60, 100] {
            task.record_bytes(written);
            reporter.report(&task);
        }
    }
}
