//! HTTP download implementation
//!
//! This module streams a task's URL into a staging file next to its
//! destination, hashing as it goes, and only renames the file onto its final
//! name once size and digest check out. Failed attempts are retried in a
//! bounded loop driven by the [`RetryPolicy`].

use std::{path::PathBuf, time::Duration};

use futures_util::StreamExt;
use reqwest::{
    Client,
    header::{self, HeaderMap, HeaderValue},
};
use serde::{Deserialize, Serialize};
use tokio::{fs::File, io::AsyncWriteExt};
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use super::{DownloadError, RetryPolicy, Task, TaskStatus, Transfer, TransferSession};
use crate::progress::ProgressReporter;
use crate::verify::{self, Digest, StreamHasher};

pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloaderConfig {
    /// Bytes written (and reported) per chunk.
    pub chunk_size: usize,
    /// Upper bound for one whole attempt, connect to last byte.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
    pub user_agent: String,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry: RetryPolicy::default(),
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Outcome of checking for an existing file before touching the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precheck {
    /// A usable file is already at `path`.
    Skip {
        path: PathBuf,
        size: u64,
        digest: Option<Digest>,
    },
    /// Nothing there, or what is there does not match.
    Fetch,
}

/// Decide whether `task` needs downloading at all.
///
/// Looks at the task's stored copy first, then its destination. A file is
/// accepted when nothing was expected of it, or its size and digest match
/// whatever was given. This hashes files, so call it off the async executor.
pub fn precheck(task: &Task) -> Precheck {
    task.stored_copy
        .iter()
        .cloned()
        .chain(std::iter::once(task.destination_path()))
        .find_map(|path| check_existing(task, path))
        .unwrap_or(Precheck::Fetch)
}

fn check_existing(task: &Task, path: PathBuf) -> Option<Precheck> {
    let meta = std::fs::metadata(&path).ok()?;
    if !meta.is_file() {
        return None;
    }
    let size = meta.len();
    if let Some(expected) = task.expected_size {
        if expected != size {
            debug!(path = ?path, expected, actual = size, "Existing file has the wrong size");
            return None;
        }
    }
    let digest = match &task.expected_digest {
        Some(expected) => match verify::hash_file(&path) {
            Ok(actual) if &actual == expected => Some(actual),
            Ok(actual) => {
                info!(path = ?path, expected = %expected, actual = %actual, "Existing file failed verification, redownloading");
                return None;
            }
            Err(e) => {
                warn!(path = ?path, error = %e, "Could not hash existing file");
                return None;
            }
        },
        None => None,
    };
    Some(Precheck::Skip { path, size, digest })
}

/// The transfer engine. Holds configuration and the progress surface; the
/// HTTP client itself lives in the per-batch [`DownloadSession`].
#[derive(Debug, Clone, Default)]
pub struct Downloader {
    config: DownloaderConfig,
    reporter: ProgressReporter,
}

impl Downloader {
    pub fn new(config: DownloaderConfig, reporter: ProgressReporter) -> Self {
        Self { config, reporter }
    }

    pub fn config(&self) -> &DownloaderConfig {
        &self.config
    }

    pub fn reporter(&self) -> &ProgressReporter {
        &self.reporter
    }

    /// Download a single task outside of any batch.
    pub async fn download(&self, task: &mut Task) -> Result<bool, DownloadError> {
        let session = self.open_session(1)?;
        Ok(session.transfer(task).await)
    }
}

impl Transfer for Downloader {
    type Session = DownloadSession;

    fn open_session(&self, max_concurrent: usize) -> Result<DownloadSession, DownloadError> {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));

        let client = Client::builder()
            .default_headers(headers)
            .user_agent(self.config.user_agent.clone())
            .connect_timeout(self.config.connect_timeout)
            .pool_max_idle_per_host(max_concurrent.max(1))
            .build()
            .map_err(|e| DownloadError::Client(e.to_string()))?;

        debug!(pool = max_concurrent, "Opened download session");
        Ok(DownloadSession {
            client,
            config: self.config.clone(),
            reporter: self.reporter.clone(),
        })
    }
}

/// One batch worth of shared HTTP connections.
pub struct DownloadSession {
    client: Client,
    config: DownloaderConfig,
    reporter: ProgressReporter,
}

impl Drop for DownloadSession {
    fn drop(&mut self) {
        trace!("Download session closed");
    }
}

impl TransferSession for DownloadSession {
    async fn transfer(&self, task: &mut Task) -> bool {
        let span = info_span!("download_task", id = %task.id, url = %task.url);
        self.run(task).instrument(span).await
    }
}

impl DownloadSession {
    async fn run(&self, task: &mut Task) -> bool {
        if task.is_cancel_requested() {
            self.finish(task, TaskStatus::Cancelled, Some(DownloadError::Cancelled));
            return false;
        }

        let check = {
            let probe = task.clone();
            tokio::task::spawn_blocking(move || precheck(&probe))
                .await
                .unwrap_or(Precheck::Fetch)
        };
        if let Precheck::Skip { path, size, digest } = check {
            info!(path = ?path, "File already present, skipping download");
            if let Some(dir) = path.parent() {
                task.destination = dir.to_path_buf();
            }
            task.skipped = true;
            task.total_size = Some(size);
            task.bytes_written = size;
            task.digest = digest;
            self.finish(task, TaskStatus::Completed, None);
            return true;
        }

        loop {
            if let Err(e) = task.transition(TaskStatus::Downloading) {
                error!(error = %e, "Task cannot start downloading");
                return false;
            }
            self.reporter.report(task);

            let attempt = tokio::time::timeout(self.config.timeout, self.attempt(task)).await;
            let err = match attempt {
                Ok(Ok(())) => {
                    info!(bytes = task.bytes_written, path = ?task.destination_path(), "Download completed");
                    self.finish(task, TaskStatus::Completed, None);
                    return true;
                }
                Ok(Err(e)) => e,
                Err(_) => DownloadError::Timeout(self.config.timeout),
            };

            remove_staging(task.staging_path()).await;

            if matches!(err, DownloadError::Cancelled) {
                info!(downloaded = task.bytes_written, "Download cancelled during transfer");
                self.finish(task, TaskStatus::Cancelled, Some(err));
                return false;
            }

            task.retry_count += 1;
            task.last_error = Some(err.to_string());

            if !err.is_retryable() || task.retry_count >= task.max_retries {
                error!(
                    error = %err,
                    retry_count = task.retry_count,
                    max_retries = task.max_retries,
                    "Download failed permanently"
                );
                self.finish(task, TaskStatus::Failed, Some(err));
                return false;
            }

            error!(
                error = %err,
                retry = task.retry_count,
                max_retries = task.max_retries,
                "Download failed with retryable error"
            );
            if task.transition(TaskStatus::Retry).is_err() {
                return false;
            }
            self.reporter.report(task);

            let delay = self.config.retry.delay_for(task.retry_count);
            if !delay.is_zero() {
                info!(delay_ms = delay.as_millis() as u64, "Waiting before retry");
            }
            let cancel = task.cancellation_token();
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Download cancelled during retry wait");
                    self.finish(task, TaskStatus::Cancelled, Some(DownloadError::Cancelled));
                    return false;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One GET into the staging file. Leaves the staging file behind on
    /// error; the caller cleans it up.
    async fn attempt(&self, task: &mut Task) -> Result<(), DownloadError> {
        tokio::fs::create_dir_all(&task.destination).await?;
        let response = self.client.get(&task.url).send().await?;
        trace!(status = %response.status(), "Got response");
        if !response.status().is_success() {
            return Err(DownloadError::Status(response.status()));
        }

        task.total_size = task.expected_size.or(response.content_length());
        match task.total_size {
            Some(size) => info!(bytes = size, path = ?task.destination_path(), "Starting download"),
            None => info!(path = ?task.destination_path(), "Starting download of unknown size"),
        }

        let staging = task.staging_path();
        let mut file = File::create(&staging).await?;
        let mut hasher = StreamHasher::new();
        let mut written: u64 = 0;
        let chunk_size = self.config.chunk_size.max(1);
        let cancel = task.cancellation_token();
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                next = stream.next() => next,
            };
            let Some(bytes) = next else { break };
            let bytes = bytes?;

            for piece in bytes.chunks(chunk_size) {
                file.write_all(piece).await?;
                hasher.update(piece);
                written += piece.len() as u64;
                task.record_bytes(written);
                self.reporter.report(task);
                if cancel.is_cancelled() {
                    return Err(DownloadError::Cancelled);
                }
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Some(expected) = task.expected_size {
            if expected != written {
                return Err(DownloadError::SizeMismatch {
                    expected,
                    actual: written,
                });
            }
        }

        let actual = hasher.finalize();
        if let Some(expected) = &task.expected_digest {
            if expected != &actual {
                return Err(DownloadError::ChecksumMismatch {
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        task.digest = Some(actual);

        tokio::fs::rename(&staging, task.destination_path()).await?;
        Ok(())
    }

    fn finish(&self, task: &mut Task, status: TaskStatus, err: Option<DownloadError>) {
        if let Some(e) = err {
            task.last_error = Some(e.to_string());
        }
        if let Err(e) = task.transition(status) {
            warn!(error = %e, "Ignoring invalid final transition");
        }
        self.reporter.report(task);
    }
}

async fn remove_staging(path: PathBuf) {
    match tokio::fs::remove_file(&path).await {
        Ok(()) => trace!(path = ?path, "Removed staging file"),
        Err(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
            ) => {}
        Err(e) => warn!(path = ?path, error = %e, "Failed to remove staging file"),
    }
}
