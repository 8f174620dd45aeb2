//! Module for downloading model files from HTTP sources
//!
//! This module provides the task model, the streaming HTTP transfer engine,
//! and the priority scheduler that bounds how many transfers run at once.

mod http;
mod models;
mod queue;
mod retry;

use std::{future::Future, time::Duration};

use thiserror::Error;

pub use self::http::{
    DEFAULT_CHUNK_SIZE, DEFAULT_CONNECT_TIMEOUT, DEFAULT_TIMEOUT, DownloadSession, Downloader,
    DownloaderConfig, Precheck, precheck,
};
pub use self::models::{
    AssetType, DEFAULT_MAX_RETRIES, Task, TaskRequest, TaskSnapshot, TaskStatus, filename_from_url,
};
pub use self::queue::{BatchReport, BatchSummary, CancelOutcome, DEFAULT_MAX_CONCURRENT, Scheduler};
pub use self::retry::RetryPolicy;

use crate::verify::Digest;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP error: {0}")]
    Status(reqwest::StatusCode),

    #[error("transfer timed out after {0:?}")]
    Timeout(Duration),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: Digest, actual: Digest },

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("download cancelled")]
    Cancelled,

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("unknown asset type: {0}")]
    UnknownAssetType(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

impl DownloadError {
    /// Whether another attempt may succeed. Network trouble and integrity
    /// failures are retried; cancellation and programming errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::Status(_)
                | Self::Timeout(_)
                | Self::ChecksumMismatch { .. }
                | Self::SizeMismatch { .. }
                | Self::Filesystem(_)
        )
    }
}

/// Something that can run transfers for one batch.
///
/// [`Scheduler::process`] opens one session per call, shares it between every
/// in-flight task of that batch and drops it when the batch is done.
pub trait Transfer: Send + Sync + 'static {
    type Session: TransferSession;

    fn open_session(&self, max_concurrent: usize) -> Result<Self::Session, DownloadError>;
}

/// A batch-scoped transfer resource (e.g. a connection pool).
pub trait TransferSession: Send + Sync + 'static {
    /// Drive `task` to a terminal state. Returns `true` on completion.
    fn transfer(&self, task: &mut Task) -> impl Future<Output = bool> + Send;
}
