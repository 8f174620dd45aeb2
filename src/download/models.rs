//! Data structures for the download system
//!
//! Tasks, their status machine, and the serializable snapshots handed to
//! observers and the API.

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use super::DownloadError;
use crate::verify::{Digest, StreamHasher};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Category tag that decides where an asset lives in canonical storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    Checkpoint,
    Lora,
    Vae,
    Controlnet,
    Embedding,
    Metadata,
    Other,
}

impl AssetType {
    pub const ALL: [AssetType; 7] = [
        Self::Checkpoint,
        Self::Lora,
        Self::Vae,
        Self::Controlnet,
        Self::Embedding,
        Self::Metadata,
        Self::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Checkpoint => "checkpoint",
            Self::Lora => "lora",
            Self::Vae => "vae",
            Self::Controlnet => "controlnet",
            Self::Embedding => "embedding",
            Self::Metadata => "metadata",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetType {
    type Err = DownloadError;

    /// Accepts the canonical names plus the plural / catalog spellings
    /// ("checkpoints", "loras", "embeddings", "textual_inversion", ...).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        let kind = match lowered.as_str() {
            "checkpoint" | "checkpoints" | "model" | "stable-diffusion" => Self::Checkpoint,
            "lora" | "loras" | "lycoris" | "locon" => Self::Lora,
            "vae" | "vaes" => Self::Vae,
            "controlnet" | "controlnets" => Self::Controlnet,
            "embedding" | "embeddings" | "textual_inversion" | "textualinversion" => {
                Self::Embedding
            }
            "metadata" => Self::Metadata,
            "other" => Self::Other,
            _ => return Err(DownloadError::UnknownAssetType(s.to_string())),
        };
        Ok(kind)
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Downloading,
    Retry,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// The transition table. Everything moves forward except `Retry`, which
    /// loops back into `Downloading`. `Pending -> Completed` is the pre-check
    /// finding a valid file already on disk.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Downloading | Completed | Cancelled)
                | (Downloading, Completed | Retry | Failed | Cancelled)
                | (Retry, Downloading | Failed | Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Retry => "retry",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.pad(s)
    }
}

/// One requested file acquisition.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: Ulid,
    pub url: String,
    pub destination: PathBuf,
    pub filename: String,
    pub asset_type: AssetType,
    pub expected_size: Option<u64>,
    pub expected_digest: Option<Digest>,
    pub metadata: BTreeMap<String, String>,
    pub priority: i32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub progress: f32,
    pub bytes_written: u64,
    pub total_size: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Set when the pre-check found a valid file and no transfer happened.
    pub skipped: bool,
    /// Digest of the bytes that ended up on disk, once known.
    pub digest: Option<Digest>,
    /// A previously stored copy the pre-check may accept instead of
    /// downloading. Never written to.
    pub stored_copy: Option<PathBuf>,
    status: TaskStatus,
    cancel: CancellationToken,
}

impl Task {
    pub fn new(url: impl Into<String>, destination: impl AsRef<Path>, asset_type: AssetType) -> Self {
        let url = url.into();
        let filename = filename_from_url(&url);
        Self {
            id: Ulid::new(),
            url,
            destination: destination.as_ref().to_path_buf(),
            filename,
            asset_type,
            expected_size: None,
            expected_digest: None,
            metadata: BTreeMap::new(),
            priority: 0,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            progress: 0.0,
            bytes_written: 0,
            total_size: None,
            started_at: None,
            finished_at: None,
            last_error: None,
            skipped: false,
            digest: None,
            stored_copy: None,
            status: TaskStatus::Pending,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        let filename = filename.into();
        if is_safe_filename(&filename) {
            self.filename = filename;
        } else {
            tracing::warn!(filename = %filename, "Ignoring unsafe filename override");
        }
        self
    }

    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    pub fn with_expected_digest(mut self, digest: Digest) -> Self {
        self.expected_digest = Some(digest);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_stored_copy(mut self, path: impl Into<PathBuf>) -> Self {
        self.stored_copy = Some(path.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Final location of the file once the task completes.
    pub fn destination_path(&self) -> PathBuf {
        self.destination.join(&self.filename)
    }

    /// Staging file the transfer writes into before the verified rename.
    /// Carries the task id so tasks sharing a filename never share it.
    pub fn staging_path(&self) -> PathBuf {
        self.destination
            .join(format!("{}.{}.part", self.filename, self.id))
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Move the task to `next`, enforcing the transition table.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), DownloadError> {
        if !self.status.can_transition_to(next) {
            return Err(DownloadError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        tracing::trace!(id = %self.id, from = %self.status, to = %next, "Task transition");
        match next {
            TaskStatus::Downloading if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            TaskStatus::Retry => {
                self.progress = 0.0;
                self.bytes_written = 0;
            }
            s if s.is_terminal() => {
                self.finished_at = Some(Utc::now());
                if s == TaskStatus::Completed {
                    self.progress = 100.0;
                }
            }
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    /// Record progress after a chunk. Never moves the percentage backwards
    /// while downloading.
    pub fn record_bytes(&mut self, written: u64) {
        self.bytes_written = written;
        if let Some(total) = self.total_size.filter(|t| *t > 0) {
            let pct = ((written as f64 / total as f64) * 100.0).min(100.0) as f32;
            if pct > self.progress {
                self.progress = pct;
            }
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            url: self.url.clone(),
            filename: self.filename.clone(),
            asset_type: self.asset_type,
            status: self.status,
            progress: self.progress,
            bytes_written: self.bytes_written,
            total_size: self.total_size,
            priority: self.priority,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            skipped: self.skipped,
            started_at: self.started_at,
            finished_at: self.finished_at,
            last_error: self.last_error.clone(),
        }
    }
}

/// Read-only view of a task for observers and the API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSnapshot {
    pub id: Ulid,
    pub url: String,
    pub filename: String,
    pub asset_type: AssetType,
    pub status: TaskStatus,
    pub progress: f32,
    pub bytes_written: u64,
    pub total_size: Option<u64>,
    pub priority: i32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub skipped: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Request body / catalog shape used to build a task from outside the crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub url: String,
    pub asset_type: AssetType,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub expected_size: Option<u64>,
    #[serde(default)]
    pub sha256: Option<Digest>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl TaskRequest {
    pub fn into_task(self, destination: impl AsRef<Path>) -> Task {
        let mut task = Task::new(self.url, destination, self.asset_type).with_priority(self.priority);
        if let Some(name) = self.filename {
            task = task.with_filename(name);
        }
        if let Some(size) = self.expected_size {
            task = task.with_expected_size(size);
        }
        if let Some(digest) = self.sha256 {
            task = task.with_expected_digest(digest);
        }
        if let Some(max) = self.max_retries {
            task = task.with_max_retries(max);
        }
        task.metadata = self.metadata;
        task
    }
}

fn is_safe_filename(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

/// Derive a filename from the last path segment of `url`, falling back to a
/// name built from the URL's hash.
pub fn filename_from_url(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|segment| is_safe_filename(segment))
        .unwrap_or_else(|| {
            let mut hasher = StreamHasher::new();
            hasher.update(url.as_bytes());
            let digest = hasher.finalize();
            let name = format!("download_{}", &digest.as_str()[..16]);
            tracing::debug!(url = %url, filename = %name, "Using hash-based filename");
            name
        })
}
