//! Canonical on-disk storage.
//!
//! One tree under a storage root holds every asset exactly once. Consumer
//! installations see it through symlinks, never copies. Anything that changes
//! the tree's structure runs under an exclusive advisory lock on the root.

mod consumer;
mod env;
mod layout;
mod lock;
mod maintenance;
mod registry;
mod router;

use std::{
    io,
    path::{Path, PathBuf},
};

use thiserror::Error;

pub use consumer::{Binding, ConsumerKind, LinkReport, UnlinkReport};
pub use env::CacheEnvironment;
pub use layout::{LAYOUT_VERSION, METADATA_FILE, StorageLayout, StorageMetadata};
pub use lock::{LOCK_FILE, StorageLock};
pub use maintenance::{CategoryUsage, DedupReport, Duplicate, UsageReport, UsageStats};
pub use registry::{AssetEntry, AssetRegistry, REGISTRY_FILE};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("filesystem error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid JSON in {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("walk error: {0}")]
    Walk(#[from] jwalk::Error),

    #[error("not a regular file: {0:?}")]
    NotAFile(PathBuf),

    #[error("unknown storage category: {0}")]
    UnknownCategory(String),

    #[error("unknown consumer: {0}")]
    UnknownConsumer(String),
}

impl StorageError {
    pub(crate) fn io(path: impl AsRef<Path>) -> impl FnOnce(io::Error) -> StorageError {
        let path = path.as_ref().to_path_buf();
        move |source| StorageError::Io { path, source }
    }
}

pub type Result<T, E = StorageError> = std::result::Result<T, E>;

/// Owner of the canonical tree. Cheap to clone; holds no open handles.
#[derive(Debug, Clone)]
pub struct StorageManager {
    layout: StorageLayout,
}

impl StorageManager {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            layout: StorageLayout::new(root),
        }
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Take the structural-mutation lock for this root.
    pub fn lock(&self) -> Result<StorageLock> {
        StorageLock::acquire(self.root())
    }

    pub fn registry_path(&self) -> PathBuf {
        self.root().join(REGISTRY_FILE)
    }
}
