use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use fs2::FileExt;
use tracing::{trace, warn};

use super::{Result, StorageError};

pub const LOCK_FILE: &str = ".weightvault.lock";

/// Exclusive advisory lock on a storage root, released on drop.
///
/// The lock is per open file description, so two guards for the same root
/// block each other even inside one process. Never take it while already
/// holding it.
#[derive(Debug)]
pub struct StorageLock {
    file: File,
    path: PathBuf,
}

impl StorageLock {
    pub fn acquire(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(StorageError::io(root))?;
        let path = root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(StorageError::io(&path))?;
        FileExt::lock_exclusive(&file).map_err(StorageError::io(&path))?;
        trace!(path = ?path, "Storage lock acquired");
        Ok(Self { file, path })
    }
}

impl Drop for StorageLock {
    fn drop(&mut self) {
        match FileExt::unlock(&self.file) {
            Ok(()) => trace!(path = ?self.path, "Storage lock released"),
            Err(e) => warn!(path = ?self.path, error = %e, "Failed to release storage lock"),
        }
    }
}
