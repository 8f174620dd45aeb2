use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};

use super::{Result, StorageError, StorageManager};
use crate::download::AssetType;

impl StorageManager {
    /// Canonical directory for an asset type. Pure lookup.
    pub fn route(&self, asset_type: AssetType) -> PathBuf {
        self.layout().model_dir(asset_type)
    }

    /// Move a downloaded file into the canonical directory for its type and
    /// return where it ended up.
    #[instrument(skip(self), fields(root = ?self.root()))]
    pub fn organize(&self, file: &Path, asset_type: AssetType) -> Result<PathBuf> {
        let meta = std::fs::symlink_metadata(file).map_err(StorageError::io(file))?;
        if !meta.is_file() {
            return Err(StorageError::NotAFile(file.to_path_buf()));
        }
        let name = file
            .file_name()
            .ok_or_else(|| StorageError::NotAFile(file.to_path_buf()))?;

        let _lock = self.lock()?;
        let dir = self.route(asset_type);
        std::fs::create_dir_all(&dir).map_err(StorageError::io(&dir))?;
        let dest = dir.join(name);

        if same_file(file, &dest) {
            debug!(path = ?dest, "File already in canonical location");
            return Ok(dest);
        }

        move_file(file, &dest)?;
        info!(from = ?file, to = ?dest, asset_type = %asset_type, "Organized file");
        Ok(dest)
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Rename, falling back to copy + remove when the rename fails (typically a
/// cross-filesystem move).
pub(crate) fn move_file(src: &Path, dest: &Path) -> Result<()> {
    debug!(from = ?src, to = ?dest, "Moving path");
    if let Err(e) = std::fs::rename(src, dest) {
        debug!(error = %e, "Rename failed, copying instead");
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(StorageError::io(parent))?;
        }
        copy_into_place(src, dest)?;
        std::fs::remove_file(src).map_err(StorageError::io(src))?;
    }
    Ok(())
}

/// Copy `src` to a temporary sibling of `dest` and rename it over `dest`, so
/// `dest` is either untouched or complete.
fn copy_into_place(src: &Path, dest: &Path) -> Result<()> {
    let name = dest
        .file_name()
        .ok_or_else(|| StorageError::NotAFile(dest.to_path_buf()))?;
    let tmp = dest.with_file_name(format!(".{}.{}.tmp", name.to_string_lossy(), ulid::Ulid::new()));

    let copied = std::fs::copy(src, &tmp)
        .and_then(|_| std::fs::File::open(&tmp)?.sync_all())
        .map_err(StorageError::io(&tmp))
        .and_then(|()| std::fs::rename(&tmp, dest).map_err(StorageError::io(dest)));
    if copied.is_err() {
        if let Err(e) = std::fs::remove_file(&tmp) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = ?tmp, error = %e, "Failed to remove temporary copy");
            }
        }
    }
    copied
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_organize_moves_into_type_directory() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path().join("vault"));
        storage.initialize().unwrap();

        let incoming = dir.path().join("sd_xl_base.safetensors");
        std::fs::write(&incoming, b"ckpt").unwrap();

        let placed = storage.organize(&incoming, AssetType::Checkpoint).unwrap();
        assert_eq!(
            placed,
            storage.root().join("models/checkpoints/sd_xl_base.safetensors")
        );
        assert!(!incoming.exists());
        assert_eq!(std::fs::read(&placed).unwrap(), b"ckpt");

        // organizing a file that is already in place is a no-op
        assert_eq!(storage.organize(&placed, AssetType::Checkpoint).unwrap(), placed);
        assert!(placed.exists());
    }

    #[test]
    fn test_copy_fallback_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("model.safetensors");
        std::fs::write(&src, b"weights").unwrap();

        // a non-empty directory at the destination makes the final rename fail
        let dest = dir.path().join("models").join("model.safetensors");
        std::fs::create_dir_all(dest.join("occupied")).unwrap();
        assert!(copy_into_place(&src, &dest).is_err());
        assert!(move_file(&src, &dest).is_err());

        assert_eq!(std::fs::read(&src).unwrap(), b"weights");
        let leftovers: Vec<_> = std::fs::read_dir(dest.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("model.safetensors")]);

        let clean = dir.path().join("elsewhere").join("model.safetensors");
        std::fs::create_dir_all(clean.parent().unwrap()).unwrap();
        copy_into_place(&src, &clean).unwrap();
        assert_eq!(std::fs::read(&clean).unwrap(), b"weights");
        assert_eq!(std::fs::read_dir(clean.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn test_organize_rejects_directories_and_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path());
        assert!(matches!(
            storage.organize(dir.path(), AssetType::Other),
            Err(StorageError::NotAFile(_))
        ));
        assert!(matches!(
            storage.organize(&dir.path().join("missing.bin"), AssetType::Other),
            Err(StorageError::Io { .. })
        ));
    }
}
