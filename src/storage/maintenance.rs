//! Read-only accounting and the mutating cleanup passes.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
};

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::{Result, StorageError, StorageLayout, StorageManager};
use crate::verify::{self, Digest};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    pub files: u64,
    pub bytes: u64,
}

impl UsageStats {
    fn add(&mut self, bytes: u64) {
        self.files += 1;
        self.bytes += bytes;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CategoryUsage {
    #[serde(flatten)]
    pub total: UsageStats,
    pub subcategories: BTreeMap<String, UsageStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageReport {
    pub categories: BTreeMap<String, CategoryUsage>,
    pub total: UsageStats,
    /// Free space on the filesystem holding the root, when it can be read.
    pub available_bytes: Option<u64>,
}

/// One file removed by [`StorageManager::deduplicate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Duplicate {
    pub removed: PathBuf,
    pub kept: PathBuf,
    pub digest: Digest,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DedupReport {
    pub duplicates: Vec<Duplicate>,
    pub bytes_freed: u64,
}

impl DedupReport {
    pub fn removed_count(&self) -> usize {
        self.duplicates.len()
    }
}

/// Regular files under `dir` in a stable order. Symlinks are not followed
/// and not returned.
fn walk_files(dir: &Path) -> Result<Vec<(PathBuf, u64)>> {
    let mut files = Vec::new();
    if !dir.is_dir() {
        return Ok(files);
    }
    for entry in jwalk::WalkDir::new(dir)
        .sort(true)
        .follow_links(false)
        .skip_hidden(false)
    {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let size = entry.metadata()?.len();
        files.push((path, size));
    }
    Ok(files)
}

impl StorageManager {
    /// Per-category file counts and byte totals. Never mutates.
    pub fn usage(&self) -> Result<UsageReport> {
        let layout = self.layout();
        let mut report = UsageReport::default();

        for category in StorageLayout::categories() {
            let dir = layout.category_path(category)?;
            let mut usage = CategoryUsage::default();
            for sub in StorageLayout::subcategories(category).unwrap_or_default() {
                usage.subcategories.insert(sub.to_string(), UsageStats::default());
            }

            for (path, size) in walk_files(&dir)? {
                usage.total.add(size);
                report.total.add(size);
                let sub = path
                    .strip_prefix(&dir)
                    .ok()
                    .and_then(|rel| rel.components().next())
                    .filter(|_| path.parent() != Some(dir.as_path()))
                    .map(|c| c.as_os_str().to_string_lossy().into_owned());
                if let Some(sub) = sub {
                    usage.subcategories.entry(sub).or_default().add(size);
                }
            }
            report.categories.insert(category.to_string(), usage);
        }

        report.available_bytes = fs2::available_space(self.root()).ok();
        debug!(files = report.total.files, bytes = report.total.bytes, "Computed usage");
        Ok(report)
    }

    /// Remove byte-identical files across the whole managed tree, keeping the
    /// first one in walk order.
    ///
    /// Files are grouped by size first so only size collisions get hashed.
    /// Duplicates are collapsed even across categories; those get a warning.
    #[instrument(skip(self), fields(root = ?self.root()))]
    pub fn deduplicate(&self) -> Result<DedupReport> {
        let _lock = self.lock()?;
        let layout = self.layout();

        let mut files = Vec::new();
        for category in StorageLayout::categories() {
            files.extend(walk_files(&layout.category_path(category)?)?);
        }

        let mut by_size: BTreeMap<u64, Vec<PathBuf>> = BTreeMap::new();
        for (path, size) in files {
            if size > 0 {
                by_size.entry(size).or_default().push(path);
            }
        }

        let mut report = DedupReport::default();
        for (size, paths) in by_size.into_iter().filter(|(_, p)| p.len() > 1) {
            let mut first_seen: HashMap<Digest, PathBuf> = HashMap::new();
            for path in paths {
                let digest = match verify::hash_file(&path) {
                    Ok(digest) => digest,
                    Err(e) => {
                        warn!(path = ?path, error = %e, "Skipping unreadable file");
                        continue;
                    }
                };
                let Some(kept) = first_seen.get(&digest) else {
                    first_seen.insert(digest, path);
                    continue;
                };

                if layout.classify(kept) != layout.classify(&path) {
                    warn!(
                        kept = ?kept,
                        removed = ?path,
                        "Removing duplicate from a different category"
                    );
                }
                std::fs::remove_file(&path).map_err(StorageError::io(&path))?;
                debug!(kept = ?kept, removed = ?path, "Removed duplicate");
                report.bytes_freed += size;
                report.duplicates.push(Duplicate {
                    removed: path,
                    kept: kept.clone(),
                    digest,
                    size,
                });
            }
        }

        info!(
            removed = report.removed_count(),
            bytes_freed = report.bytes_freed,
            "Deduplication finished"
        );
        Ok(report)
    }

    /// Empty one `cache/*` directory, keeping the directory itself. Returns
    /// the number of top-level entries removed.
    #[instrument(skip(self), fields(root = ?self.root()))]
    pub fn clear_cache(&self, subcategory: &str) -> Result<usize> {
        let dir = self.layout().path("cache", subcategory)?;
        let _lock = self.lock()?;

        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StorageError::io(&dir)(e)),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(StorageError::io(&dir))?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(StorageError::io(&path))?;
            let result = if file_type.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            result.map_err(StorageError::io(&path))?;
            removed += 1;
        }

        info!(cache = subcategory, removed, "Cache cleared");
        Ok(removed)
    }
}
