//! The fixed category tree and its persisted metadata record.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::{CacheEnvironment, Result, StorageError, StorageManager};
use crate::download::AssetType;

pub const LAYOUT_VERSION: &str = "1.0";
pub const METADATA_FILE: &str = "storage_metadata.json";

const STRUCTURE: &[(&str, &[&str])] = &[
    (
        "models",
        &[
            "checkpoints",
            "loras",
            "vae",
            "controlnet",
            "embeddings",
            "upscalers",
            "clip",
            "metadata",
            "other",
        ],
    ),
    ("outputs", &["txt2img", "img2img", "extras", "grids", "videos"]),
    ("cache", &["huggingface", "torch", "pip", "downloads"]),
    ("configs", &["presets", "styles", "workflows"]),
];

/// Category → subcategory → absolute path under one root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let root = std::path::absolute(root).unwrap_or_else(|_| root.to_path_buf());
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn categories() -> impl Iterator<Item = &'static str> {
        STRUCTURE.iter().map(|(category, _)| *category)
    }

    pub fn subcategories(category: &str) -> Option<&'static [&'static str]> {
        STRUCTURE
            .iter()
            .find(|(name, _)| *name == category)
            .map(|(_, subs)| *subs)
    }

    pub fn category_path(&self, category: &str) -> Result<PathBuf> {
        Self::subcategories(category)
            .map(|_| self.root.join(category))
            .ok_or_else(|| StorageError::UnknownCategory(category.to_string()))
    }

    pub fn path(&self, category: &str, subcategory: &str) -> Result<PathBuf> {
        let subs = Self::subcategories(category)
            .ok_or_else(|| StorageError::UnknownCategory(category.to_string()))?;
        if !subs.contains(&subcategory) {
            return Err(StorageError::UnknownCategory(format!(
                "{category}/{subcategory}"
            )));
        }
        Ok(self.root.join(category).join(subcategory))
    }

    /// Subdirectory of `models` an asset type lives in.
    pub fn model_subdir(asset_type: AssetType) -> &'static str {
        match asset_type {
            AssetType::Checkpoint => "checkpoints",
            AssetType::Lora => "loras",
            AssetType::Vae => "vae",
            AssetType::Controlnet => "controlnet",
            AssetType::Embedding => "embeddings",
            AssetType::Metadata => "metadata",
            AssetType::Other => "other",
        }
    }

    pub fn model_dir(&self, asset_type: AssetType) -> PathBuf {
        self.root.join("models").join(Self::model_subdir(asset_type))
    }

    /// Where transfers land before being organized.
    pub fn downloads_dir(&self) -> PathBuf {
        self.root.join("cache").join("downloads")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    pub fn structure(&self) -> BTreeMap<String, BTreeMap<String, PathBuf>> {
        STRUCTURE
            .iter()
            .map(|(category, subs)| {
                let paths = subs
                    .iter()
                    .map(|sub| (sub.to_string(), self.root.join(category).join(sub)))
                    .collect();
                (category.to_string(), paths)
            })
            .collect()
    }

    pub fn all_paths(&self) -> Vec<PathBuf> {
        self.structure()
            .into_values()
            .flat_map(BTreeMap::into_values)
            .collect()
    }

    /// `(category, subcategory)` of a path inside the tree, if any.
    pub fn classify(&self, path: &Path) -> Option<(String, Option<String>)> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut parts = relative.components().map(|c| c.as_os_str().to_string_lossy());
        let category = parts.next()?.into_owned();
        Self::subcategories(&category)?;
        let sub = parts.next().map(|s| s.into_owned());
        Some((category, sub))
    }
}

/// The JSON record written to `storage_metadata.json` in the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageMetadata {
    pub version: String,
    pub created: DateTime<Utc>,
    pub structure: BTreeMap<String, BTreeMap<String, PathBuf>>,
}

impl StorageManager {
    /// Create every layout directory and (re)write the metadata record.
    ///
    /// Safe to repeat: existing files are never touched and the original
    /// creation time is carried over.
    #[instrument(skip(self), fields(root = ?self.root()))]
    pub fn initialize(&self) -> Result<CacheEnvironment> {
        let _lock = self.lock()?;
        let layout = self.layout();

        for path in layout.all_paths() {
            std::fs::create_dir_all(&path).map_err(StorageError::io(&path))?;
        }

        let env = self.cache_environment();
        for path in env.directories() {
            std::fs::create_dir_all(path).map_err(StorageError::io(path))?;
        }

        let created = match self.read_metadata() {
            Ok(Some(existing)) => existing.created,
            Ok(None) => Utc::now(),
            Err(e) => {
                debug!(error = %e, "Replacing unreadable metadata record");
                Utc::now()
            }
        };
        let metadata = StorageMetadata {
            version: LAYOUT_VERSION.to_string(),
            created,
            structure: layout.structure(),
        };
        let target = layout.metadata_path();
        write_json_atomic(&target, &metadata)?;

        info!(directories = layout.all_paths().len(), "Storage initialized");
        Ok(env)
    }

    pub fn read_metadata(&self) -> Result<Option<StorageMetadata>> {
        read_json(&self.layout().metadata_path())
    }

    pub fn is_initialized(&self) -> bool {
        self.layout().metadata_path().is_file()
    }
}

pub(crate) fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StorageError::io(path)(e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StorageError::Json {
            path: path.to_path_buf(),
            source,
        })
}

/// Write pretty JSON next to `path` and rename it into place.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value).map_err(|source| StorageError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(StorageError::io(&tmp))?;
    std::fs::rename(&tmp, path).map_err(StorageError::io(path))?;
    Ok(())
}
