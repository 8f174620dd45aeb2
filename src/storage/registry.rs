//! The `downloaded_assets.json` registry.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    Result,
    layout::{read_json, write_json_atomic},
};
use crate::download::Task;
use crate::verify::Digest;

pub const REGISTRY_FILE: &str = "downloaded_assets.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetEntry {
    pub url: String,
    pub size: u64,
    pub digest: Option<Digest>,
    pub downloaded_at: DateTime<Utc>,
    pub source: String,
    pub path: PathBuf,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl AssetEntry {
    /// Entry for a completed task whose file now lives at `path`.
    pub fn from_task(task: &Task, path: PathBuf) -> Self {
        let source = task
            .metadata
            .get("source")
            .cloned()
            .or_else(|| {
                url::Url::parse(&task.url)
                    .ok()
                    .and_then(|u| u.host_str().map(str::to_string))
            })
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            url: task.url.clone(),
            size: task.total_size.unwrap_or(task.bytes_written),
            digest: task.digest.clone(),
            downloaded_at: task.finished_at.unwrap_or_else(Utc::now),
            source,
            path,
            metadata: task.metadata.clone(),
        }
    }
}

type Entries = BTreeMap<String, BTreeMap<String, BTreeMap<String, AssetEntry>>>;

/// Category → subtype → name → entry, persisted as pretty JSON.
#[derive(Debug, Clone, Default)]
pub struct AssetRegistry {
    path: PathBuf,
    entries: Entries,
}

impl AssetRegistry {
    /// Load the registry at `path`, or start an empty one if it is missing.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = read_json(&path)?.unwrap_or_default();
        Ok(Self { path, entries })
    }

    pub fn save(&self) -> Result<()> {
        write_json_atomic(&self.path, &self.entries)?;
        debug!(path = ?self.path, assets = self.len(), "Saved asset registry");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&mut self, category: &str, subtype: &str, name: &str, entry: AssetEntry) {
        info!(category, subtype, name, path = ?entry.path, "Recorded asset");
        self.entries
            .entry(category.to_string())
            .or_default()
            .entry(subtype.to_string())
            .or_default()
            .insert(name.to_string(), entry);
    }

    pub fn get(&self, category: &str, subtype: &str, name: &str) -> Option<&AssetEntry> {
        self.entries.get(category)?.get(subtype)?.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &str, &AssetEntry)> {
        self.entries.iter().flat_map(|(category, subtypes)| {
            subtypes.iter().flat_map(move |(subtype, names)| {
                names
                    .iter()
                    .map(move |(name, entry)| (category.as_str(), subtype.as_str(), name.as_str(), entry))
            })
        })
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry whose path is in `removed`. Returns how many went.
    pub fn forget_paths(&mut self, removed: &[PathBuf]) -> usize {
        let mut dropped = 0;
        for subtypes in self.entries.values_mut() {
            for names in subtypes.values_mut() {
                let before = names.len();
                names.retain(|_, entry| !removed.contains(&entry.path));
                dropped += before - names.len();
            }
            subtypes.retain(|_, names| !names.is_empty());
        }
        self.entries.retain(|_, subtypes| !subtypes.is_empty());
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::AssetType;

    fn entry(path: &str) -> AssetEntry {
        let task = Task::new("https://huggingface.co/org/repo/resolve/main/a.safetensors", "/tmp", AssetType::Lora)
            .with_metadata("base_model", "sdxl");
        AssetEntry::from_task(&task, PathBuf::from(path))
    }

    #[test]
    fn test_source_falls_back_to_host() {
        let e = entry("/v/models/loras/a.safetensors");
        assert_eq!(e.source, "huggingface.co");
        assert_eq!(e.metadata["base_model"], "sdxl");

        let task = Task::new("https://example.com/x.bin", "/tmp", AssetType::Other)
            .with_metadata("source", "civitai");
        assert_eq!(AssetEntry::from_task(&task, "/x".into()).source, "civitai");
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(REGISTRY_FILE);

        let mut registry = AssetRegistry::load(&path).unwrap();
        assert!(registry.is_empty());
        registry.record("models", "loras", "a.safetensors", entry("/v/models/loras/a.safetensors"));
        registry.record("models", "vae", "b.pt", entry("/v/models/vae/b.pt"));
        registry.save().unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["models"]["loras"]["a.safetensors"]["source"], "huggingface.co");

        let reloaded = AssetRegistry::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(
            reloaded.get("models", "vae", "b.pt").map(|e| e.path.clone()),
            Some(PathBuf::from("/v/models/vae/b.pt"))
        );
    }

    #[test]
    fn test_forget_paths_prunes_empty_branches() {
        let mut registry = AssetRegistry::default();
        registry.record("models", "vae", "b.pt", entry("/v/models/vae/b.pt"));
        registry.record("models", "loras", "a.safetensors", entry("/v/models/loras/a.safetensors"));

        assert_eq!(registry.forget_paths(&[PathBuf::from("/v/models/vae/b.pt")]), 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("models", "vae", "b.pt").is_none());
        assert_eq!(registry.iter().next().map(|(_, sub, _, _)| sub), Some("loras"));
    }
}
