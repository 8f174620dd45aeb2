//! Model catalogs: named download entries read from JSON.
//!
//! A catalog is a JSON object mapping a display name to an entry:
//!
//! ```json
//! {
//!   "SDXL Base": {
//!     "url": "https://huggingface.co/.../sd_xl_base_1.0.safetensors",
//!     "size": 6938078334,
//!     "category": "checkpoint",
//!     "sha256": "31e35c80fc4829d14f90153f4c74cd59c90b779f6afe05a74cd6120b893f7e5b"
//!   }
//! }
//! ```

use std::{collections::BTreeMap, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::download::{AssetType, DownloadError, TaskRequest};
use crate::verify::Digest;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid catalog: {0}")]
    Json(#[from] serde_json::Error),

    #[error("entry {name:?}: {source}")]
    Entry {
        name: String,
        #[source]
        source: DownloadError,
    },

    #[error("no catalog entry named {0:?}")]
    UnknownEntry(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub url: String,
    #[serde(default)]
    pub size: Option<u64>,
    pub category: String,
    #[serde(default)]
    pub sha256: Option<Digest>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl CatalogEntry {
    pub fn to_request(&self, name: &str) -> Result<TaskRequest, CatalogError> {
        let asset_type: AssetType = self.category.parse().map_err(|source| CatalogError::Entry {
            name: name.to_string(),
            source,
        })?;
        let mut metadata = self.metadata.clone();
        metadata.insert("catalog_name".to_string(), name.to_string());
        Ok(TaskRequest {
            url: self.url.clone(),
            asset_type,
            filename: self.filename.clone(),
            expected_size: self.size,
            sha256: self.sha256.clone(),
            metadata,
            priority: self.priority,
            max_retries: None,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Catalog {
    entries: BTreeMap<String, CatalogEntry>,
}

impl Catalog {
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        Ok(serde_json::from_str(json)?)
    }

    pub async fn load(path: &Path) -> Result<Self, CatalogError> {
        let json = tokio::fs::read_to_string(path).await?;
        let catalog = Self::from_json(&json)?;
        debug!(path = ?path, entries = catalog.len(), "Loaded catalog");
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&CatalogEntry> {
        self.entries.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Requests for the named entries, or every entry when `names` is empty.
    pub fn requests(&self, names: &[String]) -> Result<Vec<TaskRequest>, CatalogError> {
        if names.is_empty() {
            return self
                .entries
                .iter()
                .map(|(name, entry)| entry.to_request(name))
                .collect();
        }
        names
            .iter()
            .map(|name| {
                self.get(name)
                    .ok_or_else(|| CatalogError::UnknownEntry(name.clone()))?
                    .to_request(name)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "SDXL Base": {
            "url": "https://example.com/sd_xl_base_1.0.safetensors",
            "size": 6938078334,
            "category": "checkpoints",
            "sha256": "31E35C80FC4829D14F90153F4C74CD59C90B779F6AFE05A74CD6120B893F7E5B"
        },
        "Detail Tweaker": {
            "url": "https://example.com/dl/58390",
            "category": "lora",
            "filename": "add_detail.safetensors",
            "priority": 2,
            "metadata": {"source": "civitai"}
        }
    }"#;

    #[test]
    fn test_entries_become_requests() {
        let catalog = Catalog::from_json(CATALOG).unwrap();
        assert_eq!(catalog.len(), 2);

        let requests = catalog.requests(&[]).unwrap();
        assert_eq!(requests.len(), 2);

        let lora = catalog.requests(&["Detail Tweaker".to_string()]).unwrap().remove(0);
        assert_eq!(lora.asset_type, AssetType::Lora);
        assert_eq!(lora.priority, 2);
        let task = lora.into_task("/tmp");
        assert_eq!(task.filename, "add_detail.safetensors");
        assert_eq!(task.metadata["catalog_name"], "Detail Tweaker");
        assert_eq!(task.metadata["source"], "civitai");

        let sdxl = catalog.get("SDXL Base").unwrap().to_request("SDXL Base").unwrap();
        assert_eq!(sdxl.asset_type, AssetType::Checkpoint);
        assert_eq!(sdxl.expected_size, Some(6938078334));
        assert!(sdxl.sha256.unwrap().as_str().starts_with("31e35c80"));
    }

    #[test]
    fn test_bad_entries_are_reported_by_name() {
        let catalog = Catalog::from_json(
            r#"{"x": {"url": "https://example.com/x", "category": "tokenizer"}}"#,
        )
        .unwrap();
        let err = catalog.requests(&[]).unwrap_err();
        assert!(err.to_string().contains("\"x\""));
        assert!(matches!(
            catalog.requests(&["missing".to_string()]),
            Err(CatalogError::UnknownEntry(_))
        ));
        assert!(Catalog::from_json(r#"{"x": {"url": 1}}"#).is_err());
    }
}
