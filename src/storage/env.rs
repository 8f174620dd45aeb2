use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::StorageManager;

/// Cache locations that downstream tools should inherit.
///
/// This is a plain value; nothing here touches the current process
/// environment. Launchers apply it to the child processes they spawn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEnvironment {
    pub hf_home: PathBuf,
    pub hf_hub_cache: PathBuf,
    pub transformers_cache: PathBuf,
    pub torch_home: PathBuf,
    pub pip_cache_dir: PathBuf,
}

impl CacheEnvironment {
    pub fn for_root(root: &Path) -> Self {
        let cache = root.join("cache");
        let hf_home = cache.join("huggingface");
        Self {
            hf_hub_cache: hf_home.join("hub"),
            transformers_cache: hf_home.join("hub"),
            hf_home,
            torch_home: cache.join("torch"),
            pip_cache_dir: cache.join("pip"),
        }
    }

    pub fn vars(&self) -> [(&'static str, &Path); 5] {
        [
            ("HF_HOME", &self.hf_home),
            ("HF_HUB_CACHE", &self.hf_hub_cache),
            ("TRANSFORMERS_CACHE", &self.transformers_cache),
            ("TORCH_HOME", &self.torch_home),
            ("PIP_CACHE_DIR", &self.pip_cache_dir),
        ]
    }

    pub fn directories(&self) -> impl Iterator<Item = &Path> {
        [
            self.hf_home.as_path(),
            self.hf_hub_cache.as_path(),
            self.torch_home.as_path(),
            self.pip_cache_dir.as_path(),
        ]
        .into_iter()
    }

    pub fn apply(&self, command: &mut std::process::Command) {
        for (key, value) in self.vars() {
            command.env(key, value);
        }
    }

    /// `export KEY='value'` lines for a POSIX shell.
    pub fn shell_exports(&self) -> String {
        self.vars()
            .iter()
            .map(|(key, value)| {
                let value = value.display().to_string().replace('\'', r"'\''");
                format!("export {key}='{value}'\n")
            })
            .collect()
    }
}

impl StorageManager {
    pub fn cache_environment(&self) -> CacheEnvironment {
        CacheEnvironment::for_root(self.root())
    }
}
