//! Symlink bindings from consumer installations into canonical storage.

use std::{
    fmt,
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::{Result, StorageError, StorageManager};

/// A downstream tool whose directory layout we know how to bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerKind {
    Automatic1111,
    Forge,
    ComfyUi,
    Fooocus,
    InvokeAi,
    SdNext,
}

/// One expected subdirectory of a consumer and the canonical path it maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    /// Relative to the consumer root.
    pub link: &'static str,
    pub category: &'static str,
    /// `None` binds the whole category.
    pub subcategory: Option<&'static str>,
}

const fn bind(
    link: &'static str,
    category: &'static str,
    subcategory: Option<&'static str>,
) -> Binding {
    Binding {
        link,
        category,
        subcategory,
    }
}

const WEBUI: &[Binding] = &[
    bind("models/Stable-diffusion", "models", Some("checkpoints")),
    bind("models/Lora", "models", Some("loras")),
    bind("models/VAE", "models", Some("vae")),
    bind("models/ControlNet", "models", Some("controlnet")),
    bind("models/ESRGAN", "models", Some("upscalers")),
    bind("embeddings", "models", Some("embeddings")),
    bind("outputs", "outputs", None),
];

const SDNEXT: &[Binding] = &[
    bind("models/Stable-diffusion", "models", Some("checkpoints")),
    bind("models/Lora", "models", Some("loras")),
    bind("models/VAE", "models", Some("vae")),
    bind("models/ControlNet", "models", Some("controlnet")),
    bind("models/ESRGAN", "models", Some("upscalers")),
    bind("models/embeddings", "models", Some("embeddings")),
    bind("outputs", "outputs", None),
];

const COMFYUI: &[Binding] = &[
    bind("models/checkpoints", "models", Some("checkpoints")),
    bind("models/loras", "models", Some("loras")),
    bind("models/vae", "models", Some("vae")),
    bind("models/controlnet", "models", Some("controlnet")),
    bind("models/embeddings", "models", Some("embeddings")),
    bind("models/upscale_models", "models", Some("upscalers")),
    bind("models/clip", "models", Some("clip")),
    bind("output", "outputs", None),
    bind("user/default/workflows", "configs", Some("workflows")),
];

const FOOOCUS: &[Binding] = &[
    bind("models/checkpoints", "models", Some("checkpoints")),
    bind("models/loras", "models", Some("loras")),
    bind("models/vae", "models", Some("vae")),
    bind("models/controlnet", "models", Some("controlnet")),
    bind("models/embeddings", "models", Some("embeddings")),
    bind("models/upscale_models", "models", Some("upscalers")),
    bind("outputs", "outputs", None),
];

const INVOKEAI: &[Binding] = &[
    bind("autoimport/main", "models", Some("checkpoints")),
    bind("autoimport/lora", "models", Some("loras")),
    bind("autoimport/vae", "models", Some("vae")),
    bind("autoimport/controlnet", "models", Some("controlnet")),
    bind("autoimport/embedding", "models", Some("embeddings")),
    bind("outputs", "outputs", None),
];

impl ConsumerKind {
    pub const ALL: [ConsumerKind; 6] = [
        Self::Automatic1111,
        Self::Forge,
        Self::ComfyUi,
        Self::Fooocus,
        Self::InvokeAi,
        Self::SdNext,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Automatic1111 => "automatic1111",
            Self::Forge => "forge",
            Self::ComfyUi => "comfyui",
            Self::Fooocus => "fooocus",
            Self::InvokeAi => "invokeai",
            Self::SdNext => "sdnext",
        }
    }

    pub fn bindings(&self) -> &'static [Binding] {
        match self {
            Self::Automatic1111 | Self::Forge => WEBUI,
            Self::SdNext => SDNEXT,
            Self::ComfyUi => COMFYUI,
            Self::Fooocus => FOOOCUS,
            Self::InvokeAi => INVOKEAI,
        }
    }
}

impl fmt::Display for ConsumerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsumerKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim().to_ascii_lowercase().replace(['-', '_', ' '], "").as_str() {
            "automatic1111" | "a1111" | "webui" | "sdwebui" => Self::Automatic1111,
            "forge" | "sdforge" => Self::Forge,
            "comfyui" | "comfy" => Self::ComfyUi,
            "fooocus" => Self::Fooocus,
            "invokeai" | "invoke" => Self::InvokeAi,
            "sdnext" | "vlad" => Self::SdNext,
            _ => return Err(StorageError::UnknownConsumer(s.to_string())),
        };
        Ok(kind)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkReport {
    /// Symlinks created, link path → canonical target.
    pub links: Vec<(PathBuf, PathBuf)>,
    /// Real directories moved aside, original → backup.
    pub backups: Vec<(PathBuf, PathBuf)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnlinkReport {
    pub removed: Vec<PathBuf>,
    /// Backups moved back, backup → original.
    pub restored: Vec<(PathBuf, PathBuf)>,
}

impl StorageManager {
    fn binding_target(&self, binding: &Binding) -> Result<PathBuf> {
        match binding.subcategory {
            Some(sub) => self.layout().path(binding.category, sub),
            None => self.layout().category_path(binding.category),
        }
    }

    /// Point every subdirectory `consumer` expects under `consumer_root` at
    /// canonical storage. Existing real directories are renamed to
    /// `<name>_backup`, never deleted.
    #[instrument(skip(self), fields(root = ?self.root()))]
    pub fn link_consumer(&self, consumer_root: &Path, consumer: ConsumerKind) -> Result<LinkReport> {
        let _lock = self.lock()?;
        let mut report = LinkReport::default();

        for binding in consumer.bindings() {
            let target = self.binding_target(binding)?;
            std::fs::create_dir_all(&target).map_err(StorageError::io(&target))?;

            let link = consumer_root.join(binding.link);
            if let Some(parent) = link.parent() {
                std::fs::create_dir_all(parent).map_err(StorageError::io(parent))?;
            }

            match std::fs::symlink_metadata(&link) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    debug!(link = ?link, "Replacing existing symlink");
                    remove_link(&link)?;
                }
                Ok(_) => {
                    let backup = free_backup_path(&link);
                    std::fs::rename(&link, &backup).map_err(StorageError::io(&link))?;
                    info!(from = ?link, to = ?backup, "Backed up existing directory");
                    report.backups.push((link.clone(), backup));
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::io(&link)(e)),
            }

            symlink_dir(&target, &link).map_err(StorageError::io(&link))?;
            debug!(link = ?link, target = ?target, "Linked");
            report.links.push((link, target));
        }

        info!(
            consumer = %consumer,
            links = report.links.len(),
            backups = report.backups.len(),
            "Consumer linked to storage"
        );
        Ok(report)
    }

    /// Undo [`link_consumer`](Self::link_consumer): drop symlinks that point
    /// into this storage root and move the newest backup back into place.
    #[instrument(skip(self), fields(root = ?self.root()))]
    pub fn unlink_consumer(
        &self,
        consumer_root: &Path,
        consumer: ConsumerKind,
    ) -> Result<UnlinkReport> {
        let _lock = self.lock()?;
        let mut report = UnlinkReport::default();

        for binding in consumer.bindings() {
            let link = consumer_root.join(binding.link);
            let Ok(meta) = std::fs::symlink_metadata(&link) else {
                continue;
            };
            if !meta.file_type().is_symlink() {
                continue;
            }
            let points_here = std::fs::read_link(&link)
                .map(|target| target.starts_with(self.root()))
                .unwrap_or(false);
            if !points_here {
                warn!(link = ?link, "Leaving symlink that points outside storage");
                continue;
            }
            remove_link(&link)?;
            report.removed.push(link.clone());

            if let Some(backup) = newest_backup_path(&link) {
                std::fs::rename(&backup, &link).map_err(StorageError::io(&backup))?;
                info!(from = ?backup, to = ?link, "Restored backup");
                report.restored.push((backup, link));
            }
        }

        info!(consumer = %consumer, removed = report.removed.len(), "Consumer unlinked");
        Ok(report)
    }
}

fn backup_candidate(link: &Path, n: usize) -> PathBuf {
    let name = link
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let backup = if n == 0 {
        format!("{name}_backup")
    } else {
        format!("{name}_backup_{n}")
    };
    link.with_file_name(backup)
}

fn exists_no_follow(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok()
}

fn free_backup_path(link: &Path) -> PathBuf {
    (0..)
        .map(|n| backup_candidate(link, n))
        .find(|candidate| !exists_no_follow(candidate))
        .unwrap_or_else(|| backup_candidate(link, 0))
}

fn newest_backup_path(link: &Path) -> Option<PathBuf> {
    let mut newest = None;
    for n in 0.. {
        let candidate = backup_candidate(link, n);
        if !exists_no_follow(&candidate) {
            break;
        }
        newest = Some(candidate);
    }
    newest
}

#[cfg(unix)]
fn symlink_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

#[cfg(unix)]
fn remove_link(link: &Path) -> Result<()> {
    std::fs::remove_file(link).map_err(StorageError::io(link))
}

#[cfg(windows)]
fn remove_link(link: &Path) -> Result<()> {
    std::fs::remove_dir(link)
        .or_else(|_| std::fs::remove_file(link))
        .map_err(StorageError::io(link))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, StorageManager, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path().join("vault"));
        storage.initialize().unwrap();
        let consumer = dir.path().join("comfy");
        std::fs::create_dir_all(&consumer).unwrap();
        (dir, storage, consumer)
    }

    #[test]
    fn test_link_backs_up_real_directories() {
        let (_dir, storage, consumer) = setup();
        let loras = consumer.join("models/loras");
        std::fs::create_dir_all(&loras).unwrap();
        std::fs::write(loras.join("mine.safetensors"), b"precious").unwrap();

        let report = storage.link_consumer(&consumer, ConsumerKind::ComfyUi).unwrap();
        assert_eq!(report.links.len(), ConsumerKind::ComfyUi.bindings().len());
        assert_eq!(report.backups.len(), 1);

        for binding in ConsumerKind::ComfyUi.bindings() {
            let link = consumer.join(binding.link);
            let meta = std::fs::symlink_metadata(&link).unwrap();
            assert!(meta.file_type().is_symlink(), "{link:?} is not a symlink");
            let target = std::fs::read_link(&link).unwrap();
            assert_eq!(target, storage.binding_target(binding).unwrap());
        }

        let backup = consumer.join("models/loras_backup");
        assert_eq!(
            std::fs::read(backup.join("mine.safetensors")).unwrap(),
            b"precious"
        );

        // files placed in storage are visible through the link
        std::fs::write(storage.root().join("models/vae/v.pt"), b"v").unwrap();
        assert!(consumer.join("models/vae/v.pt").exists());
    }

    #[test]
    fn test_relink_is_stable_and_backups_never_collide() {
        let (_dir, storage, consumer) = setup();
        let output = consumer.join("output");
        std::fs::create_dir_all(&output).unwrap();
        std::fs::create_dir_all(consumer.join("output_backup")).unwrap();

        let first = storage.link_consumer(&consumer, ConsumerKind::ComfyUi).unwrap();
        assert_eq!(first.backups, vec![(output.clone(), consumer.join("output_backup_1"))]);

        let second = storage.link_consumer(&consumer, ConsumerKind::ComfyUi).unwrap();
        assert!(second.backups.is_empty());
        assert!(std::fs::symlink_metadata(&output).unwrap().file_type().is_symlink());
    }

    #[test]
    fn test_unlink_restores_backup() {
        let (_dir, storage, consumer) = setup();
        let sd = consumer.join("models/Stable-diffusion");
        std::fs::create_dir_all(&sd).unwrap();
        std::fs::write(sd.join("old.ckpt"), b"old").unwrap();

        storage.link_consumer(&consumer, ConsumerKind::Automatic1111).unwrap();
        let report = storage.unlink_consumer(&consumer, ConsumerKind::Automatic1111).unwrap();
        assert_eq!(report.removed.len(), ConsumerKind::Automatic1111.bindings().len());
        assert_eq!(report.restored.len(), 1);

        assert!(!std::fs::symlink_metadata(&sd).unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read(sd.join("old.ckpt")).unwrap(), b"old");
        assert!(!consumer.join("models/Lora").exists());
    }

    #[test]
    fn test_consumer_names() {
        assert_eq!("ComfyUI".parse::<ConsumerKind>().unwrap(), ConsumerKind::ComfyUi);
        assert_eq!("sd-webui".parse::<ConsumerKind>().unwrap(), ConsumerKind::Automatic1111);
        assert!("photoshop".parse::<ConsumerKind>().is_err());
        for kind in ConsumerKind::ALL {
            assert_eq!(kind.as_str().parse::<ConsumerKind>().unwrap(), kind);
        }
    }
}
