//! Artifact lookup across the primary, legacy and hub-cache layouts.
//!
//! Lookup is a pure, side-effect-free scan of an ordered candidate list: the
//! first directory holding a complete artifact wins. Older installs stored
//! artifacts under the repository name or in the Hugging Face hub cache; those
//! locations are still searched (and deleted) but never written to.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::catalog::ModelDescriptor;

/// Strategy for finding a model's artifact in storage.
pub trait ArtifactLocator: Send + Sync {
    /// Directory new downloads are written to.
    fn download_dir(&self, descriptor: &ModelDescriptor) -> PathBuf;

    /// Directories that may hold the artifact, in priority order.
    fn search_paths(&self, descriptor: &ModelDescriptor) -> Vec<PathBuf>;

    /// Every location that belongs to this model and must go on delete.
    fn storage_roots(&self, descriptor: &ModelDescriptor) -> Vec<PathBuf>;

    /// First search path holding a complete artifact.
    fn locate(&self, descriptor: &ModelDescriptor) -> Option<PathBuf> {
        let paths = self.search_paths(descriptor);
        let found = paths.iter().position(|p| is_complete_artifact(p))?;
        let path = paths[found].clone();

        if found > 0 {
            warn!(
                model_id = %descriptor.id,
                path = %path.display(),
                "artifact found outside the primary location"
            );
        }
        let duplicates = paths[found + 1..]
            .iter()
            .filter(|p| is_complete_artifact(p))
            .count();
        if duplicates > 0 {
            warn!(
                model_id = %descriptor.id,
                duplicates,
                "multiple copies of artifact on disk, using the first"
            );
        }

        Some(path)
    }
}

/// Whether `dir` holds `config.json` and at least one `*.safetensors` file.
pub fn is_complete_artifact(dir: &Path) -> bool {
    if !dir.join("config.json").is_file() {
        return false;
    }
    std::fs::read_dir(dir)
        .map(|entries| {
            entries.filter_map(|e| e.ok()).any(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "safetensors")
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

/// Default locator: `<models_dir>/<id>`, then `<models_dir>/<repo-name>`,
/// then hub-cache snapshots.
#[derive(Debug, Clone)]
pub struct CandidatePathLocator {
    models_dir: PathBuf,
    hub_cache_dir: Option<PathBuf>,
}

impl CandidatePathLocator {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            hub_cache_dir: None,
        }
    }

    /// Also search a Hugging Face hub cache (`.../huggingface/hub`).
    pub fn with_hub_cache(mut self, dir: impl Into<PathBuf>) -> Self {
        self.hub_cache_dir = Some(dir.into());
        self
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    fn legacy_dir(&self, descriptor: &ModelDescriptor) -> Option<PathBuf> {
        let name = descriptor.repo_name();
        (name != descriptor.id).then(|| self.models_dir.join(name))
    }

    /// `models--<org>--<name>` under the hub cache.
    fn hub_repo_dir(&self, descriptor: &ModelDescriptor) -> Option<PathBuf> {
        let hub = self.hub_cache_dir.as_ref()?;
        let folder = format!("models--{}", descriptor.repo.replace('/', "--"));
        Some(hub.join(folder))
    }

    /// Snapshot directories of the hub repo, newest name last.
    fn hub_snapshots(&self, descriptor: &ModelDescriptor) -> Vec<PathBuf> {
        let Some(repo_dir) = self.hub_repo_dir(descriptor) else {
            return Vec::new();
        };
        let mut snapshots: Vec<PathBuf> = std::fs::read_dir(repo_dir.join("snapshots"))
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.is_dir())
                    .collect()
            })
            .unwrap_or_default();
        snapshots.sort();
        snapshots
    }
}

impl ArtifactLocator for CandidatePathLocator {
    fn download_dir(&self, descriptor: &ModelDescriptor) -> PathBuf {
        self.models_dir.join(&descriptor.id)
    }

    fn search_paths(&self, descriptor: &ModelDescriptor) -> Vec<PathBuf> {
        let mut paths = vec![self.download_dir(descriptor)];
        paths.extend(self.legacy_dir(descriptor));
        paths.extend(self.hub_snapshots(descriptor));
        debug!(model_id = %descriptor.id, candidates = paths.len(), "artifact search paths");
        paths
    }

    fn storage_roots(&self, descriptor: &ModelDescriptor) -> Vec<PathBuf> {
        let mut roots = vec![self.download_dir(descriptor)];
        roots.extend(self.legacy_dir(descriptor));
        roots.extend(self.hub_repo_dir(descriptor));
        roots
    }
}
