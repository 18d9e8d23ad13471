//! Model artifact storage, fetching and lifecycle.

pub mod download;
pub mod handle;
pub mod locator;
pub mod manager;

use std::path::PathBuf;

pub use download::{
    ArtifactFetcher, DEFAULT_MIRROR_URL, DownloadProgress, MirrorFetcher, ProgressEstimator,
};
pub use handle::ModelHandle;
pub use locator::{ArtifactLocator, CandidatePathLocator, is_complete_artifact};
pub use manager::{LifecycleConfig, ModelLifecycleManager, ModelLifecycleManagerBuilder};

/// Environment variable overriding the models directory.
pub const MODELS_DIR_ENV: &str = "LABELGUARD_MODELS_DIR";

/// `$LABELGUARD_MODELS_DIR`, else `<cache_dir>/labelguard/models`.
pub fn default_models_dir() -> PathBuf {
    std::env::var(MODELS_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from(".cache"))
                .join("labelguard")
                .join("models")
        })
}

/// Default Hugging Face hub cache, searched for artifacts from older installs.
pub fn default_hub_cache_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".cache").join("huggingface").join("hub"))
}
