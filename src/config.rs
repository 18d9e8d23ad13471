//! Configuration loading.
//!
//! Configuration is loaded from TOML with the following resolution order:
//! 1. Explicit path (error if it does not exist)
//! 2. `<config_dir>/labelguard/config.toml` (user)
//! 3. Built-in defaults
//!
//! `LABELGUARD_MODELS_DIR` overrides the models directory from any source.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::catalog::{DeviceProfile, ModelCatalog};
use crate::model::{
    CandidatePathLocator, DEFAULT_MIRROR_URL, LifecycleConfig, MODELS_DIR_ENV, MirrorFetcher,
    default_hub_cache_dir, default_models_dir,
};
use crate::session::SessionConfig;
use crate::{LabelGuardError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub preferences: PreferencesConfig,
}

/// Model storage and lifecycle.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    /// Directory for downloaded artifacts.
    #[serde(default)]
    pub models_dir: Option<PathBuf>,
    /// Hugging Face hub cache to search for older downloads.
    #[serde(default)]
    pub hub_cache_dir: Option<PathBuf>,
    /// Model selected on first start.
    #[serde(default)]
    pub default_model: Option<String>,
    /// Override detected device memory.
    #[serde(default)]
    pub device_memory_gb: Option<f64>,
    /// Pause between unload and load (default: 500).
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            models_dir: None,
            hub_cache_dir: None,
            default_model: None,
            device_memory_gb: None,
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

fn default_settle_delay_ms() -> u64 {
    500
}

/// Artifact download.
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadConfig {
    /// Mirror base URL (default: https://huggingface.co).
    #[serde(default = "default_mirror_url")]
    pub mirror_url: String,
    /// Progress update interval (default: 250).
    #[serde(default = "default_progress_tick_ms")]
    pub progress_tick_ms: u64,
    /// Highest progress shown before completion (default: 0.9).
    #[serde(default = "default_progress_ceiling")]
    pub progress_ceiling: f64,
    /// Attempts per file (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Per-request timeout in seconds (default: 3600).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            mirror_url: default_mirror_url(),
            progress_tick_ms: default_progress_tick_ms(),
            progress_ceiling: default_progress_ceiling(),
            max_attempts: default_max_attempts(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_mirror_url() -> String {
    DEFAULT_MIRROR_URL.to_string()
}

fn default_progress_tick_ms() -> u64 {
    250
}

fn default_progress_ceiling() -> f64 {
    0.9
}

fn default_max_attempts() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    3600
}

/// Preference storage.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PreferencesConfig {
    /// Preference file (default: `<config_dir>/labelguard/preferences.json`).
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the standard locations.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        match Self::resolve_config_path(explicit_path)? {
            Some(path) => Self::load_from_file(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            LabelGuardError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            LabelGuardError::Configuration(format!("Failed to parse config file {path:?}: {e}"))
        })
    }

    /// Resolve the config file path. `None` means use defaults.
    fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(Some(path.to_path_buf()));
            }
            return Err(LabelGuardError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        Ok(user_config_dir()
            .map(|dir| dir.join("config.toml"))
            .filter(|path| path.exists()))
    }

    /// Models directory: environment, then config, then the default.
    pub fn models_dir(&self) -> PathBuf {
        resolve_models_dir(
            std::env::var(MODELS_DIR_ENV).ok(),
            self.models.models_dir.as_deref(),
        )
    }

    pub fn preferences_path(&self) -> PathBuf {
        self.preferences.path.clone().unwrap_or_else(|| {
            user_config_dir()
                .unwrap_or_else(|| PathBuf::from(".labelguard"))
                .join("preferences.json")
        })
    }

    pub fn device_profile(&self) -> DeviceProfile {
        match self.models.device_memory_gb {
            Some(gb) => DeviceProfile::with_memory_gb(gb),
            None => DeviceProfile::detect(),
        }
    }

    /// Built-in catalog, with `models.default_model` as its default.
    pub fn catalog(&self) -> Result<ModelCatalog> {
        let builtin = ModelCatalog::builtin();
        match &self.models.default_model {
            Some(id) => ModelCatalog::new(builtin.list_models().to_vec(), id.clone()),
            None => Ok(builtin),
        }
    }

    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            settle_delay: Duration::from_millis(self.models.settle_delay_ms),
            progress_tick: Duration::from_millis(self.download.progress_tick_ms.max(1)),
            progress_ceiling: self.download.progress_ceiling,
        }
    }

    pub fn locator(&self) -> CandidatePathLocator {
        let locator = CandidatePathLocator::new(self.models_dir());
        match self.models.hub_cache_dir.clone().or_else(default_hub_cache_dir) {
            Some(hub) => locator.with_hub_cache(hub),
            None => locator,
        }
    }

    pub fn fetcher(&self) -> Result<MirrorFetcher> {
        Ok(MirrorFetcher::with_timeout(
            &self.download.mirror_url,
            Duration::from_secs(self.download.timeout_secs),
        )?
        .max_attempts(self.download.max_attempts))
    }
}

/// `<config_dir>/labelguard`.
fn user_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("labelguard"))
}

fn resolve_models_dir(env: Option<String>, configured: Option<&Path>) -> PathBuf {
    match (env.filter(|v| !v.is_empty()), configured) {
        (Some(dir), _) => PathBuf::from(dir),
        (None, Some(dir)) => dir.to_path_buf(),
        (None, None) => default_models_dir(),
    }
}
