//! Static catalog of selectable model artifacts.
//!
//! The catalog is built once at startup and never mutated. Availability is a
//! pure function of the descriptor and the device's memory.

pub mod device;

pub use device::DeviceProfile;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::{LabelGuardError, Result};

/// Files every built-in artifact consists of.
const GEMMA_ARTIFACT_FILES: &[&str] = &[
    "config.json",
    "model.safetensors",
    "tokenizer.json",
    "tokenizer_config.json",
    "special_tokens_map.json",
];

/// Default model for new installs.
pub const DEFAULT_MODEL_ID: &str = "gemma-3-1b-it-4bit";

/// Immutable description of one downloadable model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Unique model identifier (also the artifact directory name).
    pub id: String,
    /// Display name for the UI.
    pub display_name: String,
    /// Short description.
    pub description: String,
    /// Hub repository the artifact is fetched from.
    pub repo: String,
    /// Approximate on-disk size in bytes.
    pub size_bytes: u64,
    /// Minimum device memory required to load the model.
    pub min_memory_gb: f64,
    /// Files making up the artifact.
    pub files: Vec<String>,
}

impl ModelDescriptor {
    /// Whether the device has enough memory for this model.
    pub fn is_available(&self, device: &DeviceProfile) -> bool {
        device.memory_gb >= self.min_memory_gb
    }

    /// Human-readable reason the model cannot be used, if any.
    pub fn unavailability_reason(&self, device: &DeviceProfile) -> Option<String> {
        if self.is_available(device) {
            return None;
        }
        Some(format!(
            "{} requires {:.0} GB of memory; this device has {:.1} GB",
            self.display_name, self.min_memory_gb, device.memory_gb
        ))
    }

    /// Last path segment of the hub repository (legacy directory name).
    pub fn repo_name(&self) -> &str {
        self.repo.rsplit('/').next().unwrap_or(&self.repo)
    }

    /// Approximate size formatted for display.
    pub fn size_label(&self) -> String {
        let mb = self.size_bytes as f64 / (1024.0 * 1024.0);
        if mb >= 1024.0 {
            format!("{:.1} GB", mb / 1024.0)
        } else {
            format!("{mb:.0} MB")
        }
    }
}

/// Ordered, validated set of model descriptors.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models: Vec<ModelDescriptor>,
    default_id: String,
}

impl ModelCatalog {
    /// Build a catalog, rejecting duplicate ids, empty file lists and an
    /// unknown default.
    pub fn new(models: Vec<ModelDescriptor>, default_id: impl Into<String>) -> Result<Self> {
        let default_id = default_id.into();
        let mut seen = HashSet::new();

        for model in &models {
            if !seen.insert(model.id.as_str()) {
                return Err(LabelGuardError::Configuration(format!(
                    "duplicate model id in catalog: {}",
                    model.id
                )));
            }
            if model.files.is_empty() {
                return Err(LabelGuardError::Configuration(format!(
                    "model {} lists no artifact files",
                    model.id
                )));
            }
        }

        if !seen.contains(default_id.as_str()) {
            return Err(LabelGuardError::Configuration(format!(
                "default model {default_id} is not in the catalog"
            )));
        }

        Ok(Self { models, default_id })
    }

    /// The built-in catalog shipped with the app.
    pub fn builtin() -> Self {
        let files = || GEMMA_ARTIFACT_FILES.iter().map(|f| f.to_string()).collect();
        let models = vec![
            ModelDescriptor {
                id: "gemma-3-1b-it-4bit".to_string(),
                display_name: "Gemma 3 1B".to_string(),
                description: "Fastest option. Good for short ingredient lists.".to_string(),
                repo: "mlx-community/gemma-3-1b-it-4bit".to_string(),
                size_bytes: 733 * 1024 * 1024,
                min_memory_gb: 4.0,
                files: files(),
            },
            ModelDescriptor {
                id: "gemma-2-2b-it-4bit".to_string(),
                display_name: "Gemma 2 2B".to_string(),
                description: "Balanced speed and reasoning quality.".to_string(),
                repo: "mlx-community/gemma-2-2b-it-4bit".to_string(),
                size_bytes: 1_480 * 1024 * 1024,
                min_memory_gb: 6.0,
                files: files(),
            },
            ModelDescriptor {
                id: "gemma-3-4b-it-4bit".to_string(),
                display_name: "Gemma 3 4B".to_string(),
                description: "Most thorough analysis. Needs a high-memory device.".to_string(),
                repo: "mlx-community/gemma-3-4b-it-4bit".to_string(),
                size_bytes: 2_600 * 1024 * 1024,
                min_memory_gb: 8.0,
                files: files(),
            },
        ];

        Self {
            models,
            default_id: DEFAULT_MODEL_ID.to_string(),
        }
    }

    /// All models, in catalog order.
    pub fn list_models(&self) -> &[ModelDescriptor] {
        &self.models
    }

    /// Look up a model by id.
    pub fn get(&self, id: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.id == id)
    }

    /// The catalog's default model.
    pub fn default_model(&self) -> &ModelDescriptor {
        // `new` and `builtin` guarantee the default is present.
        self.get(&self.default_id).unwrap_or(&self.models[0])
    }

    /// Models the device can run, in catalog order.
    pub fn available(&self, device: &DeviceProfile) -> Vec<&ModelDescriptor> {
        self.models.iter().filter(|m| m.is_available(device)).collect()
    }

    /// Largest model the device can run, falling back to the default.
    pub fn recommended(&self, device: &DeviceProfile) -> &ModelDescriptor {
        self.available(device)
            .into_iter()
            .max_by_key(|m| m.size_bytes)
            .unwrap_or_else(|| self.default_model())
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
