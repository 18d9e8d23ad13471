//! Persisted user preferences: the selected model and dietary profile.
//!
//! The store is plain key/value persistence. It is read when a prompt is
//! built and when the lifecycle manager starts; it is written by explicit
//! selection commands only.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{HealthProfile, PreferenceCategory};
use crate::{LabelGuardError, Result};

/// Key/value persistence for the selected model and category index sets.
pub trait PreferenceStore: Send + Sync {
    /// Persisted model id, if one was ever selected.
    fn selected_model(&self) -> Option<String>;

    fn set_selected_model(&self, id: &str) -> Result<()>;

    /// Selected option indices for one category.
    fn indices(&self, category: PreferenceCategory) -> BTreeSet<usize>;

    fn set_indices(&self, category: PreferenceCategory, indices: BTreeSet<usize>) -> Result<()>;

    /// All categories assembled into a profile.
    fn profile(&self) -> HealthProfile {
        PreferenceCategory::ALL
            .into_iter()
            .fold(HealthProfile::new(), |profile, category| {
                profile.with(category, self.indices(category))
            })
    }
}

/// On-disk shape of the preference file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct StoredPreferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    selected_model: Option<String>,
    /// Keyed by [`PreferenceCategory::key`].
    #[serde(default)]
    selections: BTreeMap<String, BTreeSet<usize>>,
}

impl StoredPreferences {
    fn indices(&self, category: PreferenceCategory) -> BTreeSet<usize> {
        self.selections
            .get(category.key())
            .cloned()
            .unwrap_or_default()
    }

    fn set_indices(&mut self, category: PreferenceCategory, indices: BTreeSet<usize>) {
        if indices.is_empty() {
            self.selections.remove(category.key());
        } else {
            self.selections.insert(category.key().to_string(), indices);
        }
    }
}

fn lock_error<T>(e: std::sync::PoisonError<T>) -> LabelGuardError {
    LabelGuardError::Preferences(format!("preference lock poisoned: {e}"))
}

/// Preferences kept in a JSON file, rewritten atomically on every change.
#[derive(Debug)]
pub struct JsonPreferenceStore {
    path: PathBuf,
    state: Mutex<StoredPreferences>,
}

impl JsonPreferenceStore {
    /// Open the store at `path`. A missing or corrupt file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = load_preferences(&path).unwrap_or_default();
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn update(&self, apply: impl FnOnce(&mut StoredPreferences)) -> Result<()> {
        let mut state = self.state.lock().map_err(lock_error)?;
        let mut next = state.clone();
        apply(&mut next);
        save_preferences(&self.path, &next)?;
        *state = next;
        Ok(())
    }
}

impl PreferenceStore for JsonPreferenceStore {
    fn selected_model(&self) -> Option<String> {
        self.state.lock().ok()?.selected_model.clone()
    }

    fn set_selected_model(&self, id: &str) -> Result<()> {
        self.update(|state| state.selected_model = Some(id.to_string()))
    }

    fn indices(&self, category: PreferenceCategory) -> BTreeSet<usize> {
        self.state
            .lock()
            .map(|state| state.indices(category))
            .unwrap_or_default()
    }

    fn set_indices(&self, category: PreferenceCategory, indices: BTreeSet<usize>) -> Result<()> {
        self.update(|state| state.set_indices(category, indices))
    }
}

/// Read preferences from disk. `None` on a missing or corrupt file.
fn load_preferences(path: &Path) -> Option<StoredPreferences> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no preference file yet");
            return None;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read preferences");
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(prefs) => Some(prefs),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt preference file, starting empty");
            None
        }
    }
}

/// Write preferences via tmp file + rename.
fn save_preferences(path: &Path, prefs: &StoredPreferences) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            LabelGuardError::Preferences(format!(
                "failed to create preference dir {}: {e}",
                parent.display()
            ))
        })?;
    }

    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(prefs)?;
    std::fs::write(&tmp_path, &json).map_err(|e| {
        LabelGuardError::Preferences(format!(
            "failed to write preference file {}: {e}",
            tmp_path.display()
        ))
    })?;
    std::fs::rename(&tmp_path, path).map_err(|e| {
        LabelGuardError::Preferences(format!(
            "failed to rename preference file {} to {}: {e}",
            tmp_path.display(),
            path.display()
        ))
    })?;

    Ok(())
}

/// In-process preferences, lost on exit.
#[derive(Debug, Default)]
pub struct MemoryPreferenceStore {
    state: Mutex<StoredPreferences>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a selected model already persisted.
    pub fn with_selected_model(id: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(StoredPreferences {
                selected_model: Some(id.into()),
                ..StoredPreferences::default()
            }),
        }
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn selected_model(&self) -> Option<String> {
        self.state.lock().ok()?.selected_model.clone()
    }

    fn set_selected_model(&self, id: &str) -> Result<()> {
        self.state.lock().map_err(lock_error)?.selected_model = Some(id.to_string());
        Ok(())
    }

    fn indices(&self, category: PreferenceCategory) -> BTreeSet<usize> {
        self.state
            .lock()
            .map(|state| state.indices(category))
            .unwrap_or_default()
    }

    fn set_indices(&self, category: PreferenceCategory, indices: BTreeSet<usize>) -> Result<()> {
        self.state
            .lock()
            .map_err(lock_error)?
            .set_indices(category, indices);
        Ok(())
    }
}
