//! Model lifecycle status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of the currently selected model.
///
/// Exactly one value is authoritative at a time; it is owned and written by
/// [`ModelLifecycleManager`](crate::ModelLifecycleManager) only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ModelStatus {
    /// No artifact for the selected model exists in the store.
    NotDownloaded,

    /// Artifact fetch in flight. `progress` is in `0.0..=1.0`.
    Downloading { progress: f64 },

    /// Artifact is on disk but nothing is resident in memory.
    Downloaded,

    /// Artifact is being materialized into memory.
    Loading,

    /// A resident handle exists and can serve generation sessions.
    Loaded,

    /// The last download or load failed.
    Error { message: String },
}

impl ModelStatus {
    /// Whether an operation is in flight (`Downloading` or `Loading`).
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Downloading { .. } | Self::Loading)
    }

    pub fn is_downloading(&self) -> bool {
        matches!(self, Self::Downloading { .. })
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded)
    }

    /// Download progress, meaningful only while `Downloading`.
    pub fn progress(&self) -> Option<f64> {
        match self {
            Self::Downloading { progress } => Some(*progress),
            _ => None,
        }
    }

    /// Error message, if this is the `Error` state.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Error { message } => Some(message),
            _ => None,
        }
    }

    /// Short machine-readable name, used in logs and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotDownloaded => "not_downloaded",
            Self::Downloading { .. } => "downloading",
            Self::Downloaded => "downloaded",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Error { .. } => "error",
        }
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Downloading { progress } => {
                write!(f, "downloading ({:.0}%)", progress * 100.0)
            }
            Self::Error { message } => write!(f, "error: {message}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// One status transition, broadcast in production order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// Model the transition applies to.
    pub model_id: String,
    /// Status after the transition.
    pub status: ModelStatus,
}

/// Result of [`ModelLifecycleManager::delete`](crate::ModelLifecycleManager::delete).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// At least one artifact location existed and removal was attempted.
    Deleted {
        /// Locations that were removed.
        removed: Vec<std::path::PathBuf>,
    },
    /// No artifact location existed before the call.
    NothingToDelete,
}
