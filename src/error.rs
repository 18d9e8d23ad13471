//! labelguard error types

/// labelguard error types
#[derive(Debug, thiserror::Error)]
pub enum LabelGuardError {
    // Transport errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("mirror returned HTTP {status} for {url}")]
    Status { status: u16, url: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Data errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("preference storage error: {0}")]
    Preferences(String),

    // Catalog / lifecycle errors
    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("model {0} is not downloaded")]
    ModelNotDownloaded(String),

    #[error("download cancelled")]
    DownloadCancelled,

    #[error("download failed: {0}")]
    Download(String),

    #[error("failed to load model: {0}")]
    Load(String),

    /// The selected model is in the `Error` state; carries its message.
    #[error("{0}")]
    ModelFailed(String),

    /// The lifecycle manager refused an operation from the current status.
    #[error("cannot {operation} while model is {status}")]
    InvalidState {
        operation: &'static str,
        status: String,
    },

    // Generation errors
    #[error("generation engine error: {0}")]
    Engine(String),
}

impl LabelGuardError {
    /// Whether this error is the normal result of a cancelled download.
    ///
    /// Cancellation settles status back to `NotDownloaded` and is never
    /// surfaced as `ModelStatus::Error`.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::DownloadCancelled)
    }

    /// Whether a fetch that failed with this error is worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Status { status, .. } => matches!(status, 408 | 429 | 500..=599),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for LabelGuardError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            LabelGuardError::Status {
                status: status.as_u16(),
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            }
        } else {
            LabelGuardError::Http(err.to_string())
        }
    }
}

impl From<toml::de::Error> for LabelGuardError {
    fn from(err: toml::de::Error) -> Self {
        LabelGuardError::Configuration(err.to_string())
    }
}

/// Result type alias for labelguard operations
pub type Result<T> = std::result::Result<T, LabelGuardError>;
