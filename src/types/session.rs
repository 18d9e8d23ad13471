//! Types for streaming inference sessions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coordinator-side state of the (single) generation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InferenceSessionState {
    /// No session is active.
    #[default]
    Idle,
    /// A session is generating.
    Running { session_id: u64 },
    /// The session has been told to cancel and is settling.
    Cancelling { session_id: u64 },
}

impl InferenceSessionState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Session id for `Running`/`Cancelling`.
    pub fn session_id(&self) -> Option<u64> {
        match self {
            Self::Idle => None,
            Self::Running { session_id } | Self::Cancelling { session_id } => Some(*session_id),
        }
    }
}

/// Why a session did not produce an answer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SessionFailure {
    /// Liveness was false before generation started.
    #[error("The app is not active. Keep the app open to analyze the label.")]
    NotActive,

    /// Liveness was withdrawn while generation was running.
    #[error("Analysis stopped because the app went inactive.")]
    WentInactive,

    /// The generation engine failed.
    #[error("Analysis failed: {0}")]
    Engine(String),

    /// The model could not be brought to `Loaded`.
    #[error("Model unavailable: {0}")]
    Lifecycle(String),
}

impl SessionFailure {
    /// Whether this failure is a liveness withdrawal (expected, not a bug).
    pub fn is_liveness(&self) -> bool {
        matches!(self, Self::NotActive | Self::WentInactive)
    }

    /// Metric label for this failure.
    pub fn label(&self) -> &'static str {
        match self {
            Self::NotActive => "not_active",
            Self::WentInactive => "went_inactive",
            Self::Engine(_) => "engine_failure",
            Self::Lifecycle(_) => "lifecycle_failure",
        }
    }
}

/// Why the coordinator cancelled a running session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// A new request replaced the running one.
    Superseded,
    /// The user pressed cancel.
    UserRequested,
    /// The app lost focus but is still visible.
    ResignedActive,
    /// The app moved to the background.
    EnteredBackground,
    /// The OS background-execution allowance ran out.
    BackgroundDeadline,
    /// Any other caller-supplied reason.
    Custom(String),
}

impl CancelReason {
    /// Metric label for this reason.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Superseded => "superseded",
            Self::UserRequested => "user",
            Self::ResignedActive => "resigned_active",
            Self::EnteredBackground => "background",
            Self::BackgroundDeadline => "background_deadline",
            Self::Custom(_) => "custom",
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Superseded => f.write_str("a new analysis was started"),
            Self::UserRequested => f.write_str("cancelled by user"),
            Self::ResignedActive => f.write_str("the app became inactive"),
            Self::EnteredBackground => f.write_str("the app moved to the background"),
            Self::BackgroundDeadline => f.write_str("background time expired"),
            Self::Custom(reason) => f.write_str(reason),
        }
    }
}

/// Events delivered to the consumer of one session, in order.
///
/// A session delivers zero or more `Chunk`s followed by exactly one
/// terminal event (`Done`, `Cancelled` or `Failed`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Newly generated text since the previous chunk.
    Chunk(String),

    /// Generation completed; the full answer with the sentinel stripped.
    Done(String),

    /// The session was cancelled by the coordinator.
    Cancelled { reason: CancelReason },

    /// The session failed.
    Failed(SessionFailure),
}

impl SessionEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Chunk(_))
    }

    /// The user-visible message for a terminal event.
    pub fn message(&self) -> Option<String> {
        match self {
            Self::Chunk(_) => None,
            Self::Done(text) => Some(text.clone()),
            Self::Cancelled { reason } => Some(format!("Analysis cancelled: {reason}.")),
            Self::Failed(failure) => Some(failure.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_message_embeds_reason() {
        let event = SessionEvent::Cancelled {
            reason: CancelReason::EnteredBackground,
        };
        assert_eq!(
            event.message().unwrap(),
            "Analysis cancelled: the app moved to the background."
        );
    }

    #[test]
    fn engine_failure_has_generic_prefix() {
        let failure = SessionFailure::Engine("out of memory".into());
        assert_eq!(failure.to_string(), "Analysis failed: out of memory");
        assert!(!failure.is_liveness());
        assert!(SessionFailure::WentInactive.is_liveness());
    }

    #[test]
    fn chunks_are_not_terminal() {
        assert!(!SessionEvent::Chunk("a".into()).is_terminal());
        assert!(SessionEvent::Done("a".into()).is_terminal());
        assert!(SessionEvent::Failed(SessionFailure::NotActive).is_terminal());
        assert!(SessionEvent::Chunk("a".into()).message().is_none());
    }

    #[test]
    fn state_session_id() {
        assert_eq!(InferenceSessionState::Idle.session_id(), None);
        assert_eq!(
            InferenceSessionState::Cancelling { session_id: 7 }.session_id(),
            Some(7)
        );
    }
}
