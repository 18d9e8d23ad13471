//! Shared data types.

pub mod profile;
pub mod session;
pub mod status;

pub use profile::{HealthProfile, PreferenceCategory};
pub use session::{CancelReason, InferenceSessionState, SessionEvent, SessionFailure};
pub use status::{DeleteOutcome, LifecycleEvent, ModelStatus};
