//! labelguard - on-device model lifecycle and streaming analysis for food labels
//!
//! This crate owns the hard part of an offline label-safety checker: keeping
//! one large on-device model downloaded, loaded and healthy, and running one
//! cancellable streaming generation at a time while the host app moves
//! between foreground and background.
//!
//! - [`ModelLifecycleManager`] downloads, loads, unloads and deletes the
//!   selected model and publishes a single authoritative [`ModelStatus`].
//! - [`InferenceCoordinator`] readies the model, runs one
//!   [`StreamingInferenceSession`] per request and cancels it when
//!   liveness is withdrawn.
//!
//! The generation runtime, OCR engine and platform grants are supplied by
//! the host through the traits in [`traits`].
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use labelguard::{InferenceCoordinator, ModelLifecycleManager, SessionEvent};
//!
//! #[tokio::main]
//! async fn main() -> labelguard::Result<()> {
//!     let manager = Arc::new(
//!         ModelLifecycleManager::builder()
//!             .loader(Arc::new(MyRuntimeLoader::default()))
//!             .build()?,
//!     );
//!     manager.download().await;
//!
//!     let coordinator = InferenceCoordinator::builder(manager).build();
//!     let mut events = coordinator.start("Ingredients: sugar, peanuts").await;
//!     while let Some(event) = events.next().await {
//!         match event {
//!             SessionEvent::Chunk(text) => print!("{text}"),
//!             terminal => {
//!                 println!("\n{}", terminal.message().unwrap_or_default());
//!                 break;
//!             }
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod preferences;
pub mod prompt;
pub mod session;
pub mod telemetry;
pub mod traits;
pub mod types;

// Re-export main types at crate root
pub use catalog::{DeviceProfile, ModelCatalog, ModelDescriptor};
pub use config::Config;
pub use coordinator::{InferenceCoordinator, InferenceCoordinatorBuilder};
pub use error::{LabelGuardError, Result};
pub use model::{
    ArtifactFetcher, ArtifactLocator, CandidatePathLocator, LifecycleConfig, MirrorFetcher,
    ModelHandle, ModelLifecycleManager, ModelLifecycleManagerBuilder,
};
pub use preferences::{JsonPreferenceStore, MemoryPreferenceStore, PreferenceStore};
pub use prompt::{OcrOutcome, SafetyVerdict, build_analysis_prompt, recognize_all};
pub use session::{
    AppPhase, LivenessEvent, LivenessMonitor, SessionConfig, SessionEvents, SessionOutcome,
    StreamingInferenceSession,
};
pub use traits::{
    ExecutionGrantProvider, FragmentStream, GenerationEngine, GrantToken, ModelLoader,
    NoopGrantProvider, TextRecognizer,
};
pub use types::{
    CancelReason, DeleteOutcome, HealthProfile, InferenceSessionState, LifecycleEvent,
    ModelStatus, PreferenceCategory, SessionEvent, SessionFailure,
};
