//! Collaborator traits at the boundary of the lifecycle and session core.
//!
//! The concrete generation runtime, OCR engine and platform execution grants
//! live outside this crate. Hosts implement these traits and hand them to
//! [`ModelLifecycleManager`](crate::ModelLifecycleManager) and
//! [`InferenceCoordinator`](crate::InferenceCoordinator).

use async_trait::async_trait;
use futures_util::Stream;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use crate::Result;
use crate::catalog::ModelDescriptor;
use crate::prompt::OcrOutcome;

/// Lazy, in-order, finite sequence of generated text fragments.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Materializes an on-disk artifact into a resident generation engine.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    /// Loader name for logging.
    fn name(&self) -> &str;

    /// Load the artifact at `artifact_dir` into memory.
    ///
    /// The returned engine is owned by the lifecycle manager; dropping the
    /// last reference must release its accelerator resources.
    async fn load(
        &self,
        descriptor: &ModelDescriptor,
        artifact_dir: &Path,
    ) -> Result<Arc<dyn GenerationEngine>>;
}

/// A resident model that can stream text for a prompt.
#[async_trait]
pub trait GenerationEngine: Send + Sync {
    /// Start generating for `prompt`.
    ///
    /// Fragments are pulled on demand; the consumer stops pulling once it
    /// sees the end-of-turn sentinel or is cancelled, and drops the stream.
    async fn generate(&self, prompt: &str) -> Result<FragmentStream>;
}

/// Extracts text from one label image. Never fails past this boundary.
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    async fn recognize(&self, image: &[u8]) -> OcrOutcome;
}

/// Opaque platform token for an extended-execution grant.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct GrantToken(u64);

impl GrantToken {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Platform source of time-bounded background execution.
///
/// `GrantToken` is not `Clone`, so a token can be ended at most once.
pub trait ExecutionGrantProvider: Send + Sync {
    /// Request extended execution. `None` when the platform refuses.
    fn begin(&self, label: &str) -> Option<GrantToken>;

    /// Return a grant to the platform.
    fn end(&self, token: GrantToken);
}

/// Grant provider for hosts without background execution limits.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopGrantProvider;

impl ExecutionGrantProvider for NoopGrantProvider {
    fn begin(&self, _label: &str) -> Option<GrantToken> {
        None
    }

    fn end(&self, _token: GrantToken) {}
}
