//! Borrowed access to the resident model.

use std::fmt;
use std::sync::Arc;

use crate::Result;
use crate::traits::{FragmentStream, GenerationEngine};

/// A session's view of the resident model.
///
/// The lifecycle manager keeps the owning copy. Each load bumps the
/// generation counter, so a handle from an earlier load can be told apart
/// from a fresh one even though the model id is the same.
#[derive(Clone)]
pub struct ModelHandle {
    model_id: String,
    generation: u64,
    engine: Arc<dyn GenerationEngine>,
}

impl ModelHandle {
    pub(crate) fn new(
        model_id: impl Into<String>,
        generation: u64,
        engine: Arc<dyn GenerationEngine>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            generation,
            engine,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Load counter value this handle was created under.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Start streaming fragments for `prompt`.
    pub async fn generate(&self, prompt: &str) -> Result<FragmentStream> {
        self.engine.generate(prompt).await
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("model_id", &self.model_id)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}
