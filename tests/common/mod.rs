//! Shared mocks for integration tests.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use labelguard::model::DownloadProgress;
use labelguard::{
    ArtifactFetcher, CandidatePathLocator, ExecutionGrantProvider, FragmentStream,
    GenerationEngine, GrantToken, LabelGuardError, MemoryPreferenceStore, ModelCatalog,
    ModelDescriptor, ModelLifecycleManager, ModelLoader, Result,
};

// ============================================================================
// Artifacts
// ============================================================================

/// Write a minimal complete artifact (`config.json` + weights).
pub fn write_artifact(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("config.json"), "{}").unwrap();
    std::fs::write(dir.join("model.safetensors"), b"weights").unwrap();
}

pub fn descriptor(id: &str) -> ModelDescriptor {
    ModelDescriptor {
        id: id.to_string(),
        display_name: id.to_string(),
        description: String::new(),
        repo: format!("org/{id}"),
        size_bytes: 64,
        min_memory_gb: 1.0,
        files: vec!["config.json".to_string(), "model.safetensors".to_string()],
    }
}

/// Two-model catalog: `alpha` (default) and `beta`.
pub fn test_catalog() -> ModelCatalog {
    ModelCatalog::new(vec![descriptor("alpha"), descriptor("beta")], "alpha").unwrap()
}

// ============================================================================
// Generation engine
// ============================================================================

type PullHook = Arc<dyn Fn(usize) + Send + Sync>;

/// Engine that replays a fixed fragment script.
pub struct ScriptedEngine {
    fragments: Vec<String>,
    pulled: AtomicUsize,
    active_streams: AtomicUsize,
    max_active_streams: AtomicUsize,
    hang_after: Option<usize>,
    fail_at: Option<usize>,
    on_pull: Mutex<Option<PullHook>>,
}

impl ScriptedEngine {
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            pulled: AtomicUsize::new(0),
            active_streams: AtomicUsize::new(0),
            max_active_streams: AtomicUsize::new(0),
            hang_after: None,
            fail_at: None,
            on_pull: Mutex::new(None),
        }
    }

    /// Stop producing (pend forever) after `n` fragments.
    pub fn hang_after(mut self, n: usize) -> Self {
        self.hang_after = Some(n);
        self
    }

    /// Return an engine error instead of fragment `index` (0-based).
    pub fn fail_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }

    /// Called with the running pull count after each fragment is produced.
    pub fn on_pull(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        *self.on_pull.lock().unwrap() = Some(Arc::new(hook));
    }

    pub fn pulled(&self) -> usize {
        self.pulled.load(Ordering::SeqCst)
    }

    pub fn max_active_streams(&self) -> usize {
        self.max_active_streams.load(Ordering::SeqCst)
    }
}

/// Decrements the active stream count when the stream is dropped.
struct StreamGuard(Arc<ScriptedEngine>);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.active_streams.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Engine wrapper so the stream can hold an `Arc` of the script.
pub struct SharedEngine(pub Arc<ScriptedEngine>);

#[async_trait]
impl GenerationEngine for SharedEngine {
    async fn generate(&self, _prompt: &str) -> Result<FragmentStream> {
        let engine = Arc::clone(&self.0);
        let active = engine.active_streams.fetch_add(1, Ordering::SeqCst) + 1;
        engine.max_active_streams.fetch_max(active, Ordering::SeqCst);
        let guard = StreamGuard(Arc::clone(&engine));

        let stream = futures_util::stream::unfold((0usize, guard), |(index, guard)| async move {
            let engine = Arc::clone(&guard.0);
            if index >= engine.fragments.len() {
                return None;
            }
            if engine.hang_after == Some(index) {
                std::future::pending::<()>().await;
            }
            tokio::task::yield_now().await;

            let count = engine.pulled.fetch_add(1, Ordering::SeqCst) + 1;
            let hook = engine.on_pull.lock().unwrap().clone();
            if let Some(hook) = hook {
                hook(count);
            }
            let item = if engine.fail_at == Some(index) {
                Err(LabelGuardError::Engine("boom".to_string()))
            } else {
                Ok(engine.fragments[index].clone())
            };
            Some((item, (index + 1, guard)))
        });
        Ok(Box::pin(stream))
    }
}

// ============================================================================
// Loader
// ============================================================================

/// Loader handing out the same scripted engine on every load.
pub struct ScriptedLoader {
    engine: Arc<ScriptedEngine>,
    loads: AtomicUsize,
    fail: AtomicBool,
    delay: Mutex<Duration>,
}

impl ScriptedLoader {
    pub fn new(engine: Arc<ScriptedEngine>) -> Self {
        Self {
            engine,
            loads: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Make every load take `delay` after it is counted.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl ModelLoader for ScriptedLoader {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn load(
        &self,
        descriptor: &ModelDescriptor,
        _artifact_dir: &Path,
    ) -> Result<Arc<dyn GenerationEngine>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(LabelGuardError::Load(format!(
                "accelerator refused {}",
                descriptor.id
            )));
        }
        Ok(Arc::new(SharedEngine(Arc::clone(&self.engine))))
    }
}

// ============================================================================
// Fetcher
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum FetchMode {
    /// Write a complete artifact.
    Succeed,
    /// Write a partial file, then wait for cancellation.
    Block,
    /// Fail with a download error.
    Fail(String),
    /// Succeed without writing weights.
    Incomplete,
}

pub struct StubFetcher {
    mode: Mutex<FetchMode>,
    calls: AtomicUsize,
}

impl StubFetcher {
    pub fn new(mode: FetchMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_mode(&self, mode: FetchMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactFetcher for StubFetcher {
    fn name(&self) -> &str {
        "stub"
    }

    async fn fetch(
        &self,
        descriptor: &ModelDescriptor,
        dest: &Path,
        progress: &DownloadProgress,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mode = self.mode.lock().unwrap().clone();
        tokio::fs::create_dir_all(dest).await?;

        match mode {
            FetchMode::Succeed => {
                write_artifact(dest);
                progress.add_downloaded(descriptor.size_bytes);
                Ok(dest.to_path_buf())
            }
            FetchMode::Block => {
                tokio::fs::write(dest.join("config.json"), "{}").await?;
                progress.add_downloaded(descriptor.size_bytes / 2);
                cancel.cancelled().await;
                Err(LabelGuardError::DownloadCancelled)
            }
            FetchMode::Fail(message) => Err(LabelGuardError::Download(message)),
            FetchMode::Incomplete => {
                tokio::fs::write(dest.join("config.json"), "{}").await?;
                Ok(dest.to_path_buf())
            }
        }
    }
}

// ============================================================================
// Grants
// ============================================================================

#[derive(Default)]
pub struct CountingGrants {
    next: AtomicU64,
    begun: AtomicUsize,
    ended: AtomicUsize,
}

impl CountingGrants {
    pub fn begun(&self) -> usize {
        self.begun.load(Ordering::SeqCst)
    }

    pub fn ended(&self) -> usize {
        self.ended.load(Ordering::SeqCst)
    }
}

impl ExecutionGrantProvider for CountingGrants {
    fn begin(&self, _label: &str) -> Option<GrantToken> {
        self.begun.fetch_add(1, Ordering::SeqCst);
        Some(GrantToken::new(self.next.fetch_add(1, Ordering::SeqCst)))
    }

    fn end(&self, _token: GrantToken) {
        self.ended.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Manager over a temp models dir with short timings.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub engine: Arc<ScriptedEngine>,
    pub loader: Arc<ScriptedLoader>,
    pub fetcher: Arc<StubFetcher>,
    pub preferences: Arc<MemoryPreferenceStore>,
    pub manager: Arc<ModelLifecycleManager>,
}

impl Harness {
    pub fn new(engine: ScriptedEngine) -> Self {
        Self::with_setup(engine, |_| {})
    }

    /// Like [`new`](Self::new) but with `alpha` already on disk.
    pub fn downloaded(engine: ScriptedEngine) -> Self {
        Self::with_setup(engine, |models| write_artifact(&models.join("alpha")))
    }

    pub fn with_setup(engine: ScriptedEngine, setup: impl FnOnce(&Path)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let models = dir.path().join("models");
        setup(&models);

        let engine = Arc::new(engine);
        let loader = Arc::new(ScriptedLoader::new(Arc::clone(&engine)));
        let fetcher = Arc::new(StubFetcher::new(FetchMode::Succeed));
        let preferences = Arc::new(MemoryPreferenceStore::new());
        let manager = ModelLifecycleManager::builder()
            .catalog(test_catalog())
            .locator(Arc::new(CandidatePathLocator::new(&models)))
            .fetcher(fetcher.clone())
            .loader(loader.clone())
            .preferences(preferences.clone())
            .settle_delay(Duration::from_millis(5))
            .progress_tick(Duration::from_millis(5))
            .build()
            .unwrap();

        Self {
            dir,
            engine,
            loader,
            fetcher,
            preferences,
            manager: Arc::new(manager),
        }
    }

    pub fn models_dir(&self) -> PathBuf {
        self.dir.path().join("models")
    }
}
