//! Lifecycle manager for the selected on-device model.
//!
//! Owns the on-disk and in-memory life of exactly one selected model and
//! publishes a single authoritative [`ModelStatus`]:
//!
//! ```text
//! NotDownloaded --download--> Downloading --ok--> Downloaded --load--> Loading --ok--> Loaded
//!                             Downloading --cancel--> NotDownloaded
//!                             Downloading --fail--> Error     Loading --fail--> Error
//!                                                              Loaded --unload--> Downloaded
//! ```
//!
//! Operations called from a status they do not apply to are no-ops that
//! return the current status. Load, unload, reload, delete, selection and
//! handle acquisition are serialized by one operation lock; a download only
//! takes that lock to claim the `Downloading` status, so it can be cancelled
//! while other callers wait.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::download::{ArtifactFetcher, DownloadProgress, MirrorFetcher, ProgressEstimator};
use super::handle::ModelHandle;
use super::locator::{ArtifactLocator, CandidatePathLocator, is_complete_artifact};
use crate::catalog::{ModelCatalog, ModelDescriptor};
use crate::preferences::{MemoryPreferenceStore, PreferenceStore};
use crate::telemetry;
use crate::traits::ModelLoader;
use crate::types::{DeleteOutcome, LifecycleEvent, ModelStatus};
use crate::{LabelGuardError, Result};

/// Capacity of the lifecycle event history channel.
const EVENT_CAPACITY: usize = 256;

/// Timing knobs for the lifecycle manager.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Pause between unload and load so the accelerator can release its
    /// command queues.
    pub settle_delay: Duration,

    /// Interval between UI progress updates while downloading.
    pub progress_tick: Duration,

    /// Highest progress reported before the fetch completes.
    pub progress_ceiling: f64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(500),
            progress_tick: Duration::from_millis(250),
            progress_ceiling: 0.9,
        }
    }
}

/// Single-writer status value plus its ordered transition history.
struct StatusCell {
    current: watch::Sender<ModelStatus>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl StatusCell {
    fn new(initial: ModelStatus) -> Self {
        let (current, _) = watch::channel(initial);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { current, events }
    }

    fn get(&self) -> ModelStatus {
        self.current.borrow().clone()
    }

    /// Replace the status. The event is sent while the watch value is
    /// locked, so history order matches write order.
    fn set(&self, model_id: &str, status: ModelStatus) {
        self.current.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            debug!(model_id, from = %current, to = %status, "model status changed");
            *current = status.clone();
            // No subscribers is fine.
            let _ = self.events.send(LifecycleEvent {
                model_id: model_id.to_string(),
                status: status.clone(),
            });
            true
        });
    }
}

/// Builder for [`ModelLifecycleManager`].
pub struct ModelLifecycleManagerBuilder {
    catalog: ModelCatalog,
    models_dir: Option<PathBuf>,
    locator: Option<Arc<dyn ArtifactLocator>>,
    fetcher: Option<Arc<dyn ArtifactFetcher>>,
    loader: Option<Arc<dyn ModelLoader>>,
    preferences: Option<Arc<dyn PreferenceStore>>,
    config: LifecycleConfig,
}

impl ModelLifecycleManagerBuilder {
    pub fn new() -> Self {
        Self {
            catalog: ModelCatalog::builtin(),
            models_dir: None,
            locator: None,
            fetcher: None,
            loader: None,
            preferences: None,
            config: LifecycleConfig::default(),
        }
    }

    /// Use a custom catalog (default: built-in).
    pub fn catalog(mut self, catalog: ModelCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Directory for the default [`CandidatePathLocator`].
    pub fn models_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.models_dir = Some(path.into());
        self
    }

    /// Replace the artifact locator entirely.
    pub fn locator(mut self, locator: Arc<dyn ArtifactLocator>) -> Self {
        self.locator = Some(locator);
        self
    }

    /// Artifact fetcher (default: [`MirrorFetcher`] against the public hub).
    pub fn fetcher(mut self, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Model loader. Required.
    pub fn loader(mut self, loader: Arc<dyn ModelLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Preference store for the persisted selection (default: in memory).
    pub fn preferences(mut self, preferences: Arc<dyn PreferenceStore>) -> Self {
        self.preferences = Some(preferences);
        self
    }

    pub fn config(mut self, config: LifecycleConfig) -> Self {
        self.config = config;
        self
    }

    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.config.settle_delay = delay;
        self
    }

    pub fn progress_tick(mut self, tick: Duration) -> Self {
        self.config.progress_tick = tick;
        self
    }

    /// Build the manager and probe the artifact store for the persisted
    /// selection.
    pub fn build(self) -> Result<ModelLifecycleManager> {
        let loader = self.loader.ok_or_else(|| {
            LabelGuardError::Configuration("no model loader configured".to_string())
        })?;
        if self.config.progress_tick.is_zero() {
            return Err(LabelGuardError::Configuration(
                "progress tick must be greater than zero".to_string(),
            ));
        }

        let locator = match self.locator {
            Some(locator) => locator,
            None => {
                let dir = self.models_dir.unwrap_or_else(super::default_models_dir);
                Arc::new(CandidatePathLocator::new(dir)) as Arc<dyn ArtifactLocator>
            }
        };
        let fetcher = self
            .fetcher
            .unwrap_or_else(|| Arc::new(MirrorFetcher::default()) as Arc<dyn ArtifactFetcher>);
        let preferences = self
            .preferences
            .unwrap_or_else(|| Arc::new(MemoryPreferenceStore::new()) as Arc<dyn PreferenceStore>);

        let selected = match preferences.selected_model() {
            Some(id) => match self.catalog.get(&id) {
                Some(descriptor) => descriptor.clone(),
                None => {
                    warn!(model_id = %id, "persisted model is not in the catalog, using default");
                    self.catalog.default_model().clone()
                }
            },
            None => self.catalog.default_model().clone(),
        };

        let initial = probe(locator.as_ref(), &selected);
        info!(
            model_id = %selected.id,
            status = %initial,
            loader = loader.name(),
            fetcher = fetcher.name(),
            "model lifecycle manager ready"
        );

        Ok(ModelLifecycleManager {
            catalog: self.catalog,
            locator,
            fetcher,
            loader,
            preferences,
            config: self.config,
            selected: RwLock::new(selected),
            status: StatusCell::new(initial),
            resident: Mutex::new(None),
            ops: tokio::sync::Mutex::new(()),
            download_cancel: Mutex::new(None),
            load_generation: AtomicU64::new(0),
        })
    }
}

impl Default for ModelLifecycleManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Storage probe: `Downloaded` when a complete artifact exists.
fn probe(locator: &dyn ArtifactLocator, descriptor: &ModelDescriptor) -> ModelStatus {
    if locator.locate(descriptor).is_some() {
        ModelStatus::Downloaded
    } else {
        ModelStatus::NotDownloaded
    }
}

/// Owner of the selected model's artifact and resident handle.
pub struct ModelLifecycleManager {
    catalog: ModelCatalog,
    locator: Arc<dyn ArtifactLocator>,
    fetcher: Arc<dyn ArtifactFetcher>,
    loader: Arc<dyn ModelLoader>,
    preferences: Arc<dyn PreferenceStore>,
    config: LifecycleConfig,
    selected: RwLock<ModelDescriptor>,
    status: StatusCell,
    resident: Mutex<Option<ModelHandle>>,
    ops: tokio::sync::Mutex<()>,
    download_cancel: Mutex<Option<CancellationToken>>,
    load_generation: AtomicU64,
}

impl ModelLifecycleManager {
    pub fn builder() -> ModelLifecycleManagerBuilder {
        ModelLifecycleManagerBuilder::new()
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// Descriptor of the currently selected model.
    pub fn selected(&self) -> ModelDescriptor {
        self.selected
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn selected_id(&self) -> String {
        self.selected
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .id
            .clone()
    }

    /// Current authoritative status.
    pub fn status(&self) -> ModelStatus {
        self.status.get()
    }

    /// Watch the latest status.
    pub fn subscribe_status(&self) -> watch::Receiver<ModelStatus> {
        self.status.current.subscribe()
    }

    /// Receive every status transition in order.
    pub fn subscribe_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.status.events.subscribe()
    }

    fn set_status(&self, model_id: &str, status: ModelStatus) {
        self.status.set(model_id, status);
    }

    /// Clone of the resident handle, if a model is loaded.
    pub fn resident_handle(&self) -> Option<ModelHandle> {
        self.resident
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Inspect storage for the selected model. Never reports `Loaded`.
    pub fn probe_status(&self) -> ModelStatus {
        probe(self.locator.as_ref(), &self.selected())
    }

    /// Location of the selected model's artifact, if complete on disk.
    pub fn artifact_path(&self) -> Option<PathBuf> {
        self.locator.locate(&self.selected())
    }

    /// Switch the selected model.
    ///
    /// Returns `Ok(false)` when `id` is already selected. Any in-flight
    /// download is cancelled and any resident model unloaded first.
    pub async fn select_model(&self, id: &str) -> Result<bool> {
        let descriptor = self
            .catalog
            .get(id)
            .cloned()
            .ok_or_else(|| LabelGuardError::ModelNotFound(id.to_string()))?;

        let _ops = self.ops.lock().await;
        let previous = self.selected_id();
        if previous == id {
            debug!(model_id = id, "model already selected");
            return Ok(false);
        }

        self.settle_download().await;
        self.unload_locked();

        *self.selected.write().unwrap_or_else(PoisonError::into_inner) = descriptor.clone();
        if let Err(e) = self.preferences.set_selected_model(id) {
            warn!(model_id = id, error = %e, "failed to persist model selection");
        }

        let status = probe(self.locator.as_ref(), &descriptor);
        self.set_status(id, status.clone());
        info!(from = %previous, to = id, status = %status, "selected model");
        Ok(true)
    }

    /// Cancel an in-flight download and wait until its status settles.
    async fn settle_download(&self) {
        if !self.status().is_downloading() {
            return;
        }
        self.cancel_download();
        let mut rx = self.subscribe_status();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|status| !status.is_downloading()).await;
    }

    /// Fetch the selected model's artifact and return the settled status.
    ///
    /// No-op while `Downloading`, `Loading` or `Loaded`. Cancellation settles
    /// to the storage probe (normally `NotDownloaded`), never to `Error`.
    pub async fn download(&self) -> ModelStatus {
        let (descriptor, cancel) = {
            let _ops = self.ops.lock().await;
            let current = self.status();
            if !matches!(
                current,
                ModelStatus::NotDownloaded | ModelStatus::Downloaded | ModelStatus::Error { .. }
            ) {
                debug!(status = %current, "download ignored");
                return current;
            }

            let descriptor = self.selected();
            let cancel = CancellationToken::new();
            *self
                .download_cancel
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(cancel.clone());
            self.set_status(&descriptor.id, ModelStatus::Downloading { progress: 0.0 });
            (descriptor, cancel)
        };

        let dest = self.locator.download_dir(&descriptor);
        // Declared before the fetch future so it drops after it.
        let mut abandoned = AbandonedDownload {
            manager: self,
            descriptor: &descriptor,
            dest: &dest,
            cancel: &cancel,
            armed: true,
        };
        info!(
            model_id = %descriptor.id,
            dest = %dest.display(),
            fetcher = self.fetcher.name(),
            "starting download"
        );

        let progress = DownloadProgress::new(descriptor.size_bytes);
        let mut estimator = ProgressEstimator::new(self.config.progress_ceiling);
        let mut ticker = tokio::time::interval(self.config.progress_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut fetch = self.fetcher.fetch(&descriptor, &dest, &progress, &cancel);
        let result = loop {
            tokio::select! {
                result = &mut fetch => break result,
                _ = cancel.cancelled() => break Err(LabelGuardError::DownloadCancelled),
                _ = ticker.tick() => {
                    let value = estimator.tick(progress.fraction());
                    self.set_status(&descriptor.id, ModelStatus::Downloading { progress: value });
                }
            }
        };
        drop(fetch);
        self.download_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let settled = match result {
            Ok(path) if is_complete_artifact(&path) => {
                self.set_status(&descriptor.id, ModelStatus::Downloading { progress: 1.0 });
                metrics::counter!(telemetry::DOWNLOADS_TOTAL, "status" => "completed").increment(1);
                info!(model_id = %descriptor.id, path = %path.display(), "download complete");
                ModelStatus::Downloaded
            }
            Ok(path) => {
                metrics::counter!(telemetry::DOWNLOADS_TOTAL, "status" => "failed").increment(1);
                warn!(model_id = %descriptor.id, path = %path.display(), "fetched artifact is incomplete");
                ModelStatus::Error {
                    message: format!("downloaded artifact for {} is incomplete", descriptor.id),
                }
            }
            Err(e) if e.is_cancellation() => {
                metrics::counter!(telemetry::DOWNLOADS_TOTAL, "status" => "cancelled").increment(1);
                info!(model_id = %descriptor.id, "download cancelled");
                discard_partial(&dest).await;
                probe(self.locator.as_ref(), &descriptor)
            }
            Err(e) => {
                metrics::counter!(telemetry::DOWNLOADS_TOTAL, "status" => "failed").increment(1);
                warn!(
                    model_id = %descriptor.id,
                    file = %progress.current_file(),
                    error = %e,
                    "download failed"
                );
                ModelStatus::Error {
                    message: e.to_string(),
                }
            }
        };

        abandoned.armed = false;
        self.set_status(&descriptor.id, settled.clone());
        settled
    }

    /// Request cancellation of the in-flight download.
    ///
    /// Returns `false` when nothing was downloading.
    pub fn cancel_download(&self) -> bool {
        let token = self
            .download_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match token {
            Some(token) => {
                debug!(model_id = %self.selected_id(), "cancelling download");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Materialize the artifact into a resident handle.
    ///
    /// Runs from `Downloaded`, or from `Error` when the artifact is on disk.
    /// A failed load leaves the artifact untouched.
    pub async fn load(&self) -> ModelStatus {
        let _ops = self.ops.lock().await;
        self.load_locked().await
    }

    async fn load_locked(&self) -> ModelStatus {
        let descriptor = self.selected();
        let current = self.status();
        if !matches!(current, ModelStatus::Downloaded | ModelStatus::Error { .. }) {
            debug!(model_id = %descriptor.id, status = %current, "load ignored");
            return current;
        }

        let Some(artifact) = self.locator.locate(&descriptor) else {
            if current == ModelStatus::Downloaded {
                warn!(model_id = %descriptor.id, "artifact disappeared from storage");
                self.set_status(&descriptor.id, ModelStatus::NotDownloaded);
                return ModelStatus::NotDownloaded;
            }
            return current;
        };

        self.set_status(&descriptor.id, ModelStatus::Loading);
        let started = Instant::now();
        let status = match self.loader.load(&descriptor, &artifact).await {
            Ok(engine) => {
                let generation = self.load_generation.fetch_add(1, Ordering::SeqCst) + 1;
                *self.resident.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(ModelHandle::new(&descriptor.id, generation, engine));
                let elapsed = started.elapsed();
                metrics::counter!(telemetry::LOADS_TOTAL, "status" => "completed").increment(1);
                metrics::histogram!(telemetry::LOAD_DURATION_SECONDS).record(elapsed.as_secs_f64());
                info!(
                    model_id = %descriptor.id,
                    generation,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "model loaded"
                );
                ModelStatus::Loaded
            }
            Err(e) => {
                metrics::counter!(telemetry::LOADS_TOTAL, "status" => "failed").increment(1);
                warn!(model_id = %descriptor.id, error = %e, "model load failed");
                ModelStatus::Error {
                    message: e.to_string(),
                }
            }
        };

        self.set_status(&descriptor.id, status.clone());
        status
    }

    /// Release the resident handle. Returns `false` if nothing was resident.
    ///
    /// Sessions holding a cloned [`ModelHandle`] keep it until they finish;
    /// the engine is dropped once the last clone goes.
    pub async fn unload(&self) -> bool {
        let _ops = self.ops.lock().await;
        self.unload_locked()
    }

    fn unload_locked(&self) -> bool {
        let released = self
            .resident
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = released else {
            return false;
        };
        info!(
            model_id = handle.model_id(),
            generation = handle.generation(),
            "model unloaded"
        );
        drop(handle);
        self.set_status(&self.selected_id(), ModelStatus::Downloaded);
        true
    }

    /// Unload (if loaded), wait for the accelerator to settle, and load.
    ///
    /// No-op unless `Downloaded` or `Loaded`.
    pub async fn reload(&self) -> ModelStatus {
        let _ops = self.ops.lock().await;
        match self.status() {
            ModelStatus::Loaded => {
                self.unload_locked();
                tokio::time::sleep(self.config.settle_delay).await;
                self.load_locked().await
            }
            ModelStatus::Downloaded => self.load_locked().await,
            other => {
                debug!(status = %other, "reload ignored");
                other
            }
        }
    }

    /// Remove every stored copy of the selected model's artifact.
    ///
    /// Unloads first and cancels an in-flight download. Removal is best
    /// effort; failures are logged.
    pub async fn delete(&self) -> DeleteOutcome {
        let _ops = self.ops.lock().await;
        self.settle_download().await;
        self.unload_locked();

        let descriptor = self.selected();
        let existing: Vec<PathBuf> = self
            .locator
            .storage_roots(&descriptor)
            .into_iter()
            .filter(|root| root.exists())
            .collect();

        if existing.is_empty() {
            info!(model_id = %descriptor.id, "nothing to delete");
            self.set_status(&descriptor.id, ModelStatus::NotDownloaded);
            return DeleteOutcome::NothingToDelete;
        }

        let mut removed = Vec::with_capacity(existing.len());
        for root in existing {
            match tokio::fs::remove_dir_all(&root).await {
                Ok(()) => {
                    debug!(model_id = %descriptor.id, path = %root.display(), "removed artifact");
                    removed.push(root);
                }
                Err(e) => warn!(
                    model_id = %descriptor.id,
                    path = %root.display(),
                    error = %e,
                    "failed to remove artifact"
                ),
            }
        }

        let status = probe(self.locator.as_ref(), &descriptor);
        info!(
            model_id = %descriptor.id,
            removed = removed.len(),
            status = %status,
            "deleted model artifact"
        );
        self.set_status(&descriptor.id, status);
        DeleteOutcome::Deleted { removed }
    }

    /// Unload, settle, and load again, returning a handle built from a
    /// clean accelerator state.
    ///
    /// The settle delay is always taken, even when nothing was resident.
    /// Sessions must start from this and never reuse an earlier handle.
    pub async fn acquire_fresh_handle(&self) -> Result<ModelHandle> {
        let _ops = self.ops.lock().await;
        self.unload_locked();
        tokio::time::sleep(self.config.settle_delay).await;
        let status = self.load_locked().await;
        self.loaded_handle(status)
    }

    /// Drive the selected model to `Loaded`, loading it if downloaded.
    pub async fn ensure_loaded(&self) -> Result<()> {
        let _ops = self.ops.lock().await;
        let status = match self.status() {
            ModelStatus::Loaded => ModelStatus::Loaded,
            _ => self.load_locked().await,
        };
        self.loaded_handle(status).map(|_| ())
    }

    /// Map a settled load status to the resident handle or an error.
    fn loaded_handle(&self, status: ModelStatus) -> Result<ModelHandle> {
        let model_id = self.selected_id();
        match status {
            ModelStatus::Loaded => self.resident_handle().ok_or_else(|| {
                LabelGuardError::Load(format!("{model_id} reported loaded without a handle"))
            }),
            ModelStatus::Error { message } => Err(LabelGuardError::ModelFailed(message)),
            ModelStatus::NotDownloaded => Err(LabelGuardError::ModelNotDownloaded(model_id)),
            other => Err(LabelGuardError::InvalidState {
                operation: "load",
                status: other.to_string(),
            }),
        }
    }
}

/// Settles a download whose future was dropped before it finished.
///
/// Cancels the fetch, clears the cancellation slot, removes partial files
/// and publishes the storage probe so the manager never stays `Downloading`.
struct AbandonedDownload<'a> {
    manager: &'a ModelLifecycleManager,
    descriptor: &'a ModelDescriptor,
    dest: &'a std::path::Path,
    cancel: &'a CancellationToken,
    armed: bool,
}

impl Drop for AbandonedDownload<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.cancel.cancel();
        self.manager
            .download_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if !is_complete_artifact(self.dest) {
            match std::fs::remove_dir_all(self.dest) {
                Ok(()) => debug!(path = %self.dest.display(), "discarded partial download"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    path = %self.dest.display(),
                    error = %e,
                    "failed to discard partial download"
                ),
            }
        }
        metrics::counter!(telemetry::DOWNLOADS_TOTAL, "status" => "cancelled").increment(1);
        let status = probe(self.manager.locator.as_ref(), self.descriptor);
        warn!(
            model_id = %self.descriptor.id,
            status = %status,
            "download abandoned by its caller"
        );
        self.manager.set_status(&self.descriptor.id, status);
    }
}

/// Remove a download directory unless it already holds a complete artifact.
async fn discard_partial(dest: &std::path::Path) {
    if is_complete_artifact(dest) {
        return;
    }
    match tokio::fs::remove_dir_all(dest).await {
        Ok(()) => debug!(path = %dest.display(), "discarded partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %dest.display(), error = %e, "failed to discard partial download"),
    }
}
