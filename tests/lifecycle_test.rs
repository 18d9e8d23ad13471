//! Integration tests for the model lifecycle manager.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    FetchMode, Harness, ScriptedEngine, ScriptedLoader, StubFetcher, descriptor, write_artifact,
};
use labelguard::{
    CandidatePathLocator, DeleteOutcome, LabelGuardError, LifecycleEvent, ModelCatalog,
    ModelLifecycleManager, ModelStatus, PreferenceStore,
};
use tokio::sync::broadcast;

fn engine() -> ScriptedEngine {
    ScriptedEngine::new(["ok", "<end_of_turn>"])
}

fn drain(rx: &mut broadcast::Receiver<LifecycleEvent>) -> Vec<ModelStatus> {
    let mut statuses = Vec::new();
    while let Ok(event) = rx.try_recv() {
        statuses.push(event.status);
    }
    statuses
}

async fn wait_until_downloading(h: &Harness) {
    let mut rx = h.manager.subscribe_status();
    rx.wait_for(|s| s.is_downloading()).await.unwrap();
}

// ============================================================================
// Probe
// ============================================================================

#[test]
fn probe_finds_config_and_safetensors() {
    let h = Harness::downloaded(engine());
    assert_eq!(h.manager.probe_status(), ModelStatus::Downloaded);
    assert_eq!(h.manager.status(), ModelStatus::Downloaded);
}

#[test]
fn probe_requires_weights() {
    let h = Harness::with_setup(engine(), |models| {
        let dir = models.join("alpha");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("config.json"), "{}").unwrap();
    });
    assert_eq!(h.manager.probe_status(), ModelStatus::NotDownloaded);
}

#[tokio::test]
async fn probe_never_reports_loaded() {
    let h = Harness::downloaded(engine());
    assert_eq!(h.manager.load().await, ModelStatus::Loaded);
    assert_eq!(h.manager.probe_status(), ModelStatus::Downloaded);
}

// ============================================================================
// Download
// ============================================================================

#[tokio::test]
async fn download_reaches_downloaded_with_monotone_progress() {
    let h = Harness::new(engine());
    let mut events = h.manager.subscribe_events();

    assert_eq!(h.manager.download().await, ModelStatus::Downloaded);
    assert_eq!(h.manager.status(), ModelStatus::Downloaded);
    assert!(h.models_dir().join("alpha").join("model.safetensors").exists());

    let statuses = drain(&mut events);
    assert_eq!(statuses.last(), Some(&ModelStatus::Downloaded));
    let progress: Vec<f64> = statuses.iter().filter_map(|s| s.progress()).collect();
    assert_eq!(progress.first(), Some(&0.0));
    assert_eq!(progress.last(), Some(&1.0));
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert!(progress[..progress.len() - 1].iter().all(|p| *p <= 0.9));
}

#[tokio::test]
async fn cancel_settles_to_not_downloaded_and_discards_partial() {
    let h = Harness::new(engine());
    h.fetcher.set_mode(FetchMode::Block);

    let manager = Arc::clone(&h.manager);
    let task = tokio::spawn(async move { manager.download().await });
    wait_until_downloading(&h).await;

    assert!(h.manager.cancel_download());
    assert_eq!(task.await.unwrap(), ModelStatus::NotDownloaded);
    assert_eq!(h.manager.status(), ModelStatus::NotDownloaded);
    assert!(!h.models_dir().join("alpha").exists());
}

#[tokio::test]
async fn cancel_without_download_is_noop() {
    let h = Harness::new(engine());
    assert!(!h.manager.cancel_download());
    assert_eq!(h.manager.status(), ModelStatus::NotDownloaded);
}

#[tokio::test]
async fn failure_becomes_error_and_retry_recovers() {
    let h = Harness::new(engine());
    h.fetcher.set_mode(FetchMode::Fail("mirror unreachable".into()));

    let status = h.manager.download().await;
    assert!(status.error_message().unwrap().contains("mirror unreachable"));
    assert_eq!(status.progress(), None);

    h.fetcher.set_mode(FetchMode::Succeed);
    assert_eq!(h.manager.download().await, ModelStatus::Downloaded);
    assert_eq!(h.fetcher.calls(), 2);
}

#[tokio::test]
async fn incomplete_fetch_is_an_error() {
    let h = Harness::new(engine());
    h.fetcher.set_mode(FetchMode::Incomplete);
    let status = h.manager.download().await;
    assert!(status.error_message().unwrap().contains("incomplete"));
}

#[tokio::test]
async fn download_ignored_while_downloading_or_loaded() {
    let h = Harness::new(engine());
    h.fetcher.set_mode(FetchMode::Block);

    let manager = Arc::clone(&h.manager);
    let task = tokio::spawn(async move { manager.download().await });
    wait_until_downloading(&h).await;

    assert!(h.manager.download().await.is_downloading());
    assert_eq!(h.fetcher.calls(), 1);
    h.manager.cancel_download();
    task.await.unwrap();

    h.fetcher.set_mode(FetchMode::Succeed);
    h.manager.download().await;
    h.manager.load().await;
    assert_eq!(h.manager.download().await, ModelStatus::Loaded);
    assert_eq!(h.fetcher.calls(), 2);
}

#[tokio::test]
async fn download_cancel_sequences_never_stick_in_downloading() {
    let h = Harness::new(engine());
    let modes = [
        FetchMode::Block,
        FetchMode::Fail("x".into()),
        FetchMode::Block,
        FetchMode::Succeed,
        FetchMode::Block,
    ];

    for mode in modes {
        h.fetcher.set_mode(mode.clone());
        let manager = Arc::clone(&h.manager);
        let task = tokio::spawn(async move { manager.download().await });
        if mode == FetchMode::Block {
            wait_until_downloading(&h).await;
            h.manager.cancel_download();
            h.manager.cancel_download();
        }
        let settled = task.await.unwrap();
        assert!(
            matches!(
                settled,
                ModelStatus::NotDownloaded | ModelStatus::Downloaded | ModelStatus::Error { .. }
            ),
            "settled in {settled}"
        );
        assert_eq!(h.manager.status(), settled);
    }
}

#[tokio::test]
async fn dropped_download_future_settles_and_frees_the_manager() {
    let h = Harness::new(engine());
    h.fetcher.set_mode(FetchMode::Block);

    let timed_out = tokio::time::timeout(Duration::from_millis(50), h.manager.download()).await;
    assert!(timed_out.is_err());

    assert_eq!(h.manager.status(), ModelStatus::NotDownloaded);
    assert!(!h.manager.cancel_download());
    assert!(!h.models_dir().join("alpha").exists());

    let deleted = tokio::time::timeout(Duration::from_secs(2), h.manager.delete())
        .await
        .expect("delete must not wait on an abandoned download");
    assert_eq!(deleted, DeleteOutcome::NothingToDelete);

    h.fetcher.set_mode(FetchMode::Succeed);
    assert_eq!(h.manager.download().await, ModelStatus::Downloaded);
}

#[tokio::test]
async fn aborted_download_task_leaves_selection_usable() {
    let h = Harness::new(engine());
    h.fetcher.set_mode(FetchMode::Block);

    let manager = Arc::clone(&h.manager);
    let task = tokio::spawn(async move { manager.download().await });
    wait_until_downloading(&h).await;
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    assert!(!h.manager.status().is_downloading());
    let switched = tokio::time::timeout(Duration::from_secs(2), h.manager.select_model("beta"))
        .await
        .unwrap()
        .unwrap();
    assert!(switched);
    assert_eq!(h.manager.status(), ModelStatus::NotDownloaded);
}

// ============================================================================
// Load / unload / reload
// ============================================================================

#[tokio::test]
async fn load_transitions_through_loading() {
    let h = Harness::downloaded(engine());
    let mut events = h.manager.subscribe_events();

    assert_eq!(h.manager.load().await, ModelStatus::Loaded);
    assert!(h.manager.resident_handle().is_some());
    assert_eq!(
        drain(&mut events),
        vec![ModelStatus::Loading, ModelStatus::Loaded]
    );
}

#[tokio::test]
async fn load_is_noop_when_not_downloaded() {
    let h = Harness::new(engine());
    assert_eq!(h.manager.load().await, ModelStatus::NotDownloaded);
    assert_eq!(h.loader.loads(), 0);
}

#[tokio::test]
async fn failed_load_keeps_artifact_and_can_be_retried() {
    let h = Harness::downloaded(engine());
    h.loader.set_failing(true);

    let status = h.manager.load().await;
    assert!(status.error_message().unwrap().contains("accelerator refused"));
    assert!(h.manager.resident_handle().is_none());
    assert!(h.manager.artifact_path().is_some());

    h.loader.set_failing(false);
    assert_eq!(h.manager.load().await, ModelStatus::Loaded);
}

#[tokio::test]
async fn unload_when_nothing_resident_changes_nothing() {
    let h = Harness::downloaded(engine());
    let mut events = h.manager.subscribe_events();

    assert!(!h.manager.unload().await);
    assert_eq!(h.manager.status(), ModelStatus::Downloaded);
    assert!(drain(&mut events).is_empty());
}

#[tokio::test]
async fn unload_returns_to_downloaded() {
    let h = Harness::downloaded(engine());
    h.manager.load().await;
    assert!(h.manager.unload().await);
    assert_eq!(h.manager.status(), ModelStatus::Downloaded);
    assert!(h.manager.resident_handle().is_none());
}

#[tokio::test]
async fn reload_builds_a_new_handle() {
    let h = Harness::downloaded(engine());
    h.manager.load().await;
    let before = h.manager.resident_handle().unwrap();

    assert_eq!(h.manager.reload().await, ModelStatus::Loaded);
    let after = h.manager.resident_handle().unwrap();
    assert!(after.generation() > before.generation());
    assert_eq!(h.loader.loads(), 2);
}

#[tokio::test]
async fn reload_ignored_when_not_downloaded() {
    let h = Harness::new(engine());
    assert_eq!(h.manager.reload().await, ModelStatus::NotDownloaded);
    assert_eq!(h.loader.loads(), 0);
}

// ============================================================================
// Handles
// ============================================================================

#[tokio::test]
async fn fresh_handle_is_never_reused() {
    let h = Harness::downloaded(engine());
    let first = h.manager.acquire_fresh_handle().await.unwrap();
    let second = h.manager.acquire_fresh_handle().await.unwrap();

    assert_ne!(first.generation(), second.generation());
    assert_eq!(h.loader.loads(), 2);
    assert_eq!(h.manager.status(), ModelStatus::Loaded);
}

#[tokio::test(start_paused = true)]
async fn fresh_handle_settles_even_from_cold() {
    let h = Harness::downloaded(engine());

    let started = tokio::time::Instant::now();
    h.manager.acquire_fresh_handle().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(5));
    assert_eq!(h.loader.loads(), 1);
}

#[tokio::test]
async fn ensure_loaded_reports_missing_artifact() {
    let h = Harness::new(engine());
    let err = h.manager.ensure_loaded().await.unwrap_err();
    assert!(matches!(err, LabelGuardError::ModelNotDownloaded(id) if id == "alpha"));
}

#[tokio::test]
async fn ensure_loaded_surfaces_load_failure() {
    let h = Harness::downloaded(engine());
    h.loader.set_failing(true);
    let err = h.manager.ensure_loaded().await.unwrap_err();
    assert_eq!(err.to_string(), "failed to load model: accelerator refused alpha");
    assert!(h.manager.status().error_message().is_some());
}

// ============================================================================
// Delete
// ============================================================================

#[tokio::test]
async fn delete_unloads_and_removes_artifact() {
    let h = Harness::downloaded(engine());
    h.manager.load().await;

    let DeleteOutcome::Deleted { removed } = h.manager.delete().await else {
        panic!("expected Deleted");
    };
    assert_eq!(removed, vec![h.models_dir().join("alpha")]);
    assert!(h.manager.resident_handle().is_none());
    assert_eq!(h.manager.status(), ModelStatus::NotDownloaded);

    assert_eq!(h.manager.delete().await, DeleteOutcome::NothingToDelete);
    assert_eq!(h.manager.status(), ModelStatus::NotDownloaded);
}

#[tokio::test]
async fn delete_removes_legacy_and_hub_copies() {
    let dir = tempfile::tempdir().unwrap();
    let models = dir.path().join("models");
    let hub = dir.path().join("hub");

    let mut alpha = descriptor("alpha");
    alpha.repo = "org/Alpha-Instruct".to_string();
    let catalog = ModelCatalog::new(vec![alpha], "alpha").unwrap();

    write_artifact(&models.join("Alpha-Instruct"));
    let hub_repo = hub.join("models--org--Alpha-Instruct");
    write_artifact(&hub_repo.join("snapshots").join("abc123"));

    let engine = Arc::new(ScriptedEngine::new(["ok"]));
    let manager = ModelLifecycleManager::builder()
        .catalog(catalog)
        .locator(Arc::new(CandidatePathLocator::new(&models).with_hub_cache(&hub)))
        .fetcher(Arc::new(StubFetcher::new(FetchMode::Succeed)))
        .loader(Arc::new(ScriptedLoader::new(engine)))
        .settle_delay(Duration::from_millis(5))
        .build()
        .unwrap();
    assert_eq!(manager.status(), ModelStatus::Downloaded);

    let DeleteOutcome::Deleted { removed } = manager.delete().await else {
        panic!("expected Deleted");
    };
    assert_eq!(removed, vec![models.join("Alpha-Instruct"), hub_repo.clone()]);
    assert!(!hub_repo.exists());
    assert_eq!(manager.status(), ModelStatus::NotDownloaded);
}

#[tokio::test]
async fn delete_with_nothing_on_disk() {
    let h = Harness::new(engine());
    assert_eq!(h.manager.delete().await, DeleteOutcome::NothingToDelete);
}

// ============================================================================
// Selection
// ============================================================================

#[tokio::test]
async fn selecting_current_model_is_noop() {
    let h = Harness::downloaded(engine());
    assert!(!h.manager.select_model("alpha").await.unwrap());
}

#[tokio::test]
async fn selecting_unknown_model_is_an_error() {
    let h = Harness::new(engine());
    let err = h.manager.select_model("gamma").await.unwrap_err();
    assert!(matches!(err, LabelGuardError::ModelNotFound(id) if id == "gamma"));
    assert_eq!(h.manager.selected().id, "alpha");
}

#[tokio::test]
async fn switching_unloads_persists_and_probes() {
    let h = Harness::downloaded(engine());
    h.manager.load().await;

    assert!(h.manager.select_model("beta").await.unwrap());
    assert!(h.manager.resident_handle().is_none());
    assert_eq!(h.manager.status(), ModelStatus::NotDownloaded);
    assert_eq!(h.preferences.selected_model().as_deref(), Some("beta"));
}

#[tokio::test]
async fn select_round_trip_restores_probe() {
    let h = Harness::downloaded(engine());
    let before = h.manager.probe_status();

    h.manager.select_model("beta").await.unwrap();
    h.manager.select_model("alpha").await.unwrap();

    assert_eq!(h.manager.probe_status(), before);
    assert_eq!(h.manager.status(), before);
}

#[tokio::test]
async fn selecting_during_download_cancels_it() {
    let h = Harness::new(engine());
    h.fetcher.set_mode(FetchMode::Block);

    let manager = Arc::clone(&h.manager);
    let task = tokio::spawn(async move { manager.download().await });
    wait_until_downloading(&h).await;

    assert!(h.manager.select_model("beta").await.unwrap());
    assert_eq!(task.await.unwrap(), ModelStatus::NotDownloaded);
    assert_eq!(h.manager.selected().id, "beta");
    assert_eq!(h.manager.status(), ModelStatus::NotDownloaded);
}

#[tokio::test]
async fn events_carry_the_model_id() {
    let h = Harness::downloaded(engine());
    let mut events = h.manager.subscribe_events();
    h.manager.select_model("beta").await.unwrap();

    let event = events.try_recv().unwrap();
    assert_eq!(event.model_id, "beta");
    assert_eq!(event.status, ModelStatus::NotDownloaded);
}
