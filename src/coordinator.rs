//! Top-level orchestration: ready the model, run one session, react to
//! liveness.
//!
//! At most one session runs at a time. Starting a new one first drives the
//! old one through `Cancelling` to `Idle`. Cancellation is cooperative: the
//! coordinator cancels the session's token, waits for the task to settle,
//! then publishes a single cancellation notice through the session's
//! terminal gate and returns the extended-execution grant.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{Stream, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::ModelLifecycleManager;
use crate::prompt::{OcrOutcome, build_analysis_prompt};
use crate::session::{
    self, GrantSlot, LivenessEvent, LivenessMonitor, SessionConfig, SessionEvents,
    SessionOutcome, SessionSink, StreamingInferenceSession,
};
use crate::telemetry;
use crate::traits::{ExecutionGrantProvider, NoopGrantProvider};
use crate::types::{CancelReason, HealthProfile, InferenceSessionState, SessionEvent, SessionFailure};

/// Label passed to the platform when requesting extended execution.
const GRANT_LABEL: &str = "label-analysis";

/// The running session, owned by the coordinator.
///
/// The task owns the only event sender and hands it back on cancellation.
struct ActiveSession {
    id: u64,
    cancel: CancellationToken,
    grant: Arc<GrantSlot>,
    task: JoinHandle<Option<SessionSink>>,
}

/// What the coordinator's session slot currently holds.
#[derive(Default)]
enum Slot {
    #[default]
    Empty,
    /// `start` is readying the model; a cancel is recorded for it to honor.
    Starting {
        id: u64,
        cancel: Option<CancelReason>,
    },
    Running(ActiveSession),
}

struct Inner {
    manager: Arc<ModelLifecycleManager>,
    session: StreamingInferenceSession,
    liveness: LivenessMonitor,
    grants: Arc<dyn ExecutionGrantProvider>,
    state: watch::Sender<InferenceSessionState>,
    admission: tokio::sync::Mutex<()>,
    active: tokio::sync::Mutex<Slot>,
    next_id: AtomicU64,
}

impl Inner {
    /// `Running(id) -> Idle`, left alone if a canceller already claimed it.
    fn settle_idle(&self, id: u64) -> bool {
        self.state.send_if_modified(|state| {
            if *state == (InferenceSessionState::Running { session_id: id }) {
                *state = InferenceSessionState::Idle;
                true
            } else {
                false
            }
        })
    }
}

/// Builder for [`InferenceCoordinator`].
pub struct InferenceCoordinatorBuilder {
    manager: Arc<ModelLifecycleManager>,
    liveness: LivenessMonitor,
    grants: Arc<dyn ExecutionGrantProvider>,
    config: SessionConfig,
}

impl InferenceCoordinatorBuilder {
    /// Shared liveness monitor (default: a new monitor in `Active`).
    pub fn liveness(mut self, liveness: LivenessMonitor) -> Self {
        self.liveness = liveness;
        self
    }

    /// Platform grant provider (default: [`NoopGrantProvider`]).
    pub fn grant_provider(mut self, grants: Arc<dyn ExecutionGrantProvider>) -> Self {
        self.grants = grants;
        self
    }

    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> InferenceCoordinator {
        let (state, _) = watch::channel(InferenceSessionState::Idle);
        InferenceCoordinator {
            inner: Arc::new(Inner {
                manager: self.manager,
                session: StreamingInferenceSession::new(self.config, self.liveness.clone()),
                liveness: self.liveness,
                grants: self.grants,
                state,
                admission: tokio::sync::Mutex::new(()),
                active: tokio::sync::Mutex::new(Slot::Empty),
                next_id: AtomicU64::new(0),
            }),
        }
    }
}

/// Sequences model readiness and streaming sessions for the UI.
///
/// Cheap to clone; clones share the same session slot.
#[derive(Clone)]
pub struct InferenceCoordinator {
    inner: Arc<Inner>,
}

impl InferenceCoordinator {
    pub fn builder(manager: Arc<ModelLifecycleManager>) -> InferenceCoordinatorBuilder {
        InferenceCoordinatorBuilder {
            manager,
            liveness: LivenessMonitor::default(),
            grants: Arc::new(NoopGrantProvider),
            config: SessionConfig::default(),
        }
    }

    pub fn manager(&self) -> &Arc<ModelLifecycleManager> {
        &self.inner.manager
    }

    pub fn liveness(&self) -> &LivenessMonitor {
        &self.inner.liveness
    }

    pub fn state(&self) -> InferenceSessionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<InferenceSessionState> {
        self.inner.state.subscribe()
    }

    /// Start a session for `prompt`, superseding any running one.
    ///
    /// Always returns an event receiver; failures to start arrive on it as
    /// a single `Failed` event. A cancel issued while the model is being
    /// readied ends the session with `Cancelled` before generation begins.
    pub async fn start(&self, prompt: impl Into<String>) -> SessionEvents {
        let prompt = prompt.into();
        let inner = &self.inner;
        let _admission = inner.admission.lock().await;

        self.cancel_if_needed(CancelReason::Superseded).await;

        let id = inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (sink, events) = session::channel(id);

        if !inner.liveness.is_active() {
            info!(session_id = id, "app not active, refusing to start analysis");
            reject(&sink, SessionFailure::NotActive);
            return events;
        }

        *inner.active.lock().await = Slot::Starting { id, cancel: None };
        let manager = &inner.manager;
        let handle = match manager.ensure_loaded().await {
            Ok(()) => manager.acquire_fresh_handle().await,
            Err(e) => Err(e),
        };

        let mut active = inner.active.lock().await;
        let pending = match std::mem::take(&mut *active) {
            Slot::Starting { id: starting, cancel } if starting == id => cancel,
            other => {
                *active = other;
                None
            }
        };
        if let Some(reason) = pending {
            info!(session_id = id, reason = %reason, "analysis cancelled while readying the model");
            if sink.finish(SessionEvent::Cancelled { reason }) {
                session::record_outcome("cancelled");
            }
            return events;
        }
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                warn!(session_id = id, error = %e, "model not ready for analysis");
                reject(&sink, SessionFailure::Lifecycle(e.to_string()));
                return events;
            }
        };

        let grant = Arc::new(GrantSlot::acquire(inner.grants.clone(), GRANT_LABEL));
        let cancel = CancellationToken::new();
        inner
            .state
            .send_replace(InferenceSessionState::Running { session_id: id });
        info!(
            session_id = id,
            model_id = handle.model_id(),
            generation = handle.generation(),
            "analysis started"
        );

        let task = tokio::spawn({
            let inner = Arc::clone(inner);
            let cancel = cancel.clone();
            let grant = Arc::clone(&grant);
            async move {
                let outcome = inner.session.run(handle, &prompt, &sink, &cancel).await;
                if outcome == SessionOutcome::Cancelled {
                    // The canceller publishes the notice and releases.
                    return Some(sink);
                }
                drop(sink);
                grant.release();
                if inner.settle_idle(id) {
                    debug!(session_id = id, "session settled");
                }
                None
            }
        });

        *active = Slot::Running(ActiveSession {
            id,
            cancel,
            grant,
            task,
        });
        events
    }

    /// Build the analysis prompt from a profile and OCR results and start it.
    pub async fn start_analysis(
        &self,
        profile: &HealthProfile,
        outcomes: &[OcrOutcome],
    ) -> SessionEvents {
        self.start(build_analysis_prompt(&profile.summary(), outcomes))
            .await
    }

    /// Cancel the running session, if any, and wait for it to settle.
    ///
    /// While a start is still readying the model the cancel is recorded and
    /// honored before generation begins. Returns `true` only for the call
    /// that performed (or recorded) the cancellation.
    pub async fn cancel_if_needed(&self, reason: CancelReason) -> bool {
        let inner = &self.inner;
        let mut active = inner.active.lock().await;
        let session = match std::mem::take(&mut *active) {
            Slot::Empty => return false,
            Slot::Starting { id, cancel: None } => {
                info!(session_id = id, reason = %reason, "cancel requested while readying the model");
                metrics::counter!(telemetry::CANCELLATIONS_TOTAL, "trigger" => reason.label())
                    .increment(1);
                *active = Slot::Starting {
                    id,
                    cancel: Some(reason),
                };
                return true;
            }
            starting @ Slot::Starting { .. } => {
                *active = starting;
                return false;
            }
            Slot::Running(session) => session,
        };

        let id = session.id;
        let claimed = inner.state.send_if_modified(|state| {
            if *state == (InferenceSessionState::Running { session_id: id }) {
                *state = InferenceSessionState::Cancelling { session_id: id };
                true
            } else {
                false
            }
        });
        if !claimed {
            debug!(session_id = id, "session already settled");
            return false;
        }

        info!(session_id = id, reason = %reason, "cancelling analysis");
        session.cancel.cancel();
        let sink = match session.task.await {
            Ok(sink) => sink,
            Err(e) => {
                warn!(session_id = id, error = %e, "session task ended abnormally");
                None
            }
        };

        let published = sink.is_some_and(|sink| {
            sink.finish(SessionEvent::Cancelled {
                reason: reason.clone(),
            })
        });
        session.grant.release();
        inner.state.send_replace(InferenceSessionState::Idle);

        metrics::counter!(telemetry::CANCELLATIONS_TOTAL, "trigger" => reason.label()).increment(1);
        if published {
            session::record_outcome("cancelled");
        } else {
            debug!(session_id = id, "session settled before the cancellation notice");
        }
        true
    }

    /// Convenience for an explicit user cancel.
    pub async fn cancel(&self) -> bool {
        self.cancel_if_needed(CancelReason::UserRequested).await
    }

    /// Apply a platform liveness event, cancelling when liveness is withdrawn.
    pub async fn handle_liveness(&self, event: LivenessEvent) -> bool {
        self.inner.liveness.apply(event);
        match event.cancel_reason() {
            Some(reason) => self.cancel_if_needed(reason).await,
            None => false,
        }
    }

    /// Feed liveness events from `events` into [`handle_liveness`](Self::handle_liveness)
    /// until the stream ends.
    pub fn spawn_liveness_listener<S>(&self, events: S) -> JoinHandle<()>
    where
        S: Stream<Item = LivenessEvent> + Send + 'static,
    {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut events = std::pin::pin!(events);
            while let Some(event) = events.next().await {
                debug!(?event, "liveness event");
                coordinator.handle_liveness(event).await;
            }
            debug!("liveness stream ended");
        })
    }
}

/// Deliver a start-up failure as the session's only event.
fn reject(sink: &SessionSink, failure: SessionFailure) {
    if sink.finish(SessionEvent::Failed(failure.clone())) {
        session::record_outcome(failure.label());
    }
}
