//! One streaming generation session.
//!
//! A session pulls fragments from a [`ModelHandle`] and reports them through
//! a [`SessionSink`]: zero or more [`SessionEvent::Chunk`]s, then exactly
//! one terminal event. The sink's terminal gate is shared with the
//! coordinator, which publishes the cancellation notice itself.

pub mod buffer;
pub mod liveness;

use std::sync::{Arc, Mutex, PoisonError};

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use buffer::StreamBuffer;
pub use liveness::{AppPhase, GrantSlot, LivenessEvent, LivenessMonitor};

use crate::model::ModelHandle;
use crate::telemetry;
use crate::types::{SessionEvent, SessionFailure};
use crate::LabelGuardError;

/// Gemma end-of-turn marker.
pub const DEFAULT_END_OF_TURN: &str = "<end_of_turn>";

/// Streaming knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Fragments per chunk update.
    pub flush_every: usize,

    /// Fragments between cooperative yields.
    pub yield_every: usize,

    /// In-band end-of-output sentinel.
    pub end_of_turn: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            flush_every: 4,
            yield_every: 8,
            end_of_turn: DEFAULT_END_OF_TURN.to_string(),
        }
    }
}

/// Producer side of one session's event channel.
///
/// Clones share the terminal gate: the first [`finish`](Self::finish) wins
/// and nothing is delivered after it.
#[derive(Debug, Clone)]
pub struct SessionSink {
    session_id: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
    settled: Arc<Mutex<bool>>,
}

impl SessionSink {
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Deliver a chunk. Dropped if the session already settled.
    pub fn chunk(&self, text: String) -> bool {
        let settled = self.settled.lock().unwrap_or_else(PoisonError::into_inner);
        if *settled {
            return false;
        }
        self.tx.send(SessionEvent::Chunk(text)).is_ok()
    }

    /// Deliver the terminal event. Returns `false` if another terminal event
    /// was already delivered.
    pub fn finish(&self, event: SessionEvent) -> bool {
        debug_assert!(event.is_terminal());
        let mut settled = self.settled.lock().unwrap_or_else(PoisonError::into_inner);
        if *settled {
            return false;
        }
        *settled = true;
        if self.tx.send(event).is_err() {
            debug!(session_id = self.session_id, "session consumer went away");
        }
        true
    }

    pub fn is_settled(&self) -> bool {
        *self.settled.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Consumer side of one session's event channel.
#[derive(Debug)]
pub struct SessionEvents {
    session_id: u64,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionEvents {
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Next event; `None` after the terminal event has been received and
    /// every sender is gone.
    pub async fn next(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Read events up to and including the terminal one.
    pub async fn collect(mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<SessionEvent> {
        UnboundedReceiverStream::new(self.rx)
    }
}

/// Create the event channel for session `session_id`.
pub fn channel(session_id: u64) -> (SessionSink, SessionEvents) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        SessionSink {
            session_id,
            tx,
            settled: Arc::new(Mutex::new(false)),
        },
        SessionEvents { session_id, rx },
    )
}

/// How [`StreamingInferenceSession::run`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// `Done` was delivered with this text.
    Completed(String),
    /// Cancellation was observed; no terminal event was delivered.
    Cancelled,
    /// `Failed` was delivered.
    Failed(SessionFailure),
}

/// Count a terminal session outcome.
pub(crate) fn record_outcome(outcome: &'static str) {
    metrics::counter!(telemetry::SESSIONS_TOTAL, "outcome" => outcome).increment(1);
}

/// Runs generation for one prompt against a borrowed model handle.
#[derive(Debug, Clone)]
pub struct StreamingInferenceSession {
    config: SessionConfig,
    liveness: LivenessMonitor,
}

impl StreamingInferenceSession {
    pub fn new(config: SessionConfig, liveness: LivenessMonitor) -> Self {
        Self { config, liveness }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Generate for `prompt`, reporting through `sink`.
    ///
    /// Liveness is checked before generation starts and after every
    /// fragment. `cancel` is polled between fragments; on cancellation no
    /// terminal event is sent and the caller owns the notice.
    pub async fn run(
        &self,
        handle: ModelHandle,
        prompt: &str,
        sink: &SessionSink,
        cancel: &CancellationToken,
    ) -> SessionOutcome {
        let session_id = sink.session_id();
        if !self.liveness.is_active() {
            info!(session_id, "app not active, session not started");
            return fail(sink, SessionFailure::NotActive);
        }

        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return SessionOutcome::Cancelled,
            stream = handle.generate(prompt) => stream,
        };
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!(session_id, error = %e, "generation failed to start");
                return fail(sink, SessionFailure::Engine(engine_message(e)));
            }
        };

        debug!(
            session_id,
            model_id = handle.model_id(),
            generation = handle.generation(),
            "session generating"
        );
        let mut buffer = StreamBuffer::new(&self.config.end_of_turn, self.config.flush_every);
        let mut pulled = 0usize;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(session_id, pulled, "session observed cancellation");
                    return SessionOutcome::Cancelled;
                }
                next = stream.next() => next,
            };
            let Some(fragment) = next else { break };
            let fragment = match fragment {
                Ok(fragment) => fragment,
                Err(e) => {
                    warn!(session_id, pulled, error = %e, "generation failed");
                    return fail(sink, SessionFailure::Engine(engine_message(e)));
                }
            };
            pulled += 1;
            metrics::counter!(telemetry::SESSION_FRAGMENTS_TOTAL).increment(1);

            if !self.liveness.is_active() {
                info!(session_id, pulled, "app went inactive, stopping generation");
                return fail(sink, SessionFailure::WentInactive);
            }

            if buffer.push(&fragment) {
                debug!(session_id, pulled, "end-of-turn sentinel reached");
                break;
            }
            if buffer.should_flush() && !cancel.is_cancelled() {
                if let Some(chunk) = buffer.take_chunk() {
                    sink.chunk(chunk);
                }
            }
            if self.config.yield_every > 0 && pulled % self.config.yield_every == 0 {
                tokio::task::yield_now().await;
            }
        }
        drop(stream);

        if cancel.is_cancelled() {
            return SessionOutcome::Cancelled;
        }
        if let Some(rest) = buffer.take_remaining() {
            sink.chunk(rest);
        }
        let text = buffer.into_text().trim().to_string();
        info!(session_id, pulled, chars = text.len(), "session complete");
        if sink.finish(SessionEvent::Done(text.clone())) {
            record_outcome("done");
        }
        SessionOutcome::Completed(text)
    }
}

fn fail(sink: &SessionSink, failure: SessionFailure) -> SessionOutcome {
    if sink.finish(SessionEvent::Failed(failure.clone())) {
        record_outcome(failure.label());
    }
    SessionOutcome::Failed(failure)
}

/// Engine errors are shown verbatim after the generic prefix.
fn engine_message(err: LabelGuardError) -> String {
    match err {
        LabelGuardError::Engine(message) => message,
        other => other.to_string(),
    }
}
