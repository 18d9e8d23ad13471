//! Application liveness and extended-execution grants.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::traits::{ExecutionGrantProvider, GrantToken};
use crate::types::CancelReason;

/// Foreground state of the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppPhase {
    /// Foreground and interactive. The only phase inference may run in.
    #[default]
    Active,
    /// Visible but not receiving input.
    Inactive,
    /// Not visible.
    Background,
}

/// Lifecycle signal delivered by the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessEvent {
    BecameActive,
    ResignedActive,
    EnteredBackground,
    /// The OS is about to revoke background execution time.
    BackgroundDeadline,
}

impl LivenessEvent {
    /// Phase the application is in after this event.
    pub fn phase(&self) -> AppPhase {
        match self {
            Self::BecameActive => AppPhase::Active,
            Self::ResignedActive => AppPhase::Inactive,
            Self::EnteredBackground | Self::BackgroundDeadline => AppPhase::Background,
        }
    }

    /// Cancellation reason when this event withdraws liveness.
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        match self {
            Self::BecameActive => None,
            Self::ResignedActive => Some(CancelReason::ResignedActive),
            Self::EnteredBackground => Some(CancelReason::EnteredBackground),
            Self::BackgroundDeadline => Some(CancelReason::BackgroundDeadline),
        }
    }
}

/// Shared view of the application phase.
///
/// Cloning shares the underlying value.
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    phase: Arc<watch::Sender<AppPhase>>,
}

impl LivenessMonitor {
    pub fn new(initial: AppPhase) -> Self {
        let (phase, _) = watch::channel(initial);
        Self {
            phase: Arc::new(phase),
        }
    }

    pub fn phase(&self) -> AppPhase {
        *self.phase.borrow()
    }

    /// Whether inference may run right now.
    pub fn is_active(&self) -> bool {
        self.phase() == AppPhase::Active
    }

    /// Set the phase. Returns `true` if it changed.
    pub fn set_phase(&self, phase: AppPhase) -> bool {
        let changed = self.phase.send_if_modified(|current| {
            if *current == phase {
                return false;
            }
            *current = phase;
            true
        });
        if changed {
            debug!(?phase, "application phase changed");
        }
        changed
    }

    /// Apply a platform event to the phase.
    pub fn apply(&self, event: LivenessEvent) -> bool {
        self.set_phase(event.phase())
    }

    pub fn subscribe(&self) -> watch::Receiver<AppPhase> {
        self.phase.subscribe()
    }
}

impl Default for LivenessMonitor {
    fn default() -> Self {
        Self::new(AppPhase::Active)
    }
}

/// Holder of at most one extended-execution grant.
///
/// The token is taken out of the slot on release, so releasing twice (or
/// releasing and then dropping) returns it to the provider once.
pub struct GrantSlot {
    provider: Arc<dyn ExecutionGrantProvider>,
    token: Mutex<Option<GrantToken>>,
}

impl GrantSlot {
    /// Request a grant. The slot is empty if the provider refuses.
    pub fn acquire(provider: Arc<dyn ExecutionGrantProvider>, label: &str) -> Self {
        let token = provider.begin(label);
        match &token {
            Some(t) => debug!(grant = t.id(), label, "extended execution granted"),
            None => debug!(label, "extended execution not granted"),
        }
        Self {
            provider,
            token: Mutex::new(token),
        }
    }

    pub fn is_held(&self) -> bool {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Return the grant to the provider. `false` if nothing was held.
    pub fn release(&self) -> bool {
        let token = self
            .token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match token {
            Some(token) => {
                debug!(grant = token.id(), "extended execution released");
                self.provider.end(token);
                true
            }
            None => false,
        }
    }
}

impl Drop for GrantSlot {
    fn drop(&mut self) {
        self.release();
    }
}
