//! Lifecycle listeners.
//!
//! Every observable hook of an execution is one [`LifecycleEvent`] variant,
//! delivered synchronously and in order to each registered [`Listener`].
//! Listener failures are logged and otherwise ignored.

use crate::runtime::ExecutionId;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Something that happened inside an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    MachineStarted,
    MachineTerminated { completed: bool },

    EventAccepted { event: String },
    EventDenied { event: String },
    EventDeferred { event: String },

    TransitionStarted { transition: String, event: String },
    TransitionEnded { transition: String, event: String },

    GuardBefore { transition: String },
    GuardAfter { transition: String, enabled: bool },
    GuardFailed { transition: String, event: String, error: String },

    EffectBefore { transition: String },
    EffectAfter { transition: String },
    EffectFailed { transition: String, event: String, error: String },

    StateEntering { state: String },
    StateEntered { state: String },
    StateEntryFailed {
        state: String,
        event: String,
        transition: Option<String>,
        error: String,
    },

    StateExiting { state: String },
    StateExited { state: String },
    StateExitFailed {
        state: String,
        event: String,
        transition: Option<String>,
        error: String,
    },

    ActivityStarted { state: String },
    ActivityFinished { state: String },
    ActivityCancelled { state: String },
    ActivityFailed { state: String, error: String },
}

impl LifecycleEvent {
    /// Short name of the hook, as used in filters.
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleEvent::MachineStarted => "machine_started",
            LifecycleEvent::MachineTerminated { .. } => "machine_terminated",
            LifecycleEvent::EventAccepted { .. } => "event_accepted",
            LifecycleEvent::EventDenied { .. } => "event_denied",
            LifecycleEvent::EventDeferred { .. } => "event_deferred",
            LifecycleEvent::TransitionStarted { .. } => "transition_started",
            LifecycleEvent::TransitionEnded { .. } => "transition_ended",
            LifecycleEvent::GuardBefore { .. } => "guard_before",
            LifecycleEvent::GuardAfter { .. } => "guard_after",
            LifecycleEvent::GuardFailed { .. } => "guard_failed",
            LifecycleEvent::EffectBefore { .. } => "effect_before",
            LifecycleEvent::EffectAfter { .. } => "effect_after",
            LifecycleEvent::EffectFailed { .. } => "effect_failed",
            LifecycleEvent::StateEntering { .. } => "state_entering",
            LifecycleEvent::StateEntered { .. } => "state_entered",
            LifecycleEvent::StateEntryFailed { .. } => "state_entry_failed",
            LifecycleEvent::StateExiting { .. } => "state_exiting",
            LifecycleEvent::StateExited { .. } => "state_exited",
            LifecycleEvent::StateExitFailed { .. } => "state_exit_failed",
            LifecycleEvent::ActivityStarted { .. } => "activity_started",
            LifecycleEvent::ActivityFinished { .. } => "activity_finished",
            LifecycleEvent::ActivityCancelled { .. } => "activity_cancelled",
            LifecycleEvent::ActivityFailed { .. } => "activity_failed",
        }
    }

    /// The state this event is about, if any.
    pub fn state(&self) -> Option<&str> {
        match self {
            LifecycleEvent::StateEntering { state }
            | LifecycleEvent::StateEntered { state }
            | LifecycleEvent::StateEntryFailed { state, .. }
            | LifecycleEvent::StateExiting { state }
            | LifecycleEvent::StateExited { state }
            | LifecycleEvent::StateExitFailed { state, .. }
            | LifecycleEvent::ActivityStarted { state }
            | LifecycleEvent::ActivityFinished { state }
            | LifecycleEvent::ActivityCancelled { state }
            | LifecycleEvent::ActivityFailed { state, .. } => Some(state),
            _ => None,
        }
    }
}

/// Error returned by a listener. Never affects the execution.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ListenerError(pub String);

/// Observer of lifecycle events.
pub trait Listener: Send + Sync {
    fn on_event(&self, execution: &ExecutionId, event: &LifecycleEvent) -> Result<(), ListenerError>;
}

impl<F> Listener for F
where
    F: Fn(&ExecutionId, &LifecycleEvent) -> Result<(), ListenerError> + Send + Sync,
{
    fn on_event(&self, execution: &ExecutionId, event: &LifecycleEvent) -> Result<(), ListenerError> {
        self(execution, event)
    }
}

/// Ordered list of listeners.
#[derive(Clone, Default)]
pub struct Listeners {
    entries: Vec<Arc<dyn Listener>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, listener: Arc<dyn Listener>) {
        self.entries.push(listener);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Delivers an event to every listener in registration order.
    ///
    /// The event is only built when someone is listening.
    pub fn notify(&self, execution: &ExecutionId, build: impl FnOnce() -> LifecycleEvent) {
        if self.entries.is_empty() {
            return;
        }
        let event = build();
        for listener in &self.entries {
            if let Err(e) = listener.on_event(execution, &event) {
                tracing::warn!(
                    "Listener failed on {} for {}: {}",
                    event.kind(),
                    execution,
                    e
                );
            }
        }
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.entries.len())
            .finish()
    }
}
