//! Events and user behaviours.
//!
//! Guards, effects, entry/exit actions and activities are host closures over
//! an engine-opaque context `C`. They report failures through
//! [`BehaviorError`]; the engine never interprets the context itself.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Name carried by synthetic time events.
pub const TIME_EVENT: &str = "$time";

/// Name carried by synthetic completion events.
pub const COMPLETION_EVENT: &str = "$completion";

/// Kind of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Submitted by the host.
    #[default]
    Signal,
    /// Generated by an expired timer.
    Time,
    /// Generated when a state completes.
    Completion,
}

/// An event dispatched to an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Trigger name matched against transition triggers.
    pub name: String,

    /// Event payload.
    #[serde(default)]
    pub payload: Value,

    /// Event kind.
    #[serde(default)]
    pub kind: EventKind,
}

impl Event {
    /// Creates a signal event without payload.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: Value::Null,
            kind: EventKind::Signal,
        }
    }

    /// Attaches a payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Creates the synthetic event injected when a timer expires.
    ///
    /// The payload carries the elapsed delay in milliseconds.
    pub fn time(elapsed: Duration) -> Self {
        Self {
            name: TIME_EVENT.to_string(),
            payload: serde_json::json!({ "elapsed_ms": elapsed.as_millis() as u64 }),
            kind: EventKind::Time,
        }
    }

    /// Creates the implicit completion event of a state.
    pub fn completion(state: &str) -> Self {
        Self {
            name: COMPLETION_EVENT.to_string(),
            payload: serde_json::json!({ "state": state }),
            kind: EventKind::Completion,
        }
    }

    /// Returns true for time and completion events.
    pub fn is_synthetic(&self) -> bool {
        self.kind != EventKind::Signal
    }

    /// Returns the elapsed delay of a time event.
    pub fn elapsed(&self) -> Option<Duration> {
        if self.kind != EventKind::Time {
            return None;
        }
        self.payload
            .get("elapsed_ms")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
    }
}

impl From<&str> for Event {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Failure reported by a guard, effect, action or activity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BehaviorError {
    message: String,
}

impl BehaviorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for BehaviorError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for BehaviorError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Guard predicate.
pub type GuardFn<C> = Arc<dyn Fn(&C, &Event) -> Result<bool, BehaviorError> + Send + Sync>;

/// Effect, entry or exit action.
pub type ActionFn<C> = Arc<dyn Fn(&mut C, &Event) -> Result<(), BehaviorError> + Send + Sync>;

/// State do-activity. Receives a copy of the context taken at state entry
/// and a token that is cancelled when the owning state exits. Changes to
/// the copy are never merged back into the execution's context.
pub type ActivityFn<C> =
    Arc<dyn Fn(C, CancellationToken) -> Result<(), BehaviorError> + Send + Sync>;

/// Computes a timer delay from the live context.
pub type DelayFn<C> = Arc<dyn Fn(&C) -> Duration + Send + Sync>;

/// Guard attached to a transition.
pub enum Guard<C> {
    /// Predicate evaluated against the context and the event.
    When(GuardFn<C>),
    /// Negation of the guard declared immediately before this transition
    /// on the same source; considered after every non-else sibling.
    Else,
}

impl<C> Guard<C> {
    pub fn is_else(&self) -> bool {
        matches!(self, Guard::Else)
    }
}

impl<C> Clone for Guard<C> {
    fn clone(&self) -> Self {
        match self {
            Guard::When(f) => Guard::When(Arc::clone(f)),
            Guard::Else => Guard::Else,
        }
    }
}

impl<C> fmt::Debug for Guard<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Guard::When(_) => f.write_str("When(..)"),
            Guard::Else => f.write_str("Else"),
        }
    }
}

/// Delay of a timed transition, resolved once when the timer is armed.
pub enum Delay<C> {
    Fixed(Duration),
    Computed(DelayFn<C>),
}

impl<C> Delay<C> {
    /// Resolves the delay against the live context.
    pub fn resolve(&self, ctx: &C) -> Duration {
        match self {
            Delay::Fixed(d) => *d,
            Delay::Computed(f) => f(ctx),
        }
    }
}

impl<C> Clone for Delay<C> {
    fn clone(&self) -> Self {
        match self {
            Delay::Fixed(d) => Delay::Fixed(*d),
            Delay::Computed(f) => Delay::Computed(Arc::clone(f)),
        }
    }
}

impl<C> fmt::Debug for Delay<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delay::Fixed(d) => write!(f, "Fixed({:?})", d),
            Delay::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}
