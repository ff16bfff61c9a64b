//! Transitions.

use crate::behavior::{ActionFn, Delay, Event, EventKind, Guard};
use crate::ids::{TransitionId, VertexId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transition kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    /// Exits the source (and re-enters it on self transitions).
    #[default]
    External,
    /// Does not exit a source that contains the target.
    Local,
    /// Runs the effect only; the source is never exited.
    Internal,
}

/// A transition between two vertices.
pub struct Transition<C> {
    pub id: TransitionId,
    pub source: VertexId,
    pub target: VertexId,
    pub kind: TransitionKind,
    pub triggers: Vec<String>,
    pub guard: Option<Guard<C>>,
    pub effect: Option<ActionFn<C>>,
    /// Armed when the source state is entered.
    pub timer: Option<Delay<C>>,
    pub name: Option<String>,
}

impl<C> Transition<C> {
    /// Triggerless, untimed transitions fire on completion.
    pub fn is_completion(&self) -> bool {
        self.triggers.is_empty() && self.timer.is_none()
    }

    pub fn is_timed(&self) -> bool {
        self.timer.is_some()
    }

    pub fn is_else(&self) -> bool {
        self.guard.as_ref().map(Guard::is_else).unwrap_or(false)
    }

    /// Returns true if this transition is triggered by the event.
    ///
    /// Time events are routed to their transition by id and never match
    /// by name.
    pub fn matches(&self, event: &Event) -> bool {
        match event.kind {
            EventKind::Signal => self.triggers.iter().any(|t| t == &event.name),
            EventKind::Completion => self.is_completion(),
            EventKind::Time => false,
        }
    }
}

impl<C> Clone for Transition<C> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            source: self.source,
            target: self.target,
            kind: self.kind,
            triggers: self.triggers.clone(),
            guard: self.guard.clone(),
            effect: self.effect.clone(),
            timer: self.timer.clone(),
            name: self.name.clone(),
        }
    }
}

impl<C> fmt::Debug for Transition<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("target", &self.target)
            .field("kind", &self.kind)
            .field("triggers", &self.triggers)
            .field("guard", &self.guard)
            .field("effect", &self.effect.is_some())
            .field("timer", &self.timer)
            .finish()
    }
}
