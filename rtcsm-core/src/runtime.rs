//! Execution identity and the link to the async runtime.
//!
//! Timers and activities complete outside the execution. They report back
//! as [`Wakeup`] messages on a channel owned by whoever drives the
//! execution, which feeds them to
//! [`Execution::handle_wakeup`](crate::Execution::handle_wakeup) on the same
//! serialized path as regular events.

use rtcsm_model::{BehaviorError, TransitionId, VertexId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// Identity of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random id.
    pub fn generate() -> Self {
        Self(format!("exec-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExecutionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ExecutionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Asynchronous completion reported back to an execution.
#[derive(Debug, Clone)]
pub enum Wakeup {
    /// A timed transition's delay elapsed.
    Timer {
        execution: ExecutionId,
        transition: TransitionId,
        generation: u64,
        elapsed: Duration,
    },
    /// A do-activity returned.
    ActivityFinished {
        execution: ExecutionId,
        state: VertexId,
        generation: u64,
        outcome: Result<(), BehaviorError>,
    },
}

impl Wakeup {
    pub fn execution(&self) -> &ExecutionId {
        match self {
            Wakeup::Timer { execution, .. } => execution,
            Wakeup::ActivityFinished { execution, .. } => execution,
        }
    }
}

/// Runtime handle and wakeup channel used for timers and activities.
#[derive(Debug, Clone)]
pub struct RuntimeLink {
    handle: Handle,
    wakeups: mpsc::UnboundedSender<Wakeup>,
}

impl RuntimeLink {
    pub fn new(handle: Handle, wakeups: mpsc::UnboundedSender<Wakeup>) -> Self {
        Self { handle, wakeups }
    }

    /// Links to the runtime of the calling task, if any.
    pub fn current(wakeups: mpsc::UnboundedSender<Wakeup>) -> Option<Self> {
        Handle::try_current()
            .ok()
            .map(|handle| Self::new(handle, wakeups))
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<Wakeup> {
        self.wakeups.clone()
    }
}
