//! Executions.
//!
//! An [`Execution`] pairs a shared model with one mutable context and all
//! per-instance runtime state. It is driven by exactly one caller at a
//! time; the executors in `rtcsm-executor` provide that serialization.

use crate::activity::ActivityTable;
use crate::configuration::Configuration;
use crate::error::EngineError;
use crate::history::HistoryStore;
use crate::listener::{LifecycleEvent, Listener, Listeners};
use crate::options::ExecutionOptions;
use crate::rtc::Step;
use crate::runtime::{ExecutionId, RuntimeLink, Wakeup};
use crate::snapshot::{self, Snapshot};
use crate::timer::TimerScheduler;
use rtcsm_model::{Event, StateMachine};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// Name of the event passed to behaviours run while starting.
pub const START_EVENT: &str = "$start";

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Created, `go` not called yet.
    Idle,
    Running,
    Paused,
    /// Reached a terminate pseudostate or completed.
    Terminated,
    /// A fatal error occurred.
    Faulted,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Idle => "idle",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Terminated => "terminated",
            ExecutionStatus::Faulted => "faulted",
        }
    }
}

/// What the engine is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnginePhase {
    Idle,
    Dispatching,
    Exiting,
    Firing,
    Entering,
    Terminated,
}

/// Result of submitting an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TakeOutcome {
    /// At least one transition fired.
    Accepted,
    /// Nothing was enabled.
    Denied,
    /// Held back by an active state until it can be handled.
    Deferred,
    /// Enqueued without waiting for the outcome.
    Queued,
}

/// One running instance of a state machine.
pub struct Execution<C> {
    pub(crate) id: ExecutionId,
    pub(crate) model: Arc<StateMachine<C>>,
    pub(crate) context: C,
    pub(crate) options: ExecutionOptions,
    pub(crate) configuration: Configuration,
    pub(crate) history: HistoryStore,
    pub(crate) status: ExecutionStatus,
    pub(crate) phase: EnginePhase,
    pub(crate) fault: Option<String>,
    pub(crate) started: bool,
    pub(crate) terminated: bool,
    pub(crate) timers: TimerScheduler,
    pub(crate) activities: ActivityTable,
    pub(crate) deferred: VecDeque<Event>,
    pub(crate) listeners: Listeners,
    pub(crate) runtime: Option<RuntimeLink>,
    pub(crate) step: Step,
}

impl<C> Execution<C>
where
    C: Clone + Send + 'static,
{
    /// Creates an execution with default options and a generated id.
    pub fn new(model: Arc<StateMachine<C>>, context: C) -> Self {
        Self::from_parts(
            ExecutionId::generate(),
            model,
            context,
            ExecutionOptions::default(),
            Listeners::new(),
            None,
        )
    }

    fn from_parts(
        id: ExecutionId,
        model: Arc<StateMachine<C>>,
        context: C,
        options: ExecutionOptions,
        listeners: Listeners,
        runtime: Option<RuntimeLink>,
    ) -> Self {
        let configuration = Configuration::new(&model);
        Self {
            id,
            model,
            context,
            options,
            configuration,
            history: HistoryStore::new(),
            status: ExecutionStatus::Idle,
            phase: EnginePhase::Idle,
            fault: None,
            started: false,
            terminated: false,
            timers: TimerScheduler::new(),
            activities: ActivityTable::new(),
            deferred: VecDeque::new(),
            listeners,
            runtime,
            step: Step::default(),
        }
    }

    /// Starts the execution by entering every root region.
    ///
    /// Calling `go` twice is an error.
    pub fn go(&mut self) -> Result<(), EngineError> {
        if self.started {
            return Err(EngineError::AlreadyStarted);
        }
        self.started = true;
        self.status = ExecutionStatus::Running;
        tracing::info!(
            "Starting execution '{}' of machine '{}'",
            self.id,
            self.model.name()
        );
        self.notify(|| LifecycleEvent::MachineStarted);

        let result = self.start();
        self.settle(result)
    }

    /// Processes one event to completion.
    pub fn take(&mut self, event: impl Into<Event>) -> Result<TakeOutcome, EngineError> {
        let event = event.into();
        match self.status {
            ExecutionStatus::Running => {}
            ExecutionStatus::Idle => return Err(EngineError::NotStarted),
            ExecutionStatus::Paused => return Err(EngineError::Paused),
            ExecutionStatus::Faulted => {
                return Err(EngineError::Faulted {
                    reason: self.fault.clone().unwrap_or_default(),
                })
            }
            ExecutionStatus::Terminated => {
                if !event.is_synthetic() {
                    self.notify(|| LifecycleEvent::EventDenied {
                        event: event.name.clone(),
                    });
                }
                return Ok(TakeOutcome::Denied);
            }
        }

        let result = self.dispatch(event);
        self.settle(result)
    }

    /// Processes a timer or activity completion.
    ///
    /// Stale wakeups and wakeups arriving while the execution is not
    /// running are dropped.
    pub fn handle_wakeup(&mut self, wakeup: Wakeup) -> Result<(), EngineError> {
        if wakeup.execution() != &self.id {
            return Err(EngineError::ExecutionMismatch {
                expected: self.id.to_string(),
                found: wakeup.execution().to_string(),
            });
        }
        if self.status != ExecutionStatus::Running {
            tracing::trace!("Dropping wakeup for {} execution '{}'", self.status.as_str(), self.id);
            return Ok(());
        }
        let result = self.wake(wakeup);
        self.settle(result)
    }

    /// Stops event intake and returns a snapshot.
    pub fn pause(&mut self) -> Result<Snapshot<C>, EngineError> {
        match self.status {
            ExecutionStatus::Running => {}
            ExecutionStatus::Idle => return Err(EngineError::NotStarted),
            ExecutionStatus::Paused => return Err(EngineError::Paused),
            ExecutionStatus::Terminated => return Err(EngineError::Terminated),
            ExecutionStatus::Faulted => {
                return Err(EngineError::Faulted {
                    reason: self.fault.clone().unwrap_or_default(),
                })
            }
        }
        self.status = ExecutionStatus::Paused;
        tracing::info!("Paused execution '{}'", self.id);
        Ok(self.snapshot())
    }

    /// Reinstalls the state described by a snapshot and resumes.
    ///
    /// Every key is validated before the execution is touched. Restored
    /// states get their timers re-armed and activities restarted; their
    /// entry behaviours do not run again.
    pub fn resume(&mut self, snapshot: Snapshot<C>) -> Result<(), EngineError> {
        if self.terminated || snapshot.terminated {
            return Err(EngineError::CannotResumeTerminated);
        }
        match self.status {
            ExecutionStatus::Paused | ExecutionStatus::Idle => {}
            ExecutionStatus::Running => return Err(EngineError::NotPaused),
            ExecutionStatus::Terminated => return Err(EngineError::CannotResumeTerminated),
            ExecutionStatus::Faulted => {
                return Err(EngineError::Faulted {
                    reason: self.fault.clone().unwrap_or_default(),
                })
            }
        }

        let result = self.reinstall(snapshot);
        self.settle(result)
    }

    /// Returns a snapshot of the current state.
    pub fn snapshot(&self) -> Snapshot<C> {
        Snapshot {
            execution_id: self.id.clone(),
            state_configuration: snapshot::capture_configuration(&self.model, &self.configuration),
            history: snapshot::capture_history(&self.model, &self.history),
            started: self.started,
            terminated: self.terminated,
            context: self.context.clone(),
            deferred: self.deferred.iter().cloned().collect(),
        }
    }

    /// Attaches the runtime used for timers and activities.
    pub fn set_runtime(&mut self, link: RuntimeLink) {
        self.runtime = Some(link);
    }

    pub fn add_listener(&mut self, listener: Arc<dyn Listener>) {
        self.listeners.add(listener);
    }
}

impl<C> Execution<C> {
    pub fn id(&self) -> &ExecutionId {
        &self.id
    }

    pub fn model(&self) -> &Arc<StateMachine<C>> {
        &self.model
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn phase(&self) -> EnginePhase {
        self.phase
    }

    /// Reason of the fault, if the execution is faulted.
    pub fn fault(&self) -> Option<&str> {
        self.fault.as_deref()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// Number of events waiting on a deferring state.
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    pub fn has_runtime(&self) -> bool {
        self.runtime.is_some()
    }

    /// Returns true if the vertex with this key is active.
    pub fn is_active(&self, key: &str) -> bool {
        self.model
            .find_vertex(key)
            .map(|v| self.configuration.contains(v))
            .unwrap_or(false)
    }

    /// Keys of the active vertices, parents first.
    pub fn active_states(&self) -> Vec<String> {
        self.configuration
            .active_vertices()
            .into_iter()
            .map(|v| self.model.vertex(v).key.clone())
            .collect()
    }

    pub(crate) fn notify(&self, build: impl FnOnce() -> LifecycleEvent) {
        self.listeners.notify(&self.id, build);
    }
}

impl<C> std::fmt::Debug for Execution<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Execution")
            .field("id", &self.id)
            .field("machine", &self.model.name())
            .field("status", &self.status)
            .field("active", &self.active_states())
            .finish()
    }
}

/// Builder for [`Execution`].
pub struct ExecutionBuilder<C> {
    id: Option<ExecutionId>,
    model: Option<Arc<StateMachine<C>>>,
    context: Option<C>,
    options: ExecutionOptions,
    listeners: Listeners,
    runtime: Option<RuntimeLink>,
}

impl<C> Default for ExecutionBuilder<C> {
    fn default() -> Self {
        Self {
            id: None,
            model: None,
            context: None,
            options: ExecutionOptions::default(),
            listeners: Listeners::new(),
            runtime: None,
        }
    }
}

impl<C> ExecutionBuilder<C>
where
    C: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<ExecutionId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn model(mut self, model: Arc<StateMachine<C>>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn context(mut self, context: C) -> Self {
        self.context = Some(context);
        self
    }

    pub fn options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn Listener>) -> Self {
        self.listeners.add(listener);
        self
    }

    pub fn runtime(mut self, link: RuntimeLink) -> Self {
        self.runtime = Some(link);
        self
    }

    pub fn build(self) -> Result<Execution<C>, EngineError> {
        let model = self.model.ok_or(EngineError::MissingModel)?;
        let context = self.context.ok_or(EngineError::MissingContext)?;
        Ok(Execution::from_parts(
            self.id.unwrap_or_else(ExecutionId::generate),
            model,
            context,
            self.options,
            self.listeners,
            self.runtime,
        ))
    }
}
