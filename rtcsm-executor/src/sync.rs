//! Synchronous executor.
//!
//! The engine runs on the calling thread. Nothing is queued: the caller owns
//! serialization, and overlapping calls are rejected rather than blocked.
//! Timer and activity completions are collected on a channel and applied at
//! the start of the next call, or explicitly through
//! [`SyncExecutor::poll_wakeups`].

use crate::error::ExecutorError;
use crate::executor::Executor;
use async_trait::async_trait;
use parking_lot::Mutex;
use rtcsm_core::{
    EngineError, Execution, ExecutionBuilder, ExecutionId, ExecutionStatus, RuntimeLink, Snapshot,
    TakeOutcome, Wakeup,
};
use rtcsm_model::Event;
use tokio::sync::mpsc;

/// Runs one execution on the caller's thread.
pub struct SyncExecutor<C> {
    id: ExecutionId,
    execution: Mutex<Execution<C>>,
    wakeups: Mutex<mpsc::UnboundedReceiver<Wakeup>>,
}

impl<C> SyncExecutor<C>
where
    C: Clone + Send + 'static,
{
    /// Builds the execution. A missing model or context fails here.
    ///
    /// When called inside a tokio runtime, timers and activities are
    /// scheduled on it; otherwise models that use them fault on entry.
    pub fn new(builder: ExecutionBuilder<C>) -> Result<Self, ExecutorError> {
        let mut execution = builder.build()?;
        let (tx, rx) = mpsc::unbounded_channel();
        match RuntimeLink::current(tx) {
            Some(link) => execution.set_runtime(link),
            None => tracing::debug!(
                "No runtime for execution '{}', timers and activities are unavailable",
                execution.id()
            ),
        }

        Ok(Self {
            id: execution.id().clone(),
            execution: Mutex::new(execution),
            wakeups: Mutex::new(rx),
        })
    }

    pub fn go(&self) -> Result<(), ExecutorError> {
        self.run(|execution| execution.go())
    }

    pub fn take(&self, event: impl Into<Event>) -> Result<TakeOutcome, ExecutorError> {
        let event = event.into();
        self.run(move |execution| execution.take(event))
    }

    pub fn pause(&self) -> Result<Snapshot<C>, ExecutorError> {
        self.run(|execution| execution.pause())
    }

    pub fn resume(&self, snapshot: Snapshot<C>) -> Result<(), ExecutorError> {
        self.run(move |execution| execution.resume(snapshot))
    }

    /// Applies pending wakeups, then snapshots.
    pub fn snapshot(&self) -> Result<Snapshot<C>, ExecutorError> {
        self.run(|execution| Ok(execution.snapshot()))
    }

    /// Applies every pending timer and activity completion. Returns how
    /// many were handled.
    pub fn poll_wakeups(&self) -> Result<usize, ExecutorError> {
        let mut execution = self.lock()?;
        Ok(self.drain(&mut execution)?)
    }

    /// Reads the execution.
    pub fn inspect<R>(&self, f: impl FnOnce(&Execution<C>) -> R) -> Result<R, ExecutorError> {
        let execution = self.lock()?;
        Ok(f(&execution))
    }

    pub fn status(&self) -> Result<ExecutionStatus, ExecutorError> {
        self.inspect(|execution| execution.status())
    }

    fn lock(&self) -> Result<parking_lot::MutexGuard<'_, Execution<C>>, ExecutorError> {
        self.execution
            .try_lock()
            .ok_or(ExecutorError::ConcurrentAccess)
    }

    fn run<R>(
        &self,
        op: impl FnOnce(&mut Execution<C>) -> Result<R, EngineError>,
    ) -> Result<R, ExecutorError> {
        let mut execution = self.lock()?;
        self.drain(&mut execution)?;
        Ok(op(&mut execution)?)
    }

    fn drain(&self, execution: &mut Execution<C>) -> Result<usize, EngineError> {
        let mut wakeups = self.wakeups.lock();
        let mut handled = 0;
        while let Ok(wakeup) = wakeups.try_recv() {
            execution.handle_wakeup(wakeup)?;
            handled += 1;
        }
        Ok(handled)
    }
}

#[async_trait]
impl<C> Executor<C> for SyncExecutor<C>
where
    C: Clone + Send + 'static,
{
    fn id(&self) -> &ExecutionId {
        &self.id
    }

    async fn go(&self) -> Result<(), ExecutorError> {
        SyncExecutor::go(self)
    }

    async fn take(&self, event: Event) -> Result<TakeOutcome, ExecutorError> {
        SyncExecutor::take(self, event)
    }

    async fn pause(&self) -> Result<Snapshot<C>, ExecutorError> {
        SyncExecutor::pause(self)
    }

    async fn resume(&self, snapshot: Snapshot<C>) -> Result<(), ExecutorError> {
        SyncExecutor::resume(self, snapshot)
    }

    async fn snapshot(&self) -> Result<Snapshot<C>, ExecutorError> {
        SyncExecutor::snapshot(self)
    }
}

impl<C> std::fmt::Debug for SyncExecutor<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncExecutor").field("id", &self.id).finish()
    }
}
