//! Lock-serialized executor.
//!
//! One dedicated worker drains a FIFO queue for a single execution. `take`
//! may be called from any task; events are processed one at a time in
//! submission order.

use crate::config::{ExecutorConfig, TakeMode};
use crate::error::ExecutorError;
use crate::executor::Executor;
use crate::worker::{ExecutionHandle, SharedStatus, ShardWorker};
use async_trait::async_trait;
use rtcsm_core::{Execution, ExecutionId, Snapshot, TakeOutcome};
use rtcsm_model::Event;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Runs one execution on its own worker task.
pub struct SerialExecutor<C> {
    handle: ExecutionHandle<C>,
    worker: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl<C> SerialExecutor<C>
where
    C: Clone + Send + 'static,
{
    /// Starts a worker for `execution`. Must be called inside a tokio
    /// runtime.
    pub async fn spawn(execution: Execution<C>, config: &ExecutorConfig) -> Result<Self, ExecutorError> {
        Self::with_capacity(execution, config.queue_capacity, config.take_mode).await
    }

    pub async fn with_capacity(
        execution: Execution<C>,
        queue_capacity: usize,
        take_mode: TakeMode,
    ) -> Result<Self, ExecutorError> {
        let shutdown = CancellationToken::new();
        let (commands, worker) = ShardWorker::spawn(0, queue_capacity, shutdown.clone())?;
        let id = execution.id().clone();
        let handle = ExecutionHandle::register(commands, execution, take_mode).await?;
        tracing::info!("Serial executor started for execution '{}'", id);
        Ok(Self {
            handle,
            worker: Some(worker),
            shutdown,
        })
    }

    /// Returns a cloneable handle for submitting from other tasks.
    pub fn handle(&self) -> ExecutionHandle<C> {
        self.handle.clone()
    }

    pub fn status(&self) -> &Arc<SharedStatus> {
        self.handle.shared_status()
    }

    /// Stops the worker. Queued commands that were not yet processed are
    /// dropped.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
        tracing::info!("Serial executor for '{}' stopped", self.handle.id());
    }
}

impl<C> Drop for SerialExecutor<C> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl<C> Executor<C> for SerialExecutor<C>
where
    C: Clone + Send + 'static,
{
    fn id(&self) -> &ExecutionId {
        self.handle.id()
    }

    async fn go(&self) -> Result<(), ExecutorError> {
        self.handle.go().await
    }

    async fn take(&self, event: Event) -> Result<TakeOutcome, ExecutorError> {
        self.handle.take(event).await
    }

    async fn pause(&self) -> Result<Snapshot<C>, ExecutorError> {
        self.handle.pause().await
    }

    async fn resume(&self, snapshot: Snapshot<C>) -> Result<(), ExecutorError> {
        self.handle.resume(snapshot).await
    }

    async fn snapshot(&self) -> Result<Snapshot<C>, ExecutorError> {
        self.handle.snapshot().await
    }
}
