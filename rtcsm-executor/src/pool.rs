//! Sharded-pool executor.
//!
//! A fixed number of shard workers share all executions. Each execution is
//! pinned to one shard by a key (its id unless given explicitly), so its
//! events serialize on that shard while other shards run in parallel. Shard
//! queues are bounded: submitters wait while their shard is full.

use crate::config::{Config, PoolConfig, TakeMode};
use crate::error::ExecutorError;
use crate::executor::Executor;
use crate::shard::shard_for;
use crate::worker::{Command, ExecutionHandle, SharedStatus, ShardWorker};
use async_trait::async_trait;
use rtcsm_core::{Execution, ExecutionId, Snapshot, TakeOutcome};
use rtcsm_model::Event;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Fixed pool of shard workers.
pub struct ShardedPool<C> {
    shards: Vec<mpsc::Sender<Command<C>>>,
    workers: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
    take_mode: TakeMode,
}

impl<C> ShardedPool<C>
where
    C: Clone + Send + 'static,
{
    /// Starts the shard workers. Must be called inside a tokio runtime.
    pub fn new(config: &PoolConfig, take_mode: TakeMode) -> Result<Self, ExecutorError> {
        let shutdown = CancellationToken::new();
        let count = config.shards.max(1);
        let mut shards = Vec::with_capacity(count);
        let mut workers = Vec::with_capacity(count);
        for shard in 0..count {
            let (commands, worker) =
                ShardWorker::spawn(shard, config.queue_capacity, shutdown.clone())?;
            shards.push(commands);
            workers.push(worker);
        }

        tracing::info!(
            "Sharded pool started ({} shards, queue capacity {})",
            count,
            config.queue_capacity
        );

        Ok(Self {
            shards,
            workers,
            shutdown,
            take_mode,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ExecutorError> {
        Self::new(&config.pool, config.executor.take_mode)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Returns the shard a key maps to.
    pub fn shard_of(&self, key: &str) -> usize {
        shard_for(key, self.shards.len())
    }

    /// Hosts an execution on the shard of its id.
    pub async fn register(&self, execution: Execution<C>) -> Result<PoolExecution<C>, ExecutorError> {
        let key = execution.id().to_string();
        self.register_with_key(execution, &key).await
    }

    /// Hosts an execution on the shard of an explicit key. Executions that
    /// share a key share a shard.
    pub async fn register_with_key(
        &self,
        execution: Execution<C>,
        key: &str,
    ) -> Result<PoolExecution<C>, ExecutorError> {
        let shard = self.shard_of(key);
        let commands = self.shards[shard].clone();
        let handle = ExecutionHandle::register(commands, execution, self.take_mode).await?;
        tracing::debug!("Execution '{}' assigned to shard {}", handle.id(), shard);
        Ok(PoolExecution { handle, shard })
    }

    /// Stops every worker. Executions still hosted are dropped.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
        tracing::info!("Sharded pool stopped");
    }
}

impl<C> Drop for ShardedPool<C> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// An execution hosted by a [`ShardedPool`].
#[derive(Debug)]
pub struct PoolExecution<C> {
    handle: ExecutionHandle<C>,
    shard: usize,
}

impl<C> Clone for PoolExecution<C> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            shard: self.shard,
        }
    }
}

impl<C> PoolExecution<C>
where
    C: Send + 'static,
{
    pub fn shard(&self) -> usize {
        self.shard
    }

    pub fn status(&self) -> &Arc<SharedStatus> {
        self.handle.shared_status()
    }

    /// Removes the execution from the pool and returns its last snapshot.
    pub async fn remove(self) -> Result<Snapshot<C>, ExecutorError> {
        self.handle.remove().await
    }
}

#[async_trait]
impl<C> Executor<C> for PoolExecution<C>
where
    C: Send + 'static,
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
