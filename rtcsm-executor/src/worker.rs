//! Shard worker.
//!
//! A worker task owns a set of executions and is the only place they are
//! touched. Commands from handles and wakeups from timers and activities are
//! multiplexed onto the same loop, so one execution never sees two events
//! at once. The serial executor is a worker hosting a single execution; the
//! sharded pool runs one worker per shard.

use crate::config::TakeMode;
use crate::error::ExecutorError;
use crate::executor::Executor;
use async_trait::async_trait;
use rtcsm_core::{
    EngineError, Execution, ExecutionId, ExecutionStatus, RuntimeLink, Snapshot, TakeOutcome,
    Wakeup,
};
use rtcsm_model::Event;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type Reply<T> = oneshot::Sender<Result<T, ExecutorError>>;

pub(crate) enum Command<C> {
    Register {
        execution: Box<Execution<C>>,
        status: Arc<SharedStatus>,
        reply: Reply<()>,
    },
    Go {
        id: ExecutionId,
        reply: Reply<()>,
    },
    Take {
        id: ExecutionId,
        event: Event,
        reply: Option<Reply<TakeOutcome>>,
    },
    Pause {
        id: ExecutionId,
        reply: Reply<Snapshot<C>>,
    },
    Resume {
        id: ExecutionId,
        snapshot: Snapshot<C>,
        reply: Reply<()>,
    },
    Snapshot {
        id: ExecutionId,
        reply: Reply<Snapshot<C>>,
    },
    Remove {
        id: ExecutionId,
        reply: Reply<Snapshot<C>>,
    },
}

/// Execution status mirrored out of the worker.
///
/// Read without a round trip to the worker; it trails the worker by at most
/// the command in flight.
#[derive(Debug, Default)]
pub struct SharedStatus {
    started: AtomicBool,
    paused: AtomicBool,
    terminated: AtomicBool,
    faulted: AtomicBool,
    processed: AtomicU64,
}

impl SharedStatus {
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    /// Events and wakeups handled so far.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> ExecutionStatus {
        if self.is_faulted() {
            ExecutionStatus::Faulted
        } else if self.is_terminated() {
            ExecutionStatus::Terminated
        } else if self.is_paused() {
            ExecutionStatus::Paused
        } else if self.started.load(Ordering::Acquire) {
            ExecutionStatus::Running
        } else {
            ExecutionStatus::Idle
        }
    }

    fn update<C>(&self, execution: &Execution<C>) {
        let status = execution.status();
        self.started
            .store(execution.is_started(), Ordering::Release);
        self.paused
            .store(status == ExecutionStatus::Paused, Ordering::Release);
        self.terminated
            .store(status == ExecutionStatus::Terminated, Ordering::Release);
        self.faulted
            .store(status == ExecutionStatus::Faulted, Ordering::Release);
    }
}

struct Hosted<C> {
    execution: Execution<C>,
    status: Arc<SharedStatus>,
}

/// Worker loop hosting a set of executions.
pub struct ShardWorker<C> {
    shard: usize,
    executions: HashMap<ExecutionId, Hosted<C>>,
    commands: mpsc::Receiver<Command<C>>,
    wakeups: mpsc::UnboundedReceiver<Wakeup>,
    wakeup_tx: mpsc::UnboundedSender<Wakeup>,
    handle: Handle,
    shutdown: CancellationToken,
}

impl<C> ShardWorker<C>
where
    C: Clone + Send + 'static,
{
    /// Spawns a worker on the current runtime.
    pub(crate) fn spawn(
        shard: usize,
        queue_capacity: usize,
        shutdown: CancellationToken,
    ) -> Result<(mpsc::Sender<Command<C>>, JoinHandle<()>), ExecutorError> {
        let handle = Handle::try_current().map_err(|_| ExecutorError::NoRuntime)?;
        let (tx, commands) = mpsc::channel(queue_capacity.max(1));
        let (wakeup_tx, wakeups) = mpsc::unbounded_channel();
        let worker = ShardWorker {
            shard,
            executions: HashMap::new(),
            commands,
            wakeups,
            wakeup_tx,
            handle: handle.clone(),
            shutdown,
        };
        Ok((tx, handle.spawn(worker.run())))
    }

    async fn run(mut self) {
        tracing::debug!("Shard worker {} started", self.shard);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(wakeup) = self.wakeups.recv() => self.handle_wakeup(wakeup),
            }
        }

        tracing::debug!(
            "Shard worker {} stopped ({} executions)",
            self.shard,
            self.executions.len()
        );
    }

    fn handle_command(&mut self, command: Command<C>) {
        match command {
            Command::Register {
                execution,
                status,
                reply,
            } => {
                let _ = reply.send(self.register(*execution, status));
            }
            Command::Go { id, reply } => {
                let _ = reply.send(self.with(&id, |e| e.go()));
            }
            Command::Take { id, event, reply } => {
                let name = event.name.clone();
                let result = self.with(&id, |e| e.take(event));
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            tracing::warn!("Dropped event '{}' for '{}': {}", name, id, e);
                        }
                    }
                }
            }
            Command::Pause { id, reply } => {
                let _ = reply.send(self.with(&id, |e| e.pause()));
            }
            Command::Resume {
                id,
                snapshot,
                reply,
            } => {
                let _ = reply.send(self.with(&id, |e| e.resume(snapshot)));
            }
            Command::Snapshot { id, reply } => {
                let _ = reply.send(self.with(&id, |e| Ok(e.snapshot())));
            }
            Command::Remove { id, reply } => {
                let result = self
                    .executions
                    .remove(&id)
                    .map(|hosted| hosted.execution.snapshot())
                    .ok_or_else(|| ExecutorError::ExecutionNotFound(id.to_string()));
                let _ = reply.send(result);
            }
        }
    }

    fn register(
        &mut self,
        mut execution: Execution<C>,
        status: Arc<SharedStatus>,
    ) -> Result<(), ExecutorError> {
        let id = execution.id().clone();
        if self.executions.contains_key(&id) {
            return Err(ExecutorError::ExecutionExists(id.to_string()));
        }
        execution.set_runtime(RuntimeLink::new(
            self.handle.clone(),
            self.wakeup_tx.clone(),
        ));
        status.update(&execution);
        tracing::debug!("Shard {} hosts execution '{}'", self.shard, id);
        self.executions.insert(id, Hosted { execution, status });
        Ok(())
    }

    fn with<R>(
        &mut self,
        id: &ExecutionId,
        op: impl FnOnce(&mut Execution<C>) -> Result<R, EngineError>,
    ) -> Result<R, ExecutorError> {
        let hosted = self
            .executions
            .get_mut(id)
            .ok_or_else(|| ExecutorError::ExecutionNotFound(id.to_string()))?;
        let result = op(&mut hosted.execution);
        hosted.status.update(&hosted.execution);
        hosted.status.processed.fetch_add(1, Ordering::Relaxed);
        Ok(result?)
    }

    fn handle_wakeup(&mut self, wakeup: Wakeup) {
        let id = wakeup.execution().clone();
        match self.executions.get_mut(&id) {
            Some(hosted) => {
                if let Err(e) = hosted.execution.handle_wakeup(wakeup) {
                    tracing::warn!("Wakeup failed for execution '{}': {}", id, e);
                }
                hosted.status.update(&hosted.execution);
                hosted.status.processed.fetch_add(1, Ordering::Relaxed);
            }
            None => tracing::trace!("Dropping wakeup for removed execution '{}'", id),
        }
    }
}

/// Handle to an execution hosted by a worker.
pub struct ExecutionHandle<C> {
    id: ExecutionId,
    commands: mpsc::Sender<Command<C>>,
    status: Arc<SharedStatus>,
    take_mode: TakeMode,
}

impl<C> Clone for ExecutionHandle<C> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            commands: self.commands.clone(),
            status: Arc::clone(&self.status),
            take_mode: self.take_mode,
        }
    }
}

impl<C> ExecutionHandle<C>
where
    C: Send + 'static,
{
    /// Hands an execution to a worker.
    pub(crate) async fn register(
        commands: mpsc::Sender<Command<C>>,
        execution: Execution<C>,
        take_mode: TakeMode,
    ) -> Result<Self, ExecutorError> {
        let handle = Self {
            id: execution.id().clone(),
            commands,
            status: Arc::new(SharedStatus::default()),
            take_mode,
        };
        let status = Arc::clone(&handle.status);
        handle
            .request(move |reply| Command::Register {
                execution: Box::new(execution),
                status,
                reply,
            })
            .await?;
        Ok(handle)
    }

    pub fn id(&self) -> &ExecutionId {
        &self.id
    }

    pub fn take_mode(&self) -> TakeMode {
        self.take_mode
    }

    pub fn shared_status(&self) -> &Arc<SharedStatus> {
        &self.status
    }

    pub async fn go(&self) -> Result<(), ExecutorError> {
        let id = self.id.clone();
        self.request(|reply| Command::Go { id, reply }).await
    }

    /// Submits an event.
    ///
    /// A paused execution is rejected without a round trip. In
    /// fire-and-forget mode the call returns once the event is queued.
    pub async fn take(&self, event: Event) -> Result<TakeOutcome, ExecutorError> {
        if self.status.is_paused() {
            return Err(EngineError::Paused.into());
        }
        let id = self.id.clone();
        match self.take_mode {
            TakeMode::FireAndForget => {
                self.commands
                    .send(Command::Take {
                        id,
                        event,
                        reply: None,
                    })
                    .await
                    .map_err(|_| ExecutorError::Closed)?;
                Ok(TakeOutcome::Queued)
            }
            TakeMode::WaitForCompletion => {
                self.request(|reply| Command::Take {
                    id,
                    event,
                    reply: Some(reply),
                })
                .await
            }
        }
    }

    /// Pauses after every event queued ahead of it.
    pub async fn pause(&self) -> Result<Snapshot<C>, ExecutorError> {
        let id = self.id.clone();
        self.request(|reply| Command::Pause { id, reply }).await
    }

    pub async fn resume(&self, snapshot: Snapshot<C>) -> Result<(), ExecutorError> {
        let id = self.id.clone();
        self.request(|reply| Command::Resume {
            id,
            snapshot,
            reply,
        })
        .await
    }

    pub async fn snapshot(&self) -> Result<Snapshot<C>, ExecutorError> {
        let id = self.id.clone();
        self.request(|reply| Command::Snapshot { id, reply }).await
    }

    /// Removes the execution from its worker and returns its last snapshot.
    pub async fn remove(&self) -> Result<Snapshot<C>, ExecutorError> {
        let id = self.id.clone();
        self.request(|reply| Command::Remove { id, reply }).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command<C>,
    ) -> Result<T, ExecutorError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| ExecutorError::Closed)?;
        rx.await.map_err(|_| ExecutorError::Closed)?
    }
}

#[async_trait]
impl<C> Executor<C> for ExecutionHandle<C>
where
    C: Send + 'static,
{
    fn id(&self) -> &ExecutionId {
        &self.id
    }

    async fn go(&self) -> Result<(), ExecutorError> {
        ExecutionHandle::go(self).await
    }

    async fn take(&self, event: Event) -> Result<TakeOutcome, ExecutorError> {
        ExecutionHandle::take(self, event).await
    }

    async fn pause(&self) -> Result<Snapshot<C>, ExecutorError> {
        ExecutionHandle::pause(self).await
    }

    async fn resume(&self, snapshot: Snapshot<C>) -> Result<(), ExecutorError> {
        ExecutionHandle::resume(self, snapshot).await
    }

    async fn snapshot(&self) -> Result<Snapshot<C>, ExecutorError> {
        ExecutionHandle::snapshot(self).await
    }
}

impl<C> std::fmt::Debug for ExecutionHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("id", &self.id)
            .field("status", &self.status.status())
            .field("take_mode", &self.take_mode)
            .finish()
    }
}
