//! The executor contract.

use crate::error::ExecutorError;
use async_trait::async_trait;
use rtcsm_core::{ExecutionId, Snapshot, TakeOutcome};
use rtcsm_model::Event;

/// Control surface shared by every executor.
///
/// Implementations differ in where the engine runs and how calls are
/// serialized; the observable semantics of one execution are the same.
#[async_trait]
pub trait Executor<C>: Send + Sync
where
    C: Send + 'static,
{
    fn id(&self) -> &ExecutionId;

    /// Enters the initial configuration.
    async fn go(&self) -> Result<(), ExecutorError>;

    /// Submits one event.
    async fn take(&self, event: Event) -> Result<TakeOutcome, ExecutorError>;

    /// Stops event intake and returns a snapshot.
    async fn pause(&self) -> Result<Snapshot<C>, ExecutorError>;

    /// Reinstalls a snapshot and resumes event intake.
    async fn resume(&self, snapshot: Snapshot<C>) -> Result<(), ExecutorError>;

    async fn snapshot(&self) -> Result<Snapshot<C>, ExecutorError>;
}
