//! # rtcsm-executor
//!
//! Execution strategies for rtcsm.
//!
//! This crate provides:
//! - [`SyncExecutor`]: runs on the calling thread, rejects overlapping calls
//! - [`SerialExecutor`]: one worker task per execution with a FIFO queue
//! - [`ShardedPool`]: N shard workers, executions pinned by key
//! - [`Config`]: executor configuration from YAML and environment
//!
//! All of them implement [`Executor`], so hosts can switch strategies
//! without changing how they drive an execution.

pub mod config;
pub mod error;
pub mod executor;
pub mod pool;
pub mod serial;
pub mod shard;
pub mod sync;
pub mod worker;

pub use config::{
    Config, ConfigError, EngineConfig, ExecutorConfig, ExecutorKind, PoolConfig, TakeMode,
};
pub use error::ExecutorError;
pub use executor::Executor;
pub use pool::{PoolExecution, ShardedPool};
pub use serial::SerialExecutor;
pub use shard::shard_for;
pub use sync::SyncExecutor;
pub use worker::{ExecutionHandle, SharedStatus};
