//! # rtcsm-core
//!
//! Run-to-completion engine for rtcsm.
//!
//! This crate provides:
//! - The per-execution state configuration tree and history records
//! - Transition selection and firing with pseudostate resolution
//! - Time events and do-activities with cooperative cancellation
//! - Lifecycle listeners and a broadcast fan-out
//! - Snapshot, pause and resume

pub mod activity;
pub mod broadcast;
pub mod configuration;
pub mod error;
pub mod execution;
pub mod history;
pub mod listener;
pub mod options;
mod rtc;
pub mod runtime;
pub mod snapshot;
pub mod timer;

#[cfg(test)]
mod scenarios;

pub use broadcast::{create_broadcaster, LifecycleBroadcaster, LifecycleFilter, LifecycleNotice};
pub use configuration::{ConfigNode, Configuration};
pub use error::EngineError;
pub use execution::{EnginePhase, Execution, ExecutionBuilder, ExecutionStatus, TakeOutcome};
pub use history::HistoryStore;
pub use listener::{LifecycleEvent, Listener, ListenerError, Listeners};
pub use options::{DefaultEntryPolicy, ExecutionOptions};
pub use runtime::{ExecutionId, RuntimeLink, Wakeup};
pub use snapshot::{Snapshot, SnapshotNode};
