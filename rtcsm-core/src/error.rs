//! Engine error types.

use rtcsm_model::BehaviorError;
use thiserror::Error;

/// Errors from the run-to-completion engine.
///
/// Every error except the lifecycle checks below leaves the execution
/// faulted; see [`EngineError::is_fatal`].
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("execution already started")]
    AlreadyStarted,

    #[error("execution not started")]
    NotStarted,

    #[error("execution is paused")]
    Paused,

    #[error("execution is not paused")]
    NotPaused,

    #[error("execution is faulted: {reason}")]
    Faulted { reason: String },

    #[error("execution is terminated")]
    Terminated,

    #[error("execution is terminated and cannot be resumed")]
    CannotResumeTerminated,

    #[error("snapshot belongs to execution '{found}', expected '{expected}'")]
    ExecutionMismatch { expected: String, found: String },

    #[error("state not found: {id}")]
    StateNotFound { id: String },

    #[error("region not found: {id}")]
    RegionNotFound { id: String },

    #[error("invalid snapshot: {reason}")]
    InvalidSnapshot { reason: String },

    #[error("no default entry for region '{region}'")]
    NoDefaultEntry { region: String },

    #[error("region '{region}' already holds '{active}', cannot enter '{entering}'")]
    ConfigurationConflict {
        region: String,
        active: String,
        entering: String,
    },

    #[error("cannot enter '{vertex}': its container is not active")]
    DetachedVertex { vertex: String },

    #[error("no enabled branch leaving '{vertex}'")]
    NoEnabledBranch { vertex: String },

    #[error("completion chain exceeded {limit} transitions")]
    CompletionLoop { limit: usize },

    #[error("guard of '{transition}' failed: {source}")]
    Guard {
        transition: String,
        #[source]
        source: BehaviorError,
    },

    #[error("effect of '{transition}' failed: {source}")]
    Effect {
        transition: String,
        #[source]
        source: BehaviorError,
    },

    #[error("entry of '{state}' failed: {source}")]
    Entry {
        state: String,
        #[source]
        source: BehaviorError,
    },

    #[error("exit of '{state}' failed: {source}")]
    Exit {
        state: String,
        #[source]
        source: BehaviorError,
    },

    #[error("activity of '{state}' failed: {source}")]
    Activity {
        state: String,
        #[source]
        source: BehaviorError,
    },

    #[error("no runtime attached, cannot start {what}")]
    RuntimeUnavailable { what: &'static str },

    #[error("execution requires a model")]
    MissingModel,

    #[error("execution requires a context")]
    MissingContext,
}

impl EngineError {
    /// Returns true if this error leaves the execution unusable.
    ///
    /// Lifecycle misuse (calling an operation in the wrong state) is
    /// reported without changing the execution.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            EngineError::AlreadyStarted
                | EngineError::NotStarted
                | EngineError::Paused
                | EngineError::NotPaused
                | EngineError::Faulted { .. }
                | EngineError::Terminated
                | EngineError::CannotResumeTerminated
                | EngineError::ExecutionMismatch { .. }
                | EngineError::MissingModel
                | EngineError::MissingContext
        )
    }

    /// Returns true for failures raised by host guards, effects, actions
    /// or activities.
    pub fn is_user_fault(&self) -> bool {
        matches!(
            self,
            EngineError::Guard { .. }
                | EngineError::Effect { .. }
                | EngineError::Entry { .. }
                | EngineError::Exit { .. }
                | EngineError::Activity { .. }
        )
    }

    /// Returns a stable error code for reporting.
    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::AlreadyStarted
            | EngineError::NotStarted
            | EngineError::Paused
            | EngineError::NotPaused
            | EngineError::Terminated
            | EngineError::CannotResumeTerminated
            | EngineError::ExecutionMismatch { .. } => "INVALID_LIFECYCLE",
            EngineError::Faulted { .. } => "FAULTED",
            EngineError::StateNotFound { .. } => "STATE_NOT_FOUND",
            EngineError::RegionNotFound { .. } => "REGION_NOT_FOUND",
            EngineError::InvalidSnapshot { .. } => "BAD_SNAPSHOT",
            EngineError::NoDefaultEntry { .. }
            | EngineError::ConfigurationConflict { .. }
            | EngineError::DetachedVertex { .. }
            | EngineError::NoEnabledBranch { .. }
            | EngineError::CompletionLoop { .. } => "CONFIGURATION_FAULT",
            EngineError::Guard { .. } => "GUARD_FAILED",
            EngineError::Effect { .. } => "EFFECT_FAILED",
            EngineError::Entry { .. } | EngineError::Exit { .. } => "ACTION_FAILED",
            EngineError::Activity { .. } => "ACTIVITY_FAILED",
            EngineError::RuntimeUnavailable { .. } => "NO_RUNTIME",
            EngineError::MissingModel | EngineError::MissingContext => "BAD_REQUEST",
        }
    }
}
