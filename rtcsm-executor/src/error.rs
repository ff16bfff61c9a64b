//! Executor error types.

use rtcsm_core::EngineError;
use thiserror::Error;

/// Executor errors.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("execution is already in use by another caller")]
    ConcurrentAccess,

    #[error("execution '{0}' not found")]
    ExecutionNotFound(String),

    #[error("execution '{0}' already exists")]
    ExecutionExists(String),

    #[error("executor is shut down")]
    Closed,

    #[error("no tokio runtime available")]
    NoRuntime,
}

impl ExecutorError {
    /// Returns a stable error code for reporting.
    pub fn error_code(&self) -> &'static str {
        match self {
            ExecutorError::Engine(e) => e.error_code(),
            ExecutorError::ConcurrentAccess => "CONCURRENT_ACCESS",
            ExecutorError::ExecutionNotFound(_) => "EXECUTION_NOT_FOUND",
            ExecutorError::ExecutionExists(_) => "EXECUTION_EXISTS",
            ExecutorError::Closed => "CLOSED",
            ExecutorError::NoRuntime => "NO_RUNTIME",
        }
    }

    /// Returns whether the call may succeed if simply retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutorError::ConcurrentAccess)
    }

    /// Returns the engine error, if this wraps one.
    pub fn engine(&self) -> Option<&EngineError> {
        match self {
            ExecutorError::Engine(e) => Some(e),
            _ => None,
        }
    }
}
