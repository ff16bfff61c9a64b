//! Model error types.

use thiserror::Error;

/// Errors raised while building or loading a static model.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("duplicate vertex key: {key}")]
    DuplicateVertex { key: String },

    #[error("duplicate region key: {key}")]
    DuplicateRegion { key: String },

    #[error("region '{region}' declares more than one {kind} pseudostate")]
    DuplicatePseudostate { region: String, kind: &'static str },

    #[error("unknown vertex: {key}")]
    UnknownVertex { key: String },

    #[error("unknown submachine: {name}")]
    UnknownSubmachine { name: String },

    #[error("vertex '{key}' cannot own {what}")]
    InvalidOwner { key: String, what: &'static str },

    #[error("invalid machine definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("invalid guard expression: {reason}")]
    InvalidGuard { reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ModelError {
    /// Returns a stable error code for reporting.
    pub fn error_code(&self) -> &'static str {
        match self {
            ModelError::DuplicateVertex { .. } | ModelError::DuplicateRegion { .. } => {
                "DUPLICATE_KEY"
            }
            ModelError::DuplicatePseudostate { .. } => "DUPLICATE_PSEUDOSTATE",
            ModelError::UnknownVertex { .. } | ModelError::UnknownSubmachine { .. } => {
                "NOT_FOUND"
            }
            ModelError::InvalidOwner { .. } => "INVALID_OWNER",
            ModelError::InvalidDefinition { .. } => "BAD_DEFINITION",
            ModelError::InvalidGuard { .. } => "BAD_GUARD",
            ModelError::Json(_) => "BAD_REQUEST",
        }
    }
}
