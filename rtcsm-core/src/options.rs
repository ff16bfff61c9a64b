//! Per-execution engine options.

use serde::{Deserialize, Serialize};

/// What happens when a composite state is entered without an explicit
/// descendant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultEntryPolicy {
    /// Follow the region's initial pseudostate.
    #[default]
    Initial,
    /// Refuse the entry and fault the execution.
    None,
}

impl std::str::FromStr for DefaultEntryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "initial" => Ok(DefaultEntryPolicy::Initial),
            "none" => Ok(DefaultEntryPolicy::None),
            other => Err(format!("unknown default entry policy: {}", other)),
        }
    }
}

/// Engine options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionOptions {
    pub default_entry: DefaultEntryPolicy,

    /// Upper bound on completion transitions fired while processing one
    /// event.
    pub max_completion_chain: usize,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            default_entry: DefaultEntryPolicy::Initial,
            max_completion_chain: 1000,
        }
    }
}

impl ExecutionOptions {
    pub fn with_default_entry(mut self, policy: DefaultEntryPolicy) -> Self {
        self.default_entry = policy;
        self
    }

    pub fn with_max_completion_chain(mut self, limit: usize) -> Self {
        self.max_completion_chain = limit;
        self
    }
}
