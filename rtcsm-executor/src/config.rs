//! Executor configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via RTCSM_CONFIG or --config)
//! 3. Environment variables

use rtcsm_core::{DefaultEntryPolicy, ExecutionOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Executor configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Executor selection.
    pub executor: ExecutorConfig,
    /// Sharded pool configuration.
    pub pool: PoolConfig,
    /// Engine options handed to every execution.
    pub engine: EngineConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("RTCSM_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from any key/value source.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        self.executor.apply_overrides(&lookup);
        self.pool.apply_overrides(&lookup);
        self.engine.apply_overrides(&lookup);
    }

    /// Rejects values the executors cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executor.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "executor.queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.pool.shards == 0 {
            return Err(ConfigError::ValidationError(
                "pool.shards must be greater than 0".to_string(),
            ));
        }
        if self.pool.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "pool.queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.engine.max_completion_chain == 0 {
            return Err(ConfigError::ValidationError(
                "engine.max_completion_chain must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Which executor drives executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    /// On the calling thread.
    Sync,
    /// One worker task per execution.
    #[default]
    Serial,
    /// Fixed pool of shard workers.
    Pool,
}

impl std::str::FromStr for ExecutorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sync" => Ok(ExecutorKind::Sync),
            "serial" => Ok(ExecutorKind::Serial),
            "pool" => Ok(ExecutorKind::Pool),
            other => Err(format!("unknown executor: {}", other)),
        }
    }
}

/// What `take` waits for on the queued executors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TakeMode {
    /// Enqueue and return `Queued` immediately.
    FireAndForget,
    /// Wait until the event has been processed.
    #[default]
    WaitForCompletion,
}

impl std::str::FromStr for TakeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "fire_and_forget" => Ok(TakeMode::FireAndForget),
            "wait_for_completion" | "wait" => Ok(TakeMode::WaitForCompletion),
            other => Err(format!("unknown take mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub kind: ExecutorKind,
    pub take_mode: TakeMode,
    /// Command queue size of a serial executor. Callers wait when it is full.
    pub queue_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kind: ExecutorKind::Serial,
            take_mode: TakeMode::WaitForCompletion,
            queue_capacity: 1024,
        }
    }
}

impl ExecutorConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(kind) = lookup("RTCSM_EXECUTOR") {
            match kind.parse() {
                Ok(k) => self.kind = k,
                Err(e) => tracing::warn!("Ignoring RTCSM_EXECUTOR: {}", e),
            }
        }

        if let Some(mode) = lookup("RTCSM_TAKE_MODE") {
            match mode.parse() {
                Ok(m) => self.take_mode = m,
                Err(e) => tracing::warn!("Ignoring RTCSM_TAKE_MODE: {}", e),
            }
        }

        if let Some(cap) = lookup("RTCSM_QUEUE_CAPACITY") {
            if let Ok(n) = cap.parse() {
                self.queue_capacity = n;
            }
        }
    }
}

/// Sharded pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of shard workers.
    pub shards: usize,
    /// Command queue size of each shard.
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            shards: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            queue_capacity: 256,
        }
    }
}

impl PoolConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(shards) = lookup("RTCSM_POOL_SHARDS") {
            if let Ok(n) = shards.parse() {
                self.shards = n;
            }
        }

        if let Some(cap) = lookup("RTCSM_POOL_QUEUE_CAPACITY") {
            if let Ok(n) = cap.parse() {
                self.queue_capacity = n;
            }
        }
    }
}

/// Engine options, as configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub default_entry: DefaultEntryPolicy,
    pub max_completion_chain: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let options = ExecutionOptions::default();
        Self {
            default_entry: options.default_entry,
            max_completion_chain: options.max_completion_chain,
        }
    }
}

impl EngineConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(policy) = lookup("RTCSM_DEFAULT_ENTRY") {
            match policy.parse() {
                Ok(p) => self.default_entry = p,
                Err(e) => tracing::warn!("Ignoring RTCSM_DEFAULT_ENTRY: {}", e),
            }
        }

        if let Some(limit) = lookup("RTCSM_MAX_COMPLETION_CHAIN") {
            if let Ok(n) = limit.parse() {
                self.max_completion_chain = n;
            }
        }
    }

    /// Returns the options handed to new executions.
    pub fn options(&self) -> ExecutionOptions {
        ExecutionOptions::default()
            .with_default_entry(self.default_entry)
            .with_max_completion_chain(self.max_completion_chain)
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
