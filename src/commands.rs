//! Command implementations.

use colored::Colorize;
use rtcsm_core::{
    ExecutionBuilder, ExecutionId, LifecycleEvent, Listener, ListenerError, Snapshot, TakeOutcome,
};
use rtcsm_executor::{
    Config, Executor, ExecutorKind, SerialExecutor, ShardedPool, SyncExecutor,
};
use rtcsm_model::{Event, MachineDefinition};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

type CommandResult = Result<String, Box<dyn std::error::Error>>;

pub struct RunArgs {
    pub definition: PathBuf,
    pub events: Vec<String>,
    pub ctx: Option<String>,
    pub id: Option<String>,
    pub wait_ms: u64,
    pub trace: bool,
    pub snapshot: bool,
}

/// Loads a definition file, naming the machine after the file stem.
fn load_definition(path: &Path) -> Result<MachineDefinition, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read '{}': {}", path.display(), e))?;
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("machine")
        .to_string();
    Ok(MachineDefinition::from_json_str(name, 1, &text)?)
}

/// Parses `name` or `name={"payload": ...}`.
pub fn parse_event(spec: &str) -> Result<Event, Box<dyn std::error::Error>> {
    match spec.split_once('=') {
        Some((name, payload)) => {
            let payload: Value = serde_json::from_str(payload)
                .map_err(|e| format!("invalid payload for '{}': {}", name, e))?;
            Ok(Event::new(name).with_payload(payload))
        }
        None => Ok(Event::new(spec)),
    }
}

pub fn validate(path: &Path) -> CommandResult {
    let definition = load_definition(path)?;
    let machine = definition.machine();
    Ok(format!(
        "{} machine {} (checksum {})\n  vertices: {}\n  regions: {}\n  transitions: {}",
        "Valid".green(),
        definition.name.cyan(),
        definition.checksum,
        machine.vertex_count(),
        machine.region_count(),
        machine.transition_count()
    ))
}

fn outcome_label(outcome: TakeOutcome) -> String {
    match outcome {
        TakeOutcome::Accepted => "accepted".green().to_string(),
        TakeOutcome::Denied => "denied".yellow().to_string(),
        TakeOutcome::Deferred => "deferred".blue().to_string(),
        TakeOutcome::Queued => "queued".dimmed().to_string(),
    }
}

fn trace_listener() -> Arc<dyn Listener> {
    Arc::new(
        |_: &ExecutionId, event: &LifecycleEvent| -> Result<(), ListenerError> {
            let line = match event.state() {
                Some(state) => format!("  {} {}", event.kind(), state),
                None => format!("  {}", event.kind()),
            };
            eprintln!("{}", line.dimmed());
            Ok(())
        },
    )
}

pub async fn run(args: RunArgs, config: &Config) -> CommandResult {
    let definition = load_definition(&args.definition)?;
    let ctx: Value = match &args.ctx {
        Some(text) => serde_json::from_str(text).map_err(|e| format!("invalid context: {}", e))?,
        None => Value::Object(Default::default()),
    };
    let events = args
        .events
        .iter()
        .map(|spec| parse_event(spec))
        .collect::<Result<Vec<_>, _>>()?;

    let mut builder = ExecutionBuilder::new()
        .model(definition.machine())
        .context(ctx)
        .options(config.engine.options());
    if let Some(id) = &args.id {
        builder = builder.id(id.as_str());
    }
    if args.trace {
        builder = builder.listener(trace_listener());
    }

    // The pool must outlive the execution it hosts.
    let mut pool: Option<ShardedPool<Value>> = None;
    let executor: Box<dyn Executor<Value>> = match config.executor.kind {
        ExecutorKind::Sync => Box::new(SyncExecutor::new(builder)?),
        ExecutorKind::Serial => {
            Box::new(SerialExecutor::spawn(builder.build()?, &config.executor).await?)
        }
        ExecutorKind::Pool => {
            let shards = ShardedPool::from_config(config)?;
            let hosted = shards.register(builder.build()?).await?;
            pool = Some(shards);
            Box::new(hosted)
        }
    };

    let mut out = vec![format!(
        "{} {} ({:?} executor)",
        "Started".green(),
        executor.id().as_str().cyan(),
        config.executor.kind
    )];
    executor.go().await?;

    for event in events {
        let name = event.name.clone();
        let outcome = executor.take(event).await?;
        out.push(format!("  {} -> {}", name.bold(), outcome_label(outcome)));
    }

    if args.wait_ms > 0 {
        tokio::time::sleep(Duration::from_millis(args.wait_ms)).await;
    }

    let snapshot = executor.snapshot().await?;
    out.push(describe(&snapshot));
    if args.snapshot {
        out.push(serde_json::to_string_pretty(&snapshot)?);
    }

    if let Some(pool) = pool {
        pool.shutdown().await;
    }
    Ok(out.join("\n"))
}

fn describe(snapshot: &Snapshot<Value>) -> String {
    let status = if snapshot.terminated {
        "terminated".red().to_string()
    } else {
        "running".green().to_string()
    };
    format!(
        "{}: [{}] ({})\n{}: {}",
        "Active".bold(),
        snapshot.active_ids().join(", ").yellow(),
        status,
        "Context".bold(),
        snapshot.context
    )
}
