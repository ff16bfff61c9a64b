//! rtcsm - run-to-completion state machine runner
//!
//! Loads a JSON machine definition and drives it through one of the
//! executors, printing each event's outcome and the final configuration.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use rtcsm_executor::{Config, ExecutorKind, TakeMode};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rtcsm")]
#[command(about = "Run-to-completion engine for hierarchical, concurrent state machines")]
#[command(version)]
struct Cli {
    /// Executor configuration file (YAML)
    #[arg(short, long, env = "RTCSM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a definition and print a summary of its model
    Validate {
        /// Definition file (JSON)
        definition: PathBuf,
    },

    /// Start an execution and feed it events
    Run {
        /// Definition file (JSON)
        definition: PathBuf,

        /// Event to submit, in order; `name` or `name={"payload": ...}`
        #[arg(short, long = "event")]
        events: Vec<String>,

        /// Initial context JSON
        #[arg(long)]
        ctx: Option<String>,

        /// Execution ID (generated if not provided)
        #[arg(long)]
        id: Option<String>,

        /// Executor to use (overrides configuration)
        #[arg(short = 'x', long)]
        executor: Option<ExecutorKind>,

        /// Return as soon as events are queued
        #[arg(long)]
        fire_and_forget: bool,

        /// Milliseconds to wait for timers and activities before the final snapshot
        #[arg(short, long, default_value = "0")]
        wait_ms: u64,

        /// Print lifecycle events as they happen
        #[arg(long)]
        trace: bool,

        /// Print the final snapshot as JSON
        #[arg(long)]
        snapshot: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match Config::from_file(path) {
            Ok(c) => {
                tracing::info!("Loaded config from {}", path.display());
                c
            }
            Err(e) => {
                eprintln!("{}: {}", "Error".red(), e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    config.apply_overrides(|key| std::env::var(key).ok());

    let result = match cli.command {
        Commands::Validate { definition } => commands::validate(&definition),
        Commands::Run {
            definition,
            events,
            ctx,
            id,
            executor,
            fire_and_forget,
            wait_ms,
            trace,
            snapshot,
        } => {
            if let Some(kind) = executor {
                config.executor.kind = kind;
            }
            if fire_and_forget {
                config.executor.take_mode = TakeMode::FireAndForget;
            }
            if let Err(e) = config.validate() {
                eprintln!("{}: {}", "Error".red(), e);
                std::process::exit(1);
            }
            let args = commands::RunArgs {
                definition,
                events,
                ctx,
                id,
                wait_ms,
                trace,
                snapshot,
            };
            commands::run(args, &config).await
        }
    };

    match result {
        Ok(output) => {
            println!("{}", output);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }
}
