//! drover - orchestration engine
//!
//! Main entry point for the engine binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use drover_core::plan::Plan;
use drover_core::RunState;
use drover::engine::RunOptions;
use drover::{Engine, EngineConfig};
use eyre::{eyre, WrapErr};
use tracing_subscriber::{fmt, EnvFilter};

/// Orchestration engine: executes dependency-ordered plans as external
/// processes with retries, timeouts, and a persistent audit trail.
#[derive(Parser)]
#[command(name = "drover")]
#[command(about = "Plan orchestration engine")]
#[command(version)]
struct Cli {
    /// Path to the SQLite database (defaults to ~/.local/share/drover/drover.db)
    #[arg(long, global = true, env = "DROVER_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a plan file to completion
    Run {
        /// Path to the plan JSON file
        plan: PathBuf,

        /// Substitution variables, KEY=VALUE (repeatable)
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,

        /// Project the run belongs to
        #[arg(long, default_value = "default")]
        project_id: String,

        /// Phase the run belongs to
        #[arg(long, default_value = "default")]
        phase_id: String,

        /// Override the plan's maxConcurrency
        #[arg(long)]
        max_concurrency: Option<usize>,

        /// Control-loop poll interval in milliseconds
        #[arg(long, default_value = "500")]
        poll_interval_ms: u64,
    },

    /// Parse and validate a plan file without executing it
    Validate {
        /// Path to the plan JSON file
        plan: PathBuf,

        /// Substitution variables, KEY=VALUE (repeatable)
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,
    },
}

fn parse_var(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got: {raw}"))
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            plan,
            vars,
            project_id,
            phase_id,
            max_concurrency,
            poll_interval_ms,
        } => {
            let vars: BTreeMap<String, String> = vars.into_iter().collect();
            let plan = Plan::from_file(&plan, &vars)
                .wrap_err_with(|| format!("failed to load plan: {}", plan.display()))?;

            let config = match cli.db {
                Some(db_path) => EngineConfig { db_path },
                None => EngineConfig::default(),
            };
            let engine = Engine::new(config)
                .await
                .wrap_err("failed to open database")?;

            let options = RunOptions {
                project_id,
                phase_id,
                max_concurrency,
                poll_interval: Duration::from_millis(poll_interval_ms),
            };
            let run = engine.run_plan(&plan, &options).await?;

            println!("run {} finished: {}", run.id, run.state.as_str());
            if run.state != RunState::Succeeded {
                std::process::exit(1);
            }
            Ok(())
        }

        Command::Validate { plan, vars } => {
            let vars: BTreeMap<String, String> = vars.into_iter().collect();
            let parsed = Plan::from_file(&plan, &vars)
                .wrap_err_with(|| format!("failed to load plan: {}", plan.display()))?;
            parsed
                .validate()
                .map_err(|e| eyre!("invalid plan {}: {e}", parsed.plan_id))?;

            println!(
                "plan {} is valid ({} steps, maxConcurrency {})",
                parsed.plan_id,
                parsed.steps.len(),
                parsed.globals.max_concurrency
            );
            Ok(())
        }
    }
}
