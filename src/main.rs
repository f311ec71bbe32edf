mod doctor;
mod planner;

use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use layerflow_core::config::AppConfig;
use layerflow_core::event::WorkflowEvent;
use layerflow_core::graph::TaskGraph;
use layerflow_core::types::ExecutionMode;
use layerflow_engine::WorkflowEngine;

#[derive(Parser)]
#[command(name = "layerflow", version, about = "Run multi-layer AI workflows as dependency graphs")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "layerflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a task graph from a JSON file
    Run {
        /// Graph file
        graph: PathBuf,
        /// sequential, parallel, or adaptive (default from config)
        #[arg(long)]
        mode: Option<ExecutionMode>,
        /// Print workflow events to stderr as they happen
        #[arg(long)]
        progress: bool,
    },
    /// Validate a graph and print its phases
    Plan {
        /// Graph file
        graph: PathBuf,
    },
    /// Plan a graph from a free-text request and run it
    Ask {
        /// The request
        #[arg(trailing_var_arg = true, required = true)]
        prompt: Vec<String>,
        #[arg(long)]
        mode: Option<ExecutionMode>,
        /// Print the planned graph instead of running it
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        progress: bool,
    },
    /// Initialize and probe every layer (exits 1 if any check fails)
    Doctor,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("layerflow=info,warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "layerflow", &mut std::io::stdout());
        return Ok(());
    }

    load_env_files();
    let config = load_config(&cli.config)?;
    let registry = layerflow_layers::build_registry(&config);

    match cli.command {
        Commands::Run {
            graph,
            mode,
            progress,
        } => {
            let graph = TaskGraph::load(&graph)?;
            let engine = WorkflowEngine::from_config(registry, &config);
            let mode = mode.unwrap_or(engine.default_mode());
            if !run_graph(&engine, &graph, mode, progress).await? {
                std::process::exit(1);
            }
        }
        Commands::Plan { graph } => {
            let graph = TaskGraph::load(&graph)?;
            let engine = WorkflowEngine::from_config(registry, &config);
            print_plan(&engine, &graph)?;
        }
        Commands::Ask {
            prompt,
            mode,
            dry_run,
            progress,
        } => {
            let graph = planner::plan_from_prompt(&prompt.join(" "));
            if dry_run {
                println!("{}", serde_json::to_string_pretty(&graph)?);
                return Ok(());
            }
            let engine = WorkflowEngine::from_config(registry, &config);
            let mode = mode.unwrap_or(engine.default_mode());
            if !run_graph(&engine, &graph, mode, progress).await? {
                std::process::exit(1);
            }
        }
        Commands::Doctor => {
            println!("layerflow doctor");
            println!();
            if doctor::run_doctor(&config, &registry).await > 0 {
                std::process::exit(1);
            }
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

/// Run `graph` and print the result as JSON. Returns whether it succeeded.
async fn run_graph(
    engine: &WorkflowEngine,
    graph: &TaskGraph,
    mode: ExecutionMode,
    progress: bool,
) -> anyhow::Result<bool> {
    for (kind, outcome) in engine.registry().initialize_all().await {
        if outcome.is_ok() {
            info!(layer = %kind, "Layer ready");
        }
    }

    let printer = progress.then(|| spawn_progress_printer(engine));
    let outcome = engine.execute_workflow(graph, mode).await;
    let result = match outcome {
        Ok(result) => {
            if let Some(printer) = printer {
                printer.await.ok();
            }
            result
        }
        Err(e) => {
            if let Some(printer) = printer {
                printer.abort();
            }
            return Err(e.into());
        }
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(result.success)
}

fn spawn_progress_printer(engine: &WorkflowEngine) -> JoinHandle<()> {
    let mut rx = engine.event_bus().subscribe();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            };
            match event {
                WorkflowEvent::WorkflowStarted { mode, steps, .. } => {
                    eprintln!("[run] {} steps, {} mode", steps, mode);
                }
                WorkflowEvent::PhaseStarted { index, step_ids, .. } => {
                    eprintln!("[phase {}] {}", index, step_ids.join(", "));
                }
                WorkflowEvent::StepStarted { step_id, layer, .. } => {
                    eprintln!("  -> {} ({})", step_id, layer);
                }
                WorkflowEvent::StepRetrying {
                    step_id,
                    attempt,
                    backoff_ms,
                    error,
                    ..
                } => {
                    eprintln!("  .. {} attempt {} failed, retrying in {}ms: {}", step_id, attempt, backoff_ms, error);
                }
                WorkflowEvent::FallbackTriggered {
                    step_id,
                    fallback_id,
                    layer,
                    ..
                } => {
                    eprintln!("  !! {} failed, falling back to {} ({})", step_id, fallback_id, layer);
                }
                WorkflowEvent::StepFinished {
                    step_id,
                    success,
                    duration_ms,
                    error_kind,
                    ..
                } => {
                    if success {
                        eprintln!("  ok {} ({}ms)", step_id, duration_ms);
                    } else {
                        let kind = error_kind
                            .and_then(|k| serde_json::to_value(k).ok())
                            .and_then(|v| v.as_str().map(String::from))
                            .unwrap_or_else(|| "error".into());
                        eprintln!("  FAIL {} [{}] ({}ms)", step_id, kind, duration_ms);
                    }
                }
                WorkflowEvent::WorkflowFinished {
                    success,
                    total_duration_ms,
                    ..
                } => {
                    let status = if success { "succeeded" } else { "failed" };
                    eprintln!("[run] {} in {}ms", status, total_duration_ms);
                    break;
                }
            }
        }
    })
}

fn print_plan(engine: &WorkflowEngine, graph: &TaskGraph) -> anyhow::Result<()> {
    let plan = engine.plan(graph)?;
    println!("{} steps in {} phases", plan.step_count(), plan.phases.len());
    for (index, phase) in plan.phases.iter().enumerate() {
        println!("  phase {}: {}", index, phase.join(", "));
    }
    for (step_id, fallback) in &graph.fallback_strategies {
        println!(
            "  fallback: {} -> {} ({} {})",
            step_id, fallback.id, fallback.layer, fallback.action
        );
    }
    println!(
        "adaptive mode would run {}",
        plan.effective_mode(ExecutionMode::Adaptive)
    );
    let estimate = engine.estimate(graph)?;
    match estimate.cost {
        Some(cost) => println!(
            "estimated {}s, ${:.4}",
            estimate.duration.as_secs(),
            cost
        ),
        None => println!("estimated {}s", estimate.duration.as_secs()),
    }
    Ok(())
}

/// `.env` in the working directory first, then `~/.layerflow/.env`.
/// Variables already set are never overwritten.
fn load_env_files() {
    if let Ok(path) = dotenvy::dotenv() {
        info!(path = %path.display(), "Loaded environment file");
    }
    if let Some(home) = dirs_home() {
        let path = home.join(".layerflow").join(".env");
        if path.exists() {
            if let Err(e) = dotenvy::from_path(&path) {
                warn!(path = %path.display(), error = %e, "Failed to read environment file");
            }
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }

    // Check for config in the home directory
    if let Some(home_config) = dirs_home().map(|h| h.join(".layerflow").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }

    warn!(path = %path.display(), "No config file found, using defaults");
    Ok(AppConfig::default())
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
