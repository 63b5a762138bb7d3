use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use stagehand::config::Config;
use stagehand::core::ItemStatus;
use stagehand::orchestration::{
    CheckpointStore, FileCheckpointStore, HandlerRegistry, Orchestrator, RunContext, RunEvent,
    RunId, RunOutcome, RunState, ShellHandler,
};
use stagehand::{Error, Manifest, Result};

/// Stagehand - staged batch orchestrator for dependent work items
#[derive(Parser, Debug)]
#[command(name = "stagehand")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    STAGEHAND_DEBUG=1   Enable debug logging (alternative to --debug)\n    STAGEHAND_LOG       Log filter directive (overrides both)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.stagehand/stagehand.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file (default: ~/.stagehand/stagehand.toml)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Validate a manifest and print its stages
    Plan {
        /// Manifest file (.json or .toml)
        manifest: PathBuf,

        /// Print stages as JSON
        #[arg(long)]
        json: bool,
    },

    /// Execute a manifest stage by stage
    Run {
        /// Manifest file (.json or .toml)
        manifest: PathBuf,

        /// Run identifier (generated if omitted)
        #[arg(long)]
        run_id: Option<String>,

        /// Continue the run from its checkpoints (requires --run-id)
        #[arg(long, requires = "run_id")]
        resume: bool,

        /// Override max_concurrency from the config
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Show the checkpointed stages of a run
    Status {
        /// Run identifier
        run_id: String,
    },
}

fn main() {
    let cli = Cli::parse();
    stagehand::log::init_with_debug(cli.debug);
    tracing::info!(debug = stagehand::log::is_debug(), "stagehand starting");

    match dispatch(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {}", e);
            std::process::exit(3);
        }
    }
}

fn dispatch(cli: Cli) -> Result<i32> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Plan { manifest, json } => run_plan(&manifest, json),
        Command::Run {
            manifest,
            run_id,
            resume,
            concurrency,
        } => run_manifest(config, &manifest, run_id, resume, concurrency),
        Command::Status { run_id } => run_status(config, &run_id),
    }
}

fn run_plan(path: &Path, json: bool) -> Result<i32> {
    let manifest = Manifest::load(path)?;
    let graph = manifest.graph()?;
    let stages = graph.stages();

    if json {
        println!("{}", serde_json::to_string_pretty(&stages)?);
        return Ok(0);
    }

    println!("{} items in {} stages", graph.len(), stages.len());
    for stage in &stages {
        let ids: Vec<&str> = stage.items.iter().map(|id| id.as_str()).collect();
        println!("  stage {}: {}", stage.index, ids.join(", "));
    }
    Ok(0)
}

fn run_manifest(
    mut config: Config,
    path: &Path,
    run_id: Option<String>,
    resume: bool,
    concurrency: Option<usize>,
) -> Result<i32> {
    let manifest = Manifest::load(path)?;
    if let Some(n) = concurrency {
        config.max_concurrency = n;
    }
    if let Some(kinds) = &manifest.critical_kinds {
        config.critical_kinds = kinds.clone();
    }
    config.validate()?;

    let run_id = match run_id {
        Some(raw) => RunId::parse(&raw)?,
        None => RunId::generate(),
    };
    let store: Arc<dyn CheckpointStore> =
        Arc::new(FileCheckpointStore::new(config.checkpoints_dir()?));
    let ctx = RunContext::new(run_id, store, config.orchestrator_config());

    let base_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let registry = HandlerRegistry::new().with_all(Arc::new(ShellHandler::with_base_dir(base_dir)));
    tracing::debug!(kinds = ?registry.kinds(), "shell handler registered");

    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(async {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let printer = tokio::spawn(print_events(event_rx));
        let orchestrator = Orchestrator::new(registry).with_events(event_tx);

        eprintln!("run {}", ctx.run_id);
        let outcome = if resume {
            orchestrator.resume(&ctx, manifest.items).await
        } else {
            orchestrator.run(&ctx, manifest.items).await
        };
        // Dropping the orchestrator closes the event channel.
        drop(orchestrator);
        let _ = printer.await;
        outcome
    })?;

    println!("{}", serde_json::to_string_pretty(&outcome.report)?);
    Ok(exit_code(&outcome))
}

/// 0: done without failures, 1: done with failures, 2: aborted.
fn exit_code(outcome: &RunOutcome) -> i32 {
    match outcome.state {
        RunState::Aborted => 2,
        _ if outcome.report.has_failures() => 1,
        _ => 0,
    }
}

async fn print_events(mut events: mpsc::UnboundedReceiver<RunEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            RunEvent::Staged { stages } => eprintln!("staged into {} stages", stages.len()),
            RunEvent::StageStarted { index, items } => {
                eprintln!("stage {} ({} items)", index, items.len())
            }
            RunEvent::StageReplayed { index } => eprintln!("stage {} replayed from checkpoint", index),
            RunEvent::ItemFinished { item, status } => eprintln!("  {} {}", status_marker(status), item),
            RunEvent::StageCheckpointed { index } => eprintln!("stage {} checkpointed", index),
            RunEvent::Aborted { stage, item } => {
                eprintln!("aborted in stage {}: critical item {} failed", stage, item)
            }
            RunEvent::Finished { state } => eprintln!("finished: {}", state),
            RunEvent::ItemStarted { .. } | RunEvent::ItemHeartbeat { .. } => {}
        }
    }
}

fn status_marker(status: ItemStatus) -> &'static str {
    match status {
        ItemStatus::Success => "✓",
        ItemStatus::Partial => "~",
        ItemStatus::Failure => "✗",
    }
}

fn run_status(config: Config, raw_id: &str) -> Result<i32> {
    let run_id = RunId::parse(raw_id)?;
    let store = FileCheckpointStore::new(config.checkpoints_dir()?);

    let rt = tokio::runtime::Runtime::new()?;
    let checkpoints = rt.block_on(store.load_run(&run_id))?;
    if checkpoints.is_empty() {
        return Err(Error::Validation(format!("no checkpoints for run {}", run_id)));
    }

    println!("Run {}", run_id);
    if let Some(path) = stagehand::log::log_path() {
        println!("  log {}", path.display());
    }
    for checkpoint in &checkpoints {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for result in checkpoint.items.values() {
            *counts.entry(result.status.to_string()).or_default() += 1;
        }
        let summary: Vec<String> = counts
            .iter()
            .map(|(status, n)| format!("{} {}", n, status))
            .collect();
        println!(
            "  stage {}  {}  {}",
            checkpoint.stage_index,
            checkpoint.written_at.format("%Y-%m-%d %H:%M:%S"),
            summary.join(", ")
        );
    }
    Ok(0)
}
