mod gate;
mod script;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures_util::StreamExt;
use serde::Serialize;
use tiller_kernel::{KernelBuilder, LogFormat, RolloutRequest, TillerConfig};
use tiller_protocol::{
    EventId, KnowledgeProvider, RecallKind, RolloutId, SortOrder, TrajectoryQuery,
};
use tiller_recall::{ProviderSet, RecallCoordinator, load_knowledge_dir};
use tiller_runtime::EchoRuntime;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::gate::{GatePolicy, answer_gates};
use crate::script::ScriptFile;

#[derive(Debug, Parser)]
#[command(name = "tillerd")]
#[command(about = "tiller agent execution engine")]
struct Cli {
    #[arg(long, default_value = ".tiller")]
    root: PathBuf,
    /// TOML config; every section is optional.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, value_enum)]
    log_format: Option<CliLogFormat>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliLogFormat {
    Compact,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a scripted agent against the echo runtime.
    Run {
        #[arg(long)]
        script: PathBuf,
        #[arg(long)]
        rollout: Option<String>,
        #[arg(long)]
        label: Option<String>,
        /// Print events as they are appended.
        #[arg(long)]
        follow: bool,
        /// How to answer tool calls held by `[confirmation].gate`.
        #[arg(long, value_enum, default_value_t = GatePolicy::Prompt)]
        on_gate: GatePolicy,
    },
    /// Print a rollout's stored events.
    Events {
        rollout: String,
        #[arg(long, default_value_t = 0)]
        from: EventId,
        #[arg(long)]
        to: Option<EventId>,
    },
    /// Print the agent-visible view of a rollout.
    View {
        rollout: String,
        #[arg(long)]
        as_of: Option<EventId>,
    },
    /// List archived trajectories.
    Trajectories {
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        rollout: Option<String>,
        /// Only rollouts delegated by this parent.
        #[arg(long)]
        parent: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long)]
        ascending: bool,
    },
    /// Query the knowledge providers.
    Recall {
        #[arg(long)]
        query: String,
        #[arg(long)]
        knowledge_dir: Option<PathBuf>,
    },
}

fn init_tracing(config: &TillerConfig, format: Option<CliLogFormat>) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.filter));
    let format = match format {
        Some(CliLogFormat::Compact) => LogFormat::Compact,
        Some(CliLogFormat::Json) => LogFormat::Json,
        None => config.log.format,
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => TillerConfig::load(path).await?,
        None => TillerConfig::default(),
    };
    init_tracing(&config, cli.log_format);

    match cli.command {
        Command::Run {
            script,
            rollout,
            label,
            follow,
            on_gate,
        } => run(&cli.root, config, &script, rollout, label, follow, on_gate).await,
        Command::Events { rollout, from, to } => {
            let kernel = inspector(&cli.root, config).await?;
            let events = kernel
                .read_events(&RolloutId::from_string(rollout), from, to)
                .await?;
            for event in events {
                println!("{}", serde_json::to_string(&event)?);
            }
            Ok(())
        }
        Command::View { rollout, as_of } => {
            let kernel = inspector(&cli.root, config).await?;
            let view = kernel
                .get_view(&RolloutId::from_string(rollout), as_of)
                .await?;
            print_json(&view)
        }
        Command::Trajectories {
            label,
            rollout,
            parent,
            limit,
            offset,
            ascending,
        } => {
            let kernel = inspector(&cli.root, config).await?;
            let query = TrajectoryQuery {
                label,
                rollout_id: rollout.map(RolloutId::from_string),
                parent_id: parent.map(RolloutId::from_string),
                order: if ascending {
                    SortOrder::Ascending
                } else {
                    SortOrder::Descending
                },
                offset,
                limit,
            };
            for trajectory in kernel.trajectories(&query).await? {
                let parent = trajectory
                    .parent_id
                    .as_ref()
                    .map_or_else(|| "-".to_owned(), RolloutId::to_string);
                println!(
                    "{}\t{}\t{}\tparent={}\t{:?}\titerations={}\treward={}\tevents={}",
                    trajectory.trajectory_id,
                    trajectory.label,
                    trajectory.rollout_id,
                    parent,
                    trajectory.status,
                    trajectory.iterations,
                    trajectory.reward,
                    trajectory.events.len()
                );
            }
            Ok(())
        }
        Command::Recall {
            query,
            knowledge_dir,
        } => recall(&config, knowledge_dir, &query).await,
    }
}

/// A kernel used only to read stored state.
async fn inspector(root: &Path, config: TillerConfig) -> Result<tiller_kernel::Kernel> {
    KernelBuilder::new(root)
        .config(config)
        .runtime(Arc::new(EchoRuntime::new()))
        .build()
        .await
}

async fn run(
    root: &Path,
    config: TillerConfig,
    script_path: &Path,
    rollout: Option<String>,
    label: Option<String>,
    follow: bool,
    on_gate: GatePolicy,
) -> Result<()> {
    let script = ScriptFile::load(script_path).await?;
    let kernel = script
        .install(KernelBuilder::new(root).config(config))
        .build()
        .await?;

    let rollout_id = rollout.map_or_else(RolloutId::new_uuid, RolloutId::from_string);
    let mut request = RolloutRequest::new(script.agent.clone(), script.task.clone())
        .with_id(rollout_id.clone());
    if let Some(label) = label.or(script.label.clone()) {
        request = request.with_label(label);
    }

    let printer = if follow {
        let mut events = kernel.subscribe(&rollout_id, 0).await?.until_terminal();
        Some(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(error) => warn!(%error, "failed to render event"),
                }
            }
        }))
    } else {
        None
    };

    // Prompts go to stderr so stdout stays machine-readable.
    let gates = kernel.subscribe(&rollout_id, 0).await?.until_terminal();
    let gatekeeper = tokio::spawn(answer_gates(
        kernel.clone(),
        gates,
        on_gate,
        tokio::io::BufReader::new(tokio::io::stdin()),
        tokio::io::stderr(),
    ));

    let handle = kernel.start(request)?;
    let cancel_kernel = kernel.clone();
    let cancel_id = rollout_id.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(rollout_id = %cancel_id, "interrupted, cancelling rollout");
            cancel_kernel.cancel(&cancel_id);
        }
    });

    let outcome = handle.wait().await?;
    interrupt.abort();
    // A cancelled rollout can leave a prompt unanswered.
    gatekeeper.abort();
    if let Some(printer) = printer {
        printer.await.context("event printer panicked")?;
    }

    info!(
        rollout_id = %rollout_id,
        status = ?outcome.state.status,
        iterations = outcome.state.iteration,
        "rollout complete"
    );
    print_json(&serde_json::json!({
        "rollout_id": rollout_id,
        "status": outcome.state.status,
        "truncated": outcome.state.truncated,
        "iterations": outcome.state.iteration,
        "reward": outcome.state.reward,
        "outputs": outcome.state.outputs,
        "failure": outcome.state.failure,
        "metrics": outcome.state.metrics,
        "trajectory_id": outcome.trajectory_id,
    }))
}

async fn recall(config: &TillerConfig, knowledge_dir: Option<PathBuf>, query: &str) -> Result<()> {
    let dir = knowledge_dir
        .or_else(|| config.recall.knowledge_dir.clone())
        .context("no knowledge directory: pass --knowledge-dir or set [recall].knowledge_dir")?;
    let providers = load_knowledge_dir(&dir)
        .await?
        .into_iter()
        .map(|provider| Arc::new(provider) as Arc<dyn KnowledgeProvider>)
        .collect();
    let coordinator = RecallCoordinator::new(Arc::new(ProviderSet::new(providers)?), &config.recall);
    print_json(&coordinator.recall(RecallKind::Knowledge, query, ""))
}
