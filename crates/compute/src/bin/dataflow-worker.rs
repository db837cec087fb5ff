//! dataflow-worker: recompute nodes of a YAML-defined graph.
//!
//! The graph definition is installed into a node store (in-memory, or a
//! JSON state file with `--state`) and every storage backend is the
//! in-process memory backend registered under the configured id.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use dataflow_compute::{
    ComputeOutcome, FileNodeStore, GraphDefinition, MemoryNodeStore, Node, NodeStore,
    Orchestrator,
};
use dataflow_core::{load_dotenv, Config};
use dataflow_storage::{BackendRegistry, ConnectionScope, MemoryBackend, Where};

#[derive(Parser, Debug)]
#[command(name = "dataflow-worker", version, about)]
struct Cli {
    /// Graph definition (YAML).
    #[arg(long, env = "DATAFLOW_GRAPH")]
    graph: PathBuf,

    /// JSON file holding node records and lock state across runs.
    #[arg(long, env = "DATAFLOW_STATE")]
    state: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bring a node and its dependencies up to date.
    Recompute {
        /// Node name or id.
        #[arg(long)]
        node: String,
        /// Recompute even when everything is fresh.
        #[arg(long)]
        force: bool,
    },
    /// Print compute node names grouped by dependency level.
    Levels,
    /// Print the freshness tree below a node.
    Explain {
        #[arg(long)]
        node: String,
    },
    /// Validate a compute node against the installed graph.
    Validate {
        #[arg(long)]
        node: String,
    },
    /// Clear a computing lock left behind by a crashed worker.
    ReleaseLock {
        #[arg(long)]
        node: String,
    },
}

fn main() -> Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    config.log_summary();

    let store: Arc<dyn NodeStore> = match &cli.state {
        Some(path) => Arc::new(
            FileNodeStore::open(path)
                .with_context(|| format!("failed to open state file {}", path.display()))?,
        ),
        None => Arc::new(MemoryNodeStore::new()),
    };

    let mut registry = BackendRegistry::new();
    registry.register(Arc::new(MemoryBackend::new(config.storage.default_backend.clone())));
    let registry = Arc::new(registry);

    let definition = GraphDefinition::load(&cli.graph)
        .with_context(|| format!("failed to load graph {}", cli.graph.display()))?;
    {
        let scope = ConnectionScope::new(Arc::clone(&registry));
        definition
            .install(store.as_ref(), &scope, &config.storage)
            .context("failed to install graph definition")?;
    }

    let orchestrator = Orchestrator::new(config.compute.clone(), Arc::clone(&store), Arc::clone(&registry));

    match cli.command {
        Command::Recompute { node, force } => {
            let target = orchestrator.lookup(&node)?;
            let outcome = orchestrator.recompute(target.id(), force)?;
            match &outcome {
                ComputeOutcome::Invalid(result) => bail!("'{node}' is not valid: {}", result.summary()),
                other => info!(node = %node, outcome = ?other, "recompute finished"),
            }
            print_output(&orchestrator, &registry, &target)?;
            println!("{}", serde_json::to_string_pretty(&orchestrator.metrics())?);
        }
        Command::Levels => {
            for (level, names) in orchestrator.levels()? {
                println!("{level}: {}", names.join(", "));
            }
        }
        Command::Explain { node } => {
            let target = orchestrator.lookup(&node)?;
            print!("{}", orchestrator.explain(target.id())?);
        }
        Command::Validate { node } => {
            let Node::Compute(target) = orchestrator.lookup(&node)? else {
                bail!("'{node}' is a data node");
            };
            let result = orchestrator.validate(&target)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.is_valid() {
                bail!("{}", result.summary());
            }
        }
        Command::ReleaseLock { node } => {
            let target = orchestrator.lookup(&node)?;
            orchestrator.force_computing_lock_release(target.id())?;
            info!(node = %node, "computing lock released");
        }
    }
    registry.disconnect_all();
    Ok(())
}

/// Print the rows a compute node's output now holds.
fn print_output(
    orchestrator: &Orchestrator,
    registry: &Arc<BackendRegistry>,
    target: &Node,
) -> Result<()> {
    let Node::Compute(node) = target else {
        return Ok(());
    };
    let Some(output_id) = node.data_node_id else {
        return Ok(());
    };
    let Some(Node::Data(output)) = orchestrator.store().get(output_id)? else {
        return Ok(());
    };
    let scope = ConnectionScope::new(Arc::clone(registry));
    for record in scope.dataset(&output.dataset_spec())?.all(&Where::new(), None, 0)? {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}
