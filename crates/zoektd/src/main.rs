//! zoektd — the Zoekt control plane daemon.
//!
//! Assembles the state store, the reconciliation engine and its worker loop
//! into one process, plus a few operator commands against the same store.
//!
//! # Usage
//!
//! ```text
//! zoektd run --config /etc/zoekt/zoekt.toml --data-dir /var/lib/zoekt
//! zoektd register-node --address 10.0.0.7:6070 --total-bytes 500000000000
//! zoektd enable-namespace --root-namespace-id 42 --replicas 2
//! zoektd status
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use zoekt_core::ZoektConfig;
use zoekt_reconcile::{
    InMemoryEventBus, Reconciler, RunTask, StaticDirectory, TaskDispatcher, TaskFuture,
    TaskOutcome, Worker,
};
use zoekt_state::{Node, StateStore, Task};

#[derive(Parser)]
#[command(name = "zoektd", about = "Zoekt control plane daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    /// Data directory for persistent state.
    #[arg(long, global = true, default_value = "/var/lib/zoekt")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the reconciliation worker until interrupted.
    Run {
        /// Path to zoekt.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// JSON namespace directory (tenants, subscriptions, projects).
        #[arg(long)]
        directory: Option<PathBuf>,

        /// Override the scheduling interval from the config (seconds).
        #[arg(long)]
        interval: Option<u64>,

        /// Complete node tasks locally instead of leaving them for nodes.
        #[arg(long)]
        simulate_nodes: bool,
    },

    /// Parse and validate a config file.
    ValidateConfig {
        #[arg(long)]
        config: PathBuf,
    },

    /// Print the default configuration as TOML.
    DefaultConfig,

    /// Register a search node.
    RegisterNode {
        #[arg(long)]
        address: String,

        #[arg(long)]
        total_bytes: i64,

        #[arg(long, default_value = "1")]
        schema_version: u32,
    },

    /// Opt a root namespace into search.
    EnableNamespace {
        #[arg(long)]
        root_namespace_id: u64,

        /// Desired replica count; the config default applies when omitted.
        #[arg(long)]
        replicas: Option<u32>,
    },

    /// Print nodes and their storage as JSON.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run {
            config,
            directory,
            interval,
            simulate_nodes,
        } => {
            run(
                &cli.data_dir,
                config.as_deref(),
                directory.as_deref(),
                interval,
                simulate_nodes,
            )
            .await
        }
        Command::ValidateConfig { config } => {
            ZoektConfig::from_file(&config)?;
            println!("{}: ok", config.display());
            Ok(())
        }
        Command::DefaultConfig => {
            print!("{}", ZoektConfig::default().to_toml_string()?);
            Ok(())
        }
        Command::RegisterNode {
            address,
            total_bytes,
            schema_version,
        } => {
            let state = open_state(&cli.data_dir)?;
            let node = state.register_node(&address, total_bytes, schema_version)?;
            println!("{}", serde_json::to_string_pretty(&node)?);
            Ok(())
        }
        Command::EnableNamespace {
            root_namespace_id,
            replicas,
        } => {
            let state = open_state(&cli.data_dir)?;
            let ns = state.enable_namespace(root_namespace_id, replicas)?;
            println!("{}", serde_json::to_string_pretty(&ns)?);
            Ok(())
        }
        Command::Status => status(&cli.data_dir),
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,zoektd=debug,zoekt=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_state(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let db_path = data_dir.join("zoekt.redb");
    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(state)
}

async fn run(
    data_dir: &Path,
    config_path: Option<&Path>,
    directory_path: Option<&Path>,
    interval: Option<u64>,
    simulate_nodes: bool,
) -> anyhow::Result<()> {
    info!("zoekt control plane starting");

    let config = match config_path {
        Some(path) => ZoektConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ZoektConfig::default(),
    };
    let directory = match directory_path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading directory {}", path.display()))?;
            StaticDirectory::from_json(&json)?
        }
        None => {
            warn!("no namespace directory given; rollout and initial indexing see no tenants");
            StaticDirectory::new()
        }
    };
    let interval = Duration::from_secs(interval.unwrap_or(config.worker.schedule_interval_secs));
    let claim_limit = config.tasks.claim_limit;

    let state = open_state(data_dir)?;
    let reconciler = Arc::new(Reconciler::new(
        state.clone(),
        Arc::new(config),
        Arc::new(directory),
    ));
    let mut worker = Worker::new(reconciler, Arc::new(InMemoryEventBus::new()));
    if simulate_nodes {
        worker = worker.with_dispatcher(TaskDispatcher::new(state, claim_limit, simulated_node()));
        info!("simulating node task execution");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = tokio::spawn(async move {
        worker.run(interval, shutdown_rx).await;
    });

    tokio::signal::ctrl_c()
        .await
        .context("installing CTRL+C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    let _ = worker_handle.await;

    info!("zoekt control plane stopped");
    Ok(())
}

/// Completes every task immediately with an empty index.
fn simulated_node() -> RunTask {
    Arc::new(|node: Node, task: Task| {
        Box::pin(async move {
            info!(
                node = %node.address,
                task_id = task.id,
                task_type = ?task.task_type,
                "simulated task"
            );
            Ok(TaskOutcome::Succeeded { size_bytes: 0 })
        }) as TaskFuture
    })
}

fn status(data_dir: &Path) -> anyhow::Result<()> {
    let state = open_state(data_dir)?;
    let mut nodes = Vec::new();
    for node in state.list_nodes()? {
        let Some(storage) = state.node_storage(node.id)? else {
            continue;
        };
        nodes.push(serde_json::json!({
            "id": node.id,
            "address": node.address,
            "schema_version": node.schema_version,
            "total_bytes": storage.total_bytes,
            "reserved_bytes": storage.reserved_bytes,
            "used_bytes": storage.used_bytes,
            "unclaimed_bytes": storage.unclaimed_bytes(),
        }));
    }
    let summary = serde_json::json!({
        "nodes": nodes,
        "enabled_namespaces": state.list_enabled_namespaces()?.len(),
        "replicas": state.list_replicas()?.len(),
        "indices": state.list_indices()?.len(),
        "repositories": state.list_repositories()?.len(),
        "tasks_in_flight": state.list_in_flight_tasks()?.len(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
