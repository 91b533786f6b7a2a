//! Cohort cluster entry points.
//!
//! One binary, two roles:
//! - `cohort-server manager`: coordinator, accepts shard connections,
//!   resolves queries and merges results
//! - `cohort-server shard`: execution, loads worker storages and connects
//!   to the manager

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use cohort_core::cluster::{ManagerNode, ShardNode};
use cohort_core::concepts::Dataset;
use cohort_core::worker::{Worker, WorkerStorage};
use config::Config;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Cohort cluster node
#[derive(Parser, Debug)]
#[command(name = "cohort-server")]
#[command(about = "Distributed columnar engine for person-centric event analytics", long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, short = 'v')]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the coordinating manager node
    Manager,
    /// Run an executing shard node
    Shard,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = Config::load(args.config.as_deref()).context("loading configuration")?;

    let worker_threads = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .clamp(2, 32);
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .thread_name("cohort-net")
        .enable_all()
        .build()
        .context("building runtime")?;

    match args.command {
        Command::Manager => rt.block_on(run_manager(config)),
        Command::Shard => rt.block_on(run_shard(config)),
    }
}

async fn run_manager(config: Config) -> anyhow::Result<()> {
    let manager = ManagerNode::new();

    for dataset in load_datasets(&config.storage.datasets_dir)? {
        manager.register_dataset(dataset);
    }

    info!("starting manager on {}", config.cluster.bind_addr);
    manager
        .start(config.cluster.bind_addr)
        .await
        .context("running manager")?;
    Ok(())
}

async fn run_shard(config: Config) -> anyhow::Result<()> {
    let workers = load_workers(&config)?;
    if workers.is_empty() {
        warn!(
            "no worker storages found under {}, shard starts empty",
            config.storage.directory
        );
    }

    let shard = ShardNode::new(config.cluster.shard_name.clone(), workers);
    info!(
        "starting shard {} against manager {}",
        shard.name(),
        config.cluster.manager_addr
    );
    shard
        .start(config.cluster.manager_addr)
        .await
        .context("running shard")?;
    Ok(())
}

/// Load every worker storage found under the storage directory. Failures of
/// single storages are logged and skipped so one corrupt worker does not
/// take the shard down.
fn load_workers(config: &Config) -> anyhow::Result<Vec<Arc<Worker>>> {
    let directory = PathBuf::from(&config.storage.directory);
    if !directory.exists() {
        return Ok(Vec::new());
    }

    let mut workers = Vec::new();
    for entry in std::fs::read_dir(&directory)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        match WorkerStorage::load(entry.path()) {
            Ok(storage) => match Worker::new(storage, config.execution.threads) {
                Ok(worker) => workers.push(Arc::new(worker)),
                Err(e) => warn!("failed to start worker from {:?}: {e}", entry.path()),
            },
            Err(e) => warn!("failed to read storage {:?}: {e}", entry.path()),
        }
    }
    info!("loaded {} workers", workers.len());
    Ok(workers)
}

/// Load dataset descriptors (JSON) for query resolution on the manager.
fn load_datasets(directory: &str) -> anyhow::Result<Vec<Dataset>> {
    let directory = PathBuf::from(directory);
    if !directory.exists() {
        warn!("dataset directory {:?} does not exist", directory);
        return Ok(Vec::new());
    }

    let mut datasets = Vec::new();
    for entry in std::fs::read_dir(&directory)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let dataset: Dataset = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        info!("loaded dataset {} from {}", dataset.schema.name, path.display());
        datasets.push(dataset);
    }
    Ok(datasets)
}
