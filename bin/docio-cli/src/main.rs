//! DocIO CLI - cluster simulation
//!
//! Boots an in-process cluster, writes documents, takes a replica down
//! while writes continue, restarts it and verifies that recovery brings
//! every shard back to a consistent state. Optionally takes a backup.

use anyhow::{Context, Result, ensure};
use clap::{Args as ClapArgs, Parser, Subcommand};
use docio_cluster::{Cluster, FaultInjector};
use docio_common::{CollectionName, Config, DocId};
use docio_store::{Document, Query};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "docio-cli")]
#[command(about = "DocIO cluster simulation")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "docio.toml")]
    config: String,

    /// Log level (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a failure and recovery scenario
    Simulate(SimulateArgs),
    /// Print the effective configuration
    ShowConfig,
}

#[derive(ClapArgs, Debug)]
struct SimulateArgs {
    /// Nodes in the cluster
    #[arg(long, default_value = "3")]
    nodes: usize,

    /// Shards of the collection
    #[arg(long, default_value = "2")]
    shards: u32,

    /// Replicas per shard
    #[arg(long, default_value = "3")]
    replicas: u32,

    /// Documents written before the failure
    #[arg(long, default_value = "100")]
    docs: u64,

    /// Documents written while a node is down
    #[arg(long, default_value = "50")]
    docs_while_down: u64,

    /// Largest gap closed by peer-sync
    #[arg(long)]
    peer_sync_limit: Option<u64>,

    /// Take a backup of the first node into this directory
    #[arg(long)]
    backup_dir: Option<PathBuf>,

    /// Print metrics in Prometheus text format
    #[arg(long)]
    prometheus: bool,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    #[serde(flatten)]
    docio: Config,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn load_config(path: &str) -> Result<FileConfig> {
    if !std::path::Path::new(path).exists() {
        return Ok(FileConfig::default());
    }
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    toml::from_str(&raw).with_context(|| format!("parsing {path}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let file = load_config(&args.config)?;
    let log_level = args.log_level.unwrap_or(file.logging.level);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match args.command {
        Commands::Simulate(opts) => simulate(file.docio, opts).await,
        Commands::ShowConfig => {
            print!("{}", toml::to_string_pretty(&file.docio)?);
            Ok(())
        }
    }
}

async fn write_range(cluster: &Cluster, name: &CollectionName, from: u64, count: u64) -> Result<()> {
    let client = cluster.client();
    for i in from..from + count {
        let doc = Document::new(DocId::from(i))
            .with_field("n_ti", i)
            .with_field("title", format!("document {i}"));
        client.add(name, doc).await?;
    }
    client.commit(name).await?;
    Ok(())
}

async fn simulate(mut config: Config, opts: SimulateArgs) -> Result<()> {
    if let Some(limit) = opts.peer_sync_limit {
        config.recovery.peer_sync_limit = limit;
    }
    let recovery_wait = config.cluster.recovery_wait();
    let cluster = Cluster::start(config)?;
    let nodes = cluster.add_nodes(opts.nodes);
    let name = cluster
        .create_collection("collection1", opts.shards, opts.replicas)
        .await?;
    info!("Booted {} nodes; writing {} documents", nodes.len(), opts.docs);
    write_range(&cluster, &name, 0, opts.docs).await?;

    let victim = *nodes.last().context("cluster has no nodes")?;
    info!("Stopping {} and writing {} more documents", victim, opts.docs_while_down);
    cluster.stop_node(victim).await?;
    write_range(&cluster, &name, opts.docs, opts.docs_while_down).await?;

    cluster.start_node(victim).await?;
    cluster.wait_for_recoveries(&name, recovery_wait).await?;

    for key in cluster.directory().shard_keys(&name)? {
        if let Some(outcome) = cluster.recovery().last_outcome(&key, victim) {
            info!(
                "{} on {} recovered via {} ({} replayed)",
                key, victim, outcome.strategy, outcome.replayed
            );
        }
        let report = cluster
            .checker()
            .verify_shard(&key, Duration::from_secs(10))
            .await?;
        info!("{} consistent across {} replicas", key, report.compared() + 1);
    }

    let expected = opts.docs + opts.docs_while_down;
    let found = cluster
        .client()
        .query(&name, &Query::all().rows(0))
        .await?
        .num_found;
    ensure!(found == expected, "expected {expected} documents, found {found}");

    if let Some(dir) = opts.backup_dir {
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let backups = cluster.backups();
        let job = backups.trigger_backup(nodes[0], &dir)?;
        let record = backups
            .wait_for_completion(nodes[0], job, Duration::from_secs(30))
            .await?;
        match &record.artifact {
            Some(path) => info!("Backup {} written to {}", job, path.display()),
            None => warn!("Backup {} ended {}: {:?}", job, record.status, record.error),
        }
    }

    println!("{}", serde_json::to_string_pretty(&cluster.metrics().snapshot())?);
    if opts.prometheus {
        print!("{}", cluster.export_metrics());
    }
    cluster.shutdown();
    Ok(())
}
