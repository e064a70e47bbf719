//! surged — the Surge daemon.
//!
//! Single binary that assembles the autoscaling control plane:
//! - State store (redb)
//! - Metric source (HTTP instant queries, or a static replay)
//! - One controller per scaling target (policy, cooldown, budget,
//!   placement)
//!
//! # Usage
//!
//! ```text
//! surged run --config surge.toml --data-dir /var/lib/surge
//! surged standalone --config surge.toml --replay 80,80,30
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use surge_controller::{Controller, LocalOrchestrator, Orchestrator, TargetParams};
use surge_core::{SurgeConfig, TargetConfig, parse_duration};
use surge_metrics::{MetricSource, PromSource, StaticSource};
use surge_placement::{Constraint, ConstraintSet};
use surge_state::{MetricValue, NodeInfo, StateStore};

#[derive(Parser)]
#[command(name = "surged", about = "Surge autoscaling daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run against the configured metrics backend.
    Run {
        /// Path to the configuration file.
        #[arg(long, default_value = "surge.toml")]
        config: PathBuf,

        /// Data directory for persistent state (overrides the config).
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Run with the in-process orchestrator and a static metric replay.
    Standalone {
        /// Path to the configuration file.
        #[arg(long, default_value = "surge.toml")]
        config: PathBuf,

        /// Data directory for persistent state (overrides the config).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Comma-separated metric values to replay; the last one repeats.
        /// Entries that are not finite numbers replay an outage.
        #[arg(long, default_value = "0")]
        replay: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,surged=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, data_dir } => run(config, data_dir).await,
        Command::Standalone {
            config,
            data_dir,
            replay,
        } => standalone(config, data_dir, replay).await,
    }
}

/// Control plane against a live metrics backend.
async fn run(config_path: PathBuf, data_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_config(&config_path)?;
    let Some(metrics) = config.metrics.clone() else {
        anyhow::bail!(
            "run mode needs a [metrics] section in {}",
            config_path.display()
        );
    };
    let timeout = parse_duration(&metrics.timeout).unwrap_or(Duration::from_secs(5));
    let window = parse_duration(&metrics.window).unwrap_or(Duration::from_secs(60));
    info!(endpoint = %metrics.endpoint, "using HTTP metric source");

    serve(config, data_dir, move || {
        Box::new(PromSource::new(metrics.endpoint.clone(), timeout, window))
    })
    .await
}

/// Self-contained mode: in-process orchestrator, replayed metrics.
async fn standalone(
    config_path: PathBuf,
    data_dir: Option<PathBuf>,
    replay: String,
) -> anyhow::Result<()> {
    let config = load_config(&config_path)?;
    let values = parse_replay(&replay);
    info!(samples = values.len(), "using static metric replay");

    serve(config, data_dir, move || {
        Box::new(StaticSource::new(values.clone()))
    })
    .await
}

fn load_config(path: &Path) -> anyhow::Result<SurgeConfig> {
    let config = SurgeConfig::from_file(path)?;
    config.validate()?;
    info!(
        path = ?path,
        nodes = config.nodes.len(),
        targets = config.targets.len(),
        "configuration loaded"
    );
    Ok(config)
}

/// Spin up one controller per target and park until Ctrl-C.
async fn serve(
    config: SurgeConfig,
    data_dir: Option<PathBuf>,
    make_source: impl Fn() -> Box<dyn MetricSource>,
) -> anyhow::Result<()> {
    if config.targets.is_empty() {
        anyhow::bail!("no [[target]] configured");
    }
    let poll = parse_duration(&config.poll_interval).unwrap_or(Duration::from_secs(30));

    // Ensure data directory exists.
    let data_dir = data_dir
        .or_else(|| config.data_dir.clone())
        .unwrap_or_else(|| PathBuf::from("/var/lib/surge"));
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("surge.redb");

    // ── Initialize subsystems ──────────────────────────────────

    // State store.
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // Node inventory + in-process orchestrator.
    let nodes: Vec<NodeInfo> = config
        .nodes
        .iter()
        .map(|n| NodeInfo {
            id: n.id.clone(),
            labels: n.labels.clone(),
        })
        .collect();
    let orchestrator: Arc<dyn Orchestrator> = Arc::new(LocalOrchestrator::new(nodes));
    info!(nodes = config.nodes.len(), "orchestrator initialized");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start controllers ──────────────────────────────────────

    let mut handles = Vec::new();
    for target in &config.targets {
        let mut controller = Controller::new(
            target_params(target),
            store.clone(),
            make_source(),
            orchestrator.clone(),
        );
        let rx = shutdown_rx.clone();
        info!(target = %target.name, interval = ?poll, "controller starting");
        handles.push(tokio::spawn(async move {
            controller.run(poll, rx).await;
        }));
    }

    // Graceful shutdown on Ctrl-C.
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C handler");
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    // Wait for controllers to finish their cycle.
    for handle in handles {
        let _ = handle.await;
    }

    info!("Surge daemon stopped");
    Ok(())
}

/// Build controller parameters from one target's configuration.
///
/// Spread constraints keep their declaration order from the config;
/// anti-affinity ranks last so it breaks ties inside the emptiest
/// domain rather than overriding the spread.
fn target_params(target: &TargetConfig) -> TargetParams {
    let cooldown = parse_duration(&target.cooldown).unwrap_or(Duration::from_secs(30));
    let mut constraints: Vec<Constraint> = target
        .spreads
        .iter()
        .map(|s| Constraint::TopologySpread {
            key: s.key.clone(),
            max_skew: s.max_skew,
        })
        .collect();
    if target.anti_affinity {
        constraints.push(Constraint::AntiAffinity);
    }
    TargetParams {
        name: target.name.clone(),
        min_replicas: target.min_replicas,
        max_replicas: target.max_replicas,
        threshold: target.threshold,
        activation_threshold: target.activation_threshold,
        cooldown_secs: cooldown.as_secs(),
        max_unavailable: target.max_unavailable,
        query: target.query.clone(),
        constraints: ConstraintSet::new(constraints),
    }
}

/// Parse `--replay` into a value sequence. Entries that are not finite
/// numbers become gaps so outage handling can be replayed too.
fn parse_replay(raw: &str) -> Vec<MetricValue> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| match part.parse::<f64>() {
            Ok(value) if value.is_finite() => MetricValue::Scalar(value),
            _ => MetricValue::Unavailable,
        })
        .collect()
}
