//! Forker: a clinically-safe file replication engine.
//!
//! Usage:
//!     forker run --config forker.toml
//!     forker requeue --config forker.toml --entry-id <uuid> --reason "..." --by operator@example.com

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use forker_db::Store;
use forker_discovery::{watch_until_stable, DiscoveryFilter, DiscoverySource, StabilityConfig};
use forker_ids::{QuarantineEntryId, TargetId};
use forker_logging::{init_logging, LogConfig};
use forker_orchestrator::{Orchestrator, QuarantineManager, RetryPolicy, TargetSpec};
use forker_protocol::ForkerConfig;
use forker_worker::WorkerPool;

#[derive(Parser, Debug)]
#[command(name = "forker", about = "Clinically-safe dual-destination file replication engine")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the replication engine daemon: watch the source directory,
    /// replicate stable files to every configured target, verify, and
    /// quarantine on integrity failure.
    Run {
        #[arg(long, default_value = "forker.toml")]
        config: PathBuf,
    },
    /// Release a quarantined job and requeue it for a fresh copy attempt
    /// (the engine's sole reverse transition, I8). Operator-invoked only;
    /// the engine never does this automatically.
    Requeue {
        #[arg(long, default_value = "forker.toml")]
        config: PathBuf,
        #[arg(long)]
        entry_id: String,
        #[arg(long)]
        reason: String,
        #[arg(long, default_value = "operator")]
        by: String,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(LogConfig {
        app_name: "forker",
        verbose: std::env::var("FORKER_VERBOSE").is_ok(),
        tui_mode: false,
    })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match args.command {
        Command::Run { config } => runtime.block_on(run(config)),
        Command::Requeue {
            config,
            entry_id,
            reason,
            by,
        } => requeue(config, entry_id, reason, by),
    }
}

fn load_config(path: &Path) -> anyhow::Result<ForkerConfig> {
    ForkerConfig::load(path).map_err(|e| anyhow::anyhow!("failed to load config {}: {e}", path.display()))
}

fn target_specs(config: &ForkerConfig) -> anyhow::Result<Vec<TargetSpec>> {
    Ok(vec![
        TargetSpec {
            id: TargetId::parse("TargetA")?,
            dest_root: PathBuf::from(&config.directories.target_a),
        },
        TargetSpec {
            id: TargetId::parse("TargetB")?,
            dest_root: PathBuf::from(&config.directories.target_b),
        },
    ])
}

async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    let config = load_config(&config_path)?;
    info!(config = %config_path.display(), environment = %config.environment, "starting forker");

    for dir in [
        &config.directories.source,
        &config.directories.target_a,
        &config.directories.target_b,
        &config.directories.quarantine,
        &config.directories.processing,
    ] {
        std::fs::create_dir_all(dir)?;
    }

    let store = Arc::new(Store::open(&config.database.connection_string)?);

    let targets = target_specs(&config)?;
    let retry_policy = RetryPolicy {
        max_attempts: config.target.max_attempts,
        backoff_base: Duration::from_secs(config.target.backoff_base_secs),
        backoff_max: Duration::from_secs(config.target.backoff_max_secs),
    };

    let verification_delay = if config.environment.allows_destructive_test_hooks() {
        config.testing.verification_delay_seconds.map(Duration::from_secs)
    } else {
        if config.testing.verification_delay_seconds.is_some() {
            warn!("testing.verificationDelaySeconds is set but environment is not Demo; ignoring");
        }
        None
    };

    let (completions_tx, completions_rx) = mpsc::channel(256);
    let pool = WorkerPool::new(Arc::clone(&store), config.target.worker_pool_size, completions_tx);

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        pool,
        targets,
        retry_policy,
        verification_delay,
    ));

    orchestrator.recover_and_redispatch()?;

    let (stable_tx, stable_rx) = mpsc::channel(256);
    let (discovery_shutdown_tx, discovery_shutdown_rx) = oneshot::channel();
    let (orchestrator_shutdown_tx, orchestrator_shutdown_rx) = oneshot::channel();

    let filter = DiscoveryFilter::new(
        &config.monitoring.file_filters,
        &config.monitoring.exclude_extensions,
    )?;
    let stability_config = StabilityConfig {
        minimum_file_age: Duration::from_secs(config.monitoring.minimum_file_age_secs),
        check_interval: Duration::from_secs(config.monitoring.stability_check_interval_secs),
        max_checks: config.monitoring.max_stability_checks,
    };
    let source = Arc::new(DiscoverySource::new(
        config.directories.source.clone(),
        filter,
        Duration::from_secs(config.monitoring.rescan_interval_secs),
    ));

    let discovery_task = {
        let source = Arc::clone(&source);
        tokio::spawn(async move {
            let (candidates_tx, mut candidates_rx) = mpsc::channel::<PathBuf>(256);
            let watch_task = {
                let source = Arc::clone(&source);
                tokio::spawn(async move {
                    if let Err(e) = source.run(candidates_tx, discovery_shutdown_rx).await {
                        warn!(error = %e, "discovery source stopped with an error");
                    }
                })
            };

            while let Some(path) = candidates_rx.recv().await {
                let stable_tx = stable_tx.clone();
                tokio::spawn(async move {
                    match watch_until_stable(&path, stability_config).await {
                        forker_discovery::Stability::Stable { size } => {
                            let _ = stable_tx.send((path, size)).await;
                        }
                        forker_discovery::Stability::Gone => {
                            info!(path = %path.display(), "candidate disappeared before becoming stable");
                        }
                        forker_discovery::Stability::StillGrowing => {
                            // Unreachable: `watch_until_stable` only returns
                            // once `Stable`, `Gone`, or `Error` is reached.
                        }
                        forker_discovery::Stability::Error(e) => {
                            warn!(path = %path.display(), error = %e, "stability check failed");
                        }
                    }
                });
            }

            let _ = watch_task.await;
        })
    };

    let orchestrator_task = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            orchestrator.run(stable_rx, completions_rx, orchestrator_shutdown_rx).await;
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = discovery_shutdown_tx.send(());
    let _ = orchestrator_shutdown_tx.send(());

    let _ = discovery_task.await;
    let _ = orchestrator_task.await;

    Ok(())
}

fn requeue(config_path: PathBuf, entry_id: String, reason: String, by: String) -> anyhow::Result<()> {
    let config = load_config(&config_path)?;
    let store = Store::open(&config.database.connection_string)
        .map_err(|e| anyhow::anyhow!("failed to open store: {e}"))?;

    let id = QuarantineEntryId::parse(&entry_id)
        .map_err(|e| anyhow::anyhow!("invalid entry id '{entry_id}': {e}"))?;

    let manager = QuarantineManager::new(&store);
    manager
        .release_and_requeue(&id, reason, by)
        .map_err(|e| anyhow::anyhow!("failed to release and requeue: {e}"))?;

    info!(entry_id = %entry_id, "quarantine entry released and job requeued");
    Ok(())
}
