//! fleetrolld: the fleetroll daemon.
//!
//! One binary running the rollout scheduler loop and the REST API over a
//! shared redb store. Several daemons may point at the same store file
//! through a shared volume; the claim update keeps them from processing
//! the same rollout twice.
//!
//! # Usage
//!
//! ```text
//! fleetrolld run --config /etc/fleetroll/fleetroll.toml --data-dir /var/lib/fleetroll
//! fleetrolld default-config > fleetroll.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use fleetroll_core::FleetrollConfig;
use fleetroll_rollout::{RolloutManager, StoreTargetMatcher};
use fleetroll_scheduler::RolloutScheduler;
use fleetroll_state::StateStore;
use tokio::sync::watch;
use tracing::info;

#[derive(Parser)]
#[command(name = "fleetrolld", about = "fleetroll staged rollout daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler loop and the API server.
    Run {
        /// Path to fleetroll.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Directory holding fleetroll.redb. Overrides `store.path`.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// API port. Overrides `api.port`.
        #[arg(long)]
        port: Option<u16>,

        /// Scheduler interval, e.g. "10s". Overrides `scheduler.interval`.
        #[arg(long)]
        interval: Option<String>,

        /// Claim staleness window, e.g. "2s". Overrides `scheduler.claim_delay`.
        #[arg(long)]
        claim_delay: Option<String>,
    },
    /// Print the default configuration as TOML.
    DefaultConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fleetrolld=debug,fleetroll=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            port,
            interval,
            claim_delay,
        } => {
            let mut config = match config {
                Some(path) => FleetrollConfig::from_file(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => FleetrollConfig::default(),
            };
            if let Some(dir) = data_dir {
                config.store.path = dir.join("fleetroll.redb");
            }
            if let Some(port) = port {
                config.api.port = port;
            }
            if let Some(interval) = interval {
                config.scheduler.interval = interval;
            }
            if let Some(delay) = claim_delay {
                config.scheduler.claim_delay = delay;
            }
            config.validate()?;
            run(config).await
        }
        Command::DefaultConfig => {
            print!("{}", FleetrollConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

async fn run(config: FleetrollConfig) -> anyhow::Result<()> {
    info!("fleetroll daemon starting");

    let db_path = config.store.path.clone();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let matcher = Arc::new(StoreTargetMatcher::new(store.clone()));
    let manager = RolloutManager::new(store.clone(), matcher, config.rollout.clone());
    let executor = manager.executor();

    let interval = config.scheduler.interval()?;
    let claim_delay = config.scheduler.claim_delay()?;
    let scheduler = RolloutScheduler::new(executor, interval, claim_delay);
    info!(
        interval = %config.scheduler.interval,
        claim_delay = %config.scheduler.claim_delay,
        "rollout scheduler initialized"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler_handle = tokio::spawn(async move {
        scheduler.run(shutdown_rx).await;
    });

    // ── Start API server ───────────────────────────────────────

    let router = fleetroll_api::build_router(manager);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.api.port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    let _ = scheduler_handle.await;

    info!("fleetroll daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use fleetroll_core::parse_duration;

    use super::*;

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from([
            "fleetrolld",
            "run",
            "--data-dir",
            "/tmp/fr",
            "--port",
            "9000",
            "--claim-delay",
            "500ms",
        ])
        .unwrap();
        match cli.command {
            Command::Run {
                data_dir,
                port,
                claim_delay,
                config,
                interval,
            } => {
                assert_eq!(data_dir, Some(PathBuf::from("/tmp/fr")));
                assert_eq!(port, Some(9000));
                let delay = claim_delay.as_deref().and_then(parse_duration);
                assert_eq!(delay.map(|d| d.as_millis()), Some(500));
                assert!(config.is_none());
                assert!(interval.is_none());
            }
            Command::DefaultConfig => panic!("expected run"),
        }
    }

    #[test]
    fn default_config_round_trips() {
        let rendered = FleetrollConfig::default().to_toml_string().unwrap();
        assert_eq!(
            FleetrollConfig::from_toml_str(&rendered).unwrap(),
            FleetrollConfig::default()
        );
    }
}
