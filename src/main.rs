use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use watchtower_agent::config::{AgentConfig, Registry};
use watchtower_agent::lifecycle::Component;
use watchtower_agent::mailbox::Mailbox;
use watchtower_agent::manager::SchedulerRegistry;
use watchtower_agent::plugin::import_roster;
use watchtower_agent::store::Storage;
use watchtower_agent::transport::Upstream;

/// Watchtower host agent - runs collection plugins and relays metrics
#[derive(Parser, Debug)]
#[command(name = "watchtower-agent", version, about)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Binary plugin roster to import at startup
    #[arg(short, long)]
    roster: Option<PathBuf>,
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "cannot listen for SIGTERM"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for ctrl-c");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    let args = Args::parse();

    let config = match AgentConfig::from_file(&args.config).and_then(|c| c.validate().map(|_| c)) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(path = %args.config.display(), error = %e, "invalid configuration");
            return Err(e.into());
        }
    };

    info!(
        cluster = %config.cluster.name,
        mode = ?config.cluster.mode,
        "watchtower agent starting"
    );

    let registry = Arc::new(Registry::new());
    if let Some(path) = &args.roster {
        let file = tokio::fs::File::open(path).await?;
        match import_roster(file, &registry).await {
            Ok(count) => info!(path = %path.display(), count, "plugin roster imported"),
            Err(e) => {
                error!(path = %path.display(), error = %e, "cannot import plugin roster");
                return Err(e.into());
            }
        }
    }

    let mailbox = Mailbox::new(config.mailbox.capacity());

    let upstream = Upstream::new(Arc::clone(&config), mailbox.clone());
    if let Err(e) = upstream.start().await {
        error!(error = %e, "cannot start transport");
        return Err(e.into());
    }

    let storage = config
        .cluster
        .mode
        .persists()
        .then(|| Storage::new(&config, mailbox.clone()));
    if let Some(storage) = &storage {
        storage.start().await?;
    }

    let schedulers = SchedulerRegistry::new(Arc::clone(&config), Arc::clone(&registry), mailbox);
    schedulers.reconcile().await;
    schedulers.start().await?;

    info!("agent ready");
    shutdown_signal().await;
    info!("shutting down");

    if let Err(e) = schedulers.shutdown().await {
        warn!(error = %e, "scheduler registry stopped with error");
    }
    if let Err(e) = upstream.stop().await {
        warn!(error = %e, "transport stopped with error");
    }
    if let Some(storage) = &storage {
        if let Err(e) = storage.stop().await {
            warn!(error = %e, "storage stopped with error");
        }
    }

    info!("agent stopped");
    Ok(())
}
