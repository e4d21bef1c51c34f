//! devlive daemon - device liveness tracking
//!
//! Runs the device registry, the liveness sweeper and the stats reporter
//! until SIGINT/SIGTERM. The `simulate` subcommand additionally feeds the
//! registry with synthetic devices and drives a client reconnect loop.
//!
//! # Usage
//!
//! ```bash
//! # Run with the default configuration
//! devlived run
//!
//! # Run against an explicit config file
//! devlived run --config ./devlive.toml
//!
//! # Synthetic traffic: 16 devices, 4 of which fall silent
//! devlived simulate --devices 16 --silent 4
//!
//! # Print the effective configuration
//! devlived config
//!
//! # Enable debug logging
//! RUST_LOG=devlived=debug devlived run
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown

use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use devlive_core::config::resolve_path;
use devlive_core::LivenessConfig;
use devlived::notifier::{ConnectionStateNotifier, RegistryBridge};
use devlived::reconnect::ReconnectTimer;
use devlived::registry::{DeviceRegistry, LoggingListener};
use devlived::scheduler::Scheduler;
use devlived::simulate::{Simulation, SimulationPlan, SimulatedConnector};
use devlived::stats::start_reporter;
use devlived::sweeper::LivenessSweeper;

/// devlive daemon - device liveness tracking
#[derive(Parser, Debug)]
#[command(name = "devlived", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the registry, sweeper and stats reporter
    Run {
        /// Config file (defaults to $DEVLIVE_CONFIG, then the user config dir)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Run with synthetic devices and a synthetic client connection
    Simulate {
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of synthetic devices
        #[arg(long, default_value_t = 8)]
        devices: usize,

        /// How many devices fall silent and get evicted
        #[arg(long, default_value_t = 2)]
        silent: usize,

        /// Connect attempts the synthetic client refuses before connecting
        #[arg(long, default_value_t = 3)]
        connect_failures: usize,
    },
    /// Print the effective configuration as TOML
    Config {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Default to 'run' if no subcommand given
    let command = args.command.unwrap_or(Command::Run { config: None });

    match command {
        Command::Run { config } => {
            let config = load_config(config)?;
            run_daemon(config, None)
        }
        Command::Simulate {
            config,
            devices,
            silent,
            connect_failures,
        } => {
            let config = load_config(config)?;
            let plan = SimulationPlan {
                devices,
                silent,
                ..SimulationPlan::default()
            };
            run_daemon(config, Some((plan, connect_failures)))
        }
        Command::Config { config } => {
            let path = resolve_path(config.as_deref());
            let config = load_config(config)?;
            match path {
                Some(path) => println!("# {}", path.display()),
                None => println!("# built-in defaults"),
            }
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(explicit: Option<PathBuf>) -> Result<LivenessConfig> {
    LivenessConfig::load(explicit.as_deref()).context("Failed to load configuration")
}

/// Installs the tracing subscriber. `RUST_LOG` wins over the config file.
fn init_logging(log_level: &str) -> Result<()> {
    let filter = if env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::builder()
            .parse(format!(
                "devlived={log_level},devlive_core={log_level}"
            ))
            .with_context(|| format!("Invalid log_level {log_level:?}"))?
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

/// Runs the daemon (async entry point).
#[tokio::main]
async fn run_daemon(config: LivenessConfig, simulate: Option<(SimulationPlan, usize)>) -> Result<()> {
    init_logging(&config.log_level)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "devlive daemon starting"
    );

    // Create cancellation token for graceful shutdown
    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let scheduler = Scheduler::new(Handle::current());

    let registry = Arc::new(DeviceRegistry::new());
    registry.add_listener(Arc::new(LoggingListener));

    let notifier = Arc::new(ConnectionStateNotifier::new());
    notifier.add_listener(Arc::new(RegistryBridge::new(Arc::clone(&registry))));

    let sweeper = LivenessSweeper::new(Arc::clone(&registry), scheduler.clone(), config.sweep);
    sweeper.start();

    let stats = start_reporter(&scheduler, Arc::clone(&registry), config.stats);

    let reconnect = if config.reconnect.enabled {
        ReconnectTimer::new(scheduler.clone(), config.reconnect)
    } else {
        ReconnectTimer::disabled()
    };

    let simulation = simulate.map(|(plan, connect_failures)| {
        reconnect.start(Arc::new(SimulatedConnector::new(connect_failures)));
        Simulation::start(Arc::clone(&registry), Arc::clone(&notifier), &scheduler, plan)
    });

    info!(
        auto_reconnect = reconnect.is_auto_connect(),
        simulated = simulation.is_some(),
        "devlive daemon running"
    );

    cancel_token.cancelled().await;

    if let Some(simulation) = &simulation {
        simulation.stop();
    }
    reconnect.stop();
    sweeper.stop();
    stats.cancel();
    scheduler.shutdown().await;

    info!(devices = registry.size(), "devlive daemon stopped");
    Ok(())
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
