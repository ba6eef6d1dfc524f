//! stratad — Strata control-plane daemon
//!
//! Accepts worker nodes into the fleet over the node protocol, tracks
//! their health, places built deployments, and drives zero-downtime
//! cutovers.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use stratad::agent::{CommandContainerManager, CutoverDriver};
use stratad::config::DaemonConfig;
use stratad::gateway::run_gateway;
use stratad::shutdown::{LoopComponent, ShutdownCoordinator};
use stratad::SharedState;
use strata_auth::TokenStore;
use strata_deploy::{Deployer, HttpRoutingUpdater};
use strata_node::classifier::HealthClassifier;
use strata_node::NodeManager;
use strata_sched::monitor::{HealthMonitor, run_poll_loop, run_reschedule_listener};
use strata_sched::Scheduler;
use strata_store::Store;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "stratad")]
#[command(about = "Strata control-plane daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane (gateway, scheduler, classifier, cutover)
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/stratad/config.json")]
        config: PathBuf,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/stratad/config.json")]
        output: PathBuf,

        /// Gateway listen address
        #[arg(long, default_value = "0.0.0.0:18800")]
        listen: String,
    },

    /// Manage worker/operator bearer tokens
    Token {
        #[command(subcommand)]
        action: TokenAction,

        /// Path to config file (for the state directory)
        #[arg(short, long, default_value = "/etc/stratad/config.json")]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Mint a token; the secret is printed exactly once
    Create {
        /// Token holder name (e.g. worker-fleet, ci)
        name: String,
    },
    /// Revoke a token by id
    Revoke { token_id: String },
    /// List tokens (no secrets)
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if !matches!(cli.command, Commands::Token { .. }) {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(EnvFilter::from_default_env().add_directive("stratad=info".parse()?))
            .init();
    }

    match cli.command {
        Commands::Run { config } => {
            let code = run_daemon(config).await?;
            std::process::exit(code);
        }
        Commands::InitConfig { output, listen } => {
            init_config(output, listen)?;
        }
        Commands::Token { action, config } => {
            token_command(action, config)?;
        }
    }

    Ok(())
}

// ─── Run ─────────────────────────────────────────────────────────────────────

async fn run_daemon(config_path: PathBuf) -> anyhow::Result<i32> {
    info!(config = %config_path.display(), "starting stratad");

    let config = DaemonConfig::load(&config_path)?;
    info!(
        listen = %config.listen_addr,
        state_path = %config.state_path.display(),
        routing = %config.routing_url,
        "loaded config"
    );

    let store = Arc::new(Store::open(&config.state_path));
    let tokens = TokenStore::new(&config.state_path);
    let nodes = Arc::new(NodeManager::new());
    let state = Arc::new(SharedState::new(
        config.clone(),
        store.clone(),
        nodes.clone(),
        tokens,
    ));

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        nodes.clone(),
        config.scheduler_config(),
    ));
    let containers = Arc::new(CommandContainerManager::new(
        nodes.clone(),
        store.clone(),
        Duration::from_secs(config.command_timeout_secs),
    ));
    let routing = Arc::new(HttpRoutingUpdater::new(
        config.routing_url.clone(),
        config.routing_api_key.clone(),
    ));
    let deployer = Arc::new(Deployer::new(containers, routing, config.deployer_config()));

    let coordinator = ShutdownCoordinator::new(Duration::from_secs(config.shutdown_timeout_secs));

    // Down transitions flow classifier -> scheduler through this channel.
    let (reschedule_tx, reschedule_rx) = tokio::sync::mpsc::channel(32);

    let classifier = HealthClassifier::new(
        nodes.clone(),
        store.clone(),
        config.classifier_thresholds(),
        reschedule_tx,
    );
    coordinator.register(LoopComponent::spawn("health-classifier", |stop| {
        classifier.run(stop)
    }));

    {
        let scheduler = scheduler.clone();
        let rx = reschedule_rx;
        coordinator.register(LoopComponent::spawn("reschedule-listener", move |stop| {
            run_reschedule_listener(scheduler, rx, stop)
        }));
    }
    {
        let scheduler = scheduler.clone();
        let store = store.clone();
        coordinator.register(LoopComponent::spawn("health-monitor", move |stop| {
            HealthMonitor::new(scheduler, store).run(stop)
        }));
    }
    {
        let scheduler = scheduler.clone();
        let store = store.clone();
        coordinator.register(LoopComponent::spawn("scheduler-poll", move |stop| {
            run_poll_loop(scheduler, store, stop)
        }));
    }

    let driver = CutoverDriver::new(
        store.clone(),
        nodes.clone(),
        deployer,
        Duration::from_secs(config.poll_interval_secs),
    );
    coordinator.register(LoopComponent::spawn("cutover-driver", move |stop| {
        driver.run(stop)
    }));

    let listener = TcpListener::bind(&config.listen_addr).await?;
    {
        let state = state.clone();
        coordinator.register(LoopComponent::spawn("gateway", move |stop| {
            run_gateway(listener, state, stop)
        }));
    }

    info!("stratad running");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    state.stop_serving();
    let code = coordinator.shutdown().await;
    Ok(code)
}

// ─── InitConfig ───────────────────────────────────────────────────────────────

fn init_config(output: PathBuf, listen: String) -> anyhow::Result<()> {
    let config = DaemonConfig {
        listen_addr: listen,
        ..DaemonConfig::default()
    };
    config.save(&output)?;

    println!("Config written to {}", output.display());
    println!();
    println!("Mint a worker token, then run:");
    println!("  stratad token create worker-fleet --config {}", output.display());
    println!("  stratad run --config {}", output.display());

    Ok(())
}

// ─── Token ────────────────────────────────────────────────────────────────────

fn token_command(action: TokenAction, config_path: PathBuf) -> anyhow::Result<()> {
    let config = DaemonConfig::load(&config_path)?;
    let mut tokens = TokenStore::new(&config.state_path);

    match action {
        TokenAction::Create { name } => {
            let (token_id, secret) = tokens.create(&name);
            println!("Token created for '{name}'.");
            println!();
            println!("  id:     {token_id}");
            println!("  secret: {secret}");
            println!();
            println!("The secret is shown only once. Configure the worker with it.");
        }
        TokenAction::Revoke { token_id } => match tokens.revoke(&token_id) {
            Ok(()) => println!("Token {token_id} revoked."),
            Err(e) => {
                error!(error = %e, "revoke failed");
                anyhow::bail!("{e}");
            }
        },
        TokenAction::List => {
            for record in tokens.list() {
                println!(
                    "{}  {}  active={}  created={}  last_used={}",
                    record.token_id,
                    record.name,
                    record.active,
                    record.created_at.format("%Y-%m-%d %H:%M:%S"),
                    record
                        .last_used
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "never".to_string()),
                );
            }
        }
    }

    Ok(())
}
