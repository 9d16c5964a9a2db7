use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use iothub::bus::{serve, IngressState, MessageBus};
use iothub::cli::{format_dry_run, Args};
use iothub::config::{default_config_path, load_config_from};
use iothub::hub::{Dispatcher, HubService};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = args.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let config = load_config_from(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?
        .with_overrides(args.backend, args.listen.clone());
    config.validate().context("Invalid configuration")?;

    // Dry-run mode: print the resolved setup and exit
    if args.dry_run {
        println!("{}", format_dry_run(&config, &config_path.display().to_string()));
        return Ok(());
    }

    let discovery = config.create_discovery()?;
    let backend = config.create_backend(discovery)?;
    backend
        .initialize()
        .await
        .with_context(|| format!("Failed to initialize {} backend", backend.name()))?;
    info!("Using {} backend", backend.name());

    let store = config.create_store().await?;
    let hub = Arc::new(HubService::new(backend.clone(), store, config.hub_config()));
    hub.initialize().await.context("Failed to load state")?;

    let bus = Arc::new(MessageBus::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = Dispatcher::new(hub.clone(), bus.clone()).spawn(shutdown_rx.clone());

    let addr = config.listen_addr()?;
    let ingress = IngressState::new(bus, hub);
    tasks.push(tokio::spawn(async move {
        if let Err(e) = serve(addr, ingress, shutdown_rx).await {
            error!("Ingress failed: {}", e);
        }
    }));

    info!("Endpoints:");
    info!("  GET  /health                - Health check");
    info!("  GET  /v1/status             - Tenant and service counts");
    info!("  POST /v1/topics/{{topic}}     - Publish a tenant or product notification");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");

    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Task ended abnormally: {}", e);
        }
    }
    backend.shutdown().await;

    Ok(())
}
