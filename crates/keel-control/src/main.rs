//! Keel control worker binary.
//!
//! Connects to PostgreSQL, optionally registers and heartbeats this
//! worker's node, and runs dispatcher loops until shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use keel_control::{
    CommandExecutor, ControlConfig, DeploymentManager, Dispatcher, InFlight, JobQueue,
    PostgresQueue, PostgresStore, RuntimeExecutor,
};
use keel_scheduler::{
    HeartbeatMetrics, HeartbeatTask, MetricsSource, NodeDescriptor, NodeId, NodeRegistry,
    NodeStore, PostgresNodeStore,
};

#[derive(Parser, Debug)]
#[command(name = "keel-control")]
#[command(about = "Run keel build dispatchers against the shared queue")]
#[command(version)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "debug,sqlx=warn"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    info!("keel control worker starting");

    let config = ControlConfig::load(cli.config.as_deref()).context("failed to load config")?;

    info!(
        max_connections = config.database.max_connections,
        concurrency = config.dispatcher.concurrency,
        node_id = ?config.dispatcher.node_id,
        placement = config.dispatcher.placement,
        executor = %config.executor.program,
        "configuration loaded"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(config.database.connect_timeout())
        .connect(&config.database.url)
        .await
        .context("failed to connect to database")?;

    let queue: Arc<dyn JobQueue> = Arc::new(PostgresQueue::from_pool(pool.clone()).await?);
    let store = Arc::new(PostgresStore::from_pool(pool.clone()).await?);
    let node_store: Arc<dyn NodeStore> = Arc::new(PostgresNodeStore::from_pool(pool).await?);
    let registry = Arc::new(NodeRegistry::new(node_store, &config.health)?);

    let in_flight = Arc::new(InFlight::new());
    let manager = Arc::new(DeploymentManager::new(
        store,
        Arc::clone(&queue),
        Arc::clone(&in_flight),
    ));
    let executor: Arc<dyn RuntimeExecutor> = Arc::new(CommandExecutor::new(
        config.executor.program.clone(),
        config.executor.args.clone(),
    ));

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    let node_id = match &config.dispatcher.node_id {
        Some(id) => {
            let descriptor = NodeDescriptor::new(id.clone(), config.dispatcher.node_address.clone())
                .with_id(NodeId::new(id.clone()));
            let node_id = registry.register(descriptor).await?;

            let load = Arc::clone(&in_flight);
            let metrics: MetricsSource = Arc::new(move || {
                HeartbeatMetrics::with_load(u32::try_from(load.len()).unwrap_or(u32::MAX))
            });
            let heartbeat = HeartbeatTask::new(
                Arc::clone(&registry),
                node_id.clone(),
                config.health.heartbeat_interval,
                metrics,
            );
            tasks.spawn(heartbeat.run(shutdown.clone()));

            Some(node_id)
        }
        None => None,
    };

    for id in 0..config.dispatcher.concurrency.max(1) {
        let mut dispatcher = Dispatcher::new(
            id,
            Arc::clone(&queue),
            Arc::clone(&manager),
            Arc::clone(&executor),
        )
        .with_retry(config.retry.policy())
        .with_poll_interval(config.dispatcher.poll_interval())
        .with_build_timeout(config.dispatcher.build_timeout());

        if let Some(node_id) = &node_id {
            dispatcher = dispatcher.with_node(Arc::clone(&registry), node_id.clone());
        }
        if config.dispatcher.placement {
            dispatcher = dispatcher.with_placement(Arc::clone(&registry));
        }

        let token = shutdown.clone();
        tasks.spawn(async move { dispatcher.run(token).await });
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "worker task failed");
            shutdown.cancel();
        }
    }

    info!("keel control worker shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
    }
}
