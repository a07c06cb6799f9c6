//! Runner fleet scaler
//!
//! Runs the timer-driven workers (scale-down, pool, housekeeping) and a
//! local delivery loop: job notifications are read as JSON lines from stdin,
//! dispatched, and the resulting queue messages are fed to scale-up and the
//! retry scheduler. No cloud backend is linked yet, so every collaborator is
//! the in-memory implementation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fleet_events::JobEvent;
use fleet_scaler::{
    collaborators::memory::{ChannelQueue, MemoryCoordinator, MemoryFleet, MemoryParameterStore},
    config::Config,
    Delivery, Dispatcher, FleetProvisioner, FleetReconciler, ParameterHousekeeper,
    PeriodicWorker, PoolBalancer, RetryScheduler,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to FLEET_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting runner fleet scaler");
    info!(
        environment = %config.scale_up.environment,
        runner_type = %config.scale_up.runner_type,
        ephemeral = config.scale_up.ephemeral,
        queues = config.dispatch.queues.len(),
        "Configuration loaded"
    );

    // TODO: link the cloud provider, coordinator API and queue clients once
    // their crates exist; the in-memory collaborators stand in until then.
    let fleet = Arc::new(MemoryFleet::new());
    let coordinator = Arc::new(MemoryCoordinator::new());
    let store = Arc::new(MemoryParameterStore::new());
    let (queue, deliveries) = ChannelQueue::new();
    let queue = Arc::new(queue);

    let retry = Arc::new(RetryScheduler::new(
        config.retry.clone(),
        config.scale_up.runner_type,
        queue.clone(),
        coordinator.clone(),
    ));

    let mut provisioner = FleetProvisioner::new(
        config.scale_up.clone(),
        fleet.clone(),
        coordinator.clone(),
        store.clone(),
    );
    if config.retry.enabled {
        provisioner = provisioner.with_retry(retry.clone());
    }
    let provisioner = Arc::new(provisioner);

    let dispatcher = Arc::new(Dispatcher::new(&config.dispatch, queue.clone()));
    let reconciler = Arc::new(FleetReconciler::new(
        config.scale_down.clone(),
        fleet.clone(),
        coordinator.clone(),
    )?);
    let housekeeper = Arc::new(ParameterHousekeeper::new(
        config.housekeeping.clone(),
        store.clone(),
    ));

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    let scale_down_worker = PeriodicWorker::new(reconciler, config.scale_down.interval);
    workers.push((
        "scale-down",
        tokio::spawn({
            let shutdown_rx = shutdown_rx.clone();
            async move { scale_down_worker.run(shutdown_rx).await }
        }),
    ));

    let housekeeping_worker = PeriodicWorker::new(housekeeper, config.housekeeping.interval);
    workers.push((
        "housekeeping",
        tokio::spawn({
            let shutdown_rx = shutdown_rx.clone();
            async move { housekeeping_worker.run(shutdown_rx).await }
        }),
    ));

    if let Some(pool) = &config.pool {
        let balancer = Arc::new(PoolBalancer::new(
            pool,
            &config.scale_down,
            provisioner.clone(),
            fleet.clone(),
            coordinator.clone(),
        ));
        let pool_worker = PeriodicWorker::new(balancer, pool.interval);
        workers.push((
            "pool",
            tokio::spawn({
                let shutdown_rx = shutdown_rx.clone();
                async move { pool_worker.run(shutdown_rx).await }
            }),
        ));
    }

    let delivery = Arc::new(Delivery::new(
        provisioner,
        retry,
        queue.clone(),
        config.redelivery_delay,
    ));
    workers.push((
        "delivery",
        tokio::spawn(delivery.run(deliveries, shutdown_rx.clone())),
    ));

    tokio::spawn(read_jobs(dispatcher));

    // Wait for shutdown signal (Ctrl+C)
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(10);
    for (name, handle) in workers {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, handle).await {
            warn!(worker = name, error = %e, "Worker did not shut down in time");
        }
    }

    info!("Runner fleet scaler shutdown complete");
    Ok(())
}

/// Reads job notifications from stdin, one JSON document per line.
async fn read_jobs(dispatcher: Arc<Dispatcher>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Job input closed");
                return;
            }
            Err(e) => {
                error!(error = %e, "Failed to read job input");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let job: JobEvent = match serde_json::from_str(&line) {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, "Rejecting malformed job event");
                continue;
            }
        };

        match dispatcher.dispatch(&job).await {
            Ok(outcome) => info!(
                job_id = job.id,
                status = outcome.status_code(),
                message = %outcome.message(),
                "Job event handled"
            ),
            Err(e) => error!(job_id = job.id, error = %e, "Failed to dispatch job"),
        }
    }
}
