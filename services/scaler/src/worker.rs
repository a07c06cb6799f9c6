//! Periodic background workers.
//!
//! Scale-down, pool top-up and parameter housekeeping are timer driven. Each
//! runs in its own worker so a pass never overlaps with itself.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{error, info, instrument};

use crate::error::ScalerResult;
use crate::housekeeping::ParameterHousekeeper;
use crate::pool::PoolBalancer;
use crate::scale_down::FleetReconciler;

/// One unit of timer-driven work.
#[async_trait]
pub trait PeriodicTask: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run_once(&self) -> ScalerResult<()>;
}

#[async_trait]
impl PeriodicTask for FleetReconciler {
    fn name(&self) -> &'static str {
        "scale-down"
    }

    async fn run_once(&self) -> ScalerResult<()> {
        self.reconcile().await.map(|_| ())
    }
}

#[async_trait]
impl PeriodicTask for PoolBalancer {
    fn name(&self) -> &'static str {
        "pool"
    }

    async fn run_once(&self) -> ScalerResult<()> {
        self.adjust(self.target()).await.map(|_| ())
    }
}

#[async_trait]
impl PeriodicTask for ParameterHousekeeper {
    fn name(&self) -> &'static str {
        "housekeeping"
    }

    async fn run_once(&self) -> ScalerResult<()> {
        self.sweep().await.map(|_| ())
    }
}

/// Runs a task on a fixed interval until shutdown is signaled.
pub struct PeriodicWorker {
    task: Arc<dyn PeriodicTask>,
    interval: Duration,
}

impl PeriodicWorker {
    pub fn new(task: Arc<dyn PeriodicTask>, interval: Duration) -> Self {
        Self { task, interval }
    }

    #[instrument(skip(self, shutdown), fields(task = self.task.name()))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        // Don't immediately tick on startup - wait for first interval
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.task.run_once().await {
                        error!(error = %e, retryable = e.is_retryable(), "Worker pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
