//! Local message delivery.
//!
//! Stands in for the queue transport when no cloud backend is linked:
//! published messages arrive on a channel, wait out their delay, and are
//! handed to scale-up or to the retry check depending on their destination.
//! A scale-up message that fails with a retryable error is published again
//! after the configured redelivery delay, the way a queue would make it
//! visible again after its visibility timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::collaborators::memory::PublishedMessage;
use crate::collaborators::MessageQueue;
use crate::retry::{RetryOutcome, RetryScheduler};
use crate::scale_up::FleetProvisioner;

/// What happened to one delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Scale-up ran; `machines` were created.
    Provisioned { machines: usize },
    /// The retry check ran.
    Retried(RetryOutcome),
    /// Scale-up failed with a retryable error and the message was
    /// published again.
    Redelivered { delay: Duration },
    /// The message failed for good and was dropped.
    Dropped,
}

/// Routes delivered messages to scale-up or the retry scheduler.
pub struct Delivery {
    provisioner: Arc<FleetProvisioner>,
    retry: Arc<RetryScheduler>,
    queue: Arc<dyn MessageQueue>,
    redelivery_delay: Duration,
}

impl Delivery {
    pub fn new(
        provisioner: Arc<FleetProvisioner>,
        retry: Arc<RetryScheduler>,
        queue: Arc<dyn MessageQueue>,
        redelivery_delay: Duration,
    ) -> Self {
        Self {
            provisioner,
            retry,
            queue,
            redelivery_delay,
        }
    }

    /// Handles one message, honoring its delay first.
    #[instrument(skip(self, message), fields(destination = %message.destination))]
    pub async fn handle(&self, message: PublishedMessage) -> DeliveryOutcome {
        if let Some(delay) = message.delay {
            tokio::time::sleep(delay).await;
        }

        if message.destination == self.retry.retry_queue() {
            return match self.retry.handle_message(&message.body).await {
                Ok(outcome) => DeliveryOutcome::Retried(outcome),
                Err(e) => {
                    error!(error = %e, "Retry check failed");
                    DeliveryOutcome::Dropped
                }
            };
        }

        let e = match self
            .provisioner
            .handle_batch(std::slice::from_ref(&message.body))
            .await
        {
            Ok(machines) => {
                return DeliveryOutcome::Provisioned {
                    machines: machines.len(),
                }
            }
            Err(e) => e,
        };

        if !e.is_retryable() {
            error!(error = %e, "Scale-up failed, dropping message");
            return DeliveryOutcome::Dropped;
        }

        warn!(
            error = %e,
            delay_secs = self.redelivery_delay.as_secs(),
            "Scale-up failed with a retryable error, redelivering"
        );
        match self
            .queue
            .publish(&message.destination, &message.body, Some(self.redelivery_delay))
            .await
        {
            Ok(()) => DeliveryOutcome::Redelivered {
                delay: self.redelivery_delay,
            },
            Err(e) => {
                error!(error = %e, "Failed to redeliver message");
                DeliveryOutcome::Dropped
            }
        }
    }

    /// Consumes `deliveries` until shutdown, then waits for messages that are
    /// already in flight.
    pub async fn run(
        self: Arc<Self>,
        mut deliveries: mpsc::UnboundedReceiver<PublishedMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                message = deliveries.recv() => {
                    let Some(message) = message else { break };
                    let delivery = self.clone();
                    in_flight.spawn(async move { delivery.handle(message).await });
                }
                Some(finished) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = finished {
                        error!(error = %e, "Delivery task failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Delivery loop shutting down");
                        break;
                    }
                }
            }
        }

        if !in_flight.is_empty() {
            info!(pending = in_flight.len(), "Draining in-flight deliveries");
        }
        while let Some(finished) = in_flight.join_next().await {
            match finished {
                Ok(outcome) => debug!(outcome = ?outcome, "In-flight delivery finished"),
                Err(e) => error!(error = %e, "Delivery task failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::memory::{
        ChannelQueue, MemoryCoordinator, MemoryFleet, MemoryParameterStore, MemoryQueue,
    };
    use crate::collaborators::{CapacityType, FleetProvider, FleetResult, MachineFilter};
    use crate::config::{FleetSettings, RetryConfig, ScaleUpConfig};
    use fleet_events::{ActionRequest, JobAction, JobEvent, OwnerType, RunnerType};
    use fleet_reconcile::RetryBackoff;

    fn scale_up_config() -> ScaleUpConfig {
        ScaleUpConfig {
            environment: "ci".into(),
            runner_type: RunnerType::Org,
            ephemeral: false,
            jit_config: false,
            job_queued_check: false,
            maximum_runners: None,
            name_prefix: String::new(),
            runner_labels: vec![],
            runner_group: "Default".into(),
            disable_auto_update: false,
            token_path: "/tokens".into(),
            coordinator_url: "https://github.com".into(),
            fleet: FleetSettings {
                subnet_ids: vec!["subnet-a".into()],
                instance_types: vec!["m5.large".into()],
                launch_template_name: "ci-runner".into(),
                capacity_type: CapacityType::Spot,
                allocation_strategy: "lowest-price".into(),
                max_spot_price: None,
                on_demand_failover_on_error: vec![],
                image_id_parameter: None,
            },
        }
    }

    fn retry_config() -> RetryConfig {
        RetryConfig {
            enabled: false,
            backoff: RetryBackoff::default(),
            job_queue: "jobs".into(),
            retry_queue: "jobs-retry".into(),
            metrics_enabled: false,
        }
    }

    fn body(id: u64) -> String {
        let job = JobEvent {
            id,
            event_type: "workflow_job".into(),
            action: JobAction::Queued,
            repository_owner: "acme".into(),
            repository_name: "api".into(),
            owner_type: OwnerType::Organization,
            requested_labels: vec!["linux".into()],
            installation_id: 11,
            retry_counter: None,
        };
        ActionRequest::for_job(&job, "q-linux", false).to_json().unwrap()
    }

    fn message(body: String) -> PublishedMessage {
        PublishedMessage {
            destination: "q-linux".into(),
            body,
            delay: None,
        }
    }

    fn setup(
        fleet: Arc<MemoryFleet>,
        queue: Arc<dyn MessageQueue>,
        redelivery_delay: Duration,
    ) -> Delivery {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let provisioner = Arc::new(FleetProvisioner::new(
            scale_up_config(),
            fleet,
            coordinator.clone(),
            Arc::new(MemoryParameterStore::new()),
        ));
        let retry = Arc::new(RetryScheduler::new(
            retry_config(),
            RunnerType::Org,
            queue.clone(),
            coordinator,
        ));
        Delivery::new(provisioner, retry, queue, redelivery_delay)
    }

    fn capacity_error() -> FleetResult {
        FleetResult {
            instance_ids: vec![],
            error_codes: vec!["InsufficientInstanceCapacity".into()],
        }
    }

    #[tokio::test]
    async fn test_retryable_scale_failure_is_redelivered() {
        let fleet = Arc::new(MemoryFleet::new());
        fleet.script_create(capacity_error()).await;
        let queue = Arc::new(MemoryQueue::new());
        let delivery = setup(fleet, queue.clone(), Duration::from_secs(30));

        let outcome = delivery.handle(message(body(1))).await;

        assert_eq!(
            outcome,
            DeliveryOutcome::Redelivered {
                delay: Duration::from_secs(30)
            }
        );
        let redelivered = queue.published_to("q-linux").await;
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].body, body(1));
        assert_eq!(redelivered[0].delay, Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_fatal_scale_failure_is_dropped() {
        let fleet = Arc::new(MemoryFleet::new());
        fleet
            .script_create(FleetResult {
                instance_ids: vec![],
                error_codes: vec!["InvalidParameterValue".into()],
            })
            .await;
        let queue = Arc::new(MemoryQueue::new());
        let delivery = setup(fleet, queue.clone(), Duration::from_secs(30));

        assert_eq!(delivery.handle(message(body(1))).await, DeliveryOutcome::Dropped);
        assert!(queue.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_redelivered_message_provisions_once_capacity_returns() {
        let fleet = Arc::new(MemoryFleet::new());
        fleet.script_create(capacity_error()).await;
        let (queue, deliveries) = ChannelQueue::new();
        let queue = Arc::new(queue);
        let delivery = Arc::new(setup(fleet.clone(), queue.clone(), Duration::from_millis(10)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(delivery.run(deliveries, shutdown_rx));
        queue.publish("q-linux", &body(1), None).await.unwrap();

        let filter = MachineFilter::environment("ci");
        tokio::time::timeout(Duration::from_secs(5), async {
            while fleet.list_machines(&filter).await.unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(fleet.create_requests().await.len(), 2);
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drains_delayed_messages() {
        let fleet = Arc::new(MemoryFleet::new());
        let (queue, deliveries) = ChannelQueue::new();
        let queue = Arc::new(queue);
        let delivery = Arc::new(setup(fleet.clone(), queue.clone(), Duration::from_secs(30)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(delivery.run(deliveries, shutdown_rx));
        queue
            .publish("q-linux", &body(1), Some(Duration::from_millis(50)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fleet.create_requests().await.len(), 1);
    }
}
