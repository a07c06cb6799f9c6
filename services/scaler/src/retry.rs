//! Job requeue with exponential backoff.
//!
//! A job can look "not queued yet" for a moment after the coordinator emits
//! it, and a machine created for it may be taken by another job. The
//! scheduler parks a copy of the message on a delayed queue and, on
//! delivery, sends it back to scale-up if the job is still waiting.
//!
//! The retry counter lives only on the message, so replaying a message is
//! harmless.

use std::sync::Arc;
use std::time::Duration;

use fleet_events::{ActionRequest, RunnerType};
use tracing::{debug, info, instrument};

use crate::collaborators::{Coordinator, JobStatus, MessageQueue, RunnerScope};
use crate::config::RetryConfig;
use crate::error::ScalerResult;

/// Tracing target for metric events.
pub const METRICS_TARGET: &str = "fleet_scaler::metrics";

/// What a retry step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    Disabled,
    /// `max_attempts` reached; the message was dropped.
    Exhausted { retry_counter: u32 },
    /// Parked on the delayed queue.
    Scheduled { retry_counter: u32, delay: Duration },
    /// Sent back to the scale-up queue.
    Requeued { retry_counter: u32, destination: String },
    /// The job left the queued state; dropped.
    NoLongerQueued { status: JobStatus },
}

/// Schedules and performs job requeues.
pub struct RetryScheduler {
    config: RetryConfig,
    runner_type: RunnerType,
    queue: Arc<dyn MessageQueue>,
    coordinator: Arc<dyn Coordinator>,
}

impl RetryScheduler {
    pub fn new(
        config: RetryConfig,
        runner_type: RunnerType,
        queue: Arc<dyn MessageQueue>,
        coordinator: Arc<dyn Coordinator>,
    ) -> Self {
        Self {
            config,
            runner_type,
            queue,
            coordinator,
        }
    }

    pub fn retry_queue(&self) -> &str {
        &self.config.retry_queue
    }

    /// Parks a copy of `request` on the delayed queue with its counter
    /// advanced, unless retries are disabled or exhausted.
    #[instrument(skip(self, request), fields(job_id = request.id))]
    pub async fn schedule_retry(&self, request: &ActionRequest) -> ScalerResult<RetryOutcome> {
        if !self.config.enabled {
            return Ok(RetryOutcome::Disabled);
        }

        let attempts = request.retry_count();
        let Some(delay) = self.config.backoff.delay_for(attempts) else {
            info!(
                retry_counter = attempts,
                max_attempts = self.config.backoff.max_attempts,
                "Job retry attempts exhausted, dropping"
            );
            return Ok(RetryOutcome::Exhausted {
                retry_counter: attempts,
            });
        };

        let next = request.with_next_retry();
        self.queue
            .publish(&self.config.retry_queue, &next.to_json()?, Some(delay))
            .await?;

        let retry_counter = next.retry_count();
        info!(
            retry_counter,
            delay_secs = delay.as_secs(),
            "Job retry scheduled"
        );
        Ok(RetryOutcome::Scheduled {
            retry_counter,
            delay,
        })
    }

    /// Re-checks a delayed message and sends it back to scale-up when the
    /// job is still queued.
    #[instrument(skip(self, request), fields(job_id = request.id))]
    pub async fn check_and_retry(&self, request: &ActionRequest) -> ScalerResult<RetryOutcome> {
        let scope = RunnerScope::new(request.owner_tag(self.runner_type), self.runner_type);
        let installation_hint = (request.installation_id != 0).then_some(request.installation_id);
        let auth = self
            .coordinator
            .installation_auth(&scope, installation_hint)
            .await?;

        let status = self
            .coordinator
            .job_status(
                &auth,
                &request.repository_owner,
                &request.repository_name,
                request.id,
            )
            .await?;

        if status != JobStatus::Queued {
            debug!(status = ?status, "Job no longer queued, dropping retry");
            return Ok(RetryOutcome::NoLongerQueued { status });
        }

        let destination = request
            .queue_id
            .clone()
            .unwrap_or_else(|| self.config.job_queue.clone());
        self.queue
            .publish(&destination, &request.to_json()?, None)
            .await?;

        let retry_counter = request.retry_count();
        if self.config.metrics_enabled {
            info!(
                target: METRICS_TARGET,
                metric = "RetryJob",
                value = 1u64,
                retry_counter,
                repository = %request.full_name(),
                "metric"
            );
        }
        info!(retry_counter, destination = %destination, "Job requeued for scale-up");

        Ok(RetryOutcome::Requeued {
            retry_counter,
            destination,
        })
    }

    /// Decodes and re-checks a delayed queue message.
    pub async fn handle_message(&self, body: &str) -> ScalerResult<RetryOutcome> {
        let request = ActionRequest::from_json(body)?;
        self.check_and_retry(&request).await
    }
}
