//! Scale-up: turning a routed job (or a pool top-up) into machines.
//!
//! One message produces at most one fleet decision. The flow is:
//!
//! 1. resolve the installation for the owner
//! 2. optionally confirm the job is still queued
//! 3. enforce the per-owner machine ceiling
//! 4. issue one batched create request
//! 5. publish bootstrap material per created machine
//!
//! Only a capacity shortfall in step 4, or a ceiling hit in ephemeral mode,
//! produces the retryable [`ScalerError::Scale`].

pub mod bootstrap;
pub mod fleet;

use std::sync::Arc;

use chrono::Utc;
use fleet_events::{event_types, ActionRequest};
use fleet_reconcile::MachineRecord;
use tracing::{debug, error, info, instrument, warn};

use crate::collaborators::{
    Coordinator, FleetProvider, InstallationAuth, JobStatus, MachineFilter, ParameterStore,
    RunnerScope,
};
use crate::config::ScaleUpConfig;
use crate::error::{ScalerError, ScalerResult};
use crate::retry::RetryScheduler;

pub use bootstrap::{BootstrapPublisher, BACKPRESSURE_DELAY, BACKPRESSURE_THRESHOLD};
pub use fleet::{is_scale_error, SCALE_ERROR_CODES};

/// Which path created a machine, written to the `created_by` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreatedBy {
    ScaleUp,
    Pool,
}

impl CreatedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreatedBy::ScaleUp => "scale-up",
            CreatedBy::Pool => "pool",
        }
    }
}

/// Provisions machines for routed jobs and pool top-ups.
pub struct FleetProvisioner {
    config: ScaleUpConfig,
    fleet: Arc<dyn FleetProvider>,
    coordinator: Arc<dyn Coordinator>,
    store: Arc<dyn ParameterStore>,
    retry: Option<Arc<RetryScheduler>>,
}

impl FleetProvisioner {
    pub fn new(
        config: ScaleUpConfig,
        fleet: Arc<dyn FleetProvider>,
        coordinator: Arc<dyn Coordinator>,
        store: Arc<dyn ParameterStore>,
    ) -> Self {
        Self {
            config,
            fleet,
            coordinator,
            store,
            retry: None,
        }
    }

    /// Hands every processed message to `retry` afterwards.
    pub fn with_retry(mut self, retry: Arc<RetryScheduler>) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Processes a delivery batch. Only single-message batches are handled;
    /// anything else is skipped with a warning so that no job is provisioned
    /// twice.
    pub async fn handle_batch(&self, bodies: &[String]) -> ScalerResult<Vec<MachineRecord>> {
        let [body] = bodies else {
            warn!(
                batch_size = bodies.len(),
                "Scale-up expects exactly one message per invocation, skipping batch"
            );
            return Ok(Vec::new());
        };

        let request = ActionRequest::from_json(body)?;
        self.provision(&request).await
    }

    /// Provisions one machine for a routed job.
    #[instrument(
        skip(self, request),
        fields(job_id = request.id, repository = %request.full_name())
    )]
    pub async fn provision(&self, request: &ActionRequest) -> ScalerResult<Vec<MachineRecord>> {
        if self.config.ephemeral && request.event_type != event_types::WORKFLOW_JOB {
            return Err(ScalerError::UnsupportedEvent(format!(
                "ephemeral runners only handle {} events, got '{}'",
                event_types::WORKFLOW_JOB,
                request.event_type
            )));
        }

        let scope = RunnerScope::new(
            request.owner_tag(self.config.runner_type),
            self.config.runner_type,
        );
        let installation_hint = (request.installation_id != 0).then_some(request.installation_id);
        let auth = self
            .coordinator
            .installation_auth(&scope, installation_hint)
            .await?;

        if self.config.job_queued_check {
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
                info!(status = ?status, "Job is not queued, no runner will be created");
                return Ok(Vec::new());
            }
        }

        let machines = if self.at_maximum(&scope).await? {
            if self.config.ephemeral {
                return Err(ScalerError::Scale(format!(
                    "maximum number of runners reached for {}",
                    scope
                )));
            }
            info!(owner = %scope.owner, "Maximum number of runners reached, no runner created");
            Vec::new()
        } else {
            self.create_runners(&scope, &auth, 1, CreatedBy::ScaleUp)
                .await?
        };

        if let Some(retry) = &self.retry {
            if let Err(e) = retry.schedule_retry(request).await {
                error!(error = %e, "Failed to schedule job retry");
            }
        }

        Ok(machines)
    }

    async fn at_maximum(&self, scope: &RunnerScope) -> ScalerResult<bool> {
        let Some(maximum) = self.config.maximum_runners else {
            return Ok(false);
        };

        let filter = MachineFilter::environment(&self.config.environment)
            .owned_by(scope.runner_type, &scope.owner);
        let current = self.fleet.list_machines(&filter).await?.len();
        debug!(current, maximum, owner = %scope.owner, "Current runner count");

        Ok(current >= maximum as usize)
    }

    /// Creates `count` machines for `scope` and publishes their bootstrap
    /// material. Shared by the job path and the pool path.
    pub async fn create_runners(
        &self,
        scope: &RunnerScope,
        auth: &InstallationAuth,
        count: u32,
        created_by: CreatedBy,
    ) -> ScalerResult<Vec<MachineRecord>> {
        let image_id = match &self.config.fleet.image_id_parameter {
            Some(parameter) => Some(self.store.get(parameter).await?),
            None => None,
        };

        let request = fleet::build_request(
            &self.config.fleet,
            &self.config.environment,
            scope,
            count,
            created_by,
            image_id.as_deref(),
        )?;
        let instance_ids =
            fleet::create_fleet(self.fleet.as_ref(), &self.config.fleet, request).await?;

        BootstrapPublisher {
            config: &self.config,
            coordinator: self.coordinator.as_ref(),
            fleet: self.fleet.as_ref(),
            store: self.store.as_ref(),
        }
        .publish(scope, auth, &instance_ids)
        .await?;

        info!(
            owner = %scope.owner,
            created_by = created_by.as_str(),
            count = instance_ids.len(),
            "Runners created"
        );

        let launch_time = Utc::now();
        Ok(instance_ids
            .into_iter()
            .map(|instance_id| MachineRecord {
                instance_id,
                launch_time: Some(launch_time),
                owner: scope.owner.clone(),
                runner_type: scope.runner_type,
                orphan: false,
                environment: self.config.environment.clone(),
                runner_id: None,
            })
            .collect())
    }
}
