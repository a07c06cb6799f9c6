//! Per-machine bootstrap material.
//!
//! Every created machine gets one secure parameter at
//! `<token_path>/<instance_id>` that it reads at boot: either a registration
//! command line built around a reusable token, or a single-use JIT config.

use std::time::Duration;

use fleet_events::RunnerType;
use tracing::{debug, info, warn};

use crate::collaborators::{
    tags, Coordinator, FleetProvider, InstallationAuth, JitConfigRequest, ParameterStore,
    RunnerScope,
};
use crate::config::ScaleUpConfig;
use crate::error::ScalerResult;

/// Batch size from which writes are spaced out.
pub const BACKPRESSURE_THRESHOLD: usize = 40;

/// Pause between two writes of a large batch.
pub const BACKPRESSURE_DELAY: Duration = Duration::from_millis(25);

/// Publishes bootstrap material for freshly created machines.
pub struct BootstrapPublisher<'a> {
    pub config: &'a ScaleUpConfig,
    pub coordinator: &'a dyn Coordinator,
    pub fleet: &'a dyn FleetProvider,
    pub store: &'a dyn ParameterStore,
}

impl BootstrapPublisher<'_> {
    pub async fn publish(
        &self,
        scope: &RunnerScope,
        auth: &InstallationAuth,
        instance_ids: &[String],
    ) -> ScalerResult<()> {
        let throttle = instance_ids.len() >= BACKPRESSURE_THRESHOLD;
        if throttle {
            debug!(
                count = instance_ids.len(),
                delay_ms = BACKPRESSURE_DELAY.as_millis() as u64,
                "Spacing out bootstrap writes"
            );
        }

        if self.config.jit_config {
            self.publish_jit(scope, auth, instance_ids, throttle).await
        } else {
            self.publish_registration(scope, auth, instance_ids, throttle)
                .await
        }
    }

    async fn publish_registration(
        &self,
        scope: &RunnerScope,
        auth: &InstallationAuth,
        instance_ids: &[String],
        throttle: bool,
    ) -> ScalerResult<()> {
        let token = self.coordinator.registration_token(auth, scope).await?;
        let command = registration_command(self.config, scope, &token);

        for (i, instance_id) in instance_ids.iter().enumerate() {
            if throttle && i > 0 {
                tokio::time::sleep(BACKPRESSURE_DELAY).await;
            }
            self.store
                .put(&self.parameter_path(instance_id), &command, true)
                .await?;
        }

        info!(
            owner = %scope.owner,
            count = instance_ids.len(),
            "Registration config published"
        );
        Ok(())
    }

    async fn publish_jit(
        &self,
        scope: &RunnerScope,
        auth: &InstallationAuth,
        instance_ids: &[String],
        throttle: bool,
    ) -> ScalerResult<()> {
        let runner_group_id = match scope.runner_type {
            RunnerType::Org => {
                self.coordinator
                    .runner_group_id(auth, scope, &self.config.runner_group)
                    .await?
            }
            RunnerType::Repo => 1,
        };

        for (i, instance_id) in instance_ids.iter().enumerate() {
            if throttle && i > 0 {
                tokio::time::sleep(BACKPRESSURE_DELAY).await;
            }

            let request = JitConfigRequest {
                name: format!("{}{}", self.config.name_prefix, instance_id),
                runner_group_id,
                labels: self.config.runner_labels.clone(),
            };
            let jit = self.coordinator.jit_config(auth, scope, &request).await?;

            let runner_tag = [(tags::RUNNER_ID.to_string(), jit.runner_id.to_string())];
            if let Err(e) = self.fleet.tag_machine(instance_id, &runner_tag).await {
                warn!(
                    instance_id = %instance_id,
                    error = %e,
                    "Failed to tag machine with runner id"
                );
            }

            self.store
                .put(&self.parameter_path(instance_id), &jit.encoded_config, true)
                .await?;
            debug!(instance_id = %instance_id, runner_id = jit.runner_id, "JIT config published");
        }

        info!(owner = %scope.owner, count = instance_ids.len(), "JIT configs published");
        Ok(())
    }

    fn parameter_path(&self, instance_id: &str) -> String {
        format!(
            "{}/{}",
            self.config.token_path.trim_end_matches('/'),
            instance_id
        )
    }
}

/// Assembles the runner registration arguments.
pub fn registration_command(config: &ScaleUpConfig, scope: &RunnerScope, token: &str) -> String {
    let mut args = vec![
        format!("--url {}/{}", config.coordinator_url, scope.owner),
        format!("--token {}", token),
    ];
    if !config.runner_labels.is_empty() {
        args.push(format!("--labels {}", config.runner_labels.join(",")));
    }
    if config.disable_auto_update {
        args.push("--disableupdate".to_string());
    }
    if scope.runner_type == RunnerType::Org && !config.runner_group.is_empty() {
        args.push(format!("--runnergroup {}", config.runner_group));
    }
    if config.ephemeral {
        args.push("--ephemeral".to_string());
    }
    args.join(" ")
}
