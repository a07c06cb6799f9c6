//! Warm pool top-up.
//!
//! Counts the organization's machines that can take a job now or shortly
//! (registered and idle, or still booting) and asks the provisioner for the
//! difference. Never terminates anything; surplus is left to scale-down.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleet_events::{PoolEvent, RunnerType};
use fleet_reconcile::{join_views, pool_idle_count, MachineClass};
use tracing::{debug, info, instrument};

use crate::collaborators::{Coordinator, FleetProvider, MachineFilter, RunnerScope};
use crate::config::{PoolConfig, ScaleDownConfig};
use crate::error::ScalerResult;
use crate::scale_up::{CreatedBy, FleetProvisioner};

/// Result of one adjustment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub booting: usize,
    pub topped_up: usize,
}

/// Keeps a pool of idle organization runners.
pub struct PoolBalancer {
    owner: String,
    target: u32,
    environment: String,
    name_prefix: String,
    boot_time: chrono::Duration,
    provisioner: Arc<FleetProvisioner>,
    fleet: Arc<dyn FleetProvider>,
    coordinator: Arc<dyn Coordinator>,
}

impl PoolBalancer {
    /// Classification settings are shared with scale-down so both agree on
    /// what "booting" means.
    pub fn new(
        pool: &PoolConfig,
        scale_down: &ScaleDownConfig,
        provisioner: Arc<FleetProvisioner>,
        fleet: Arc<dyn FleetProvider>,
        coordinator: Arc<dyn Coordinator>,
    ) -> Self {
        Self {
            owner: pool.owner.clone(),
            target: pool.size,
            environment: scale_down.environment.clone(),
            name_prefix: scale_down.name_prefix.clone(),
            boot_time: scale_down.boot_time,
            provisioner,
            fleet,
            coordinator,
        }
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    /// Adjusts to the size carried by a scheduler event.
    pub async fn handle_event(&self, event: PoolEvent) -> ScalerResult<PoolStats> {
        self.adjust(event.pool_size).await
    }

    pub async fn adjust(&self, target_pool_size: u32) -> ScalerResult<PoolStats> {
        self.adjust_at(target_pool_size, Utc::now()).await
    }

    #[instrument(skip(self), fields(owner = %self.owner))]
    pub async fn adjust_at(
        &self,
        target_pool_size: u32,
        now: DateTime<Utc>,
    ) -> ScalerResult<PoolStats> {
        let scope = RunnerScope::org(&self.owner);
        let auth = self.coordinator.installation_auth(&scope, None).await?;
        let runners = self.coordinator.list_runners(&auth, &scope).await?;

        let filter =
            MachineFilter::environment(&self.environment).owned_by(RunnerType::Org, &self.owner);
        let machines: Vec<_> = self
            .fleet
            .list_machines(&filter)
            .await?
            .into_iter()
            .filter(|m| !m.orphan)
            .collect();

        let joined = join_views(machines, &runners, &self.name_prefix, self.boot_time, now);
        let available = pool_idle_count(joined.iter().map(|(_, class)| class));
        let booting = joined
            .iter()
            .filter(|(_, class)| *class == MachineClass::Booting)
            .count();

        let mut stats = PoolStats {
            idle: available - booting,
            booting,
            topped_up: 0,
        };

        let top_up = (target_pool_size as usize).saturating_sub(available);
        if top_up == 0 {
            debug!(available, target = target_pool_size, "Pool is at or above target");
            return Ok(stats);
        }

        info!(available, target = target_pool_size, top_up, "Topping up pool");
        let created = self
            .provisioner
            .create_runners(&scope, &auth, top_up as u32, CreatedBy::Pool)
            .await?;
        stats.topped_up = created.len();

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::memory::{MemoryCoordinator, MemoryFleet, MemoryParameterStore};
    use crate::collaborators::{tags, CapacityType};
    use crate::config::{FleetSettings, ScaleUpConfig};
    use chrono::{Duration, TimeZone};
    use fleet_reconcile::{MachineRecord, RegisteredRunner, RunnerStatus};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
    }

    fn machine(id: &str, age_minutes: i64) -> MachineRecord {
        MachineRecord {
            instance_id: id.into(),
            launch_time: Some(now() - Duration::minutes(age_minutes)),
            owner: "acme".into(),
            runner_type: RunnerType::Org,
            orphan: false,
            environment: "ci".into(),
            runner_id: None,
        }
    }

    fn balancer() -> (PoolBalancer, Arc<MemoryFleet>, Arc<MemoryCoordinator>) {
        let fleet = Arc::new(MemoryFleet::new());
        let coordinator = Arc::new(MemoryCoordinator::new());
        let store = Arc::new(MemoryParameterStore::new());
        let scale_up = ScaleUpConfig {
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
            token_path: "/fleet/tokens".into(),
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
        };
        let scale_down = ScaleDownConfig {
            environment: "ci".into(),
            name_prefix: String::new(),
            minimum_running_time: Duration::minutes(5),
            boot_time: Duration::minutes(5),
            windows: vec![],
            interval: std::time::Duration::from_secs(300),
        };
        let pool = PoolConfig {
            size: 3,
            owner: "acme".into(),
            interval: std::time::Duration::from_secs(300),
        };
        let provisioner = Arc::new(FleetProvisioner::new(
            scale_up,
            fleet.clone(),
            coordinator.clone(),
            store,
        ));
        let balancer = PoolBalancer::new(
            &pool,
            &scale_down,
            provisioner,
            fleet.clone(),
            coordinator.clone(),
        );
        (balancer, fleet, coordinator)
    }

    #[tokio::test]
    async fn test_pool_at_target_is_noop() {
        let (balancer, fleet, coordinator) = balancer();
        for i in 0..3u64 {
            let id = format!("i-{}", i);
            fleet.insert(machine(&id, 30)).await;
            coordinator
                .register(
                    "acme",
                    RegisteredRunner {
                        id: i,
                        name: id.clone(),
                        busy: false,
                        status: RunnerStatus::Online,
                    },
                )
                .await;
        }

        let stats = balancer.adjust_at(balancer.target(), now()).await.unwrap();
        assert_eq!(stats.idle, 3);
        assert_eq!(stats.topped_up, 0);
        assert!(fleet.create_requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_busy_and_orphans_do_not_count() {
        let (balancer, fleet, coordinator) = balancer();
        fleet.insert(machine("i-busy", 30)).await;
        fleet.insert(machine("i-unregistered", 30)).await;
        coordinator
            .register(
                "acme",
                RegisteredRunner {
                    id: 1,
                    name: "i-busy".into(),
                    busy: true,
                    status: RunnerStatus::Online,
                },
            )
            .await;

        let stats = balancer
            .handle_event(PoolEvent { pool_size: 2 })
            .await
            .unwrap();
        assert_eq!(stats.topped_up, 2);

        let requests = fleet.create_requests().await;
        assert_eq!(requests[0].target_capacity, 2);
        assert_eq!(requests[0].tag(tags::CREATED_BY), Some("pool"));
        assert!(fleet.terminated().await.is_empty());
    }
}
