//! Scale-down reconciliation.
//!
//! A pass runs in two phases:
//!
//! 1. Terminate every machine already tagged orphan. A machine tagged in
//!    pass N is therefore only removed in pass N+1.
//! 2. Walk the remaining machines owner group by owner group, in eviction
//!    order, and decide per machine: booting, orphan (tag only), within its
//!    minimum running time, kept idle (spends the group's idle budget), or
//!    removed.
//!
//! Removal re-reads the live busy flag of every matching runner, never the
//! pass listing, and terminates the machine only after every registration
//! was deleted. A failure on one machine is logged and counted; it never
//! stops the pass.

mod cache;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleet_reconcile::{
    classify_machine, order_for_eviction, EvictionPolicy, MachineClass, MachineRecord,
};
use futures_util::future::try_join_all;
use tracing::{debug, info, instrument, warn};

use crate::collaborators::{
    tags, Coordinator, CoordinatorError, FleetProvider, MachineFilter, RunnerScope,
};
use crate::config::ScaleDownConfig;
use crate::error::ScalerResult;

pub use cache::PassCache;

/// Counters for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassStats {
    pub orphans_terminated: usize,
    pub orphans_tagged: usize,
    pub terminated: usize,
    pub kept_idle: usize,
    pub within_minimum_running_time: usize,
    pub booting: usize,
    pub busy_skipped: usize,
    pub deregistration_refused: usize,
    pub failures: usize,
}

/// Decision taken for one machine in phase 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MachineAction {
    Booting,
    OrphanTagged,
    WithinMinimumRunningTime,
    KeptIdle,
    BusySkipped,
    DeregistrationRefused,
    Terminated,
}

impl PassStats {
    fn record(&mut self, action: MachineAction) {
        match action {
            MachineAction::Booting => self.booting += 1,
            MachineAction::OrphanTagged => self.orphans_tagged += 1,
            MachineAction::WithinMinimumRunningTime => self.within_minimum_running_time += 1,
            MachineAction::KeptIdle => self.kept_idle += 1,
            MachineAction::BusySkipped => self.busy_skipped += 1,
            MachineAction::DeregistrationRefused => self.deregistration_refused += 1,
            MachineAction::Terminated => self.terminated += 1,
        }
    }
}

/// Reconciles the fleet against the coordinator's registrations.
pub struct FleetReconciler {
    config: ScaleDownConfig,
    policy: EvictionPolicy,
    fleet: Arc<dyn FleetProvider>,
    coordinator: Arc<dyn Coordinator>,
}

impl FleetReconciler {
    /// Compiles the idle-capacity policy; an invalid policy is fatal.
    pub fn new(
        config: ScaleDownConfig,
        fleet: Arc<dyn FleetProvider>,
        coordinator: Arc<dyn Coordinator>,
    ) -> ScalerResult<Self> {
        let policy = EvictionPolicy::compile(&config.windows)?;
        Ok(Self {
            config,
            policy,
            fleet,
            coordinator,
        })
    }

    pub async fn reconcile(&self) -> ScalerResult<PassStats> {
        self.reconcile_at(Utc::now()).await
    }

    /// Runs one pass as of `now`.
    #[instrument(skip(self), fields(environment = %self.config.environment))]
    pub async fn reconcile_at(&self, now: DateTime<Utc>) -> ScalerResult<PassStats> {
        let mut stats = PassStats::default();
        let mut cache = PassCache::new();

        self.terminate_orphans(&mut stats).await?;

        let machines: Vec<MachineRecord> = self
            .fleet
            .list_machines(&MachineFilter::environment(&self.config.environment))
            .await?
            .into_iter()
            .filter(|m| !m.orphan)
            .collect();

        let window = self.policy.active_window(now);
        debug!(
            machines = machines.len(),
            idle_count = window.idle_count,
            strategy = %window.strategy,
            expression = ?self.policy.active_expression(now),
            "Evaluating machines"
        );

        for (scope, group) in group_by_owner(machines) {
            let mut idle_budget = window.idle_count;
            let ordered = order_for_eviction(group, window.strategy, |m| m.launch_time);

            for machine in ordered {
                match self
                    .evaluate(&mut cache, &scope, &machine, &mut idle_budget, now)
                    .await
                {
                    Ok(action) => stats.record(action),
                    Err(e) => {
                        warn!(
                            instance_id = %machine.instance_id,
                            owner = %scope.owner,
                            error = %e,
                            "Failed to reconcile machine"
                        );
                        stats.failures += 1;
                    }
                }
            }
        }

        info!(
            orphans_terminated = stats.orphans_terminated,
            orphans_tagged = stats.orphans_tagged,
            terminated = stats.terminated,
            kept_idle = stats.kept_idle,
            busy_skipped = stats.busy_skipped,
            failures = stats.failures,
            owners_listed = cache.scopes_listed(),
            "Scale-down pass complete"
        );

        Ok(stats)
    }

    async fn terminate_orphans(&self, stats: &mut PassStats) -> ScalerResult<()> {
        let orphans = self
            .fleet
            .list_machines(&MachineFilter::environment(&self.config.environment).orphans())
            .await?;

        for orphan in orphans {
            match self
                .fleet
                .terminate_machines(std::slice::from_ref(&orphan.instance_id))
                .await
            {
                Ok(()) => {
                    info!(instance_id = %orphan.instance_id, "Orphan machine terminated");
                    stats.orphans_terminated += 1;
                }
                Err(e) => {
                    warn!(
                        instance_id = %orphan.instance_id,
                        error = %e,
                        "Failed to terminate orphan machine"
                    );
                    stats.failures += 1;
                }
            }
        }
        Ok(())
    }

    async fn evaluate(
        &self,
        cache: &mut PassCache,
        scope: &RunnerScope,
        machine: &MachineRecord,
        idle_budget: &mut u32,
        now: DateTime<Utc>,
    ) -> ScalerResult<MachineAction> {
        let runners = cache.runners(self.coordinator.as_ref(), scope).await?;
        let class = classify_machine(
            machine,
            &runners,
            &self.config.name_prefix,
            self.config.boot_time,
            now,
        );

        match class {
            MachineClass::Booting => {
                debug!(instance_id = %machine.instance_id, "Machine booting, not registered yet");
                Ok(MachineAction::Booting)
            }
            MachineClass::Orphan => self.handle_unregistered(cache, scope, machine).await,
            MachineClass::Registered { runner_ids, .. } => {
                if !machine.running_longer_than(self.config.minimum_running_time, now) {
                    return Ok(MachineAction::WithinMinimumRunningTime);
                }
                if *idle_budget > 0 {
                    *idle_budget -= 1;
                    debug!(
                        instance_id = %machine.instance_id,
                        remaining = *idle_budget,
                        "Machine kept idle"
                    );
                    return Ok(MachineAction::KeptIdle);
                }
                self.remove(cache, scope, machine, &runner_ids).await
            }
        }
    }

    /// Tags an unregistered machine past its boot allowance as orphan.
    ///
    /// Machines carrying a runner id from a JIT config get one direct lookup
    /// first: a runner that is busy under that id is still working even if
    /// the name listing missed it.
    async fn handle_unregistered(
        &self,
        cache: &mut PassCache,
        scope: &RunnerScope,
        machine: &MachineRecord,
    ) -> ScalerResult<MachineAction> {
        if let Some(runner_id) = machine.runner_id {
            let auth = cache.auth(self.coordinator.as_ref(), scope).await?;
            match self.coordinator.runner_busy(&auth, scope, runner_id).await {
                Ok(true) => {
                    info!(
                        instance_id = %machine.instance_id,
                        runner_id,
                        "Runner busy, not an orphan"
                    );
                    return Ok(MachineAction::BusySkipped);
                }
                Ok(false) | Err(CoordinatorError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.fleet
            .tag_machine(
                &machine.instance_id,
                &[(tags::ORPHAN.to_string(), "true".to_string())],
            )
            .await?;
        info!(
            instance_id = %machine.instance_id,
            "Machine has no runner registration, tagged as orphan"
        );
        Ok(MachineAction::OrphanTagged)
    }

    async fn remove(
        &self,
        cache: &mut PassCache,
        scope: &RunnerScope,
        machine: &MachineRecord,
        runner_ids: &[u64],
    ) -> ScalerResult<MachineAction> {
        let auth = cache.auth(self.coordinator.as_ref(), scope).await?;

        let busy = try_join_all(
            runner_ids
                .iter()
                .map(|id| self.coordinator.runner_busy(&auth, scope, *id)),
        )
        .await?;
        if busy.iter().any(|b| *b) {
            info!(instance_id = %machine.instance_id, "Runner is busy, not removed");
            return Ok(MachineAction::BusySkipped);
        }

        let deleted = try_join_all(
            runner_ids
                .iter()
                .map(|id| self.coordinator.delete_runner(&auth, scope, *id)),
        )
        .await?;
        if !deleted.iter().all(|ok| *ok) {
            warn!(
                instance_id = %machine.instance_id,
                runner_ids = ?runner_ids,
                "Coordinator refused to deregister runner, machine kept"
            );
            return Ok(MachineAction::DeregistrationRefused);
        }

        self.fleet
            .terminate_machines(std::slice::from_ref(&machine.instance_id))
            .await?;
        info!(
            instance_id = %machine.instance_id,
            owner = %scope.owner,
            "Runner deregistered and machine terminated"
        );
        Ok(MachineAction::Terminated)
    }
}

/// Groups machines by owner tag, in order of first appearance.
fn group_by_owner(machines: Vec<MachineRecord>) -> Vec<(RunnerScope, Vec<MachineRecord>)> {
    let mut groups: Vec<(RunnerScope, Vec<MachineRecord>)> = Vec::new();
    for machine in machines {
        let scope = RunnerScope::of_machine(&machine);
        match groups.iter_mut().find(|(s, _)| *s == scope) {
            Some((_, group)) => group.push(machine),
            None => groups.push((scope, vec![machine])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::memory::{MemoryCoordinator, MemoryFleet};
    use chrono::{Duration, TimeZone};
    use fleet_events::{EvictionStrategy, RunnerType, ScaleDownWindow};
    use fleet_reconcile::{RegisteredRunner, RunnerStatus};

    fn now() -> DateTime<Utc> {
        // Monday
        Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
    }

    fn machine(id: &str, owner: &str, age_minutes: i64) -> MachineRecord {
        MachineRecord {
            instance_id: id.to_string(),
            launch_time: Some(now() - Duration::minutes(age_minutes)),
            owner: owner.to_string(),
            runner_type: RunnerType::Org,
            orphan: false,
            environment: "ci".to_string(),
            runner_id: None,
        }
    }

    fn runner(id: u64, name: &str, busy: bool) -> RegisteredRunner {
        RegisteredRunner {
            id,
            name: name.to_string(),
            busy,
            status: RunnerStatus::Online,
        }
    }

    fn config(windows: Vec<ScaleDownWindow>) -> ScaleDownConfig {
        ScaleDownConfig {
            environment: "ci".into(),
            name_prefix: String::new(),
            minimum_running_time: Duration::minutes(5),
            boot_time: Duration::minutes(5),
            windows,
            interval: std::time::Duration::from_secs(300),
        }
    }

    fn reconciler(
        windows: Vec<ScaleDownWindow>,
    ) -> (FleetReconciler, Arc<MemoryFleet>, Arc<MemoryCoordinator>) {
        let fleet = Arc::new(MemoryFleet::new());
        let coordinator = Arc::new(MemoryCoordinator::new());
        let reconciler =
            FleetReconciler::new(config(windows), fleet.clone(), coordinator.clone()).unwrap();
        (reconciler, fleet, coordinator)
    }

    fn always(idle_count: u32, strategy: EvictionStrategy) -> ScaleDownWindow {
        ScaleDownWindow {
            cron: "* * * * * *".into(),
            idle_count,
            time_zone: "UTC".into(),
            eviction_strategy: Some(strategy),
        }
    }

    #[test]
    fn test_group_by_owner_keeps_first_appearance_order() {
        let groups = group_by_owner(vec![
            machine("i-1", "b", 10),
            machine("i-2", "a", 10),
            machine("i-3", "b", 10),
        ]);
        let owners: Vec<_> = groups.iter().map(|(s, g)| (s.owner.as_str(), g.len())).collect();
        assert_eq!(owners, vec![("b", 2), ("a", 1)]);
    }

    #[tokio::test]
    async fn test_idle_budget_keeps_newest_with_oldest_first() {
        let (reconciler, fleet, coordinator) =
            reconciler(vec![always(1, EvictionStrategy::OldestFirst)]);
        fleet.insert(machine("i-old", "acme", 60)).await;
        fleet.insert(machine("i-new", "acme", 10)).await;
        coordinator.register("acme", runner(1, "i-old", false)).await;
        coordinator.register("acme", runner(2, "i-new", false)).await;

        let stats = reconciler.reconcile_at(now()).await.unwrap();
        assert_eq!(stats.kept_idle, 1);
        assert_eq!(stats.terminated, 1);
        assert_eq!(fleet.terminated().await, vec!["i-old".to_string()]);
    }

    #[tokio::test]
    async fn test_newest_first_evicts_newest() {
        let (reconciler, fleet, coordinator) =
            reconciler(vec![always(1, EvictionStrategy::NewestFirst)]);
        fleet.insert(machine("i-old", "acme", 60)).await;
        fleet.insert(machine("i-new", "acme", 10)).await;
        coordinator.register("acme", runner(1, "i-old", false)).await;
        coordinator.register("acme", runner(2, "i-new", false)).await;

        reconciler.reconcile_at(now()).await.unwrap();
        assert_eq!(fleet.terminated().await, vec!["i-new".to_string()]);
    }

    #[tokio::test]
    async fn test_idle_budget_is_per_owner() {
        let (reconciler, fleet, coordinator) =
            reconciler(vec![always(1, EvictionStrategy::OldestFirst)]);
        for (id, owner, runner_id) in [("i-a", "a", 1), ("i-b", "b", 2)] {
            fleet.insert(machine(id, owner, 30)).await;
            coordinator.register(owner, runner(runner_id, id, false)).await;
        }

        let stats = reconciler.reconcile_at(now()).await.unwrap();
        assert_eq!(stats.kept_idle, 2);
        assert!(fleet.terminated().await.is_empty());
    }

    #[tokio::test]
    async fn test_minimum_running_time_grace() {
        let (reconciler, fleet, coordinator) = reconciler(vec![]);
        fleet.insert(machine("i-young", "acme", 2)).await;
        coordinator.register("acme", runner(1, "i-young", false)).await;

        let stats = reconciler.reconcile_at(now()).await.unwrap();
        assert_eq!(stats.within_minimum_running_time, 1);
        assert!(fleet.terminated().await.is_empty());
    }

    #[tokio::test]
    async fn test_refused_deregistration_keeps_machine() {
        let (reconciler, fleet, coordinator) = reconciler(vec![]);
        fleet.insert(machine("i-1", "acme", 30)).await;
        coordinator.register("acme", runner(1, "i-1", false)).await;
        coordinator.register("acme", runner(2, "i-1", false)).await;
        coordinator.refuse_delete(2).await;

        let stats = reconciler.reconcile_at(now()).await.unwrap();
        assert_eq!(stats.deregistration_refused, 1);
        assert!(fleet.terminated().await.is_empty());
        assert_eq!(coordinator.deleted().await, vec![1]);
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_pass() {
        let (reconciler, fleet, coordinator) = reconciler(vec![]);
        fleet.insert(machine("i-1", "acme", 30)).await;
        fleet.insert(machine("i-2", "acme", 40)).await;
        coordinator.register("acme", runner(1, "i-1", false)).await;
        coordinator.register("acme", runner(2, "i-2", false)).await;
        fleet.fail_termination("i-2").await;

        let stats = reconciler.reconcile_at(now()).await.unwrap();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.terminated, 1);
        assert_eq!(fleet.terminated().await, vec!["i-1".to_string()]);
    }

    #[tokio::test]
    async fn test_busy_jit_runner_is_not_orphaned() {
        let (reconciler, fleet, coordinator) = reconciler(vec![]);
        let mut m = machine("i-jit", "acme", 30);
        m.runner_id = Some(77);
        fleet.insert(m).await;
        coordinator.set_live_busy(77, true).await;

        let stats = reconciler.reconcile_at(now()).await.unwrap();
        assert_eq!(stats.busy_skipped, 1);
        assert!(!fleet.machine("i-jit").await.unwrap().orphan);
    }

    #[tokio::test]
    async fn test_runner_listing_is_fetched_once_per_owner() {
        let (reconciler, fleet, coordinator) =
            reconciler(vec![always(5, EvictionStrategy::OldestFirst)]);
        for i in 0..3 {
            let id = format!("i-{}", i);
            fleet.insert(machine(&id, "acme", 30)).await;
            coordinator.register("acme", runner(i, &id, false)).await;
        }

        reconciler.reconcile_at(now()).await.unwrap();
        assert_eq!(coordinator.list_calls().await, 1);

        reconciler.reconcile_at(now()).await.unwrap();
        assert_eq!(coordinator.list_calls().await, 2);
    }
}
