//! In-memory collaborators for development and testing.
//!
//! Each implementation keeps its state behind a `tokio::sync::RwLock`, records
//! the calls made against it, and can be scripted to fail or answer in a
//! particular way.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_events::RunnerType;
use fleet_reconcile::{MachineRecord, RegisteredRunner, RunnerStatus};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use super::{
    tags, Coordinator, CoordinatorError, FleetProvider, FleetRequest, FleetResult,
    InstallationAuth, JitConfig, JitConfigRequest, JobStatus, MachineFilter, MessageQueue,
    Parameter, ParameterPage, ParameterStore, ProviderError, QueueError, RunnerScope, StoreError,
};

// =============================================================================
// Fleet
// =============================================================================

#[derive(Default)]
struct FleetState {
    machines: Vec<MachineRecord>,
    tags: HashMap<String, Vec<(String, String)>>,
    scripted: VecDeque<FleetResult>,
    requests: Vec<FleetRequest>,
    terminated: Vec<String>,
    failing_terminations: HashSet<String>,
    fail_requests: bool,
}

/// In-memory fleet provider.
pub struct MemoryFleet {
    state: RwLock<FleetState>,
    counter: AtomicU64,
}

impl MemoryFleet {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(FleetState::default()),
            counter: AtomicU64::new(0),
        }
    }

    fn next_instance_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("i-{:04x}{}", n, &suffix[..13])
    }

    /// Adds an existing machine.
    pub async fn insert(&self, machine: MachineRecord) {
        self.state.write().await.machines.push(machine);
    }

    /// Queues the result of the next create request instead of fulfilling it.
    pub async fn script_create(&self, result: FleetResult) {
        self.state.write().await.scripted.push_back(result);
    }

    /// Makes every subsequent call fail at the transport level.
    pub async fn fail_requests(&self) {
        self.state.write().await.fail_requests = true;
    }

    /// Makes terminating `instance_id` fail.
    pub async fn fail_termination(&self, instance_id: &str) {
        self.state
            .write()
            .await
            .failing_terminations
            .insert(instance_id.to_string());
    }

    pub async fn create_requests(&self) -> Vec<FleetRequest> {
        self.state.read().await.requests.clone()
    }

    /// Ids passed to `terminate_machines`, in call order.
    pub async fn terminated(&self) -> Vec<String> {
        self.state.read().await.terminated.clone()
    }

    pub async fn machine(&self, instance_id: &str) -> Option<MachineRecord> {
        self.state
            .read()
            .await
            .machines
            .iter()
            .find(|m| m.instance_id == instance_id)
            .cloned()
    }

    pub async fn machines(&self) -> Vec<MachineRecord> {
        self.state.read().await.machines.clone()
    }

    pub async fn tags_of(&self, instance_id: &str) -> Vec<(String, String)> {
        self.state
            .read()
            .await
            .tags
            .get(instance_id)
            .cloned()
            .unwrap_or_default()
    }

    fn record_from_request(request: &FleetRequest, instance_id: String) -> MachineRecord {
        MachineRecord {
            instance_id,
            launch_time: Some(Utc::now()),
            owner: request.tag(tags::OWNER).unwrap_or_default().to_string(),
            runner_type: request
                .tag(tags::TYPE)
                .and_then(|t| t.parse().ok())
                .unwrap_or(RunnerType::Repo),
            orphan: false,
            environment: request.tag(tags::ENVIRONMENT).unwrap_or_default().to_string(),
            runner_id: None,
        }
    }
}

impl Default for MemoryFleet {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FleetProvider for MemoryFleet {
    async fn create_machines(&self, request: &FleetRequest) -> Result<FleetResult, ProviderError> {
        let mut state = self.state.write().await;
        if state.fail_requests {
            return Err(ProviderError::Request("[MEMORY] create failed".to_string()));
        }
        state.requests.push(request.clone());

        let result = match state.scripted.pop_front() {
            Some(result) => result,
            None => FleetResult {
                instance_ids: (0..request.target_capacity)
                    .map(|_| self.next_instance_id())
                    .collect(),
                error_codes: Vec::new(),
            },
        };

        for id in &result.instance_ids {
            state
                .machines
                .push(Self::record_from_request(request, id.clone()));
            state.tags.insert(id.clone(), request.tags.clone());
        }

        info!(
            requested = request.target_capacity,
            created = result.instance_ids.len(),
            capacity_type = %request.capacity_type,
            "[MEMORY] Fleet request processed"
        );

        Ok(result)
    }

    async fn terminate_machines(&self, instance_ids: &[String]) -> Result<(), ProviderError> {
        let mut state = self.state.write().await;
        if state.fail_requests {
            return Err(ProviderError::Request("[MEMORY] terminate failed".to_string()));
        }
        if let Some(id) = instance_ids
            .iter()
            .find(|id| state.failing_terminations.contains(*id))
        {
            return Err(ProviderError::Request(format!(
                "[MEMORY] terminate {} failed",
                id
            )));
        }

        for id in instance_ids {
            state.machines.retain(|m| &m.instance_id != id);
            state.terminated.push(id.clone());
            debug!(instance_id = %id, "[MEMORY] Machine terminated");
        }
        Ok(())
    }

    async fn list_machines(
        &self,
        filter: &MachineFilter,
    ) -> Result<Vec<MachineRecord>, ProviderError> {
        let state = self.state.read().await;
        if state.fail_requests {
            return Err(ProviderError::Request("[MEMORY] list failed".to_string()));
        }
        Ok(state
            .machines
            .iter()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect())
    }

    async fn tag_machine(
        &self,
        instance_id: &str,
        new_tags: &[(String, String)],
    ) -> Result<(), ProviderError> {
        let mut state = self.state.write().await;
        if state.fail_requests {
            return Err(ProviderError::Request("[MEMORY] tag failed".to_string()));
        }

        let machine = state
            .machines
            .iter_mut()
            .find(|m| m.instance_id == instance_id)
            .ok_or_else(|| ProviderError::NotFound(instance_id.to_string()))?;

        for (key, value) in new_tags {
            match key.as_str() {
                tags::ORPHAN => machine.orphan = value == "true",
                tags::RUNNER_ID => machine.runner_id = value.parse().ok(),
                _ => {}
            }
        }

        let entry = state.tags.entry(instance_id.to_string()).or_default();
        for (key, value) in new_tags {
            entry.retain(|(k, _)| k != key);
            entry.push((key.clone(), value.clone()));
        }
        Ok(())
    }
}

// =============================================================================
// Coordinator
// =============================================================================

#[derive(Default)]
struct CoordinatorState {
    runners: HashMap<String, Vec<RegisteredRunner>>,
    live_busy: HashMap<u64, bool>,
    refused_deletes: HashSet<u64>,
    deleted: Vec<u64>,
    jobs: HashMap<u64, JobStatus>,
    groups: HashMap<String, u64>,
    unauthorized: HashSet<String>,
    auth_calls: usize,
    list_calls: usize,
    busy_checks: Vec<u64>,
    jit_requests: Vec<JitConfigRequest>,
}

/// In-memory CI coordinator.
pub struct MemoryCoordinator {
    state: RwLock<CoordinatorState>,
    next_runner_id: AtomicU64,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        let mut state = CoordinatorState::default();
        state.groups.insert("Default".to_string(), 1);
        Self {
            state: RwLock::new(state),
            next_runner_id: AtomicU64::new(1000),
        }
    }

    /// Registers a runner under `owner`.
    pub async fn register(&self, owner: &str, runner: RegisteredRunner) {
        self.state
            .write()
            .await
            .runners
            .entry(owner.to_string())
            .or_default()
            .push(runner);
    }

    /// Overrides what the live busy check reports, independent of listings.
    pub async fn set_live_busy(&self, runner_id: u64, busy: bool) {
        self.state.write().await.live_busy.insert(runner_id, busy);
    }

    /// Makes deregistration of `runner_id` return a refusal.
    pub async fn refuse_delete(&self, runner_id: u64) {
        self.state.write().await.refused_deletes.insert(runner_id);
    }

    pub async fn set_job_status(&self, job_id: u64, status: JobStatus) {
        self.state.write().await.jobs.insert(job_id, status);
    }

    pub async fn add_runner_group(&self, name: &str, id: u64) {
        self.state.write().await.groups.insert(name.to_string(), id);
    }

    /// Makes authentication for `owner` fail.
    pub async fn deny(&self, owner: &str) {
        self.state.write().await.unauthorized.insert(owner.to_string());
    }

    pub async fn deleted(&self) -> Vec<u64> {
        self.state.read().await.deleted.clone()
    }

    pub async fn auth_calls(&self) -> usize {
        self.state.read().await.auth_calls
    }

    pub async fn list_calls(&self) -> usize {
        self.state.read().await.list_calls
    }

    pub async fn busy_checks(&self) -> Vec<u64> {
        self.state.read().await.busy_checks.clone()
    }

    pub async fn jit_requests(&self) -> Vec<JitConfigRequest> {
        self.state.read().await.jit_requests.clone()
    }
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn installation_auth(
        &self,
        scope: &RunnerScope,
        installation_id: Option<u64>,
    ) -> Result<InstallationAuth, CoordinatorError> {
        let mut state = self.state.write().await;
        state.auth_calls += 1;

        if state.unauthorized.contains(&scope.owner) {
            return Err(CoordinatorError::Auth {
                owner: scope.owner.clone(),
                reason: "[MEMORY] denied".to_string(),
            });
        }

        let installation_id = installation_id.unwrap_or(1);
        Ok(InstallationAuth {
            installation_id,
            token: format!("ghs_memory_{}", installation_id),
        })
    }

    async fn list_runners(
        &self,
        _auth: &InstallationAuth,
        scope: &RunnerScope,
    ) -> Result<Vec<RegisteredRunner>, CoordinatorError> {
        let mut state = self.state.write().await;
        state.list_calls += 1;
        Ok(state.runners.get(&scope.owner).cloned().unwrap_or_default())
    }

    async fn runner_busy(
        &self,
        _auth: &InstallationAuth,
        scope: &RunnerScope,
        runner_id: u64,
    ) -> Result<bool, CoordinatorError> {
        let mut state = self.state.write().await;
        state.busy_checks.push(runner_id);

        if let Some(busy) = state.live_busy.get(&runner_id) {
            return Ok(*busy);
        }
        state
            .runners
            .get(&scope.owner)
            .and_then(|runners| runners.iter().find(|r| r.id == runner_id))
            .map(|r| r.busy)
            .ok_or_else(|| CoordinatorError::NotFound(format!("runner {}", runner_id)))
    }

    async fn delete_runner(
        &self,
        _auth: &InstallationAuth,
        scope: &RunnerScope,
        runner_id: u64,
    ) -> Result<bool, CoordinatorError> {
        let mut state = self.state.write().await;
        if state.refused_deletes.contains(&runner_id) {
            return Ok(false);
        }
        if let Some(runners) = state.runners.get_mut(&scope.owner) {
            runners.retain(|r| r.id != runner_id);
        }
        state.deleted.push(runner_id);
        Ok(true)
    }

    async fn job_status(
        &self,
        _auth: &InstallationAuth,
        repository_owner: &str,
        repository_name: &str,
        job_id: u64,
    ) -> Result<JobStatus, CoordinatorError> {
        self.state
            .read()
            .await
            .jobs
            .get(&job_id)
            .copied()
            .ok_or_else(|| {
                CoordinatorError::NotFound(format!(
                    "job {} in {}/{}",
                    job_id, repository_owner, repository_name
                ))
            })
    }

    async fn registration_token(
        &self,
        _auth: &InstallationAuth,
        scope: &RunnerScope,
    ) -> Result<String, CoordinatorError> {
        Ok(format!("reg-token-{}", scope.owner.replace('/', "-")))
    }

    async fn runner_group_id(
        &self,
        _auth: &InstallationAuth,
        _scope: &RunnerScope,
        group_name: &str,
    ) -> Result<u64, CoordinatorError> {
        self.state
            .read()
            .await
            .groups
            .get(group_name)
            .copied()
            .ok_or_else(|| CoordinatorError::NotFound(format!("runner group {}", group_name)))
    }

    async fn jit_config(
        &self,
        _auth: &InstallationAuth,
        scope: &RunnerScope,
        request: &JitConfigRequest,
    ) -> Result<JitConfig, CoordinatorError> {
        let runner_id = self.next_runner_id.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.write().await;
        state.jit_requests.push(request.clone());
        state
            .runners
            .entry(scope.owner.clone())
            .or_default()
            .push(RegisteredRunner {
                id: runner_id,
                name: request.name.clone(),
                busy: false,
                status: RunnerStatus::Offline,
            });

        Ok(JitConfig {
            runner_id,
            encoded_config: format!("jit-{}-{}", request.name, runner_id),
        })
    }
}

// =============================================================================
// Parameter store
// =============================================================================

#[derive(Debug, Clone)]
struct StoredParameter {
    value: String,
    secure: bool,
    last_modified: DateTime<Utc>,
}

/// A write recorded by [`MemoryParameterStore`].
#[derive(Debug, Clone)]
pub struct RecordedWrite {
    pub path: String,
    pub secure: bool,
    pub at: Instant,
}

/// In-memory parameter store with prefix pagination.
pub struct MemoryParameterStore {
    parameters: RwLock<BTreeMap<String, StoredParameter>>,
    writes: RwLock<Vec<RecordedWrite>>,
    failing_deletes: RwLock<HashSet<String>>,
    page_size: usize,
}

impl MemoryParameterStore {
    pub fn new() -> Self {
        Self::with_page_size(10)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            parameters: RwLock::new(BTreeMap::new()),
            writes: RwLock::new(Vec::new()),
            failing_deletes: RwLock::new(HashSet::new()),
            page_size: page_size.max(1),
        }
    }

    /// Stores a parameter with an explicit modification time.
    pub async fn insert_at(&self, path: &str, value: &str, last_modified: DateTime<Utc>) {
        self.parameters.write().await.insert(
            path.to_string(),
            StoredParameter {
                value: value.to_string(),
                secure: false,
                last_modified,
            },
        );
    }

    pub async fn fail_delete(&self, path: &str) {
        self.failing_deletes.write().await.insert(path.to_string());
    }

    pub async fn value(&self, path: &str) -> Option<String> {
        self.parameters
            .read()
            .await
            .get(path)
            .map(|p| p.value.clone())
    }

    pub async fn is_secure(&self, path: &str) -> bool {
        self.parameters
            .read()
            .await
            .get(path)
            .is_some_and(|p| p.secure)
    }

    pub async fn paths(&self) -> Vec<String> {
        self.parameters.read().await.keys().cloned().collect()
    }

    /// Writes made through `put`, in order.
    pub async fn writes(&self) -> Vec<RecordedWrite> {
        self.writes.read().await.clone()
    }
}

impl Default for MemoryParameterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ParameterStore for MemoryParameterStore {
    async fn put(&self, path: &str, value: &str, secure: bool) -> Result<(), StoreError> {
        self.parameters.write().await.insert(
            path.to_string(),
            StoredParameter {
                value: value.to_string(),
                secure,
                last_modified: Utc::now(),
            },
        );
        self.writes.write().await.push(RecordedWrite {
            path: path.to_string(),
            secure,
            at: Instant::now(),
        });
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<String, StoreError> {
        self.value(path)
            .await
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    async fn list_by_prefix(
        &self,
        prefix: &str,
        next_token: Option<&str>,
    ) -> Result<ParameterPage, StoreError> {
        let parameters = self.parameters.read().await;
        let page: Vec<Parameter> = parameters
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .filter(|(path, _)| next_token.is_none_or(|token| path.as_str() > token))
            .take(self.page_size)
            .map(|(path, p)| Parameter {
                path: path.clone(),
                last_modified: p.last_modified,
            })
            .collect();

        let next_token = if page.len() == self.page_size {
            page.last().map(|p| p.path.clone())
        } else {
            None
        };

        Ok(ParameterPage {
            parameters: page,
            next_token,
        })
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        if self.failing_deletes.read().await.contains(path) {
            return Err(StoreError::Request(format!("[MEMORY] delete {} failed", path)));
        }
        self.parameters
            .write()
            .await
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }
}

// =============================================================================
// Queue
// =============================================================================

/// A message recorded by [`MemoryQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub destination: String,
    pub body: String,
    pub delay: Option<Duration>,
}

/// In-memory queue that records every publish.
pub struct MemoryQueue {
    published: RwLock<Vec<PublishedMessage>>,
    fail: RwLock<bool>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            published: RwLock::new(Vec::new()),
            fail: RwLock::new(false),
        }
    }

    pub async fn fail_publishes(&self) {
        *self.fail.write().await = true;
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.published.read().await.clone()
    }

    pub async fn published_to(&self, destination: &str) -> Vec<PublishedMessage> {
        self.published
            .read()
            .await
            .iter()
            .filter(|m| m.destination == destination)
            .cloned()
            .collect()
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn publish(
        &self,
        destination: &str,
        body: &str,
        delay: Option<Duration>,
    ) -> Result<(), QueueError> {
        if *self.fail.read().await {
            return Err(QueueError::Publish {
                destination: destination.to_string(),
                reason: "[MEMORY] publish failed".to_string(),
            });
        }
        self.published.write().await.push(PublishedMessage {
            destination: destination.to_string(),
            body: body.to_string(),
            delay,
        });
        Ok(())
    }
}

/// Queue that forwards every publish to a channel.
///
/// Delays are carried on the message; the consumer decides how to honor
/// them.
pub struct ChannelQueue {
    sender: mpsc::UnboundedSender<PublishedMessage>,
}

impl ChannelQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PublishedMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl MessageQueue for ChannelQueue {
    async fn publish(
        &self,
        destination: &str,
        body: &str,
        delay: Option<Duration>,
    ) -> Result<(), QueueError> {
        self.sender
            .send(PublishedMessage {
                destination: destination.to_string(),
                body: body.to_string(),
                delay,
            })
            .map_err(|_| QueueError::Publish {
                destination: destination.to_string(),
                reason: "consumer closed".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::CapacityType;

    fn request(count: u32) -> FleetRequest {
        FleetRequest {
            launch_template_name: "runner".to_string(),
            overrides: vec![],
            target_capacity: count,
            capacity_type: CapacityType::Spot,
            allocation_strategy: "lowest-price".to_string(),
            max_spot_price: None,
            tags: vec![
                (tags::ENVIRONMENT.to_string(), "test".to_string()),
                (tags::TYPE.to_string(), "Org".to_string()),
                (tags::OWNER.to_string(), "acme".to_string()),
            ],
        }
    }

    #[tokio::test]
    async fn test_memory_fleet_create_and_list() {
        let fleet = MemoryFleet::new();
        let result = fleet.create_machines(&request(2)).await.unwrap();
        assert_eq!(result.instance_ids.len(), 2);

        let listed = fleet
            .list_machines(&MachineFilter::environment("test").owned_by(RunnerType::Org, "acme"))
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|m| m.instance_id.starts_with("i-")));
        assert_eq!(fleet.machines().await, listed);
    }

    #[tokio::test]
    async fn test_memory_fleet_orphan_tag() {
        let fleet = MemoryFleet::new();
        let result = fleet.create_machines(&request(1)).await.unwrap();
        let id = &result.instance_ids[0];

        fleet
            .tag_machine(id, &[(tags::ORPHAN.to_string(), "true".to_string())])
            .await
            .unwrap();

        let orphans = fleet
            .list_machines(&MachineFilter::environment("test").orphans())
            .await
            .unwrap();
        assert_eq!(orphans.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_pagination() {
        let store = MemoryParameterStore::with_page_size(2);
        for i in 0..5 {
            store.put(&format!("/tokens/i-{}", i), "v", true).await.unwrap();
        }
        store.put("/other/x", "v", false).await.unwrap();

        let mut seen = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = store.list_by_prefix("/tokens", token.as_deref()).await.unwrap();
            seen.extend(page.parameters.into_iter().map(|p| p.path));
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        assert_eq!(seen.len(), 5);
    }
}
