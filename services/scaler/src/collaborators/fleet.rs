//! Fleet provider interface.
//!
//! The provider creates, lists, tags and terminates machines. Machines carry
//! their grouping metadata as tags so that listing alone is enough to
//! rebuild a [`MachineRecord`].

use async_trait::async_trait;
use fleet_events::RunnerType;
use fleet_reconcile::MachineRecord;
use thiserror::Error;

/// Tag keys written on every machine.
pub mod tags {
    pub const APPLICATION: &str = "fleet:Application";
    pub const APPLICATION_VALUE: &str = "ci-runner";
    pub const ENVIRONMENT: &str = "fleet:Environment";
    pub const TYPE: &str = "fleet:Type";
    pub const OWNER: &str = "fleet:Owner";
    pub const CREATED_BY: &str = "fleet:created_by";
    pub const ORPHAN: &str = "fleet:orphan";
    pub const RUNNER_ID: &str = "fleet:runner_id";
}

/// Fleet provider errors. All of them are transport-level and fatal to the
/// caller; capacity problems are reported through [`FleetResult::error_codes`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("fleet provider request failed: {0}")]
    Request(String),

    #[error("machine not found: {0}")]
    NotFound(String),
}

/// Purchase option for new machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityType {
    Spot,
    OnDemand,
}

impl std::fmt::Display for CapacityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapacityType::Spot => write!(f, "spot"),
            CapacityType::OnDemand => write!(f, "on-demand"),
        }
    }
}

impl std::str::FromStr for CapacityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spot" => Ok(CapacityType::Spot),
            "on-demand" => Ok(CapacityType::OnDemand),
            other => Err(format!("unknown capacity type '{}'", other)),
        }
    }
}

/// One placement option of a fleet request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetOverride {
    pub subnet_id: String,
    pub instance_type: String,
    pub image_id: Option<String>,
}

/// A single batched create request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetRequest {
    pub launch_template_name: String,
    pub overrides: Vec<FleetOverride>,
    pub target_capacity: u32,
    pub capacity_type: CapacityType,
    pub allocation_strategy: String,
    pub max_spot_price: Option<String>,
    pub tags: Vec<(String, String)>,
}

impl FleetRequest {
    /// Value of a tag on the request, if present.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Outcome of a create request. Both fields may be non-empty on partial
/// fulfilment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetResult {
    pub instance_ids: Vec<String>,
    pub error_codes: Vec<String>,
}

/// Listing filter. `environment` is always applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineFilter {
    pub environment: String,
    pub runner_type: Option<RunnerType>,
    pub owner: Option<String>,
    pub orphan: Option<bool>,
}

impl MachineFilter {
    pub fn environment(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            ..Default::default()
        }
    }

    pub fn owned_by(mut self, runner_type: RunnerType, owner: impl Into<String>) -> Self {
        self.runner_type = Some(runner_type);
        self.owner = Some(owner.into());
        self
    }

    pub fn orphans(mut self) -> Self {
        self.orphan = Some(true);
        self
    }

    /// True when `machine` passes the filter.
    pub fn matches(&self, machine: &MachineRecord) -> bool {
        machine.environment == self.environment
            && self.runner_type.is_none_or(|t| t == machine.runner_type)
            && self.owner.as_ref().is_none_or(|o| *o == machine.owner)
            && self.orphan.is_none_or(|o| o == machine.orphan)
    }
}

/// Compute fleet provider.
#[async_trait]
pub trait FleetProvider: Send + Sync {
    /// Issues one batched create request.
    async fn create_machines(&self, request: &FleetRequest) -> Result<FleetResult, ProviderError>;

    /// Terminates machines.
    async fn terminate_machines(&self, instance_ids: &[String]) -> Result<(), ProviderError>;

    /// Lists live (pending or running) machines.
    async fn list_machines(
        &self,
        filter: &MachineFilter,
    ) -> Result<Vec<MachineRecord>, ProviderError>;

    /// Adds or overwrites tags on a machine.
    async fn tag_machine(
        &self,
        instance_id: &str,
        tags: &[(String, String)],
    ) -> Result<(), ProviderError>;
}
