//! CI coordinator interface.

use async_trait::async_trait;
use fleet_events::RunnerType;
use fleet_reconcile::{MachineRecord, RegisteredRunner};
use thiserror::Error;

/// Coordinator errors. All of them are fatal to the component that hit them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("authentication failed for '{owner}': {reason}")]
    Auth { owner: String, reason: String },

    #[error("no installation found for '{0}'")]
    InstallationNotFound(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("coordinator request failed: {0}")]
    Request(String),
}

/// Registration scope: who runners are registered against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunnerScope {
    /// Owner tag: organization, or `owner/repo`.
    pub owner: String,
    pub runner_type: RunnerType,
}

impl RunnerScope {
    pub fn new(owner: impl Into<String>, runner_type: RunnerType) -> Self {
        Self {
            owner: owner.into(),
            runner_type,
        }
    }

    pub fn org(owner: impl Into<String>) -> Self {
        Self::new(owner, RunnerType::Org)
    }

    pub fn of_machine(machine: &MachineRecord) -> Self {
        Self::new(machine.owner.clone(), machine.runner_type)
    }
}

impl std::fmt::Display for RunnerScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.runner_type, self.owner)
    }
}

/// An installation token for one owner.
#[derive(Clone, PartialEq, Eq)]
pub struct InstallationAuth {
    pub installation_id: u64,
    pub token: String,
}

impl std::fmt::Debug for InstallationAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallationAuth")
            .field("installation_id", &self.installation_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Live job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    InProgress,
    Completed,
    Waiting,
}

/// Request for a single-use runner configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitConfigRequest {
    pub name: String,
    pub runner_group_id: u64,
    pub labels: Vec<String>,
}

/// A single-use runner configuration bound to one runner registration.
#[derive(Clone, PartialEq, Eq)]
pub struct JitConfig {
    pub runner_id: u64,
    pub encoded_config: String,
}

impl std::fmt::Debug for JitConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitConfig")
            .field("runner_id", &self.runner_id)
            .field("encoded_config", &"<redacted>")
            .finish()
    }
}

/// CI coordinator API.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Resolves an installation token. A known `installation_id` skips the
    /// owner lookup.
    async fn installation_auth(
        &self,
        scope: &RunnerScope,
        installation_id: Option<u64>,
    ) -> Result<InstallationAuth, CoordinatorError>;

    /// Lists every runner registered in the scope.
    async fn list_runners(
        &self,
        auth: &InstallationAuth,
        scope: &RunnerScope,
    ) -> Result<Vec<RegisteredRunner>, CoordinatorError>;

    /// Fetches the live busy flag of one runner.
    async fn runner_busy(
        &self,
        auth: &InstallationAuth,
        scope: &RunnerScope,
        runner_id: u64,
    ) -> Result<bool, CoordinatorError>;

    /// Deregisters a runner. `Ok(false)` means the coordinator refused.
    async fn delete_runner(
        &self,
        auth: &InstallationAuth,
        scope: &RunnerScope,
        runner_id: u64,
    ) -> Result<bool, CoordinatorError>;

    /// Fetches the live status of a job.
    async fn job_status(
        &self,
        auth: &InstallationAuth,
        repository_owner: &str,
        repository_name: &str,
        job_id: u64,
    ) -> Result<JobStatus, CoordinatorError>;

    /// Creates a reusable registration token for the scope.
    async fn registration_token(
        &self,
        auth: &InstallationAuth,
        scope: &RunnerScope,
    ) -> Result<String, CoordinatorError>;

    /// Resolves a runner group name to its id.
    async fn runner_group_id(
        &self,
        auth: &InstallationAuth,
        scope: &RunnerScope,
        group_name: &str,
    ) -> Result<u64, CoordinatorError>;

    /// Creates a single-use runner configuration.
    async fn jit_config(
        &self,
        auth: &InstallationAuth,
        scope: &RunnerScope,
        request: &JitConfigRequest,
    ) -> Result<JitConfig, CoordinatorError>;
}
