//! Shared enums used across messages and configuration.

use serde::{Deserialize, Serialize};

// =============================================================================
// Event Type Constants
// =============================================================================

/// Coordinator event type names.
pub mod event_types {
    /// A job changed state (queued, in progress, completed).
    pub const WORKFLOW_JOB: &str = "workflow_job";
}

// =============================================================================
// Ownership
// =============================================================================

/// The kind of account owning the repository that emitted a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OwnerType {
    #[default]
    Organization,
    User,
}

/// The registration scope of a runner.
///
/// Org runners are shared by every repository of the owner; repo runners
/// are registered against a single repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunnerType {
    Org,
    Repo,
}

impl RunnerType {
    /// Returns the scope for the organization-runners setting.
    pub fn from_org_level(enabled: bool) -> Self {
        if enabled {
            RunnerType::Org
        } else {
            RunnerType::Repo
        }
    }

    /// Computes the owner tag used to group machines and registrations.
    ///
    /// `Org` scopes to the owner login, `Repo` to `owner/repo`.
    pub fn owner_tag(&self, repository_owner: &str, repository_name: &str) -> String {
        match self {
            RunnerType::Org => repository_owner.to_string(),
            RunnerType::Repo => format!("{}/{}", repository_owner, repository_name),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerType::Org => "Org",
            RunnerType::Repo => "Repo",
        }
    }
}

impl std::fmt::Display for RunnerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunnerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Org" => Ok(RunnerType::Org),
            "Repo" => Ok(RunnerType::Repo),
            other => Err(format!("unknown runner type '{}'", other)),
        }
    }
}

// =============================================================================
// Job and Eviction Enums
// =============================================================================

/// Action carried by a job notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    Queued,
    Waiting,
    InProgress,
    Completed,
    #[serde(other)]
    Other,
}

/// Order in which surplus idle machines are evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvictionStrategy {
    /// Evict the oldest machines first, keep the newest.
    #[default]
    OldestFirst,
    /// Evict the newest machines first, keep the oldest.
    NewestFirst,
}

impl std::fmt::Display for EvictionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionStrategy::OldestFirst => write!(f, "oldest_first"),
            EvictionStrategy::NewestFirst => write!(f, "newest_first"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_tag() {
        assert_eq!(RunnerType::Org.owner_tag("acme", "api"), "acme");
        assert_eq!(RunnerType::Repo.owner_tag("acme", "api"), "acme/api");
    }

    #[test]
    fn test_runner_type_parse() {
        assert_eq!("Org".parse::<RunnerType>().unwrap(), RunnerType::Org);
        assert_eq!("Repo".parse::<RunnerType>().unwrap(), RunnerType::Repo);
        assert!("org".parse::<RunnerType>().is_err());
    }

    #[test]
    fn test_eviction_strategy_serialization() {
        assert_eq!(
            serde_json::to_string(&EvictionStrategy::OldestFirst).unwrap(),
            "\"oldest_first\""
        );
        let parsed: EvictionStrategy = serde_json::from_str("\"newest_first\"").unwrap();
        assert_eq!(parsed, EvictionStrategy::NewestFirst);
    }

    #[test]
    fn test_unknown_job_action() {
        let parsed: JobAction = serde_json::from_str("\"requested\"").unwrap();
        assert_eq!(parsed, JobAction::Other);
    }
}
