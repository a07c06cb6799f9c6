//! Job notifications and the queue message envelope derived from them.

use serde::{Deserialize, Serialize};

use crate::{EventError, JobAction, OwnerType, RunnerType};

/// A job notification as received from the coordinator.
///
/// Immutable once received. The dispatcher only reads it; the retry counter
/// is carried forward on the [`ActionRequest`] envelope instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    /// Coordinator job identifier.
    pub id: u64,

    /// Event type header (e.g. `workflow_job`).
    pub event_type: String,

    /// Job action (queued, in_progress, ...).
    pub action: JobAction,

    /// Login of the repository owner.
    pub repository_owner: String,

    /// Repository name without the owner.
    pub repository_name: String,

    /// Whether the owner is an organization or a user.
    #[serde(default)]
    pub owner_type: OwnerType,

    /// Capability labels requested by the job.
    #[serde(default)]
    pub requested_labels: Vec<String>,

    /// Installation of the coordinator app, `0` when unknown.
    #[serde(default)]
    pub installation_id: u64,

    /// Number of retries already scheduled for this job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_counter: Option<u32>,
}

impl JobEvent {
    /// Returns `owner/name`.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.repository_owner, self.repository_name)
    }
}

/// The message published to a scale-up queue for a routed job.
///
/// This is the envelope that travels through the dispatch queue, the delayed
/// retry queue and back. `retry_counter` is read from the message itself so
/// that replaying the same message is harmless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub id: u64,
    pub event_type: String,
    pub repository_name: String,
    pub repository_owner: String,
    #[serde(default)]
    pub installation_id: u64,
    #[serde(default)]
    pub repo_owner_type: OwnerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_fifo: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_counter: Option<u32>,
}

impl ActionRequest {
    /// Builds the message for a job routed to `queue_id`.
    pub fn for_job(job: &JobEvent, queue_id: impl Into<String>, queue_fifo: bool) -> Self {
        Self {
            id: job.id,
            event_type: job.event_type.clone(),
            repository_name: job.repository_name.clone(),
            repository_owner: job.repository_owner.clone(),
            installation_id: job.installation_id,
            repo_owner_type: job.owner_type,
            queue_id: Some(queue_id.into()),
            queue_fifo: Some(queue_fifo),
            retry_counter: job.retry_counter,
        }
    }

    /// Retries already scheduled, `0` when the field is absent.
    pub fn retry_count(&self) -> u32 {
        self.retry_counter.unwrap_or(0)
    }

    /// Returns a copy with the retry counter advanced by one.
    #[must_use]
    pub fn with_next_retry(&self) -> Self {
        Self {
            retry_counter: Some(self.retry_count().saturating_add(1)),
            ..self.clone()
        }
    }

    /// Owner tag for the configured runner scope.
    pub fn owner_tag(&self, runner_type: RunnerType) -> String {
        runner_type.owner_tag(&self.repository_owner, &self.repository_name)
    }

    /// Returns `owner/name`.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.repository_owner, self.repository_name)
    }

    /// Decodes a message body.
    pub fn from_json(body: &str) -> Result<Self, EventError> {
        let request: ActionRequest = serde_json::from_str(body)?;
        if request.repository_owner.is_empty() {
            return Err(EventError::InvalidPayload(
                "repositoryOwner must not be empty".to_string(),
            ));
        }
        Ok(request)
    }

    /// Encodes the message body.
    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }
}
