//! Job dispatcher.
//!
//! Routes an incoming job notification to exactly one scale-up queue, or
//! explains why it did not. Rejections are results, not errors; only a
//! failing publish is surfaced as an error.

use std::sync::Arc;

use fleet_events::{event_types, ActionRequest, JobAction, JobEvent, QueueConfig};
use fleet_reconcile::{order_queues, select_queue};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::collaborators::MessageQueue;
use crate::config::DispatchConfig;
use crate::error::ScalerResult;

/// What the dispatcher did with a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Published to `queue_id`.
    Dispatched { queue_id: String },

    /// Not a job notification.
    UnsupportedEvent { event_type: String },

    /// Repository is not on the allow list.
    UnauthorizedRepository { repository: String },

    /// The job is past the queued state; nothing to provision.
    NotQueued { action: JobAction },

    /// No queue accepts the requested labels.
    NoMatchingQueue,
}

impl DispatchOutcome {
    /// HTTP-equivalent status reported back to the webhook transport.
    pub fn status_code(&self) -> u16 {
        match self {
            DispatchOutcome::Dispatched { .. } | DispatchOutcome::NotQueued { .. } => 201,
            DispatchOutcome::UnsupportedEvent { .. } | DispatchOutcome::NoMatchingQueue => 202,
            DispatchOutcome::UnauthorizedRepository { .. } => 403,
        }
    }

    pub fn message(&self) -> String {
        match self {
            DispatchOutcome::Dispatched { queue_id } => {
                format!("Job dispatched to queue {}", queue_id)
            }
            DispatchOutcome::UnsupportedEvent { event_type } => {
                format!("Event type '{}' is not handled", event_type)
            }
            DispatchOutcome::UnauthorizedRepository { repository } => {
                format!("Repository {} is not authorized to use runners", repository)
            }
            DispatchOutcome::NotQueued { .. } => "Job is not queued, ignoring".to_string(),
            DispatchOutcome::NoMatchingQueue => {
                "No runner queue accepts the requested labels".to_string()
            }
        }
    }

    pub fn is_dispatched(&self) -> bool {
        matches!(self, DispatchOutcome::Dispatched { .. })
    }
}

/// Routes job notifications to scale-up queues.
pub struct Dispatcher {
    queues: Vec<QueueConfig>,
    allow_list: Vec<String>,
    publisher: Arc<dyn MessageQueue>,
}

impl Dispatcher {
    /// Creates a dispatcher; queues are ordered exact-match first.
    pub fn new(config: &DispatchConfig, publisher: Arc<dyn MessageQueue>) -> Self {
        Self {
            queues: order_queues(config.queues.clone()),
            allow_list: config.repository_allow_list.clone(),
            publisher,
        }
    }

    /// Queues in evaluation order.
    pub fn queues(&self) -> &[QueueConfig] {
        &self.queues
    }

    /// Routes one job.
    #[instrument(skip(self, job), fields(job_id = job.id, repository = %job.full_name()))]
    pub async fn dispatch(&self, job: &JobEvent) -> ScalerResult<DispatchOutcome> {
        if job.event_type != event_types::WORKFLOW_JOB {
            warn!(event_type = %job.event_type, "Ignoring unsupported event");
            return Ok(DispatchOutcome::UnsupportedEvent {
                event_type: job.event_type.clone(),
            });
        }

        let repository = job.full_name();
        if !self.allow_list.is_empty() && !self.allow_list.contains(&repository) {
            info!("Repository not on allow list");
            return Ok(DispatchOutcome::UnauthorizedRepository { repository });
        }

        if job.action != JobAction::Queued {
            debug!(action = ?job.action, "Job not queued");
            return Ok(DispatchOutcome::NotQueued { action: job.action });
        }

        let Some(queue) = select_queue(&self.queues, &job.requested_labels) else {
            warn!(
                labels = ?job.requested_labels,
                "Received event contains runner labels that are not accepted by any queue"
            );
            return Ok(DispatchOutcome::NoMatchingQueue);
        };

        let message = ActionRequest::for_job(job, queue.id.clone(), queue.fifo);
        self.publisher
            .publish(&queue.id, &message.to_json()?, None)
            .await?;

        info!(queue_id = %queue.id, "Job dispatched");
        Ok(DispatchOutcome::Dispatched {
            queue_id: queue.id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::memory::MemoryQueue;
    use fleet_events::{MatcherConfig, OwnerType};

    fn queue(id: &str, labels: &[&[&str]], exact: bool) -> QueueConfig {
        QueueConfig {
            id: id.to_string(),
            arn: String::new(),
            fifo: false,
            matcher_config: MatcherConfig {
                label_matchers: labels
                    .iter()
                    .map(|set| set.iter().map(|l| l.to_string()).collect())
                    .collect(),
                exact_match: exact,
            },
        }
    }

    fn job(labels: &[&str]) -> JobEvent {
        JobEvent {
            id: 42,
            event_type: "workflow_job".to_string(),
            action: JobAction::Queued,
            repository_owner: "acme".to_string(),
            repository_name: "api".to_string(),
            owner_type: OwnerType::Organization,
            requested_labels: labels.iter().map(|l| l.to_string()).collect(),
            installation_id: 7,
            retry_counter: None,
        }
    }

    fn dispatcher(queues: Vec<QueueConfig>, allow: &[&str]) -> (Dispatcher, Arc<MemoryQueue>) {
        let publisher = Arc::new(MemoryQueue::new());
        let config = DispatchConfig {
            queues,
            repository_allow_list: allow.iter().map(|s| s.to_string()).collect(),
        };
        (Dispatcher::new(&config, publisher.clone()), publisher)
    }

    #[tokio::test]
    async fn test_exact_queue_wins_over_earlier_loose_queue() {
        let (dispatcher, publisher) = dispatcher(
            vec![
                queue("loose", &[&["linux"]], false),
                queue("exact", &[&["self-hosted", "linux", "x64"]], true),
            ],
            &[],
        );
        let order: Vec<_> = dispatcher.queues().iter().map(|q| q.id.as_str()).collect();
        assert_eq!(order, ["exact", "loose"]);

        let outcome = dispatcher.dispatch(&job(&["self-hosted", "linux"])).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Dispatched {
                queue_id: "exact".to_string()
            }
        );

        let published = publisher.published_to("exact").await;
        assert_eq!(published.len(), 1);
        let message = ActionRequest::from_json(&published[0].body).unwrap();
        assert_eq!(message.id, 42);
        assert_eq!(message.queue_id.as_deref(), Some("exact"));
        assert_eq!(message.installation_id, 7);
    }

    #[tokio::test]
    async fn test_unsupported_event() {
        let (dispatcher, publisher) = dispatcher(vec![queue("q", &[&["linux"]], false)], &[]);
        let mut event = job(&["linux"]);
        event.event_type = "check_run".to_string();

        let outcome = dispatcher.dispatch(&event).await.unwrap();
        assert_eq!(outcome.status_code(), 202);
        assert!(publisher.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_allow_list() {
        let (dispatcher, publisher) =
            dispatcher(vec![queue("q", &[&["linux"]], false)], &["acme/web"]);

        let outcome = dispatcher.dispatch(&job(&["linux"])).await.unwrap();
        assert_eq!(outcome.status_code(), 403);
        assert!(publisher.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_not_queued_is_acknowledged() {
        let (dispatcher, publisher) = dispatcher(vec![queue("q", &[&["linux"]], false)], &[]);
        let mut event = job(&["linux"]);
        event.action = JobAction::Completed;

        let outcome = dispatcher.dispatch(&event).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::NotQueued {
                action: JobAction::Completed
            }
        );
        assert_eq!(outcome.status_code(), 201);
        assert!(publisher.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_is_an_error() {
        let (dispatcher, publisher) = dispatcher(vec![queue("q", &[&["linux"]], false)], &[]);
        publisher.fail_publishes().await;

        assert!(dispatcher.dispatch(&job(&["linux"])).await.is_err());
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(DispatchOutcome::Dispatched {
            queue_id: "q".to_string(),
        })
        .unwrap();
        assert_eq!(json["outcome"], "dispatched");
        assert_eq!(json["queue_id"], "q");
    }
}
