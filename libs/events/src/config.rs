//! Configuration documents: queue matchers, scale-down windows, pool events.
//!
//! These arrive as JSON (environment variables or scheduler payloads) and
//! are validated here so downstream code only ever sees well-formed values.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{EventError, EvictionStrategy};

/// Label matching rules of a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatcherConfig {
    /// Alternative label sets advertised by the runners behind the queue.
    #[serde(default)]
    pub label_matchers: Vec<Vec<String>>,

    /// Require every requested label to be advertised (superset match).
    #[serde(default)]
    pub exact_match: bool,
}

/// A scale-up queue and the jobs it accepts.
///
/// Ordering within a configuration list is significant: the dispatcher
/// evaluates exact-match queues first, otherwise preserving this order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    /// Destination handle messages are published to.
    pub id: String,

    /// Provider resource name of the queue, informational.
    #[serde(default)]
    pub arn: String,

    /// Whether the queue preserves ordering and deduplicates.
    #[serde(default)]
    pub fifo: bool,

    pub matcher_config: MatcherConfig,
}

/// One entry of the scheduled idle-capacity policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleDownWindow {
    /// Cron expression; the window is active while it fires.
    pub cron: String,

    /// Idle machines to keep per owner while the window is active.
    pub idle_count: u32,

    /// IANA time zone the expression is evaluated in.
    #[serde(default = "default_time_zone")]
    pub time_zone: String,

    /// Eviction order, `oldest_first` when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eviction_strategy: Option<EvictionStrategy>,
}

fn default_time_zone() -> String {
    "UTC".to_string()
}

/// Payload of the timer that triggers a pool adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolEvent {
    pub pool_size: u32,
}

fn invalid(document: &str, reason: impl Into<String>) -> EventError {
    EventError::InvalidConfig {
        document: document.to_string(),
        reason: reason.into(),
    }
}

/// Parses and validates the queue configuration list.
pub fn parse_queue_configs(json: &str) -> Result<Vec<QueueConfig>, EventError> {
    const DOCUMENT: &str = "queues";

    let queues: Vec<QueueConfig> =
        serde_json::from_str(json).map_err(|e| invalid(DOCUMENT, e.to_string()))?;

    let mut seen = HashSet::new();
    for queue in &queues {
        if queue.id.trim().is_empty() {
            return Err(invalid(DOCUMENT, "queue id must not be empty"));
        }
        if !seen.insert(queue.id.as_str()) {
            return Err(invalid(DOCUMENT, format!("duplicate queue id '{}'", queue.id)));
        }
        if queue
            .matcher_config
            .label_matchers
            .iter()
            .flatten()
            .any(|label| label.trim().is_empty())
        {
            return Err(invalid(
                DOCUMENT,
                format!("queue '{}' has an empty label", queue.id),
            ));
        }
    }

    Ok(queues)
}

/// Parses and validates the scale-down policy list.
///
/// Cron syntax and time zones are checked when the policy is compiled by the
/// reconciler; this only checks the document shape.
pub fn parse_scale_down_windows(json: &str) -> Result<Vec<ScaleDownWindow>, EventError> {
    const DOCUMENT: &str = "scale_down";

    let windows: Vec<ScaleDownWindow> =
        serde_json::from_str(json).map_err(|e| invalid(DOCUMENT, e.to_string()))?;

    for window in &windows {
        if window.cron.trim().is_empty() {
            return Err(invalid(DOCUMENT, "cron expression must not be empty"));
        }
        if window.time_zone.trim().is_empty() {
            return Err(invalid(DOCUMENT, "time zone must not be empty"));
        }
    }

    Ok(windows)
}

/// Parses the repository allow list (`["owner/repo", ...]`).
pub fn parse_allow_list(json: &str) -> Result<Vec<String>, EventError> {
    const DOCUMENT: &str = "repository_allow_list";

    let entries: Vec<String> =
        serde_json::from_str(json).map_err(|e| invalid(DOCUMENT, e.to_string()))?;

    if let Some(bad) = entries.iter().find(|e| !e.contains('/')) {
        return Err(invalid(DOCUMENT, format!("'{}' is not owner/repo", bad)));
    }

    Ok(entries)
}
