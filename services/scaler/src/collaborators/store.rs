//! Parameter and secret store interface.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Parameter store errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("parameter not found: {0}")]
    NotFound(String),

    #[error("parameter store throttled request for {0}")]
    Throttled(String),

    #[error("parameter store request failed: {0}")]
    Request(String),
}

/// Metadata of a stored parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub path: String,
    pub last_modified: DateTime<Utc>,
}

/// One page of a prefix listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterPage {
    pub parameters: Vec<Parameter>,

    /// Continuation token; `None` on the last page.
    pub next_token: Option<String>,
}

/// Hierarchical key/value store with a bounded write throughput.
#[async_trait]
pub trait ParameterStore: Send + Sync {
    /// Writes a value, encrypting it when `secure`.
    async fn put(&self, path: &str, value: &str, secure: bool) -> Result<(), StoreError>;

    async fn get(&self, path: &str) -> Result<String, StoreError>;

    /// Lists parameters under `prefix`, one page at a time.
    async fn list_by_prefix(
        &self,
        prefix: &str,
        next_token: Option<&str>,
    ) -> Result<ParameterPage, StoreError>;

    async fn delete(&self, path: &str) -> Result<(), StoreError>;
}
