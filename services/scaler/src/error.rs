//! Engine error taxonomy.

use fleet_events::EventError;
use fleet_reconcile::ReconcileError;

use crate::collaborators::{CoordinatorError, ProviderError, QueueError, StoreError};

/// Result type for engine operations.
pub type ScalerResult<T> = Result<T, ScalerError>;

/// Errors surfaced by the engine.
///
/// Only [`ScalerError::Scale`] asks the caller's transport to redeliver the
/// triggering message. Everything else is fatal to the current invocation.
#[derive(Debug, thiserror::Error)]
pub enum ScalerError {
    /// Capacity could not be obtained right now.
    #[error("scale error: {0}")]
    Scale(String),

    /// Missing or inconsistent configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The message is not something this component handles.
    #[error("unsupported event: {0}")]
    UnsupportedEvent(String),

    /// The fleet provider created nothing for a reason outside the
    /// capacity/throttling allow-list.
    #[error("fleet creation failed: {0}")]
    FleetCreation(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error(transparent)]
    Policy(#[from] ReconcileError),
}

impl ScalerError {
    /// True for the single retryable signal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ScalerError::Scale(_))
    }
}
