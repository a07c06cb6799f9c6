//! Runner fleet decision primitives.
//!
//! Everything in this crate is a pure function of its inputs: no I/O, no
//! clocks read behind the caller's back. The async engine gathers the two
//! eventually-consistent views of the world (machines known to the fleet
//! provider, runners registered with the coordinator) and hands them here to
//! decide what to do.
//!
//! - [`matcher`]: which queue a job's labels route to
//! - [`policy`]: which scheduled idle-capacity window is active
//! - [`ordering`]: in which order surplus idle machines are evicted
//! - [`classify`]: the fleet/coordinator join and pool accounting
//! - [`backoff`]: job requeue delays
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs (including `now`)
//! - A machine without a launch time is never preferred for eviction and is
//!   never considered past its grace periods

use thiserror::Error;

pub mod backoff;
pub mod classify;
pub mod matcher;
pub mod ordering;
pub mod policy;

pub use backoff::{RetryBackoff, MAX_RETRY_DELAY};
pub use classify::{
    classify_machine, join_views, pool_idle_count, MachineClass, MachineRecord, RegisteredRunner,
    RunnerStatus,
};
pub use matcher::{can_run_job, order_queues, select_queue};
pub use ordering::order_for_eviction;
pub use policy::{ActiveWindow, EvictionPolicy};

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// A cron expression could not be parsed.
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    /// A time zone name is not a known IANA zone.
    #[error("invalid time zone '{0}'")]
    InvalidTimeZone(String),
}
