//! Runner fleet scaler.
//!
//! Keeps a fleet of CI runner machines sized to demand:
//!
//! - [`dispatch`]: routes job notifications to scale-up queues
//! - [`scale_up`]: creates machines for routed jobs and pool top-ups
//! - [`retry`]: requeues jobs that may not be visible yet
//! - [`delivery`]: local transport feeding queued messages back in
//! - [`scale_down`]: evicts idle machines and removes orphans
//! - [`pool`]: keeps a warm pool of idle runners
//! - [`housekeeping`]: removes bootstrap parameters nobody consumed
//!
//! Every external system sits behind a trait in [`collaborators`]; the
//! decision logic itself lives in `fleet-reconcile`.

pub mod collaborators;
pub mod config;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod housekeeping;
pub mod pool;
pub mod retry;
pub mod scale_down;
pub mod scale_up;
pub mod worker;

pub use config::Config;
pub use delivery::{Delivery, DeliveryOutcome};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use error::{ScalerError, ScalerResult};
pub use housekeeping::{ParameterHousekeeper, SweepStats};
pub use pool::{PoolBalancer, PoolStats};
pub use retry::{RetryOutcome, RetryScheduler};
pub use scale_down::{FleetReconciler, PassStats};
pub use scale_up::{CreatedBy, FleetProvisioner};
pub use worker::{PeriodicTask, PeriodicWorker};
