//! External collaborators the engine depends on.
//!
//! Every collaborator is an async trait so the engine can be driven against
//! real backends or the in-memory implementations in [`memory`]. None of
//! them time out on their own; callers rely on the backend's call-level
//! timeouts and surface failures as ordinary errors.

mod coordinator;
mod fleet;
pub mod memory;
mod queue;
mod store;

pub use coordinator::{
    Coordinator, CoordinatorError, InstallationAuth, JitConfig, JitConfigRequest, JobStatus,
    RunnerScope,
};
pub use fleet::{
    tags, CapacityType, FleetOverride, FleetProvider, FleetRequest, FleetResult, MachineFilter,
    ProviderError,
};
pub use queue::{MessageQueue, QueueError};
pub use store::{Parameter, ParameterPage, ParameterStore, StoreError};
