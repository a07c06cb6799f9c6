//! # fleet-events
//!
//! Wire schemas shared by the runner fleet components.
//!
//! ## Design Principles
//!
//! - Messages are immutable once received; only the retry scheduler bumps
//!   `retryCounter`, and it does so on a fresh copy
//! - Field names follow the coordinator's and the queue's JSON conventions
//!   (`camelCase`), so payloads survive a round trip through external queues
//! - Configuration documents are parsed into validated structs at the
//!   process boundary; a document that fails validation never reaches the
//!   reconciliation logic
//!
//! ## Contents
//!
//! - [`JobEvent`]: a job notification as received from the coordinator
//! - [`ActionRequest`]: the queue message routed to a scale-up queue
//! - [`QueueConfig`], [`ScaleDownWindow`], [`PoolEvent`]: configuration
//!   schemas

mod config;
mod envelope;
mod error;
mod types;

pub use config::*;
pub use envelope::*;
pub use error::EventError;
pub use types::*;
