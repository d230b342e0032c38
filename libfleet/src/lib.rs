#![forbid(unsafe_code)]

//! # fleet
//!
//! Run one action against many remote hosts at once. Encapsulates
//! abstractions for things like:
//!
//! - Target descriptors and the actions applied to them
//! - The Remote Target Executor contract, with SSH and local transports
//! - The Fleet Orchestrator: bounded concurrency, progress events and
//!   cooperative cancellation
//! - Logging, tracing and the audit trail

pub mod action;
pub mod executor;
pub mod job;
pub mod log;
pub mod orchestrator;
pub mod target;

pub use action::FleetAction;
pub use executor::{RemoteTargetExecutor, TargetExecutor};
pub use job::{FleetJob, JobId, TargetResult, TargetState};
pub use orchestrator::{JobEvent, JobEvents, Orchestrator, OrchestratorError};
pub use target::TargetDescriptor;
