//! Drift detection engine.
//!
//! This module coordinates the drift subsystem, including:
//! - A detection scheduler servicing many independently-timed configurations
//! - A per-configuration synchronization gate enforcing at-most-one
//!   unacknowledged change set in flight
//! - The transport boundary over which change sets reach the remote peer
//! - The `DriftManager` facade exposed to the configuration collaborator

pub mod gate;
pub mod manager;
pub mod schedule;
pub mod scheduler;
pub mod transport;

pub use gate::SyncGate;
pub use manager::{DriftManager, DriftManagerConfig};
pub use schedule::{DetectionSchedule, ScheduleKey, ScheduleQueue, ScheduleStatus};
pub use scheduler::DetectionScheduler;
pub use transport::{ChangeSetHeaders, ChangeSetTransport};

// Re-exported so transport implementations and callers see one surface.
pub use driftwatch_store::GateStatus;
