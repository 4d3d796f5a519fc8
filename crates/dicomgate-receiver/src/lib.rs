//! Inbound side of the gateway: one SCP listener per enabled route,
//! accepting C-ECHO and C-STORE associations, filing instances into
//! `incoming/<study>/`, and promoting quiescent studies to the scheduler.

pub mod association;
pub mod extract;
pub mod listener;
pub mod registry;
pub mod watchdog;

/// Completion event handed to the pipeline scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudyCompletion {
    pub ae_title: String,
    pub study_uid: String,
}

pub use listener::{ListenerStats, ListenerStatsSnapshot, RouteListener};
pub use registry::StudyRegistry;
pub use watchdog::CompletionWatchdog;
