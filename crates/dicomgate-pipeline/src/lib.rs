//! The study pipeline: per-route worker pools driving the study state
//! machine from completed ingestion through anonymization, review gating,
//! destination fan-out, retry and archival — plus the typed read surface
//! the admin layer projects.

pub mod events;
pub mod handle;
pub mod retry;
pub mod review;
pub mod scheduler;
pub mod service;

/// Unit of work on a route's queue. The retry manager and review gate
/// feed the same channel the completion watchdog does, so all study work
/// flows through one code path per route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkItem {
    /// Fresh (or user-retried, or recovered) study: run the full plan
    ProcessStudy { ae_title: String, study_uid: String },
    /// Review approval: the study is back in `processing/`, fan out
    ForwardApproved { ae_title: String, study_uid: String },
    /// Retry of a single destination for an otherwise-settled study
    SendOne {
        ae_title: String,
        study_uid: String,
        destination: String,
    },
}

pub use handle::PipelineHandle;
pub use retry::RetryManager;
pub use review::ReviewGate;
pub use scheduler::Scheduler;
pub use service::PipelineService;
