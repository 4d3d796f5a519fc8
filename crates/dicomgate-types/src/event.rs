use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transfer::{DestinationResult, TransferStatus};

/// Pipeline event, broadcast to the webhook dispatcher, history writer and
/// the admin read surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    StudyReceived {
        ae_title: String,
        study_uid: String,
        source_ae: String,
        file_count: usize,
        byte_total: u64,
        at: DateTime<Utc>,
    },
    StudyCompleted {
        ae_title: String,
        study_uid: String,
        status: TransferStatus,
        destinations: Vec<DestinationResult>,
        at: DateTime<Utc>,
    },
    StudyFailed {
        ae_title: String,
        study_uid: String,
        reason: String,
        at: DateTime<Utc>,
    },
    ReviewPending {
        ae_title: String,
        study_uid: String,
        review_id: String,
        at: DateTime<Utc>,
    },
    ReviewDecided {
        ae_title: String,
        study_uid: String,
        review_id: String,
        approved: bool,
        user: String,
        at: DateTime<Utc>,
    },
    DestinationRetryScheduled {
        ae_title: String,
        study_uid: String,
        destination: String,
        attempt: u32,
        next_retry_at: DateTime<Utc>,
        at: DateTime<Utc>,
    },
}

impl PipelineEvent {
    /// Event name as used in `Route.webhook_events` filters.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StudyReceived { .. } => "study_received",
            Self::StudyCompleted { .. } => "study_completed",
            Self::StudyFailed { .. } => "study_failed",
            Self::ReviewPending { .. } => "review_pending",
            Self::ReviewDecided { .. } => "review_decided",
            Self::DestinationRetryScheduled { .. } => "destination_retry_scheduled",
        }
    }

    pub fn ae_title(&self) -> &str {
        match self {
            Self::StudyReceived { ae_title, .. }
            | Self::StudyCompleted { ae_title, .. }
            | Self::StudyFailed { ae_title, .. }
            | Self::ReviewPending { ae_title, .. }
            | Self::ReviewDecided { ae_title, .. }
            | Self::DestinationRetryScheduled { ae_title, .. } => ae_title,
        }
    }

    pub fn study_uid(&self) -> &str {
        match self {
            Self::StudyReceived { study_uid, .. }
            | Self::StudyCompleted { study_uid, .. }
            | Self::StudyFailed { study_uid, .. }
            | Self::ReviewPending { study_uid, .. }
            | Self::ReviewDecided { study_uid, .. }
            | Self::DestinationRetryScheduled { study_uid, .. } => study_uid,
        }
    }
}
