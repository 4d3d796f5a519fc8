use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle state of a study inside the pipeline.
///
/// Mirrors the on-disk layout: every non-terminal state corresponds to the
/// directory the study currently lives in, and transitions between states
/// are performed as atomic renames between those directories.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StudyState {
    /// Instances are still arriving on the wire
    Receiving,
    /// Quiescence elapsed; study is eligible for scheduling
    CompletedIncoming,
    /// A pipeline worker owns the study
    Processing,
    /// Anonymization in progress
    Anonymizing,
    /// Parked in review/pending awaiting a human decision
    AwaitingReview,
    /// Fan-out to destinations in progress
    Forwarding,
    /// Some destinations succeeded, at least one is retry-pending
    Partial,
    /// All destinations terminal success (or empty plan)
    Completed,
    /// Terminal failure
    Failed,
    /// Review rejection; terminal, requires re-ingestion
    Rejected,
}

impl StudyState {
    /// Terminal states are never left by the pipeline itself; `Completed`
    /// and `Failed` may be re-entered via an explicit user retry.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Rejected)
    }

    /// Whether `self -> next` is a legal edge of the study state machine.
    pub fn can_transition_to(self, next: StudyState) -> bool {
        use StudyState::*;
        matches!(
            (self, next),
            (Receiving, Receiving)
                | (Receiving, CompletedIncoming)
                | (CompletedIncoming, Processing)
                | (Processing, Anonymizing)
                | (Anonymizing, Processing)
                | (Anonymizing, Failed)
                | (Processing, AwaitingReview)
                | (AwaitingReview, Forwarding)
                | (AwaitingReview, Rejected)
                | (Processing, Forwarding)
                | (Forwarding, Completed)
                | (Forwarding, Partial)
                | (Forwarding, Failed)
                | (Failed, Processing)
                | (Partial, Completed)
                | (Partial, Failed)
        )
    }
}

impl std::fmt::Display for StudyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Receiving => "RECEIVING",
            Self::CompletedIncoming => "COMPLETED_INCOMING",
            Self::Processing => "PROCESSING",
            Self::Anonymizing => "ANONYMIZING",
            Self::AwaitingReview => "AWAITING_REVIEW",
            Self::Forwarding => "FORWARDING",
            Self::Partial => "PARTIAL",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Rejected => "REJECTED",
        };
        f.write_str(s)
    }
}

/// Metadata extracted from a single DICOM object at receive time.
///
/// Immutable after the instance file is written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceMeta {
    /// Path of the stored object relative to the study directory
    pub path: PathBuf,
    pub sop_instance_uid: String,
    pub sop_class_uid: String,
    pub series_instance_uid: String,
    pub modality: Option<String>,
    pub patient_id: Option<String>,
    pub patient_name: Option<String>,
    pub study_date: Option<String>,
    pub file_size: u64,
}

/// One DICOM study moving through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Study {
    /// Study Instance UID (0020,000D)
    pub study_uid: String,
    /// AE title of the listener that received the study
    pub ae_title: String,
    /// Calling AE title of the peer that sent it
    pub source_ae: String,
    /// Current state; kept in sync with the owning directory
    pub state: StudyState,
    /// Received instances, in arrival order
    pub instances: Vec<InstanceMeta>,
    /// Sum of instance file sizes in bytes
    pub byte_total: u64,
    pub received_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub forwarding_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Study {
    /// Create a study record for the first instance of a new Study UID.
    pub fn new(
        study_uid: impl Into<String>,
        ae_title: impl Into<String>,
        source_ae: impl Into<String>,
    ) -> Self {
        Self {
            study_uid: study_uid.into(),
            ae_title: ae_title.into(),
            source_ae: source_ae.into(),
            state: StudyState::Receiving,
            instances: Vec::new(),
            byte_total: 0,
            received_at: Utc::now(),
            processing_started_at: None,
            forwarding_started_at: None,
            completed_at: None,
        }
    }

    /// Record a received instance.
    pub fn add_instance(&mut self, meta: InstanceMeta) {
        self.byte_total += meta.file_size;
        self.instances.push(meta);
    }

    /// Advance the state machine, stamping the relevant timestamp.
    ///
    /// Returns `false` (and leaves the study untouched) when the edge is
    /// not legal.
    pub fn transition(&mut self, next: StudyState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        match next {
            StudyState::Processing if self.processing_started_at.is_none() => {
                self.processing_started_at = Some(Utc::now());
            }
            StudyState::Forwarding if self.forwarding_started_at.is_none() => {
                self.forwarding_started_at = Some(Utc::now());
            }
            StudyState::Completed | StudyState::Failed | StudyState::Rejected => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        self.state = next;
        true
    }

    pub fn file_count(&self) -> usize {
        self.instances.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_happy_path() {
        let mut study = Study::new("1.2.3", "INGEST", "PEER");
        assert_eq!(study.state, StudyState::Receiving);
        assert!(study.transition(StudyState::CompletedIncoming));
        assert!(study.transition(StudyState::Processing));
        assert!(study.transition(StudyState::Forwarding));
        assert!(study.transition(StudyState::Completed));
        assert!(study.completed_at.is_some());
        assert!(study.state.is_terminal());
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut study = Study::new("1.2.3", "INGEST", "PEER");
        assert!(!study.transition(StudyState::Forwarding));
        assert_eq!(study.state, StudyState::Receiving);
    }

    #[test]
    fn test_user_retry_reenters_processing() {
        let mut study = Study::new("1.2.3", "INGEST", "PEER");
        study.transition(StudyState::CompletedIncoming);
        study.transition(StudyState::Processing);
        study.transition(StudyState::Forwarding);
        study.transition(StudyState::Failed);
        assert!(study.transition(StudyState::Processing));
        assert!(!study.state.is_terminal());
    }

    #[test]
    fn test_review_rejection_is_terminal() {
        let mut study = Study::new("1.2.3", "INGEST", "PEER");
        study.transition(StudyState::CompletedIncoming);
        study.transition(StudyState::Processing);
        study.transition(StudyState::AwaitingReview);
        assert!(study.transition(StudyState::Rejected));
        assert!(!study.transition(StudyState::Processing));
    }

    #[test]
    fn test_instance_accounting() {
        let mut study = Study::new("1.2.3", "INGEST", "PEER");
        study.add_instance(InstanceMeta {
            path: "a.dcm".into(),
            sop_instance_uid: "1.1".into(),
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".into(),
            series_instance_uid: "1.2".into(),
            modality: Some("CT".into()),
            patient_id: Some("P1".into()),
            patient_name: None,
            study_date: Some("20260101".into()),
            file_size: 512,
        });
        assert_eq!(study.file_count(), 1);
        assert_eq!(study.byte_total, 512);
    }
}
