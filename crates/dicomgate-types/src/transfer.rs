use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Overall status of a study's traversal of a route.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    Pending,
    Processing,
    Forwarding,
    Success,
    Partial,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

/// Per-destination outcome status within a transfer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DestinationStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    Skipped,
}

/// Result of one adapter `send_study` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReport {
    /// All instances reached the destination
    pub success: bool,
    pub files_transferred: usize,
    pub message: Option<String>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl SendReport {
    pub fn success(files_transferred: usize, duration: Duration) -> Self {
        Self {
            success: true,
            files_transferred,
            message: None,
            duration,
        }
    }

    pub fn partial(files_transferred: usize, total: usize, duration: Duration) -> Self {
        Self {
            success: false,
            files_transferred,
            message: Some(format!("stored {}/{} instances", files_transferred, total)),
            duration,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// State of one destination within a transfer.
///
/// Results within a record transition independently; the retry manager owns
/// the `attempts` / `next_retry_at` bookkeeping via [`DestinationResult::schedule_retry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationResult {
    /// Destination name as configured
    pub destination: String,
    pub status: DestinationStatus,
    pub message: Option<String>,
    /// Structured error detail from the adapter boundary, if any
    pub error_details: Option<String>,
    pub duration_ms: Option<u64>,
    pub files_transferred: usize,
    pub completed_at: Option<DateTime<Utc>>,
    /// Attempts made so far, including the initial fan-out
    pub attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Whether the last failure was transient-classified
    pub retry_eligible: bool,
}

impl DestinationResult {
    pub fn pending(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            status: DestinationStatus::Pending,
            message: None,
            error_details: None,
            duration_ms: None,
            files_transferred: 0,
            completed_at: None,
            attempts: 0,
            next_retry_at: None,
            retry_eligible: false,
        }
    }

    pub fn mark_in_progress(&mut self) {
        self.status = DestinationStatus::InProgress;
        self.attempts += 1;
        self.next_retry_at = None;
    }

    pub fn mark_success(&mut self, report: &SendReport) {
        self.status = DestinationStatus::Success;
        self.message = report.message.clone();
        self.error_details = None;
        self.duration_ms = Some(report.duration.as_millis() as u64);
        self.files_transferred = report.files_transferred;
        self.completed_at = Some(Utc::now());
        self.next_retry_at = None;
        self.retry_eligible = false;
    }

    pub fn mark_failed(&mut self, message: impl Into<String>, transient: bool) {
        self.status = DestinationStatus::Failed;
        self.message = Some(message.into());
        self.completed_at = Some(Utc::now());
        self.retry_eligible = transient;
    }

    pub fn mark_skipped(&mut self, message: impl Into<String>) {
        self.status = DestinationStatus::Skipped;
        self.message = Some(message.into());
        self.completed_at = Some(Utc::now());
    }

    /// Compute the next backoff step: `base * 2^attempt` capped at `max`,
    /// jittered by ±25%. Returns `false` once `max_retries` is exhausted,
    /// at which point the result is terminally failed.
    pub fn schedule_retry(
        &mut self,
        base_delay: Duration,
        max_delay: Duration,
        max_retries: u32,
    ) -> bool {
        if self.attempts > max_retries {
            self.retry_eligible = false;
            self.next_retry_at = None;
            return false;
        }
        let exp = self.attempts.min(16);
        let raw = base_delay.as_secs_f64() * 2f64.powi(exp as i32);
        let capped = raw.min(max_delay.as_secs_f64());
        let jitter = 1.0 + (rand::random::<f64>() - 0.5) * 0.5;
        let delay = Duration::from_secs_f64((capped * jitter).max(0.0));
        self.next_retry_at = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        self.retry_eligible = true;
        true
    }

    pub fn is_terminal(&self) -> bool {
        match self.status {
            DestinationStatus::Success | DestinationStatus::Skipped => true,
            DestinationStatus::Failed => !self.retry_eligible || self.next_retry_at.is_none(),
            _ => false,
        }
    }

    /// Failed but scheduled (or eligible) for another attempt.
    pub fn is_retry_pending(&self) -> bool {
        (self.status == DestinationStatus::Failed && self.retry_eligible)
            || (self.status == DestinationStatus::Pending && self.next_retry_at.is_some())
    }
}

/// One attempt by one study to traverse a route. Identity is immutable;
/// status and the per-destination results evolve as the pipeline runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: Uuid,
    pub study_uid: String,
    /// Listener AE title (the route)
    pub ae_title: String,
    /// Calling AE of the sending peer
    pub source_ae: String,
    pub status: TransferStatus,
    /// Study-level error summary
    pub error_message: Option<String>,
    pub file_count: usize,
    pub byte_total: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub destinations: Vec<DestinationResult>,
}

impl TransferRecord {
    pub fn new(
        study_uid: impl Into<String>,
        ae_title: impl Into<String>,
        source_ae: impl Into<String>,
        file_count: usize,
        byte_total: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            study_uid: study_uid.into(),
            ae_title: ae_title.into(),
            source_ae: source_ae.into(),
            status: TransferStatus::Pending,
            error_message: None,
            file_count,
            byte_total,
            created_at: now,
            updated_at: now,
            completed_at: None,
            destinations: Vec::new(),
        }
    }

    pub fn destination(&self, name: &str) -> Option<&DestinationResult> {
        self.destinations.iter().find(|d| d.destination == name)
    }

    pub fn destination_mut(&mut self, name: &str) -> Option<&mut DestinationResult> {
        self.destinations.iter_mut().find(|d| d.destination == name)
    }

    pub fn set_status(&mut self, status: TransferStatus) {
        self.status = status;
        self.updated_at = Utc::now();
        if status.is_terminal() {
            self.completed_at = Some(self.updated_at);
        }
    }

    /// Derive the study-level status from the destination results.
    ///
    /// An empty plan is a completed transfer with zero destination results.
    pub fn derive_status(&self) -> TransferStatus {
        if self.destinations.is_empty() {
            return TransferStatus::Success;
        }
        let all_ok = self
            .destinations
            .iter()
            .all(|d| matches!(d.status, DestinationStatus::Success | DestinationStatus::Skipped));
        if all_ok {
            return TransferStatus::Success;
        }
        let any_pending_retry = self.destinations.iter().any(|d| d.is_retry_pending());
        let any_success = self
            .destinations
            .iter()
            .any(|d| d.status == DestinationStatus::Success);
        if any_pending_retry {
            TransferStatus::Partial
        } else if any_success {
            // Partial success with the remainder terminally failed
            TransferStatus::Success
        } else {
            TransferStatus::Failed
        }
    }
}
