//! JSON sidecar files written next to a study's DICOM objects. Everything
//! here round-trips through serde; the retry metadata in particular is the
//! authoritative record the retry manager rebuilds its queue from after a
//! restart.

use chrono::{DateTime, Utc};
use dicomgate_types::{DestinationResult, GatewayError, Study};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const FAILURE_REASON_FILE: &str = "failure_reason.txt";
pub const RETRY_METADATA_FILE: &str = "retry_metadata.json";
pub const REVIEW_METADATA_FILE: &str = "review_metadata.json";
pub const DESTINATION_STATUS_FILE: &str = "destination_status.json";
pub const STUDY_MANIFEST_FILE: &str = "study.json";

/// One recorded retry attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub at: DateTime<Utc>,
    pub destination: String,
    pub error: Option<String>,
}

/// `retry_metadata.json`: retry count, per-attempt timestamps, last error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryMetadata {
    pub retry_count: u32,
    pub attempts: Vec<RetryAttempt>,
    pub last_error: Option<String>,
}

impl RetryMetadata {
    pub fn record(&mut self, destination: impl Into<String>, error: Option<String>) {
        self.retry_count += 1;
        self.last_error = error.clone();
        self.attempts.push(RetryAttempt {
            at: Utc::now(),
            destination: destination.into(),
            error,
        });
    }
}

/// Review decision captured in the sidecar.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approved,
    Rejected,
}

/// `review_metadata.json` written when a study is parked for review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewMetadata {
    pub review_id: String,
    pub study_uid: String,
    pub ae_title: String,
    pub source_ae: String,
    /// Script used for the anonymized copy shown to the reviewer
    pub script: Option<String>,
    /// Rolled-up audit counts shown to the reviewer
    pub audit_summary: BTreeMap<String, usize>,
    pub submitted_at: DateTime<Utc>,
    pub reviewer: Option<String>,
    pub decision: Option<ReviewDecision>,
    pub notes: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl ReviewMetadata {
    pub fn is_decided(&self) -> bool {
        self.decision.is_some()
    }
}

/// `destination_status.json`: the per-destination result map, keyed by
/// destination name. This file is what the scheduler consults on recovery
/// to avoid duplicate fan-out and what decides retry eligibility.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DestinationStatusFile {
    pub study_uid: String,
    pub record_id: Option<uuid::Uuid>,
    pub destinations: BTreeMap<String, DestinationResult>,
}

impl DestinationStatusFile {
    pub fn new(study_uid: impl Into<String>) -> Self {
        Self {
            study_uid: study_uid.into(),
            record_id: None,
            destinations: BTreeMap::new(),
        }
    }

    pub fn upsert(&mut self, result: DestinationResult) {
        self.destinations.insert(result.destination.clone(), result);
    }
}

fn write_json<T: Serialize>(dir: &Path, name: &str, value: &T) -> Result<(), GatewayError> {
    let tmp = dir.join(format!(".{}.tmp", name));
    fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&tmp, dir.join(name))?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(dir: &Path, name: &str) -> Result<Option<T>, GatewayError> {
    let path = dir.join(name);
    if !path.is_file() {
        return Ok(None);
    }
    let raw = fs::read(&path)?;
    Ok(Some(serde_json::from_slice(&raw)?))
}

pub fn write_failure_reason(dir: &Path, reason: &str) -> Result<(), GatewayError> {
    fs::write(dir.join(FAILURE_REASON_FILE), reason)?;
    Ok(())
}

pub fn read_failure_reason(dir: &Path) -> Option<String> {
    fs::read_to_string(dir.join(FAILURE_REASON_FILE)).ok()
}

pub fn write_retry_metadata(dir: &Path, meta: &RetryMetadata) -> Result<(), GatewayError> {
    write_json(dir, RETRY_METADATA_FILE, meta)
}

pub fn read_retry_metadata(dir: &Path) -> Result<Option<RetryMetadata>, GatewayError> {
    read_json(dir, RETRY_METADATA_FILE)
}

pub fn write_review_metadata(dir: &Path, meta: &ReviewMetadata) -> Result<(), GatewayError> {
    write_json(dir, REVIEW_METADATA_FILE, meta)
}

pub fn read_review_metadata(dir: &Path) -> Result<Option<ReviewMetadata>, GatewayError> {
    read_json(dir, REVIEW_METADATA_FILE)
}

/// `study.json`: study metadata plus the routing-rule adjustments
/// accumulated while receiving.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyManifest {
    pub study: Study,
    /// Destinations added by routing rules for this study
    #[serde(default)]
    pub destination_adds: Vec<String>,
    /// Destinations removed by routing rules for this study
    #[serde(default)]
    pub destination_removes: Vec<String>,
    /// Instances rejected by filter/validation rules (recorded, not stored)
    #[serde(default)]
    pub rejected_instances: usize,
}

pub fn write_study_manifest(dir: &Path, manifest: &StudyManifest) -> Result<(), GatewayError> {
    write_json(dir, STUDY_MANIFEST_FILE, manifest)
}

pub fn read_study_manifest(dir: &Path) -> Result<Option<StudyManifest>, GatewayError> {
    read_json(dir, STUDY_MANIFEST_FILE)
}

pub fn write_destination_status(
    dir: &Path,
    status: &DestinationStatusFile,
) -> Result<(), GatewayError> {
    write_json(dir, DESTINATION_STATUS_FILE, status)
}

pub fn read_destination_status(dir: &Path) -> Result<Option<DestinationStatusFile>, GatewayError> {
    read_json(dir, DESTINATION_STATUS_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicomgate_types::DestinationStatus;
    use tempfile::TempDir;

    #[test]
    fn test_retry_metadata_round_trip() {
        let tmp = TempDir::new().unwrap();
        let mut meta = RetryMetadata::default();
        meta.record("xnatA", Some("503".into()));
        meta.record("xnatA", None);
        write_retry_metadata(tmp.path(), &meta).unwrap();

        let loaded = read_retry_metadata(tmp.path()).unwrap().unwrap();
        assert_eq!(loaded.retry_count, 2);
        assert_eq!(loaded.attempts.len(), 2);
        assert!(loaded.last_error.is_none());
    }

    #[test]
    fn test_destination_status_round_trip() {
        let tmp = TempDir::new().unwrap();
        let mut file = DestinationStatusFile::new("1.2.3");
        let mut result = DestinationResult::pending("peer1");
        result.status = DestinationStatus::Success;
        result.files_transferred = 5;
        file.upsert(result);
        write_destination_status(tmp.path(), &file).unwrap();

        let loaded = read_destination_status(tmp.path()).unwrap().unwrap();
        assert_eq!(loaded.study_uid, "1.2.3");
        let peer = &loaded.destinations["peer1"];
        assert_eq!(peer.status, DestinationStatus::Success);
        assert_eq!(peer.files_transferred, 5);
    }

    #[test]
    fn test_missing_sidecar_is_none() {
        let tmp = TempDir::new().unwrap();
        assert!(read_review_metadata(tmp.path()).unwrap().is_none());
        assert!(read_failure_reason(tmp.path()).is_none());
    }

    #[test]
    fn test_failure_reason_plain_text() {
        let tmp = TempDir::new().unwrap();
        write_failure_reason(tmp.path(), "association refused").unwrap();
        assert_eq!(
            read_failure_reason(tmp.path()).unwrap(),
            "association refused"
        );
    }
}
