use chrono::{DateTime, Utc};
use dicomgate_types::{DestinationResult, GatewayError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::layout::AeLayout;

pub const ARCHIVE_METADATA_FILE: &str = "archive_metadata.json";

/// Metadata sidecar written next to the archived copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub study_uid: String,
    pub ae_title: String,
    pub source_ae: String,
    pub archived_at: DateTime<Utc>,
    pub received_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Destination name -> final result (attempts, last error included)
    pub destinations: BTreeMap<String, DestinationResult>,
    /// Scripts whose anonymized output was archived
    pub scripts: Vec<String>,
    pub review_decision: Option<String>,
    /// (input id, output id) pairs the honest broker produced for the study
    pub broker_mappings: Vec<(String, String)>,
    /// Relative path of the audit report JSON, when anonymization ran
    pub audit_report: Option<String>,
    pub submitted_for_review: bool,
}

/// Writes terminal studies into `archive/<YYYY-MM-DD>/study_<uid>/`.
#[derive(Debug, Clone)]
pub struct ArchiveWriter {
    layout: AeLayout,
}

impl ArchiveWriter {
    pub fn new(layout: AeLayout) -> Self {
        Self { layout }
    }

    pub fn study_archive_dir(&self, date: chrono::NaiveDate, study_uid: &str) -> PathBuf {
        self.layout
            .archive_dir()
            .join(date.format("%Y-%m-%d").to_string())
            .join(format!("study_{}", study_uid))
    }

    /// Copy originals (and anonymized copies, if any) into the dated
    /// archive folder and write the metadata sidecar.
    pub fn archive_study(
        &self,
        study_uid: &str,
        original_files: &[PathBuf],
        anonymized: &[(String, Vec<PathBuf>)],
        audit_report_json: Option<&serde_json::Value>,
        mut metadata: ArchiveMetadata,
    ) -> Result<PathBuf, GatewayError> {
        let dir = self.study_archive_dir(Utc::now().date_naive(), study_uid);
        let original_dir = dir.join("original");
        fs::create_dir_all(&original_dir)?;
        for file in original_files {
            copy_into(file, &original_dir)?;
        }

        for (script, files) in anonymized {
            let anon_dir = dir.join("anonymized").join(script);
            fs::create_dir_all(&anon_dir)?;
            for file in files {
                copy_into(file, &anon_dir)?;
            }
            metadata.scripts.push(script.clone());
        }

        if let Some(report) = audit_report_json {
            let name = "audit_report.json";
            fs::write(dir.join(name), serde_json::to_vec_pretty(report)?)?;
            metadata.audit_report = Some(name.to_string());
        }

        metadata.archived_at = Utc::now();
        fs::write(
            dir.join(ARCHIVE_METADATA_FILE),
            serde_json::to_vec_pretty(&metadata)?,
        )?;
        info!(
            ae = %self.layout.ae_title(),
            study = study_uid,
            files = original_files.len(),
            "study archived"
        );
        Ok(dir)
    }
}

fn copy_into(file: &Path, dir: &Path) -> Result<(), GatewayError> {
    let name = file
        .file_name()
        .ok_or_else(|| GatewayError::not_found("file name", file.display().to_string()))?;
    fs::copy(file, dir.join(name))?;
    Ok(())
}
