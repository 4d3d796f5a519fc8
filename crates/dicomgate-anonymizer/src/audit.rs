use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One recorded tag mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagChange {
    /// `GGGG,EEEE`
    pub tag_hex: String,
    /// Keyword when known
    pub tag_name: Option<String>,
    pub original_value: Option<String>,
    pub anonymized_value: Option<String>,
    /// Action name as written in the script
    pub action: String,
    /// Whether the tag belongs to the identifying set
    pub is_phi: bool,
}

/// Audit for one file of the study.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileAudit {
    pub file: String,
    pub changes: Vec<TagChange>,
    /// Script postconditions the output fails to satisfy
    pub conformance_issues: Vec<String>,
    /// Heuristic PHI patterns that survived (warnings, not failures)
    pub residual_phi_warnings: Vec<String>,
}

/// Study-level audit report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditReport {
    pub study_uid: String,
    pub script: String,
    pub files: Vec<FileAudit>,
    /// Change count per tag, rolled up across files
    pub tag_summary: BTreeMap<String, usize>,
    /// (input id, output id) pairs the broker produced
    pub broker_mappings: Vec<(String, String)>,
}

impl AuditReport {
    pub fn new(study_uid: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            study_uid: study_uid.into(),
            script: script.into(),
            files: Vec::new(),
            tag_summary: BTreeMap::new(),
            broker_mappings: Vec::new(),
        }
    }

    pub fn push_file(&mut self, audit: FileAudit) {
        for change in &audit.changes {
            let key = audit_key(change);
            *self.tag_summary.entry(key).or_insert(0) += 1;
        }
        self.files.push(audit);
    }

    pub fn total_changes(&self) -> usize {
        self.files.iter().map(|f| f.changes.len()).sum()
    }

    pub fn has_conformance_issues(&self) -> bool {
        self.files.iter().any(|f| !f.conformance_issues.is_empty())
    }

    /// Compact per-tag counts for the review sidecar.
    pub fn summary_counts(&self) -> BTreeMap<String, usize> {
        self.tag_summary.clone()
    }
}

fn audit_key(change: &TagChange) -> String {
    change
        .tag_name
        .clone()
        .unwrap_or_else(|| change.tag_hex.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(name: &str, hex: &str) -> TagChange {
        TagChange {
            tag_hex: hex.into(),
            tag_name: Some(name.into()),
            original_value: Some("orig".into()),
            anonymized_value: Some("anon".into()),
            action: "replace".into(),
            is_phi: true,
        }
    }

    #[test]
    fn test_summary_rollup() {
        let mut report = AuditReport::new("1.2.3", "hipaa_standard");
        report.push_file(FileAudit {
            file: "a.dcm".into(),
            changes: vec![change("PatientID", "0010,0020"), change("StudyDate", "0008,0020")],
            ..Default::default()
        });
        report.push_file(FileAudit {
            file: "b.dcm".into(),
            changes: vec![change("PatientID", "0010,0020")],
            ..Default::default()
        });

        assert_eq!(report.total_changes(), 3);
        assert_eq!(report.tag_summary["PatientID"], 2);
        assert_eq!(report.tag_summary["StudyDate"], 1);
        assert!(!report.has_conformance_issues());
    }
}
