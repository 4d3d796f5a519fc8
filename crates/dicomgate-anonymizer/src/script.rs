use chrono::{DateTime, Utc};
use dicom_core::Tag;
use dicomgate_types::GatewayError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::dict;

/// Per-tag operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TagAction {
    /// Delete the tag
    Remove,
    /// Leave the tag untouched (overrides later broader rules)
    Keep,
    /// Keep the tag with an empty value
    Empty,
    /// Constant replacement
    Replace { value: String },
    /// Replace with a hex digest of the original value
    Hash,
    /// Replace with a deterministic UID under the site root
    GenerateUid,
    /// Add the per-patient stable day offset to a DA value
    ShiftDate,
    /// Write the project/subject/session naming into PatientComments
    ProjectSubjectSessionRewrite,
    /// Zero a rectangle of pixel data (burned-in PHI)
    AlterPixels { x: u32, y: u32, w: u32, h: u32 },
}

/// One ordered script entry: a tag (keyword or hex) plus the action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TagOp {
    pub tag: String,
    #[serde(flatten)]
    pub action: TagAction,
}

impl TagOp {
    pub fn new(tag: impl Into<String>, action: TagAction) -> Self {
        Self {
            tag: tag.into(),
            action,
        }
    }

    pub fn resolve(&self) -> Option<Tag> {
        dict::resolve(&self.tag)
    }
}

/// A named anonymization script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Script {
    pub name: String,
    pub description: String,
    /// Built-in scripts are read-only
    pub builtin: bool,
    pub ops: Vec<TagOp>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Script {
    pub fn new(name: impl Into<String>, description: impl Into<String>, ops: Vec<TagOp>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            description: description.into(),
            builtin: false,
            ops,
            created_at: now,
            modified_at: now,
        }
    }

    fn builtin(name: &str, description: &str, ops: Vec<TagOp>) -> Self {
        let mut script = Self::new(name, description, ops);
        script.builtin = true;
        script
    }
}

/// The built-in script set. `basic` strips direct identifiers; the
/// `hipaa_standard` script covers the HIPAA Safe Harbor tag list with
/// date shifting and UID regeneration.
pub fn builtins() -> Vec<Script> {
    use TagAction::*;
    vec![
        Script::builtin(
            "basic",
            "Remove direct patient identifiers",
            vec![
                TagOp::new("PatientName", Replace { value: "ANONYMOUS".into() }),
                TagOp::new("PatientID", Hash),
                TagOp::new("PatientBirthDate", Empty),
                TagOp::new("PatientAddress", Remove),
                TagOp::new("PatientTelephoneNumbers", Remove),
                TagOp::new("AccessionNumber", Empty),
                TagOp::new("ReferringPhysicianName", Empty),
            ],
        ),
        Script::builtin(
            "hipaa_standard",
            "HIPAA Safe Harbor de-identification",
            vec![
                TagOp::new("PatientName", Replace { value: "ANONYMOUS".into() }),
                TagOp::new("PatientID", Hash),
                TagOp::new("OtherPatientIDs", Remove),
                TagOp::new("OtherPatientNames", Remove),
                TagOp::new("IssuerOfPatientID", Remove),
                TagOp::new("PatientBirthDate", Empty),
                TagOp::new("PatientSex", Keep),
                TagOp::new("PatientAge", Keep),
                TagOp::new("PatientAddress", Remove),
                TagOp::new("PatientTelephoneNumbers", Remove),
                TagOp::new("PatientComments", Remove),
                TagOp::new("AccessionNumber", Hash),
                TagOp::new("ReferringPhysicianName", Remove),
                TagOp::new("PerformingPhysicianName", Remove),
                TagOp::new("OperatorsName", Remove),
                TagOp::new("InstitutionName", Remove),
                TagOp::new("InstitutionAddress", Remove),
                TagOp::new("StationName", Remove),
                TagOp::new("DeviceSerialNumber", Remove),
                TagOp::new("StudyDate", ShiftDate),
                TagOp::new("SeriesDate", ShiftDate),
                TagOp::new("AcquisitionDate", ShiftDate),
                TagOp::new("ContentDate", ShiftDate),
                TagOp::new("StudyInstanceUID", GenerateUid),
                TagOp::new("SeriesInstanceUID", GenerateUid),
                TagOp::new("SOPInstanceUID", GenerateUid),
                TagOp::new("FrameOfReferenceUID", GenerateUid),
            ],
        ),
        Script::builtin("identity", "Keep every tag unchanged", Vec::new()),
    ]
}

/// Script persistence: built-ins live in memory, custom scripts are JSON
/// files in the scripts directory.
pub struct ScriptStore {
    dir: PathBuf,
    builtins: Vec<Script>,
}

impl ScriptStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            builtins: builtins(),
        })
    }

    fn script_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    pub fn get(&self, name: &str) -> Result<Script, GatewayError> {
        if let Some(builtin) = self.builtins.iter().find(|s| s.name == name) {
            return Ok(builtin.clone());
        }
        let path = self.script_path(name);
        if !path.is_file() {
            return Err(GatewayError::not_found("script", name));
        }
        Ok(serde_json::from_slice(&fs::read(&path)?)?)
    }

    pub fn list(&self) -> Result<Vec<Script>, GatewayError> {
        let mut scripts = self.builtins.clone();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                match serde_json::from_slice::<Script>(&fs::read(&path)?) {
                    Ok(script) => scripts.push(script),
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable script"),
                }
            }
        }
        Ok(scripts)
    }

    pub fn save(&self, mut script: Script) -> Result<(), GatewayError> {
        if self.builtins.iter().any(|b| b.name == script.name) {
            return Err(GatewayError::config(format!(
                "built-in script {} is read-only",
                script.name
            )));
        }
        for op in &script.ops {
            if op.resolve().is_none() && !matches!(op.action, TagAction::AlterPixels { .. }) {
                return Err(GatewayError::config(format!(
                    "script {}: unknown tag {:?}",
                    script.name, op.tag
                )));
            }
        }
        script.builtin = false;
        script.modified_at = Utc::now();
        let path = self.script_path(&script.name);
        fs::write(&path, serde_json::to_vec_pretty(&script)?)?;
        info!(script = %script.name, "script saved");
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<(), GatewayError> {
        if self.builtins.iter().any(|b| b.name == name) {
            return Err(GatewayError::config(format!(
                "built-in script {} cannot be deleted",
                name
            )));
        }
        let path = self.script_path(name);
        if !path.is_file() {
            return Err(GatewayError::not_found("script", name));
        }
        fs::remove_file(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_builtins_present() {
        let names: Vec<_> = builtins().into_iter().map(|s| s.name).collect();
        assert!(names.contains(&"basic".to_string()));
        assert!(names.contains(&"hipaa_standard".to_string()));
        assert!(names.contains(&"identity".to_string()));
    }

    #[test]
    fn test_builtin_read_only() {
        let tmp = TempDir::new().unwrap();
        let store = ScriptStore::open(tmp.path()).unwrap();
        let mut script = store.get("basic").unwrap();
        script.description = "tampered".into();
        assert!(store.save(script).is_err());
        assert!(store.delete("basic").is_err());
    }

    #[test]
    fn test_custom_script_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = ScriptStore::open(tmp.path()).unwrap();
        let script = Script::new(
            "site-trial",
            "trial-specific rules",
            vec![
                TagOp::new("StudyDescription", TagAction::Empty),
                TagOp::new("0008,1030", TagAction::Remove),
            ],
        );
        store.save(script).unwrap();

        let loaded = store.get("site-trial").unwrap();
        assert_eq!(loaded.ops.len(), 2);
        assert!(!loaded.builtin);
        assert!(store.list().unwrap().iter().any(|s| s.name == "site-trial"));

        store.delete("site-trial").unwrap();
        assert!(store.get("site-trial").is_err());
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = ScriptStore::open(tmp.path()).unwrap();
        let script = Script::new(
            "bad",
            "",
            vec![TagOp::new("Bogus", TagAction::Remove)],
        );
        assert!(store.save(script).is_err());
    }

    #[test]
    fn test_op_serde_shape() {
        let op = TagOp::new("PatientID", TagAction::Replace { value: "X".into() });
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["tag"], "PatientID");
        assert_eq!(json["action"], "replace");
        assert_eq!(json["value"], "X");
        let back: TagOp = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }
}
