use chrono::Utc;
use dicomgate_types::GatewayError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Top-level stage directories of the per-AE tree. A study directory lives
/// in exactly one stage at any instant; moves between stages are atomic
/// renames so a crash can never leave a study in two places.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StudyStage {
    Incoming,
    Processing,
    Completed,
    Failed,
    Deleted,
    ReviewPending,
    ReviewRejected,
}

impl StudyStage {
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
            Self::ReviewPending => "review/pending",
            Self::ReviewRejected => "review/rejected",
        }
    }

    pub fn all() -> [StudyStage; 7] {
        [
            Self::Incoming,
            Self::Processing,
            Self::Completed,
            Self::Failed,
            Self::Deleted,
            Self::ReviewPending,
            Self::ReviewRejected,
        ]
    }
}

/// Owner of one AE's directory tree under the data root.
#[derive(Debug, Clone)]
pub struct AeLayout {
    root: PathBuf,
    ae_title: String,
}

impl AeLayout {
    pub fn new(data_root: impl AsRef<Path>, ae_title: impl Into<String>) -> Self {
        let ae_title = ae_title.into();
        Self {
            root: data_root.as_ref().join(&ae_title),
            ae_title,
        }
    }

    pub fn ae_title(&self) -> &str {
        &self.ae_title
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the mandatory directory tree.
    pub fn ensure(&self) -> Result<(), GatewayError> {
        for stage in StudyStage::all() {
            fs::create_dir_all(self.stage_dir(stage))?;
        }
        fs::create_dir_all(self.root.join("archive"))?;
        fs::create_dir_all(self.root.join("history"))?;
        fs::create_dir_all(self.root.join("logs"))?;
        debug!(ae = %self.ae_title, root = %self.root.display(), "layout ensured");
        Ok(())
    }

    pub fn stage_dir(&self, stage: StudyStage) -> PathBuf {
        self.root.join(stage.dir_name())
    }

    /// Directory of a study (or review id) within a stage.
    pub fn study_dir(&self, stage: StudyStage, id: &str) -> PathBuf {
        self.stage_dir(stage).join(id)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join("archive")
    }

    pub fn history_dir(&self) -> PathBuf {
        self.root.join("history")
    }

    /// Atomic move of a study directory between stages.
    ///
    /// A rename failure is fatal for the study: it stays in the source
    /// stage and the next startup scan re-attempts the transition.
    pub fn transition(
        &self,
        id: &str,
        from: StudyStage,
        to: StudyStage,
    ) -> Result<PathBuf, GatewayError> {
        self.transition_as(id, from, to, id)
    }

    /// Atomic move that also renames the directory (review ids, soft
    /// deletion).
    pub fn transition_as(
        &self,
        id: &str,
        from: StudyStage,
        to: StudyStage,
        new_id: &str,
    ) -> Result<PathBuf, GatewayError> {
        let src = self.study_dir(from, id);
        let dst = self.study_dir(to, new_id);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&src, &dst).map_err(|source| GatewayError::StateTransition {
            study_uid: id.to_string(),
            from: from.dir_name().to_string(),
            to: to.dir_name().to_string(),
            source,
        })?;
        info!(
            ae = %self.ae_title,
            study = id,
            from = from.dir_name(),
            to = to.dir_name(),
            "stage transition"
        );
        Ok(dst)
    }

    /// Soft-delete: move into `deleted/` under a
    /// `<prefix>_<timestamp>_<study>` name subject to deleted-retention.
    pub fn soft_delete(
        &self,
        id: &str,
        from: StudyStage,
        prefix: &str,
    ) -> Result<PathBuf, GatewayError> {
        let stamped = format!("{}_{}_{}", prefix, Utc::now().format("%Y%m%d%H%M%S"), id);
        self.transition_as(id, from, StudyStage::Deleted, &stamped)
    }

    /// Locate the stage currently holding the study, if any.
    pub fn find_stage(&self, id: &str) -> Option<StudyStage> {
        StudyStage::all()
            .into_iter()
            .find(|stage| self.study_dir(*stage, id).is_dir())
    }

    /// Study (or review) ids currently resident in a stage.
    pub fn list_stage(&self, stage: StudyStage) -> Result<Vec<String>, GatewayError> {
        let dir = self.stage_dir(stage);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// DICOM files of a study directory, sorted for stable ordering.
    /// Sidecars and the `anonymized/` staging subtree are excluded.
    pub fn study_files(&self, stage: StudyStage, id: &str) -> Result<Vec<PathBuf>, GatewayError> {
        let dir = self.study_dir(stage, id);
        let mut files = Vec::new();
        if !dir.is_dir() {
            return Ok(files);
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_file()
                && path.extension().map(|e| e == "dcm").unwrap_or(false)
            {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Anonymized copies staged per script under the study directory.
    pub fn anonymized_dir(&self, stage: StudyStage, id: &str, script: &str) -> PathBuf {
        self.study_dir(stage, id).join("anonymized").join(script)
    }

    pub fn anonymized_files(
        &self,
        stage: StudyStage,
        id: &str,
        script: &str,
    ) -> Result<Vec<PathBuf>, GatewayError> {
        let dir = self.anonymized_dir(stage, id, script);
        let mut files = Vec::new();
        if !dir.is_dir() {
            return Ok(files);
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Guard against path escape for the storage-browse surface.
    pub fn browse(&self, relative: &str) -> Result<Vec<(String, bool)>, GatewayError> {
        let candidate = self.root.join(relative);
        let canonical = candidate.canonicalize().unwrap_or(candidate);
        let root = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());
        if !canonical.starts_with(&root) {
            warn!(ae = %self.ae_title, path = relative, "browse outside data root refused");
            return Err(GatewayError::not_found("path", relative));
        }
        let mut entries = Vec::new();
        for entry in fs::read_dir(&canonical)? {
            let entry = entry?;
            entries.push((
                entry.file_name().to_string_lossy().into_owned(),
                entry.file_type()?.is_dir(),
            ));
        }
        entries.sort();
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn layout() -> (TempDir, AeLayout) {
        let tmp = TempDir::new().unwrap();
        let layout = AeLayout::new(tmp.path(), "INGEST");
        layout.ensure().unwrap();
        (tmp, layout)
    }

    fn seed_study(layout: &AeLayout, stage: StudyStage, uid: &str) {
        let dir = layout.study_dir(stage, uid);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("a.dcm"), b"x").unwrap();
    }

    #[test]
    fn test_study_in_exactly_one_stage() {
        let (_tmp, layout) = layout();
        seed_study(&layout, StudyStage::Incoming, "1.2.3");
        assert_eq!(layout.find_stage("1.2.3"), Some(StudyStage::Incoming));

        layout
            .transition("1.2.3", StudyStage::Incoming, StudyStage::Processing)
            .unwrap();
        assert_eq!(layout.find_stage("1.2.3"), Some(StudyStage::Processing));
        assert!(!layout.study_dir(StudyStage::Incoming, "1.2.3").exists());

        let present: Vec<_> = StudyStage::all()
            .into_iter()
            .filter(|s| layout.study_dir(*s, "1.2.3").is_dir())
            .collect();
        assert_eq!(present.len(), 1);
    }

    #[test]
    fn test_failed_transition_leaves_source() {
        let (_tmp, layout) = layout();
        // no source directory
        let err = layout
            .transition("9.9.9", StudyStage::Incoming, StudyStage::Processing)
            .unwrap_err();
        assert!(matches!(err, GatewayError::StateTransition { .. }));
    }

    #[test]
    fn test_soft_delete_stamps_name() {
        let (_tmp, layout) = layout();
        seed_study(&layout, StudyStage::Completed, "1.2.3");
        let dst = layout
            .soft_delete("1.2.3", StudyStage::Completed, "manual")
            .unwrap();
        let name = dst.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("manual_"));
        assert!(name.ends_with("_1.2.3"));
        assert_eq!(layout.list_stage(StudyStage::Deleted).unwrap().len(), 1);
    }

    #[test]
    fn test_study_files_excludes_sidecars() {
        let (_tmp, layout) = layout();
        seed_study(&layout, StudyStage::Processing, "1.2.3");
        let dir = layout.study_dir(StudyStage::Processing, "1.2.3");
        fs::write(dir.join("b.dcm"), b"y").unwrap();
        fs::write(dir.join("destination_status.json"), b"{}").unwrap();
        fs::create_dir_all(dir.join("anonymized/basic")).unwrap();
        fs::write(dir.join("anonymized/basic/a.dcm"), b"z").unwrap();

        let files = layout.study_files(StudyStage::Processing, "1.2.3").unwrap();
        assert_eq!(files.len(), 2);
        let anon = layout
            .anonymized_files(StudyStage::Processing, "1.2.3", "basic")
            .unwrap();
        assert_eq!(anon.len(), 1);
    }

    #[test]
    fn test_browse_refuses_escape() {
        let (_tmp, layout) = layout();
        assert!(layout.browse("../..").is_err());
        assert!(layout.browse("incoming").is_ok());
    }
}
