use async_trait::async_trait;
use dicomgate_types::{SendReport, TransportError};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::pattern::render_pattern;
use crate::{DestinationAdapter, SendContext};

/// Filesystem sink configuration.
#[derive(Debug, Clone)]
pub struct FilesystemConfig {
    pub name: String,
    pub base_path: PathBuf,
    pub create_subdirs: bool,
    /// `{Keyword}` template over DICOM tag values
    pub naming_pattern: String,
}

/// Copies study files into a directory tree derived from tag values.
pub struct FilesystemAdapter {
    config: FilesystemConfig,
}

impl FilesystemAdapter {
    pub fn new(config: FilesystemConfig) -> Self {
        Self { config }
    }

    fn target_dir(&self, ctx: &SendContext) -> PathBuf {
        if !self.config.create_subdirs {
            return self.config.base_path.clone();
        }
        let rendered = render_pattern(&self.config.naming_pattern, &ctx.tag_values);
        let mut dir = self.config.base_path.clone();
        for component in rendered.split('/').filter(|c| !c.is_empty()) {
            dir.push(component);
        }
        dir
    }

    fn copy_blocking(
        files: &[PathBuf],
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<usize, TransportError> {
        std::fs::create_dir_all(target).map_err(classify_io)?;
        let mut copied = 0;
        for file in files {
            if cancel.is_cancelled() {
                return Err(TransportError::transient("send cancelled"));
            }
            let name = file
                .file_name()
                .ok_or_else(|| TransportError::permanent(format!("bad file name {}", file.display())))?;
            std::fs::copy(file, target.join(name)).map_err(classify_io)?;
            copied += 1;
        }
        Ok(copied)
    }
}

/// Disk-full and permission problems clear up when an operator intervenes,
/// so they stay retryable; anything else is permanent.
fn classify_io(e: std::io::Error) -> TransportError {
    let transient = matches!(e.kind(), std::io::ErrorKind::PermissionDenied)
        || e.raw_os_error() == Some(28); // ENOSPC
    if transient {
        TransportError::transient(format!("filesystem write failed: {}", e))
    } else {
        TransportError::permanent(format!("filesystem write failed: {}", e))
    }
}

#[async_trait]
impl DestinationAdapter for FilesystemAdapter {
    fn name(&self) -> &str {
        &self.config.name
    }

    /// Writable-directory probe.
    async fn echo(&self, _cancel: &CancellationToken) -> bool {
        let base = self.config.base_path.clone();
        tokio::task::spawn_blocking(move || {
            if std::fs::create_dir_all(&base).is_err() {
                return false;
            }
            let probe = base.join(".dicomgate-probe");
            let ok = std::fs::write(&probe, b"probe").is_ok();
            let _ = std::fs::remove_file(&probe);
            ok
        })
        .await
        .unwrap_or(false)
    }

    async fn send_study(
        &self,
        files: &[PathBuf],
        ctx: &SendContext,
        cancel: &CancellationToken,
    ) -> Result<SendReport, TransportError> {
        let started = Instant::now();
        let target = self.target_dir(ctx);
        debug!(destination = %self.config.name, target = %target.display(), "copying study");

        let files_owned = files.to_vec();
        let cancel = cancel.clone();
        let copied = tokio::task::spawn_blocking(move || {
            Self::copy_blocking(&files_owned, &target, &cancel)
        })
        .await
        .map_err(|e| TransportError::permanent(format!("copy task failed: {}", e)))??;

        info!(destination = %self.config.name, files = copied, "study copied");
        Ok(SendReport::success(copied, started.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ctx_with_tags(pairs: &[(&str, &str)]) -> SendContext {
        SendContext {
            study_uid: "1.2.3".into(),
            tag_values: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_copies_into_pattern_dirs() {
        let tmp = tempfile::TempDir::new().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        let file = src.join("a.dcm");
        std::fs::write(&file, b"DICM").unwrap();

        let adapter = FilesystemAdapter::new(FilesystemConfig {
            name: "fs1".into(),
            base_path: tmp.path().join("sink"),
            create_subdirs: true,
            naming_pattern: "{PatientID}/{StudyDate}".into(),
        });
        let ctx = ctx_with_tags(&[("PatientID", "P1"), ("StudyDate", "20260115")]);
        let report = adapter
            .send_study(&[file], &ctx, &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.success);
        assert!(tmp.path().join("sink/P1/20260115/a.dcm").is_file());
    }

    #[tokio::test]
    async fn test_flat_copy_without_subdirs() {
        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("a.dcm");
        std::fs::write(&file, b"DICM").unwrap();

        let adapter = FilesystemAdapter::new(FilesystemConfig {
            name: "fs1".into(),
            base_path: tmp.path().join("sink"),
            create_subdirs: false,
            naming_pattern: "{PatientID}".into(),
        });
        adapter
            .send_study(
                &[file],
                &ctx_with_tags(&[("PatientID", "P1")]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(tmp.path().join("sink/a.dcm").is_file());
        assert!(!tmp.path().join("sink/P1").exists());
    }

    #[tokio::test]
    async fn test_echo_probes_writability() {
        let tmp = tempfile::TempDir::new().unwrap();
        let adapter = FilesystemAdapter::new(FilesystemConfig {
            name: "fs1".into(),
            base_path: tmp.path().join("sink"),
            create_subdirs: true,
            naming_pattern: "{PatientID}".into(),
        });
        assert!(adapter.echo(&CancellationToken::new()).await);
    }
}
