use chrono::{NaiveDate, Utc};
use dicomgate_types::GatewayError;
use std::fs;
use tracing::{info, warn};

use crate::layout::{AeLayout, StudyStage};

/// Retention policy applied by the periodic cleanup pass. A negative value
/// disables the corresponding purge.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub history_days: i64,
    pub archive_days: i64,
    pub deleted_days: i64,
}

/// Purges archives, soft-deleted studies and history files past retention.
#[derive(Debug, Clone)]
pub struct RetentionCleaner {
    layout: AeLayout,
    policy: RetentionPolicy,
}

impl RetentionCleaner {
    pub fn new(layout: AeLayout, policy: RetentionPolicy) -> Self {
        Self { layout, policy }
    }

    /// One cleanup pass. Returns the number of entries removed.
    pub fn run_once(&self) -> Result<usize, GatewayError> {
        let mut removed = 0;
        removed += self.purge_archive()?;
        removed += self.purge_deleted()?;
        removed += self.purge_history()?;
        if removed > 0 {
            info!(ae = %self.layout.ae_title(), removed, "retention cleanup pass");
        }
        Ok(removed)
    }

    fn purge_archive(&self) -> Result<usize, GatewayError> {
        if self.policy.archive_days < 0 {
            return Ok(0);
        }
        let cutoff = Utc::now().date_naive() - chrono::Duration::days(self.policy.archive_days);
        let dir = self.layout.archive_dir();
        let mut removed = 0;
        if !dir.is_dir() {
            return Ok(0);
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            match NaiveDate::parse_from_str(&name, "%Y-%m-%d") {
                Ok(date) if date < cutoff => {
                    fs::remove_dir_all(entry.path())?;
                    removed += 1;
                }
                Ok(_) => {}
                Err(_) => warn!(ae = %self.layout.ae_title(), dir = %name, "unparseable archive folder name"),
            }
        }
        Ok(removed)
    }

    fn purge_deleted(&self) -> Result<usize, GatewayError> {
        if self.policy.deleted_days < 0 {
            return Ok(0);
        }
        let cutoff = Utc::now() - chrono::Duration::days(self.policy.deleted_days);
        let dir = self.layout.stage_dir(StudyStage::Deleted);
        let mut removed = 0;
        if !dir.is_dir() {
            return Ok(0);
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            // name shape: <prefix>_<YYYYmmddHHMMSS>_<study>
            let name = entry.file_name().to_string_lossy().into_owned();
            let stamp = name.split('_').nth(1).unwrap_or("");
            match chrono::NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S") {
                Ok(dt) if dt.and_utc() < cutoff => {
                    fs::remove_dir_all(entry.path())?;
                    removed += 1;
                }
                _ => {}
            }
        }
        Ok(removed)
    }

    fn purge_history(&self) -> Result<usize, GatewayError> {
        if self.policy.history_days < 0 {
            return Ok(0);
        }
        let cutoff = Utc::now().date_naive() - chrono::Duration::days(self.policy.history_days);
        let dir = self.layout.history_dir();
        let mut removed = 0;
        if !dir.is_dir() {
            return Ok(0);
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            if let Ok(date) = NaiveDate::parse_from_str(stem, "%Y-%m-%d") {
                if date < cutoff {
                    fs::remove_file(entry.path())?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cleaner(policy: RetentionPolicy) -> (TempDir, RetentionCleaner, AeLayout) {
        let tmp = TempDir::new().unwrap();
        let layout = AeLayout::new(tmp.path(), "INGEST");
        layout.ensure().unwrap();
        (tmp, RetentionCleaner::new(layout.clone(), policy), layout)
    }

    #[test]
    fn test_old_archive_purged() {
        let (_tmp, cleaner, layout) = cleaner(RetentionPolicy {
            history_days: -1,
            archive_days: 30,
            deleted_days: -1,
        });
        let old = layout.archive_dir().join("2020-01-01");
        let fresh = layout
            .archive_dir()
            .join(Utc::now().date_naive().format("%Y-%m-%d").to_string());
        fs::create_dir_all(&old).unwrap();
        fs::create_dir_all(&fresh).unwrap();

        assert_eq!(cleaner.run_once().unwrap(), 1);
        assert!(!old.exists());
        assert!(fresh.exists());
    }

    #[test]
    fn test_negative_retention_disables() {
        let (_tmp, cleaner, layout) = cleaner(RetentionPolicy {
            history_days: -1,
            archive_days: -1,
            deleted_days: -1,
        });
        fs::create_dir_all(layout.archive_dir().join("2020-01-01")).unwrap();
        fs::write(layout.history_dir().join("2020-01-01.json"), b"[]").unwrap();
        assert_eq!(cleaner.run_once().unwrap(), 0);
    }

    #[test]
    fn test_old_history_purged() {
        let (_tmp, cleaner, layout) = cleaner(RetentionPolicy {
            history_days: 7,
            archive_days: -1,
            deleted_days: -1,
        });
        fs::write(layout.history_dir().join("2020-01-01.json"), b"[]").unwrap();
        let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();
        fs::write(layout.history_dir().join(format!("{}.json", today)), b"[]").unwrap();
        assert_eq!(cleaner.run_once().unwrap(), 1);
    }

    #[test]
    fn test_old_deleted_purged() {
        let (_tmp, cleaner, layout) = cleaner(RetentionPolicy {
            history_days: -1,
            archive_days: -1,
            deleted_days: 14,
        });
        let old = layout
            .stage_dir(StudyStage::Deleted)
            .join("manual_20200101000000_1.2.3");
        fs::create_dir_all(&old).unwrap();
        assert_eq!(cleaner.run_once().unwrap(), 1);
        assert!(!old.exists());
    }
}
