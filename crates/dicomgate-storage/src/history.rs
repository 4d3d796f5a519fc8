use chrono::Utc;
use dicomgate_types::{GatewayError, PipelineEvent};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

use crate::layout::AeLayout;

/// Per-day transfer event log: `history/<YYYY-MM-DD>.json`, a JSON array
/// appended read-modify-write. Day files are small (one entry per pipeline
/// event) so the rewrite is cheap.
#[derive(Debug, Clone)]
pub struct HistoryLog {
    layout: AeLayout,
}

impl HistoryLog {
    pub fn new(layout: AeLayout) -> Self {
        Self { layout }
    }

    fn day_file(&self, date: chrono::NaiveDate) -> PathBuf {
        self.layout
            .history_dir()
            .join(format!("{}.json", date.format("%Y-%m-%d")))
    }

    pub fn append(&self, event: &PipelineEvent) -> Result<(), GatewayError> {
        let path = self.day_file(Utc::now().date_naive());
        let mut entries: Vec<serde_json::Value> = if path.is_file() {
            serde_json::from_slice(&fs::read(&path)?)?
        } else {
            Vec::new()
        };
        entries.push(serde_json::to_value(event)?);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&entries)?)?;
        fs::rename(&tmp, &path)?;
        debug!(ae = %self.layout.ae_title(), event = event.name(), "history appended");
        Ok(())
    }

    pub fn read_day(
        &self,
        date: chrono::NaiveDate,
    ) -> Result<Vec<serde_json::Value>, GatewayError> {
        let path = self.day_file(date);
        if !path.is_file() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(&fs::read(&path)?)?)
    }
}
