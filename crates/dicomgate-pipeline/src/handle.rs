use dashmap::DashMap;
use dicomgate_adapters::HealthSnapshot;
use dicomgate_anonymizer::{Script, ScriptStore};
use dicomgate_broker::BrokerRegistry;
use dicomgate_config::{BrokerConfig, ConfigStore, DestinationConfig, RouteConfig};
use dicomgate_receiver::{ListenerStats, ListenerStatsSnapshot};
use dicomgate_storage::sidecar::{self, ReviewMetadata};
use dicomgate_storage::{StudyStage, TransferQuery, TransferStore};
use dicomgate_types::{DestinationResult, GatewayError, StudyState, TransferRecord};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use uuid::Uuid;

use crate::scheduler::Scheduler;
use crate::WorkItem;

/// Summary row of the failed-studies view.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FailedStudy {
    pub ae_title: String,
    pub study_uid: String,
    pub failure_reason: Option<String>,
}

/// The observable surface of the pipeline, which the (out-of-scope) REST
/// layer projects. Everything here is a typed in-process call.
pub struct PipelineHandle {
    scheduler: Arc<Scheduler>,
    scripts: Arc<ScriptStore>,
    brokers: Arc<BrokerRegistry>,
    listener_stats: Arc<DashMap<String, Arc<ListenerStats>>>,
    /// Coalesces rapid duplicate user-retry triggers per (ae, study)
    recent_retries: DashMap<(String, String), Instant>,
}

impl PipelineHandle {
    pub fn new(
        scheduler: Arc<Scheduler>,
        scripts: Arc<ScriptStore>,
        brokers: Arc<BrokerRegistry>,
        listener_stats: Arc<DashMap<String, Arc<ListenerStats>>>,
    ) -> Self {
        Self {
            scheduler,
            scripts,
            brokers,
            listener_stats,
            recent_retries: DashMap::new(),
        }
    }

    fn config(&self) -> &Arc<ConfigStore> {
        &self.scheduler.config
    }

    fn transfers(&self) -> &Arc<TransferStore> {
        &self.scheduler.transfers
    }

    // --- transfer records ------------------------------------------------

    pub fn query_transfers(&self, query: &TransferQuery) -> Vec<TransferRecord> {
        self.transfers().query(query)
    }

    pub fn transfer(&self, id: Uuid) -> Option<TransferRecord> {
        self.transfers().get(id)
    }

    pub fn active_transfers(&self) -> Vec<TransferRecord> {
        self.transfers().active()
    }

    /// Per-destination status for a study: the record when one exists,
    /// else the on-disk destination-status sidecar.
    pub fn destination_status(
        &self,
        ae_title: &str,
        study_uid: &str,
    ) -> Result<Vec<DestinationResult>, GatewayError> {
        if let Some(record) = self.transfers().latest_for_study(ae_title, study_uid) {
            return Ok(record.destinations);
        }
        let layout = self
            .scheduler
            .layouts
            .get(ae_title)
            .map(|l| l.value().clone())
            .ok_or_else(|| GatewayError::not_found("route", ae_title))?;
        let Some(stage) = layout.find_stage(study_uid) else {
            return Err(GatewayError::not_found("study", study_uid));
        };
        let dir = layout.study_dir(stage, study_uid);
        Ok(sidecar::read_destination_status(&dir)?
            .map(|f| f.destinations.into_values().collect())
            .unwrap_or_default())
    }

    // --- failed studies & retries ---------------------------------------

    pub fn failed_studies(&self, ae_title: &str) -> Result<Vec<FailedStudy>, GatewayError> {
        let layout = self
            .scheduler
            .layouts
            .get(ae_title)
            .map(|l| l.value().clone())
            .ok_or_else(|| GatewayError::not_found("route", ae_title))?;
        let mut out = Vec::new();
        for study_uid in layout.list_stage(StudyStage::Failed)? {
            let dir = layout.study_dir(StudyStage::Failed, &study_uid);
            out.push(FailedStudy {
                ae_title: ae_title.to_string(),
                study_uid,
                failure_reason: sidecar::read_failure_reason(&dir),
            });
        }
        Ok(out)
    }

    /// User retry of a failed study: back to `processing/` and through the
    /// full plan. Duplicate triggers within one second coalesce.
    pub async fn retry_study(&self, ae_title: &str, study_uid: &str) -> Result<bool, GatewayError> {
        let key = (ae_title.to_string(), study_uid.to_string());
        let now = Instant::now();
        if let Some(last) = self.recent_retries.get(&key) {
            if now.duration_since(*last.value()) < Duration::from_secs(1) {
                info!(ae = ae_title, study = study_uid, "retry coalesced");
                return Ok(false);
            }
        }
        self.recent_retries.insert(key, now);

        let layout = self
            .scheduler
            .layouts
            .get(ae_title)
            .map(|l| l.value().clone())
            .ok_or_else(|| GatewayError::not_found("route", ae_title))?;
        match layout.find_stage(study_uid) {
            Some(StudyStage::Failed) => {
                let dir =
                    layout.transition(study_uid, StudyStage::Failed, StudyStage::Processing)?;
                if let Some(mut manifest) = sidecar::read_study_manifest(&dir)? {
                    manifest.study.transition(StudyState::Processing);
                    sidecar::write_study_manifest(&dir, &manifest)?;
                }
            }
            Some(StudyStage::Processing) => {}
            Some(other) => {
                return Err(GatewayError::config(format!(
                    "study {} is in {}, not retriable",
                    study_uid,
                    other.dir_name()
                )))
            }
            None => return Err(GatewayError::not_found("study", study_uid)),
        }

        if let Some(registry) = self.scheduler.registries.get(ae_title) {
            registry.in_flight().fetch_add(1, Ordering::SeqCst);
        }
        self.scheduler
            .work_tx
            .send(WorkItem::ProcessStudy {
                ae_title: ae_title.to_string(),
                study_uid: study_uid.to_string(),
            })
            .await
            .map_err(|_| GatewayError::protocol("scheduler is not running"))?;
        info!(ae = ae_title, study = study_uid, "user retry enqueued");
        Ok(true)
    }

    pub async fn retry_all_failed(&self, ae_title: &str) -> Result<usize, GatewayError> {
        let failed = self.failed_studies(ae_title)?;
        let mut retried = 0;
        for study in failed {
            if self.retry_study(ae_title, &study.study_uid).await? {
                retried += 1;
            }
        }
        Ok(retried)
    }

    // --- health & stats ---------------------------------------------------

    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.scheduler.health.snapshot()
    }

    /// Per-route association counters.
    pub fn listener_stats(&self) -> Vec<(String, ListenerStatsSnapshot)> {
        let mut stats: Vec<_> = self
            .listener_stats
            .iter()
            .map(|e| (e.key().clone(), e.value().snapshot()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }

    // --- review ----------------------------------------------------------

    pub fn pending_reviews(&self, ae_title: &str) -> Result<Vec<ReviewMetadata>, GatewayError> {
        self.scheduler.review.pending(ae_title)
    }

    pub async fn approve_review(
        &self,
        ae_title: &str,
        review_id: &str,
        user: &str,
        notes: Option<String>,
    ) -> Result<(), GatewayError> {
        self.scheduler
            .review
            .approve(ae_title, review_id, user, notes)
            .await
    }

    pub fn reject_review(
        &self,
        ae_title: &str,
        review_id: &str,
        user: &str,
        reason: &str,
    ) -> Result<(), GatewayError> {
        self.scheduler.review.reject(ae_title, review_id, user, reason)
    }

    // --- storage browse --------------------------------------------------

    /// List a directory under one AE's tree, restricted to the data root.
    pub fn browse(
        &self,
        ae_title: &str,
        relative: &str,
    ) -> Result<Vec<(String, bool)>, GatewayError> {
        let layout = self
            .scheduler
            .layouts
            .get(ae_title)
            .map(|l| l.value().clone())
            .ok_or_else(|| GatewayError::not_found("route", ae_title))?;
        layout.browse(relative)
    }

    pub fn soft_delete_study(
        &self,
        ae_title: &str,
        study_uid: &str,
        prefix: &str,
    ) -> Result<(), GatewayError> {
        let layout = self
            .scheduler
            .layouts
            .get(ae_title)
            .map(|l| l.value().clone())
            .ok_or_else(|| GatewayError::not_found("route", ae_title))?;
        let stage = layout
            .find_stage(study_uid)
            .ok_or_else(|| GatewayError::not_found("study", study_uid))?;
        layout.soft_delete(study_uid, stage, prefix)?;
        info!(ae = ae_title, study = study_uid, "study soft-deleted");
        Ok(())
    }

    // --- scripts ---------------------------------------------------------

    pub fn list_scripts(&self) -> Result<Vec<Script>, GatewayError> {
        self.scripts.list()
    }

    pub fn get_script(&self, name: &str) -> Result<Script, GatewayError> {
        self.scripts.get(name)
    }

    pub fn save_script(&self, script: Script) -> Result<(), GatewayError> {
        self.scripts.save(script)
    }

    pub fn delete_script(&self, name: &str) -> Result<(), GatewayError> {
        self.scripts.delete(name)
    }

    // --- brokers ---------------------------------------------------------

    pub async fn test_broker(&self, name: &str) -> Result<(), GatewayError> {
        self.brokers.test(name).await
    }

    pub fn clear_broker_cache(&self, name: &str) {
        self.brokers.clear_cache(name)
    }

    /// One-off lookup for the admin test surface.
    pub async fn broker_lookup(
        &self,
        name: &str,
        input_id: &str,
    ) -> Result<String, GatewayError> {
        self.brokers
            .get(name)?
            .lookup(input_id, dicomgate_broker::IdType::PatientId)
            .await
    }

    /// Back up a local broker's database file.
    pub fn backup_broker(
        &self,
        name: &str,
        target: &std::path::Path,
    ) -> Result<(), GatewayError> {
        self.brokers.local(name)?.backup(target)
    }

    /// Restore a local broker from a backup file.
    pub fn restore_broker(
        &self,
        name: &str,
        source: &std::path::Path,
    ) -> Result<(), GatewayError> {
        self.brokers.local(name)?.restore(source)
    }

    /// Export a local broker's mappings as CSV; returns the row count.
    pub fn export_broker_csv(
        &self,
        name: &str,
        target: &std::path::Path,
    ) -> Result<usize, GatewayError> {
        self.brokers.local(name)?.export_csv(target)
    }

    /// Purge a local broker's audit log rows past retention.
    pub fn cleanup_broker_logs(
        &self,
        name: &str,
        retention_days: i64,
    ) -> Result<usize, GatewayError> {
        self.brokers.local(name)?.cleanup_logs(retention_days)
    }

    // --- OCR scan surface -------------------------------------------------

    /// Run burned-in text detection on one stored study's first instance
    /// and return the reported regions.
    pub async fn scan_pixel_phi(
        &self,
        ae_title: &str,
        study_uid: &str,
    ) -> Result<Vec<dicomgate_anonymizer::OcrRegion>, GatewayError> {
        let Some(ocr) = self.scheduler.ocr.clone() else {
            return Err(GatewayError::config("no OCR service configured"));
        };
        let layout = self
            .scheduler
            .layouts
            .get(ae_title)
            .map(|l| l.value().clone())
            .ok_or_else(|| GatewayError::not_found("route", ae_title))?;
        let stage = layout
            .find_stage(study_uid)
            .ok_or_else(|| GatewayError::not_found("study", study_uid))?;
        let files = layout.study_files(stage, study_uid)?;
        let Some(first) = files.first() else {
            return Ok(Vec::new());
        };
        ocr.detect_regions(first).await
    }

    // --- configuration passthrough ---------------------------------------

    pub fn routes(&self) -> Vec<RouteConfig> {
        self.config().snapshot().routes.clone()
    }

    pub fn destinations(&self) -> Vec<DestinationConfig> {
        self.config().snapshot().destinations.clone()
    }

    pub fn brokers_config(&self) -> Vec<BrokerConfig> {
        self.config().snapshot().brokers.clone()
    }

    pub fn upsert_route(&self, route: RouteConfig) -> Result<(), GatewayError> {
        self.config()
            .upsert_route(route)
            .map_err(|e| GatewayError::config(e.to_string()))
    }

    pub fn delete_route(&self, ae_title: &str) -> Result<(), GatewayError> {
        self.config()
            .delete_route(ae_title)
            .map_err(|e| GatewayError::config(e.to_string()))
    }

    pub fn upsert_destination(&self, dest: DestinationConfig) -> Result<(), GatewayError> {
        self.config()
            .upsert_destination(dest)
            .map_err(|e| GatewayError::config(e.to_string()))
    }

    pub fn delete_destination(&self, name: &str) -> Result<(), GatewayError> {
        self.config()
            .delete_destination(name)
            .map_err(|e| GatewayError::config(e.to_string()))
    }

    pub fn upsert_broker(&self, broker: BrokerConfig) -> Result<(), GatewayError> {
        self.config()
            .upsert_broker(broker)
            .map_err(|e| GatewayError::config(e.to_string()))
    }

    pub fn delete_broker(&self, name: &str) -> Result<(), GatewayError> {
        self.config()
            .delete_broker(name)
            .map_err(|e| GatewayError::config(e.to_string()))
    }

    /// Prune coalescing entries older than a minute; called opportunistically.
    pub fn prune_retry_guards(&self) {
        let cutoff = Instant::now() - Duration::from_secs(60);
        self.recent_retries.retain(|_, at| *at > cutoff);
    }
}
