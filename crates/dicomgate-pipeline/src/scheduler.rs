use chrono::Utc;
use dashmap::{DashMap, DashSet};
use dicomgate_adapters::{AdapterRegistry, HealthMonitor, SendContext};
use dicomgate_anonymizer::engine::BrokerBinding;
use dicomgate_anonymizer::ocr::regions_to_ops;
use dicomgate_anonymizer::{AnonymizeContext, Anonymizer, AuditReport, OcrClient, ScriptStore};
use dicomgate_broker::BrokerRegistry;
use dicomgate_config::{ConfigStore, RouteConfig, RouteDestinationConfig};
use dicomgate_receiver::{StudyCompletion, StudyRegistry};
use dicomgate_storage::archive::ArchiveMetadata;
use dicomgate_storage::sidecar::{self, DestinationStatusFile, StudyManifest};
use dicomgate_storage::{AeLayout, ArchiveWriter, StudyStage, TransferStore};
use dicomgate_types::{
    DestinationResult, DestinationStatus, GatewayError, PipelineEvent, RetryTask, Study,
    StudyState, TransferRecord, TransferStatus,
};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::retry::RetryManager;
use crate::review::ReviewGate;
use crate::WorkItem;

/// Per-route worker pools driving the study state machine.
///
/// All work — fresh completions, review approvals, per-destination
/// retries, user retries — arrives as [`WorkItem`]s on one channel per
/// route, so every study mutation happens on a route worker and no two
/// transitions for the same study are ever in flight together.
pub struct Scheduler {
    pub(crate) config: Arc<ConfigStore>,
    pub(crate) layouts: Arc<DashMap<String, AeLayout>>,
    pub(crate) registries: Arc<DashMap<String, Arc<StudyRegistry>>>,
    pub(crate) transfers: Arc<TransferStore>,
    adapters: Arc<AdapterRegistry>,
    brokers: Arc<BrokerRegistry>,
    scripts: Arc<ScriptStore>,
    anonymizer: Arc<Anonymizer>,
    pub(crate) ocr: Option<Arc<OcrClient>>,
    pub(crate) health: Arc<HealthMonitor>,
    pub(crate) retry: Arc<RetryManager>,
    pub(crate) review: Arc<ReviewGate>,
    pub(crate) events: broadcast::Sender<PipelineEvent>,
    /// Intake channel feeding the dispatcher; used by the recovery scan
    /// and the user-retry surface
    pub(crate) work_tx: mpsc::Sender<WorkItem>,
    /// (study, destination) pairs with an attempt in flight
    in_flight_sends: Arc<DashSet<(String, String)>>,
    /// Serializes sidecar/record updates per study
    study_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Per-route transfer concurrency bound
    semaphores: DashMap<String, Arc<Semaphore>>,
}

#[allow(clippy::too_many_arguments)]
impl Scheduler {
    pub fn new(
        config: Arc<ConfigStore>,
        layouts: Arc<DashMap<String, AeLayout>>,
        registries: Arc<DashMap<String, Arc<StudyRegistry>>>,
        transfers: Arc<TransferStore>,
        adapters: Arc<AdapterRegistry>,
        brokers: Arc<BrokerRegistry>,
        scripts: Arc<ScriptStore>,
        anonymizer: Arc<Anonymizer>,
        ocr: Option<Arc<OcrClient>>,
        health: Arc<HealthMonitor>,
        retry: Arc<RetryManager>,
        review: Arc<ReviewGate>,
        events: broadcast::Sender<PipelineEvent>,
        work_tx: mpsc::Sender<WorkItem>,
        in_flight_sends: Arc<DashSet<(String, String)>>,
    ) -> Self {
        Self {
            config,
            layouts,
            registries,
            transfers,
            adapters,
            brokers,
            scripts,
            anonymizer,
            ocr,
            health,
            retry,
            review,
            events,
            work_tx,
            in_flight_sends,
            study_locks: DashMap::new(),
            semaphores: DashMap::new(),
        }
    }

    fn layout(&self, ae_title: &str) -> Result<AeLayout, GatewayError> {
        self.layouts
            .get(ae_title)
            .map(|l| l.value().clone())
            .ok_or_else(|| GatewayError::not_found("route", ae_title))
    }

    fn route(&self, ae_title: &str) -> Result<RouteConfig, GatewayError> {
        self.config
            .snapshot()
            .route(ae_title)
            .cloned()
            .ok_or_else(|| GatewayError::not_found("route", ae_title))
    }

    fn semaphore(&self, route: &RouteConfig) -> Arc<Semaphore> {
        self.semaphores
            .entry(route.ae_title.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(route.max_concurrent_transfers.max(1))))
            .clone()
    }

    fn study_lock(&self, study_uid: &str) -> Arc<Mutex<()>> {
        self.study_locks
            .entry(study_uid.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release_slot(&self, ae_title: &str) {
        if let Some(registry) = self.registries.get(ae_title) {
            registry.in_flight().fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Spawn the dispatcher and the per-route worker pools. Work items
    /// flow: completion watchdogs and the retry manager/review gate feed
    /// the shared intake channels; the dispatcher fans out per route.
    pub fn start(
        self: &Arc<Self>,
        mut work_rx: mpsc::Receiver<WorkItem>,
        mut completions: mpsc::Receiver<StudyCompletion>,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        let mut route_txs: HashMap<String, mpsc::Sender<WorkItem>> = HashMap::new();

        for route in self
            .config
            .snapshot()
            .routes
            .iter()
            .filter(|r| r.enabled)
        {
            let (tx, rx) = mpsc::channel::<WorkItem>(256);
            route_txs.insert(route.ae_title.clone(), tx);
            let rx = Arc::new(Mutex::new(rx));
            for worker in 0..route.worker_threads.max(1) {
                let scheduler = self.clone();
                let rx = rx.clone();
                let cancel = cancel.clone();
                let ae = route.ae_title.clone();
                handles.push(tokio::spawn(async move {
                    debug!(ae = %ae, worker, "route worker started");
                    loop {
                        let item = {
                            let mut rx = rx.lock().await;
                            tokio::select! {
                                item = rx.recv() => item,
                                _ = cancel.cancelled() => None,
                            }
                        };
                        let Some(item) = item else { break };
                        scheduler.handle_item(item, &cancel).await;
                    }
                    debug!(ae = %ae, worker, "route worker stopped");
                }));
            }
        }

        let dispatcher_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    Some(completion) = completions.recv() => Some(WorkItem::ProcessStudy {
                        ae_title: completion.ae_title,
                        study_uid: completion.study_uid,
                    }),
                    Some(item) = work_rx.recv() => Some(item),
                    _ = dispatcher_cancel.cancelled() => None,
                    else => None,
                };
                let Some(item) = item else { break };
                let ae_title = match &item {
                    WorkItem::ProcessStudy { ae_title, .. }
                    | WorkItem::ForwardApproved { ae_title, .. }
                    | WorkItem::SendOne { ae_title, .. } => ae_title.clone(),
                };
                match route_txs.get(&ae_title) {
                    Some(tx) => {
                        if tx.send(item).await.is_err() {
                            break;
                        }
                    }
                    None => warn!(ae = %ae_title, "work item for unknown route dropped"),
                }
            }
        }));

        handles
    }

    async fn handle_item(self: &Arc<Self>, item: WorkItem, cancel: &CancellationToken) {
        let outcome = match item.clone() {
            WorkItem::ProcessStudy {
                ae_title,
                study_uid,
            } => self.process_study(&ae_title, &study_uid, cancel).await,
            WorkItem::ForwardApproved {
                ae_title,
                study_uid,
            } => self.forward_approved(&ae_title, &study_uid, cancel).await,
            WorkItem::SendOne {
                ae_title,
                study_uid,
                destination,
            } => {
                self.send_one_retry(&ae_title, &study_uid, &destination, cancel)
                    .await
            }
        };
        if let Err(e) = outcome {
            error!(?item, error = %e, "work item failed");
        }
    }

    /// Full plan for a study that just completed ingestion (or was
    /// recovered / user-retried back into `processing/`).
    async fn process_study(
        self: &Arc<Self>,
        ae_title: &str,
        study_uid: &str,
        cancel: &CancellationToken,
    ) -> Result<(), GatewayError> {
        let layout = self.layout(ae_title)?;
        let route = self.route(ae_title)?;

        match layout.find_stage(study_uid) {
            Some(StudyStage::Incoming) => {
                layout.transition(study_uid, StudyStage::Incoming, StudyStage::Processing)?;
            }
            Some(StudyStage::Processing) => {}
            other => {
                warn!(ae = ae_title, study = study_uid, ?other, "study not schedulable");
                self.release_slot(ae_title);
                return Ok(());
            }
        }
        let dir = layout.study_dir(StudyStage::Processing, study_uid);
        let mut manifest = sidecar::read_study_manifest(&dir)?.unwrap_or_else(|| StudyManifest {
            study: Study::new(study_uid, ae_title, "UNKNOWN"),
            destination_adds: Vec::new(),
            destination_removes: Vec::new(),
            rejected_instances: 0,
        });
        manifest.study.transition(StudyState::CompletedIncoming);
        manifest.study.transition(StudyState::Processing);
        sidecar::write_study_manifest(&dir, &manifest)?;

        let record_id = self.ensure_record(ae_title, &manifest)?;
        self.transfers.update(record_id, |r| {
            r.set_status(TransferStatus::Processing);
        })?;

        let plan = self.build_plan(&route, &manifest);
        info!(
            ae = ae_title,
            study = study_uid,
            destinations = plan.len(),
            review = route.review_required,
            "study plan materialized"
        );

        // anonymized copies, one per distinct script
        let mut reports: HashMap<String, AuditReport> = HashMap::new();
        let mut seen_scripts: Vec<String> = Vec::new();
        for rd in plan.iter().filter(|rd| rd.anonymize) {
            let Some(script_name) = rd.script.clone() else { continue };
            if seen_scripts.contains(&script_name) {
                continue;
            }
            seen_scripts.push(script_name.clone());

            manifest.study.transition(StudyState::Anonymizing);
            match self
                .run_anonymization(&layout, &route, &manifest, rd, &script_name)
                .await
            {
                Ok(report) => {
                    std::fs::write(
                        dir.join(format!("audit_report_{}.json", script_name)),
                        serde_json::to_vec_pretty(&report)?,
                    )?;
                    reports.insert(script_name, report);
                    manifest.study.transition(StudyState::Processing);
                }
                Err(e) => {
                    return self
                        .fail_study(
                            ae_title,
                            study_uid,
                            record_id,
                            StudyStage::Processing,
                            &format!("anonymization failed: {}", e),
                        )
                        .await;
                }
            }
        }
        sidecar::write_study_manifest(&dir, &manifest)?;

        if route.review_required {
            // destinations stay PENDING while the study awaits a decision
            self.transfers.update(record_id, |r| {
                for rd in &plan {
                    if r.destination(&rd.destination).is_none() {
                        r.destinations
                            .push(DestinationResult::pending(&rd.destination));
                    }
                }
            })?;
            let script = seen_scripts.first().map(String::as_str);
            let audit = script.and_then(|s| reports.get(s));
            self.review.submit(
                ae_title,
                study_uid,
                &manifest.study.source_ae,
                script,
                audit,
            )?;
            // the slot frees while a human decides
            self.release_slot(ae_title);
            return Ok(());
        }

        self.fan_out(&route, &layout, &manifest, record_id, &plan, cancel)
            .await;
        self.finalize(ae_title, study_uid, record_id, &manifest, &reports)
            .await
    }

    /// Resume after review approval: anonymization is already staged.
    async fn forward_approved(
        self: &Arc<Self>,
        ae_title: &str,
        study_uid: &str,
        cancel: &CancellationToken,
    ) -> Result<(), GatewayError> {
        let layout = self.layout(ae_title)?;
        let route = self.route(ae_title)?;
        let dir = layout.study_dir(StudyStage::Processing, study_uid);
        let Some(manifest) = sidecar::read_study_manifest(&dir)? else {
            warn!(ae = ae_title, study = study_uid, "approved study has no manifest");
            return Ok(());
        };
        if let Some(registry) = self.registries.get(ae_title) {
            registry.in_flight().fetch_add(1, Ordering::SeqCst);
        }
        let record_id = self.ensure_record(ae_title, &manifest)?;
        let plan = self.build_plan(&route, &manifest);
        self.fan_out(&route, &layout, &manifest, record_id, &plan, cancel)
            .await;
        self.finalize(ae_title, study_uid, record_id, &manifest, &HashMap::new())
            .await
    }

    /// Latest record for the study, or a fresh one.
    fn ensure_record(
        &self,
        ae_title: &str,
        manifest: &StudyManifest,
    ) -> Result<Uuid, GatewayError> {
        if let Some(existing) = self
            .transfers
            .latest_for_study(ae_title, &manifest.study.study_uid)
        {
            if !existing.status.is_terminal() {
                return Ok(existing.id);
            }
        }
        let record = TransferRecord::new(
            &manifest.study.study_uid,
            ae_title,
            &manifest.study.source_ae,
            manifest.study.file_count(),
            manifest.study.byte_total,
        );
        let id = record.id;
        self.transfers.put(record)?;
        Ok(id)
    }

    /// Materialize the send plan: enabled route destinations (with the
    /// study's routing-rule adds and removes applied), priority order.
    fn build_plan(
        &self,
        route: &RouteConfig,
        manifest: &StudyManifest,
    ) -> Vec<RouteDestinationConfig> {
        let snapshot = self.config.snapshot();
        let mut plan: Vec<RouteDestinationConfig> = route
            .destinations
            .iter()
            .filter(|rd| !manifest.destination_removes.contains(&rd.destination))
            .cloned()
            .collect();
        for added in &manifest.destination_adds {
            if plan.iter().any(|rd| &rd.destination == added) {
                continue;
            }
            plan.push(RouteDestinationConfig {
                destination: added.clone(),
                anonymize: false,
                script: None,
                project: None,
                subject: None,
                session: None,
                priority: u32::MAX,
                max_retries: None,
                retry_delay_seconds: None,
                broker: None,
                detect_pixel_phi: false,
            });
        }
        plan.retain(|rd| {
            snapshot
                .destination(&rd.destination)
                .map(|d| d.enabled())
                .unwrap_or(false)
        });
        plan.sort_by_key(|rd| rd.priority);
        plan
    }

    async fn run_anonymization(
        &self,
        layout: &AeLayout,
        route: &RouteConfig,
        manifest: &StudyManifest,
        rd: &RouteDestinationConfig,
        script_name: &str,
    ) -> Result<AuditReport, GatewayError> {
        let study_uid = &manifest.study.study_uid;
        let out_dir = layout.anonymized_dir(StudyStage::Processing, study_uid, script_name);
        let existing = layout.anonymized_files(StudyStage::Processing, study_uid, script_name)?;
        let files = layout.study_files(StudyStage::Processing, study_uid)?;
        if !existing.is_empty() && existing.len() >= files.len() {
            debug!(study = %study_uid, script = script_name, "anonymized copy already staged");
            return Ok(AuditReport::new(study_uid, script_name));
        }

        let script = self.scripts.get(script_name)?;
        let tag_values = tag_values_of(&manifest.study);

        let broker = match &rd.broker {
            Some(name) => {
                let snapshot = self.config.snapshot();
                let config = snapshot
                    .broker(name)
                    .ok_or_else(|| GatewayError::not_found("broker", name))?;
                Some(BrokerBinding {
                    broker: self.brokers.get(name)?,
                    date_shift: config.date_shift,
                    hash_uids: config.hash_uids,
                    uid_root: config.uid_root.clone(),
                })
            }
            None => None,
        };

        let mut pixel_ops = Vec::new();
        if rd.detect_pixel_phi {
            if let Some(ocr) = &self.ocr {
                let padding = self
                    .config
                    .snapshot()
                    .ocr
                    .as_ref()
                    .map(|o| o.region_padding)
                    .unwrap_or(4);
                if let Some(first) = files.first() {
                    match ocr.detect_regions(first).await {
                        Ok(regions) => pixel_ops = regions_to_ops(&regions, padding),
                        Err(e) => {
                            return Err(GatewayError::anonymization(format!(
                                "pixel PHI detection failed: {}",
                                e
                            )))
                        }
                    }
                }
            } else {
                warn!(route = %route.ae_title, "detect_pixel_phi set but no OCR service configured");
            }
        }

        let ctx = AnonymizeContext {
            broker,
            project: rd
                .project
                .as_deref()
                .map(|p| dicomgate_adapters::render_pattern(p, &tag_values)),
            subject: rd
                .subject
                .as_deref()
                .map(|p| dicomgate_adapters::render_pattern(p, &tag_values)),
            session: rd
                .session
                .as_deref()
                .map(|p| dicomgate_adapters::render_pattern(p, &tag_values)),
            pixel_ops,
        };

        self.anonymizer
            .anonymize_study(&script, study_uid, &files, &out_dir, &ctx)
            .await
    }

    /// Fan out to every planned destination, priority groups in order,
    /// equal priorities concurrently under the route's transfer bound.
    async fn fan_out(
        self: &Arc<Self>,
        route: &RouteConfig,
        layout: &AeLayout,
        manifest: &StudyManifest,
        record_id: Uuid,
        plan: &[RouteDestinationConfig],
        cancel: &CancellationToken,
    ) {
        let study_uid = manifest.study.study_uid.clone();
        {
            let _ = self.transfers.update(record_id, |r| {
                r.set_status(TransferStatus::Forwarding);
                for rd in plan {
                    if r.destination(&rd.destination).is_none() {
                        r.destinations
                            .push(DestinationResult::pending(&rd.destination));
                    }
                }
            });
        }

        let mut groups: Vec<(u32, Vec<RouteDestinationConfig>)> = Vec::new();
        for rd in plan {
            match groups.last_mut() {
                Some((priority, group)) if *priority == rd.priority => group.push(rd.clone()),
                _ => groups.push((rd.priority, vec![rd.clone()])),
            }
        }

        for (_priority, group) in groups {
            let mut tasks = Vec::new();
            for rd in group {
                let scheduler = self.clone();
                let route = route.clone();
                let layout = layout.clone();
                let manifest_study = manifest.study.clone();
                let cancel = cancel.clone();
                let study_uid = study_uid.clone();
                tasks.push(tokio::spawn(async move {
                    scheduler
                        .send_to_destination(
                            &route,
                            &layout,
                            &manifest_study,
                            record_id,
                            &rd,
                            StudyStage::Processing,
                            &study_uid,
                            &cancel,
                        )
                        .await;
                }));
            }
            for task in tasks {
                let _ = task.await;
            }
        }
    }

    /// One destination attempt, from availability gate through result
    /// persistence. Holds the (study, destination) in-flight guard.
    #[allow(clippy::too_many_arguments)]
    async fn send_to_destination(
        self: &Arc<Self>,
        route: &RouteConfig,
        layout: &AeLayout,
        study: &Study,
        record_id: Uuid,
        rd: &RouteDestinationConfig,
        stage: StudyStage,
        study_uid: &str,
        cancel: &CancellationToken,
    ) {
        let key = (study_uid.to_string(), rd.destination.clone());
        if !self.in_flight_sends.insert(key.clone()) {
            debug!(study = study_uid, destination = %rd.destination, "attempt already in flight");
            return;
        }

        let dir = layout.study_dir(stage, study_uid);
        let mut result = {
            let lock = self.study_lock(study_uid);
            let _guard = lock.lock().await;
            sidecar::read_destination_status(&dir)
                .ok()
                .flatten()
                .and_then(|f| f.destinations.get(&rd.destination).cloned())
                .unwrap_or_else(|| DestinationResult::pending(&rd.destination))
        };

        if matches!(
            result.status,
            DestinationStatus::Success | DestinationStatus::Skipped
        ) {
            debug!(study = study_uid, destination = %rd.destination, "destination already settled");
            self.in_flight_sends.remove(&key);
            return;
        }

        let resilience = self.config.snapshot().resilience.clone();
        let base_delay =
            Duration::from_secs(rd.retry_delay_seconds.unwrap_or(resilience.retry_delay_seconds));
        let max_delay = Duration::from_secs(resilience.max_retry_delay_seconds);
        let max_retries = rd.max_retries.unwrap_or(resilience.max_retries);

        if !self.health.is_available(&rd.destination) {
            // deferred, not attempted: the destination result stays
            // PENDING with the retry deadline
            result.status = DestinationStatus::Pending;
            result.message = Some("destination unavailable, deferred".into());
            if result.schedule_retry(base_delay, max_delay, max_retries) {
                let next = result.next_retry_at.expect("scheduled above");
                self.retry
                    .enqueue(RetryTask::new(
                        &route.ae_title,
                        study_uid,
                        &rd.destination,
                        next,
                    ))
                    .await;
                let _ = self.events.send(PipelineEvent::DestinationRetryScheduled {
                    ae_title: route.ae_title.clone(),
                    study_uid: study_uid.to_string(),
                    destination: rd.destination.clone(),
                    attempt: result.attempts,
                    next_retry_at: next,
                    at: Utc::now(),
                });
            } else {
                result.mark_failed("destination unavailable, retries exhausted", false);
            }
            self.persist_result(layout, stage, study_uid, record_id, &result)
                .await;
            self.in_flight_sends.remove(&key);
            return;
        }

        result.mark_in_progress();
        self.persist_result(layout, stage, study_uid, record_id, &result)
            .await;

        let outcome = self
            .invoke_adapter(layout, study, rd, stage, study_uid, cancel)
            .await;

        match outcome {
            Ok(report) if report.success => {
                result.mark_success(&report);
            }
            Ok(report) => {
                let message = report
                    .message
                    .unwrap_or_else(|| "partial transfer".to_string());
                result.files_transferred = report.files_transferred;
                result.mark_failed(message.clone(), true);
                self.maybe_schedule_retry(
                    route, layout, stage, study_uid, record_id, &mut result, base_delay, max_delay,
                    max_retries, &message,
                )
                .await;
            }
            Err(e) => {
                let transient = e.is_transient();
                let message = e.message.clone();
                result.error_details = e.details.clone();
                result.mark_failed(message.clone(), transient);
                if transient {
                    self.maybe_schedule_retry(
                        route, layout, stage, study_uid, record_id, &mut result, base_delay,
                        max_delay, max_retries, &message,
                    )
                    .await;
                }
            }
        }

        self.persist_result(layout, stage, study_uid, record_id, &result)
            .await;
        self.in_flight_sends.remove(&key);
    }

    #[allow(clippy::too_many_arguments)]
    async fn maybe_schedule_retry(
        &self,
        route: &RouteConfig,
        layout: &AeLayout,
        stage: StudyStage,
        study_uid: &str,
        _record_id: Uuid,
        result: &mut DestinationResult,
        base_delay: Duration,
        max_delay: Duration,
        max_retries: u32,
        message: &str,
    ) {
        let dir = layout.study_dir(stage, study_uid);
        let mut retry_meta = sidecar::read_retry_metadata(&dir)
            .ok()
            .flatten()
            .unwrap_or_default();
        retry_meta.record(&result.destination, Some(message.to_string()));
        let _ = sidecar::write_retry_metadata(&dir, &retry_meta);

        if result.schedule_retry(base_delay, max_delay, max_retries) {
            let next = result.next_retry_at.expect("scheduled above");
            self.retry
                .enqueue(RetryTask::new(
                    &route.ae_title,
                    study_uid,
                    &result.destination,
                    next,
                ))
                .await;
            let _ = self.events.send(PipelineEvent::DestinationRetryScheduled {
                ae_title: route.ae_title.clone(),
                study_uid: study_uid.to_string(),
                destination: result.destination.clone(),
                attempt: result.attempts,
                next_retry_at: next,
                at: Utc::now(),
            });
        } else {
            info!(
                study = study_uid,
                destination = %result.destination,
                attempts = result.attempts,
                "destination retries exhausted"
            );
        }
    }

    /// Invoke the adapter with the right file set and naming context.
    async fn invoke_adapter(
        &self,
        layout: &AeLayout,
        study: &Study,
        rd: &RouteDestinationConfig,
        stage: StudyStage,
        study_uid: &str,
        cancel: &CancellationToken,
    ) -> Result<dicomgate_types::SendReport, dicomgate_types::TransportError> {
        let files = if rd.anonymize {
            let script = rd.script.as_deref().unwrap_or_default();
            layout
                .anonymized_files(stage, study_uid, script)
                .unwrap_or_default()
        } else {
            layout.study_files(stage, study_uid).unwrap_or_default()
        };
        if files.is_empty() {
            return Err(dicomgate_types::TransportError::permanent(
                "no files staged for destination",
            ));
        }

        let tag_values = tag_values_of(study);
        let ctx = SendContext {
            study_uid: study_uid.to_string(),
            ae_title: study.ae_title.clone(),
            project: rd
                .project
                .as_deref()
                .map(|p| dicomgate_adapters::render_pattern(p, &tag_values)),
            subject: rd
                .subject
                .as_deref()
                .map(|p| dicomgate_adapters::render_pattern(p, &tag_values)),
            session: rd
                .session
                .as_deref()
                .map(|p| dicomgate_adapters::render_pattern(p, &tag_values)),
            tag_values,
        };

        let adapter = self
            .adapters
            .get(&rd.destination)
            .map_err(|e| dicomgate_types::TransportError::permanent(e.to_string()))?;

        let route = self.route(&study.ae_title).ok();
        let semaphore = route.map(|r| self.semaphore(&r));
        let _permit = match &semaphore {
            Some(semaphore) => Some(
                semaphore
                    .acquire()
                    .await
                    .map_err(|_| dicomgate_types::TransportError::transient("scheduler stopping"))?,
            ),
            None => None,
        };

        tokio::select! {
            result = adapter.send_study(&files, &ctx, cancel) => result,
            _ = cancel.cancelled() => Err(dicomgate_types::TransportError::transient("send cancelled")),
        }
    }

    /// Persist one destination result into the sidecar and the record.
    async fn persist_result(
        &self,
        layout: &AeLayout,
        stage: StudyStage,
        study_uid: &str,
        record_id: Uuid,
        result: &DestinationResult,
    ) {
        let lock = self.study_lock(study_uid);
        let _guard = lock.lock().await;
        let dir = layout.study_dir(stage, study_uid);
        let mut status = sidecar::read_destination_status(&dir)
            .ok()
            .flatten()
            .unwrap_or_else(|| DestinationStatusFile::new(study_uid));
        status.record_id = Some(record_id);
        status.upsert(result.clone());
        if let Err(e) = sidecar::write_destination_status(&dir, &status) {
            warn!(study = study_uid, error = %e, "cannot persist destination status");
        }
        let result = result.clone();
        let _ = self.transfers.update(record_id, move |r| {
            match r.destination_mut(&result.destination) {
                Some(existing) => *existing = result,
                None => r.destinations.push(result),
            }
            r.updated_at = Utc::now();
        });
    }

    /// Settle the study directory and record after a fan-out pass.
    async fn finalize(
        self: &Arc<Self>,
        ae_title: &str,
        study_uid: &str,
        record_id: Uuid,
        manifest: &StudyManifest,
        reports: &HashMap<String, AuditReport>,
    ) -> Result<(), GatewayError> {
        let layout = self.layout(ae_title)?;
        let record = self
            .transfers
            .get(record_id)
            .ok_or_else(|| GatewayError::not_found("transfer record", record_id.to_string()))?;

        let derived = record.derive_status();
        let any_retry_pending = record.destinations.iter().any(|d| d.is_retry_pending());
        let all_failed = derived == TransferStatus::Failed;

        if all_failed {
            let reason = record
                .destinations
                .iter()
                .filter_map(|d| d.message.clone())
                .collect::<Vec<_>>()
                .join("; ");
            return self
                .fail_study(
                    ae_title,
                    study_uid,
                    record_id,
                    StudyStage::Processing,
                    &format!("all destinations failed: {}", reason),
                )
                .await;
        }

        layout.transition(study_uid, StudyStage::Processing, StudyStage::Completed)?;
        let status = if any_retry_pending {
            TransferStatus::Partial
        } else {
            TransferStatus::Success
        };
        self.transfers.update(record_id, |r| r.set_status(status))?;

        if any_retry_pending {
            info!(ae = ae_title, study = study_uid, "study partially forwarded, retries pending");
        } else {
            self.archive_study(ae_title, study_uid, &layout, manifest, reports, &record)
                .await?;
            let record = self.transfers.get(record_id).unwrap_or(record);
            let _ = self.events.send(PipelineEvent::StudyCompleted {
                ae_title: ae_title.to_string(),
                study_uid: study_uid.to_string(),
                status: record.status,
                destinations: record.destinations.clone(),
                at: Utc::now(),
            });
            info!(ae = ae_title, study = study_uid, "study completed");
        }
        self.release_slot(ae_title);
        Ok(())
    }

    async fn archive_study(
        &self,
        ae_title: &str,
        study_uid: &str,
        layout: &AeLayout,
        manifest: &StudyManifest,
        reports: &HashMap<String, AuditReport>,
        record: &TransferRecord,
    ) -> Result<(), GatewayError> {
        let stage = layout
            .find_stage(study_uid)
            .unwrap_or(StudyStage::Completed);
        let originals = layout.study_files(stage, study_uid)?;
        let dir = layout.study_dir(stage, study_uid);

        let mut anonymized = Vec::new();
        let anon_root = dir.join("anonymized");
        if anon_root.is_dir() {
            for entry in std::fs::read_dir(&anon_root)? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    let script = entry.file_name().to_string_lossy().into_owned();
                    let files = layout.anonymized_files(stage, study_uid, &script)?;
                    anonymized.push((script, files));
                }
            }
        }

        let review = sidecar::read_review_metadata(&dir)?;
        let metadata = ArchiveMetadata {
            study_uid: study_uid.to_string(),
            ae_title: ae_title.to_string(),
            source_ae: manifest.study.source_ae.clone(),
            archived_at: Utc::now(),
            received_at: Some(manifest.study.received_at),
            completed_at: record.completed_at,
            destinations: record
                .destinations
                .iter()
                .map(|d| (d.destination.clone(), d.clone()))
                .collect(),
            scripts: Vec::new(),
            review_decision: review
                .as_ref()
                .and_then(|r| r.decision)
                .map(|d| format!("{:?}", d).to_lowercase()),
            broker_mappings: reports
                .values()
                .flat_map(|r| r.broker_mappings.clone())
                .collect(),
            audit_report: None,
            submitted_for_review: review.is_some(),
        };

        let audit_json = reports
            .values()
            .next()
            .map(serde_json::to_value)
            .transpose()?;
        let writer = ArchiveWriter::new(layout.clone());
        writer.archive_study(
            study_uid,
            &originals,
            &anonymized,
            audit_json.as_ref(),
            metadata,
        )?;
        Ok(())
    }

    async fn fail_study(
        self: &Arc<Self>,
        ae_title: &str,
        study_uid: &str,
        record_id: Uuid,
        from: StudyStage,
        reason: &str,
    ) -> Result<(), GatewayError> {
        let layout = self.layout(ae_title)?;
        let dir = layout.study_dir(from, study_uid);
        sidecar::write_failure_reason(&dir, reason)?;
        layout.transition(study_uid, from, StudyStage::Failed)?;
        self.transfers.update(record_id, |r| {
            r.set_status(TransferStatus::Failed);
            r.error_message = Some(reason.to_string());
        })?;
        let _ = self.events.send(PipelineEvent::StudyFailed {
            ae_title: ae_title.to_string(),
            study_uid: study_uid.to_string(),
            reason: reason.to_string(),
            at: Utc::now(),
        });
        warn!(ae = ae_title, study = study_uid, reason, "study failed");
        self.release_slot(ae_title);
        Ok(())
    }

    /// Retry of one destination for a study already settled in
    /// `completed/` (partial) or still in `processing/`.
    async fn send_one_retry(
        self: &Arc<Self>,
        ae_title: &str,
        study_uid: &str,
        destination: &str,
        cancel: &CancellationToken,
    ) -> Result<(), GatewayError> {
        let layout = self.layout(ae_title)?;
        let route = self.route(ae_title)?;
        let Some(stage) = layout.find_stage(study_uid) else {
            warn!(ae = ae_title, study = study_uid, "retry for unknown study dropped");
            return Ok(());
        };
        if stage == StudyStage::ReviewPending || stage == StudyStage::ReviewRejected {
            // never retried while a human decision is outstanding
            return Ok(());
        }

        let dir = layout.study_dir(stage, study_uid);
        let manifest = sidecar::read_study_manifest(&dir)?.unwrap_or_else(|| StudyManifest {
            study: Study::new(study_uid, ae_title, "UNKNOWN"),
            destination_adds: Vec::new(),
            destination_removes: Vec::new(),
            rejected_instances: 0,
        });
        let record_id = match sidecar::read_destination_status(&dir)?.and_then(|s| s.record_id) {
            Some(id) => id,
            None => self.ensure_record(ae_title, &manifest)?,
        };
        let rd = self
            .build_plan(&route, &manifest)
            .into_iter()
            .find(|rd| rd.destination == destination)
            .unwrap_or(RouteDestinationConfig {
                destination: destination.to_string(),
                anonymize: false,
                script: None,
                project: None,
                subject: None,
                session: None,
                priority: 0,
                max_retries: None,
                retry_delay_seconds: None,
                broker: None,
                detect_pixel_phi: false,
            });

        self.send_to_destination(
            &route,
            &layout,
            &manifest.study,
            record_id,
            &rd,
            stage,
            study_uid,
            cancel,
        )
        .await;

        // settle the study-level status after the attempt
        let record = self
            .transfers
            .get(record_id)
            .ok_or_else(|| GatewayError::not_found("transfer record", record_id.to_string()))?;
        let derived = record.derive_status();
        let any_retry_pending = record.destinations.iter().any(|d| d.is_retry_pending());

        match derived {
            TransferStatus::Success if !any_retry_pending => {
                if stage == StudyStage::Failed {
                    layout.transition(study_uid, StudyStage::Failed, StudyStage::Completed)?;
                }
                self.transfers
                    .update(record_id, |r| r.set_status(TransferStatus::Success))?;
                let record = self.transfers.get(record_id).unwrap_or(record);
                let archive_dir = ArchiveWriter::new(layout.clone())
                    .study_archive_dir(Utc::now().date_naive(), study_uid);
                if !archive_dir.exists() {
                    self.archive_study(
                        ae_title,
                        study_uid,
                        &layout,
                        &manifest,
                        &HashMap::new(),
                        &record,
                    )
                    .await?;
                }
                let _ = self.events.send(PipelineEvent::StudyCompleted {
                    ae_title: ae_title.to_string(),
                    study_uid: study_uid.to_string(),
                    status: record.status,
                    destinations: record.destinations.clone(),
                    at: Utc::now(),
                });
                info!(ae = ae_title, study = study_uid, "study completed after retry");
            }
            TransferStatus::Failed if !any_retry_pending => {
                let reason = record
                    .destinations
                    .iter()
                    .filter_map(|d| d.message.clone())
                    .collect::<Vec<_>>()
                    .join("; ");
                sidecar::write_failure_reason(&dir, &reason)?;
                if stage == StudyStage::Completed {
                    layout.transition(study_uid, StudyStage::Completed, StudyStage::Failed)?;
                }
                self.transfers.update(record_id, |r| {
                    r.set_status(TransferStatus::Failed);
                    r.error_message = Some(reason.clone());
                })?;
                let _ = self.events.send(PipelineEvent::StudyFailed {
                    ae_title: ae_title.to_string(),
                    study_uid: study_uid.to_string(),
                    reason,
                    at: Utc::now(),
                });
            }
            _ => {
                self.transfers
                    .update(record_id, |r| r.set_status(TransferStatus::Partial))?;
            }
        }
        Ok(())
    }

    /// Startup scan: resume `processing/` studies and rebuild the retry
    /// queue from `completed/` studies with retry-pending destinations.
    pub async fn recover(&self) -> Result<(usize, usize), GatewayError> {
        let mut resumed = 0;
        let mut retries = 0;
        for entry in self.layouts.iter() {
            let (ae_title, layout) = (entry.key().clone(), entry.value().clone());

            for study_uid in layout.list_stage(StudyStage::Processing)? {
                if let Some(registry) = self.registries.get(&ae_title) {
                    registry.in_flight().fetch_add(1, Ordering::SeqCst);
                }
                self.work_tx
                    .send(WorkItem::ProcessStudy {
                        ae_title: ae_title.clone(),
                        study_uid,
                    })
                    .await
                    .map_err(|_| GatewayError::protocol("scheduler is not running"))?;
                resumed += 1;
            }

            for study_uid in layout.list_stage(StudyStage::Completed)? {
                let dir = layout.study_dir(StudyStage::Completed, &study_uid);
                let Some(status) = sidecar::read_destination_status(&dir)? else {
                    continue;
                };
                for result in status.destinations.values() {
                    if result.is_retry_pending() {
                        let next = result.next_retry_at.unwrap_or_else(Utc::now);
                        self.retry
                            .enqueue(RetryTask::new(
                                &ae_title,
                                &study_uid,
                                &result.destination,
                                next,
                            ))
                            .await;
                        retries += 1;
                    }
                }
            }
        }
        info!(resumed, retries, "startup recovery scan complete");
        Ok((resumed, retries))
    }
}

/// Tag values from the study's first instance, for templates and rules.
pub(crate) fn tag_values_of(study: &Study) -> HashMap<String, String> {
    let mut values = HashMap::new();
    if let Some(first) = study.instances.first() {
        if let Some(v) = &first.patient_id {
            values.insert("PatientID".to_string(), v.clone());
        }
        if let Some(v) = &first.patient_name {
            values.insert("PatientName".to_string(), v.clone());
        }
        if let Some(v) = &first.study_date {
            values.insert("StudyDate".to_string(), v.clone());
        }
        if let Some(v) = &first.modality {
            values.insert("Modality".to_string(), v.clone());
        }
        values.insert(
            "SeriesInstanceUID".to_string(),
            first.series_instance_uid.clone(),
        );
        values.insert(
            "SOPInstanceUID".to_string(),
            first.sop_instance_uid.clone(),
        );
    }
    values.insert("StudyInstanceUID".to_string(), study.study_uid.clone());
    values
}
