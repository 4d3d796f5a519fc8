use chrono::Utc;
use dicomgate_config::RouteConfig;
use dicomgate_types::PipelineEvent;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::registry::StudyRegistry;
use crate::StudyCompletion;

/// Completion watchdog: a single timer loop per route that promotes
/// studies whose quiescence window elapsed (with every association
/// closed) from the receive registry to the scheduler queue.
///
/// Backpressure: promotion is deferred while the route already has
/// `max_concurrent_studies` studies in flight; deferred studies stay in
/// `incoming/` and promote as slots free up.
pub struct CompletionWatchdog {
    route: RouteConfig,
    registry: Arc<StudyRegistry>,
    completions: mpsc::Sender<StudyCompletion>,
    events: broadcast::Sender<PipelineEvent>,
    tick: Duration,
}

impl CompletionWatchdog {
    pub fn new(
        route: RouteConfig,
        registry: Arc<StudyRegistry>,
        completions: mpsc::Sender<StudyCompletion>,
        events: broadcast::Sender<PipelineEvent>,
    ) -> Self {
        Self {
            route,
            registry,
            completions,
            events,
            tick: Duration::from_secs(1),
        }
    }

    #[cfg(test)]
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// One scan: promote every quiescent study the in-flight budget
    /// allows. Returns how many were promoted.
    pub async fn scan_once(&self) -> usize {
        let quiescence = self.route.quiescence();
        let in_flight = self.registry.in_flight();
        let mut promoted = 0;

        for study_uid in self.registry.quiescent(quiescence) {
            if in_flight.load(Ordering::SeqCst) >= self.route.max_concurrent_studies {
                debug!(
                    ae = %self.route.ae_title,
                    study = %study_uid,
                    "promotion deferred: max_concurrent_studies reached"
                );
                break;
            }
            let Some(manifest) = self.registry.take(&study_uid) else {
                continue;
            };
            in_flight.fetch_add(1, Ordering::SeqCst);
            info!(
                ae = %self.route.ae_title,
                study = %study_uid,
                files = manifest.study.file_count(),
                "study complete"
            );
            let _ = self.events.send(PipelineEvent::StudyReceived {
                ae_title: self.route.ae_title.clone(),
                study_uid: study_uid.clone(),
                source_ae: manifest.study.source_ae.clone(),
                file_count: manifest.study.file_count(),
                byte_total: manifest.study.byte_total,
                at: Utc::now(),
            });
            if self
                .completions
                .send(StudyCompletion {
                    ae_title: self.route.ae_title.clone(),
                    study_uid,
                })
                .await
                .is_err()
            {
                // scheduler gone; undo the slot so a restart re-promotes
                in_flight.fetch_sub(1, Ordering::SeqCst);
                break;
            }
            promoted += 1;
        }
        promoted
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            ae = %self.route.ae_title,
            quiescence_secs = self.route.study_timeout_seconds,
            "completion watchdog started"
        );
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.scan_once().await;
                }
                _ = cancel.cancelled() => break,
            }
        }
        info!(ae = %self.route.ae_title, "completion watchdog stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicomgate_storage::AeLayout;
    use dicomgate_types::InstanceMeta;
    use tempfile::TempDir;

    fn route(max_concurrent: usize, timeout: u64) -> RouteConfig {
        RouteConfig {
            ae_title: "INGEST".into(),
            port: 0,
            enabled: true,
            description: String::new(),
            worker_threads: 1,
            max_concurrent_transfers: 1,
            max_concurrent_studies: max_concurrent,
            study_timeout_seconds: timeout,
            rate_limit_per_minute: None,
            webhook_url: None,
            webhook_events: Vec::new(),
            review_required: false,
            auto_import: true,
            tls: false,
            accepted_sop_classes: Vec::new(),
            destinations: Vec::new(),
            routing_rules: Vec::new(),
            validation_rules: Vec::new(),
            filters: Vec::new(),
        }
    }

    fn meta() -> InstanceMeta {
        InstanceMeta {
            path: "a.dcm".into(),
            sop_instance_uid: "1.1".into(),
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".into(),
            series_instance_uid: "1.2".into(),
            modality: None,
            patient_id: None,
            patient_name: None,
            study_date: None,
            file_size: 10,
        }
    }

    fn setup(max_concurrent: usize) -> (
        TempDir,
        Arc<StudyRegistry>,
        CompletionWatchdog,
        mpsc::Receiver<StudyCompletion>,
    ) {
        let tmp = TempDir::new().unwrap();
        let layout = AeLayout::new(tmp.path(), "INGEST");
        layout.ensure().unwrap();
        let registry = Arc::new(StudyRegistry::new(layout));
        let (tx, rx) = mpsc::channel(16);
        let (events, _) = broadcast::channel(16);
        let watchdog =
            CompletionWatchdog::new(route(max_concurrent, 0), registry.clone(), tx, events);
        (tmp, registry, watchdog, rx)
    }

    #[tokio::test]
    async fn test_zero_quiescence_promotes_on_close() {
        let (_tmp, registry, watchdog, mut rx) = setup(4);
        registry.record_instance("1.2.3", "PEER", meta()).unwrap();
        registry.association_opened("1.2.3");

        // association still open: nothing promotes
        assert_eq!(watchdog.scan_once().await, 0);

        registry.association_closed("1.2.3");
        assert_eq!(watchdog.scan_once().await, 1);
        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.study_uid, "1.2.3");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_backpressure_defers_promotion() {
        let (_tmp, registry, watchdog, mut rx) = setup(1);
        for uid in ["1.1", "1.2"] {
            registry.record_instance(uid, "PEER", meta()).unwrap();
        }

        // one slot: only one study promotes
        assert_eq!(watchdog.scan_once().await, 1);
        assert_eq!(watchdog.scan_once().await, 0);
        assert_eq!(registry.len(), 1);

        // the pipeline frees the slot; next scan promotes the second
        registry.in_flight().fetch_sub(1, Ordering::SeqCst);
        assert_eq!(watchdog.scan_once().await, 1);
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_event_emitted_on_promotion() {
        let (_tmp, registry, watchdog, _rx) = setup(4);
        let mut events = watchdog.events.subscribe();
        registry.record_instance("1.2.3", "PEER", meta()).unwrap();
        watchdog.scan_once().await;

        match events.recv().await.unwrap() {
            PipelineEvent::StudyReceived {
                study_uid,
                file_count,
                ..
            } => {
                assert_eq!(study_uid, "1.2.3");
                assert_eq!(file_count, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
