use dashmap::{DashMap, DashSet};
use dicomgate_adapters::{AdapterRegistry, HealthMonitor};
use dicomgate_anonymizer::{Anonymizer, OcrClient, ScriptStore};
use dicomgate_broker::BrokerRegistry;
use dicomgate_config::ConfigStore;
use dicomgate_receiver::{
    CompletionWatchdog, ListenerStats, RouteListener, StudyCompletion, StudyRegistry,
};
use dicomgate_storage::cleanup::{RetentionCleaner, RetentionPolicy};
use dicomgate_storage::{AeLayout, TransferStore};
use dicomgate_types::{GatewayError, PipelineEvent};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::events::{HistoryWriter, WebhookDispatcher};
use crate::handle::PipelineHandle;
use crate::retry::RetryManager;
use crate::review::ReviewGate;
use crate::scheduler::Scheduler;

/// The assembled gateway pipeline: listeners, watchdogs, health monitor,
/// scheduler workers, retry manager, cleanup loop and event consumers.
///
/// Construction prepares every component and binds every enabled
/// listener (so bind failures surface before anything starts); `start`
/// spawns the loops.
pub struct PipelineService {
    config: Arc<ConfigStore>,
    scheduler: Arc<Scheduler>,
    retry: Arc<RetryManager>,
    health: Arc<HealthMonitor>,
    layouts: Arc<DashMap<String, AeLayout>>,
    listeners: Vec<(Arc<RouteListener>, TcpListener)>,
    watchdogs: Vec<Arc<CompletionWatchdog>>,
    webhook: Arc<WebhookDispatcher>,
    history: Arc<HistoryWriter>,
    events: broadcast::Sender<PipelineEvent>,
    work_rx: Option<mpsc::Receiver<crate::WorkItem>>,
    completions_rx: Option<mpsc::Receiver<StudyCompletion>>,
    handle: Arc<PipelineHandle>,
    /// Phase one of shutdown: stop accepting associations and promotions
    accept_cancel: CancellationToken,
    /// Phase two: interrupt workers, probes and in-flight adapter calls
    work_cancel: CancellationToken,
}

impl PipelineService {
    /// Build the whole pipeline from configuration. Fails with a
    /// configuration-class error for invalid config and a bind error for
    /// an unbindable listener port.
    pub fn build(config: Arc<ConfigStore>) -> Result<Self, GatewayError> {
        let snapshot = config.snapshot();
        let data_root = snapshot.data_root.clone();

        let layouts: Arc<DashMap<String, AeLayout>> = Arc::new(DashMap::new());
        let registries: Arc<DashMap<String, Arc<StudyRegistry>>> = Arc::new(DashMap::new());
        for route in snapshot.routes.iter().filter(|r| r.enabled) {
            let layout = AeLayout::new(&data_root, &route.ae_title);
            layout.ensure()?;
            registries.insert(
                route.ae_title.clone(),
                Arc::new(StudyRegistry::new(layout.clone())),
            );
            layouts.insert(route.ae_title.clone(), layout);
        }

        let transfers = TransferStore::open(&data_root)?;
        let adapters = Arc::new(AdapterRegistry::new(config.clone()));
        let brokers = Arc::new(BrokerRegistry::new(config.clone()));
        let scripts = Arc::new(ScriptStore::open(snapshot.scripts_dir())?);
        let anonymizer = Arc::new(Anonymizer::new(&snapshot.resilience.mrn_patterns, "2.25"));
        let ocr = match &snapshot.ocr {
            Some(ocr) => Some(Arc::new(
                OcrClient::new(&ocr.url, Duration::from_secs(ocr.timeout_seconds))
                    .map_err(|e| GatewayError::config(e.to_string()))?,
            )),
            None => None,
        };
        let health = Arc::new(HealthMonitor::new(
            adapters.clone(),
            Duration::from_secs(snapshot.resilience.health_check_interval_seconds),
            snapshot.resilience.health_probe_concurrency,
        ));

        let (events, _) = broadcast::channel(1024);
        let (work_tx, work_rx) = mpsc::channel(1024);
        let (completions_tx, completions_rx) = mpsc::channel(1024);

        let in_flight_sends: Arc<DashSet<(String, String)>> = Arc::new(DashSet::new());
        let retry = Arc::new(RetryManager::new(
            health.clone(),
            work_tx.clone(),
            in_flight_sends.clone(),
            Duration::from_secs(snapshot.resilience.retry_delay_seconds),
        ));
        let review = Arc::new(ReviewGate::new(
            layouts.clone(),
            transfers.clone(),
            work_tx.clone(),
            events.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            config.clone(),
            layouts.clone(),
            registries.clone(),
            transfers,
            adapters,
            brokers.clone(),
            scripts.clone(),
            anonymizer,
            ocr,
            health.clone(),
            retry.clone(),
            review,
            events.clone(),
            work_tx,
            in_flight_sends,
        ));

        // bind every enabled listener before anything runs
        let mut listeners = Vec::new();
        let mut watchdogs = Vec::new();
        for route in snapshot.routes.iter().filter(|r| r.enabled) {
            let registry = registries
                .get(&route.ae_title)
                .map(|r| r.value().clone())
                .expect("registry created above");
            let listener = Arc::new(RouteListener::new(route.clone(), registry.clone()));
            let bound = listener.bind()?;
            listeners.push((listener, bound));
            watchdogs.push(Arc::new(CompletionWatchdog::new(
                route.clone(),
                registry,
                completions_tx.clone(),
                events.clone(),
            )));
        }

        let listener_stats: Arc<DashMap<String, Arc<ListenerStats>>> = Arc::new(DashMap::new());
        for (listener, _) in &listeners {
            listener_stats.insert(listener.ae_title().to_string(), listener.stats());
        }

        let webhook = Arc::new(WebhookDispatcher::new(config.clone()));
        let history = Arc::new(HistoryWriter::new(&layouts));
        let handle = Arc::new(PipelineHandle::new(
            scheduler.clone(),
            scripts,
            brokers,
            listener_stats,
        ));

        Ok(Self {
            config,
            scheduler,
            retry,
            health,
            layouts,
            listeners,
            watchdogs,
            webhook,
            history,
            events,
            work_rx: Some(work_rx),
            completions_rx: Some(completions_rx),
            handle,
            accept_cancel: CancellationToken::new(),
            work_cancel: CancellationToken::new(),
        })
    }

    pub fn handle(&self) -> Arc<PipelineHandle> {
        self.handle.clone()
    }

    pub fn events(&self) -> broadcast::Sender<PipelineEvent> {
        self.events.clone()
    }

    /// Spawn every component loop. Listener and watchdog loops stop in
    /// the first shutdown phase; worker, probe and event loops in the
    /// second.
    pub async fn start(&mut self) -> Result<Vec<JoinHandle<()>>, GatewayError> {
        let mut handles = Vec::new();
        let snapshot = self.config.snapshot();
        let accept_cancel = self.accept_cancel.clone();
        let work_cancel = self.work_cancel.clone();

        handles.push(tokio::spawn(
            self.webhook
                .clone()
                .run(self.events.subscribe(), work_cancel.clone()),
        ));
        handles.push(tokio::spawn(
            self.history
                .clone()
                .run(self.events.subscribe(), work_cancel.clone()),
        ));

        handles.push(tokio::spawn(self.health.clone().run(work_cancel.clone())));
        handles.push(tokio::spawn(self.retry.clone().run(work_cancel.clone())));

        let work_rx = self
            .work_rx
            .take()
            .ok_or_else(|| GatewayError::config("pipeline already started"))?;
        let completions_rx = self
            .completions_rx
            .take()
            .ok_or_else(|| GatewayError::config("pipeline already started"))?;
        handles.extend(
            self.scheduler
                .start(work_rx, completions_rx, work_cancel.clone()),
        );

        // receive-side recovery: rebuild incoming registries, then resume
        // processing/ and the retry queue
        for entry in self.scheduler.registries.iter() {
            match entry.value().recover() {
                Ok(recovered) if !recovered.is_empty() => {
                    info!(ae = %entry.key(), count = recovered.len(), "incoming studies recovered");
                }
                Ok(_) => {}
                Err(e) => warn!(ae = %entry.key(), error = %e, "incoming recovery failed"),
            }
        }
        self.scheduler.recover().await?;

        for (listener, bound) in self.listeners.drain(..) {
            handles.push(tokio::spawn(listener.run(bound, accept_cancel.clone())));
        }
        for watchdog in &self.watchdogs {
            handles.push(tokio::spawn(watchdog.clone().run(accept_cancel.clone())));
        }

        // retention cleanup, one pass per hour
        let policy = RetentionPolicy {
            history_days: snapshot.resilience.retention_days,
            archive_days: snapshot.resilience.archive_retention_days,
            deleted_days: snapshot.resilience.deleted_retention_days,
        };
        let layouts = self.layouts.clone();
        let cleanup_cancel = work_cancel.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for entry in layouts.iter() {
                            let cleaner = RetentionCleaner::new(entry.value().clone(), policy);
                            if let Err(e) = cleaner.run_once() {
                                warn!(ae = %entry.key(), error = %e, "cleanup pass failed");
                            }
                        }
                    }
                    _ = cleanup_cancel.cancelled() => break,
                }
            }
        }));

        info!("pipeline started");
        Ok(handles)
    }

    /// Graceful shutdown: stop accepting associations, wait up to `grace`
    /// for in-flight study workers to drain, then cancel the remainder.
    /// Studies not yet terminal stay in `processing/` and are recovered on
    /// next start.
    pub async fn shutdown(&self, handles: Vec<JoinHandle<()>>, grace: Duration) {
        self.accept_cancel.cancel();

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let busy: usize = self
                .scheduler
                .registries
                .iter()
                .map(|r| r.in_flight().load(std::sync::atomic::Ordering::SeqCst))
                .sum();
            if busy == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(busy, "graceful stop window elapsed, cancelling in-flight work");
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        self.work_cancel.cancel();
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
            warn!("abandoning unfinished background tasks");
        }
        info!("pipeline stopped");
    }
}
