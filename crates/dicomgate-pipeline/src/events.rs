use dashmap::DashMap;
use dicomgate_config::ConfigStore;
use dicomgate_storage::{AeLayout, HistoryLog};
use dicomgate_types::PipelineEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Fire-and-forget webhook delivery for routes that configure one.
///
/// Delivery failures are logged and dropped; they never feed back into
/// the study pipeline and are never retried.
pub struct WebhookDispatcher {
    config: Arc<ConfigStore>,
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    fn target_for(&self, event: &PipelineEvent) -> Option<String> {
        let snapshot = self.config.snapshot();
        let route = snapshot.route(event.ae_title())?;
        let url = route.webhook_url.clone()?;
        // an empty filter list subscribes to everything
        if route.webhook_events.is_empty()
            || route.webhook_events.iter().any(|e| e == event.name())
        {
            Some(url)
        } else {
            None
        }
    }

    async fn deliver(&self, url: String, event: PipelineEvent) {
        match self.client.post(&url).json(&event).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(url = %url, event = event.name(), "webhook delivered");
            }
            Ok(response) => {
                warn!(url = %url, status = %response.status(), "webhook rejected");
            }
            Err(e) => {
                warn!(url = %url, error = %e, "webhook delivery failed");
            }
        }
    }

    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<PipelineEvent>,
        cancel: CancellationToken,
    ) {
        info!("webhook dispatcher started");
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = cancel.cancelled() => break,
            };
            match event {
                Ok(event) => {
                    if let Some(url) = self.target_for(&event) {
                        let this = self.clone();
                        tokio::spawn(async move { this.deliver(url, event).await });
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "webhook dispatcher lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        info!("webhook dispatcher stopped");
    }
}

/// Appends every pipeline event to its route's per-day history file.
pub struct HistoryWriter {
    logs: Arc<DashMap<String, HistoryLog>>,
}

impl HistoryWriter {
    pub fn new(layouts: &DashMap<String, AeLayout>) -> Self {
        let logs = Arc::new(DashMap::new());
        for entry in layouts.iter() {
            logs.insert(entry.key().clone(), HistoryLog::new(entry.value().clone()));
        }
        Self { logs }
    }

    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<PipelineEvent>,
        cancel: CancellationToken,
    ) {
        info!("history writer started");
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = cancel.cancelled() => break,
            };
            match event {
                Ok(event) => {
                    if let Some(log) = self.logs.get(event.ae_title()) {
                        if let Err(e) = log.append(&event) {
                            warn!(ae = event.ae_title(), error = %e, "history append failed");
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "history writer lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        info!("history writer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dicomgate_config::{GatewayConfig, ResilienceConfig, RouteConfig};

    fn config_with_webhook(url: Option<String>, events: Vec<String>) -> Arc<ConfigStore> {
        let config = GatewayConfig {
            data_root: "/tmp/x".into(),
            scripts_dir: None,
            resilience: ResilienceConfig::default(),
            routes: vec![RouteConfig {
                ae_title: "INGEST".into(),
                port: 11112,
                enabled: true,
                description: String::new(),
                worker_threads: 1,
                max_concurrent_transfers: 1,
                max_concurrent_studies: 4,
                study_timeout_seconds: 30,
                rate_limit_per_minute: None,
                webhook_url: url,
                webhook_events: events,
                review_required: false,
                auto_import: true,
                tls: false,
                accepted_sop_classes: Vec::new(),
                destinations: Vec::new(),
                routing_rules: Vec::new(),
                validation_rules: Vec::new(),
                filters: Vec::new(),
            }],
            destinations: Vec::new(),
            brokers: Vec::new(),
            ocr: None,
        };
        Arc::new(ConfigStore::new(config).unwrap())
    }

    fn received_event() -> PipelineEvent {
        PipelineEvent::StudyReceived {
            ae_title: "INGEST".into(),
            study_uid: "1.2.3".into(),
            source_ae: "PEER".into(),
            file_count: 1,
            byte_total: 10,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_event_filter() {
        let dispatcher = WebhookDispatcher::new(config_with_webhook(
            Some("http://hooks.example/x".into()),
            vec!["study_failed".into()],
        ));
        assert!(dispatcher.target_for(&received_event()).is_none());

        let dispatcher = WebhookDispatcher::new(config_with_webhook(
            Some("http://hooks.example/x".into()),
            Vec::new(),
        ));
        assert!(dispatcher.target_for(&received_event()).is_some());

        let dispatcher = WebhookDispatcher::new(config_with_webhook(None, Vec::new()));
        assert!(dispatcher.target_for(&received_event()).is_none());
    }

    #[tokio::test]
    async fn test_webhook_posted() {
        use wiremock::matchers::{body_partial_json, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_partial_json(serde_json::json!({
                "event": "study_received",
                "study_uid": "1.2.3"
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher = Arc::new(WebhookDispatcher::new(config_with_webhook(
            Some(format!("{}/hook", server.uri())),
            Vec::new(),
        )));
        let url = dispatcher.target_for(&received_event()).unwrap();
        dispatcher.deliver(url, received_event()).await;
    }
}
